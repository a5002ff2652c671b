// src/notify.rs
// Outbound message delivery. One notifier fronts every channel and dispatches
// on the address variant, so business code never knows which provider a user
// lives on.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::channel::ChannelAddress;
use crate::config::TwilioConfig;
use crate::error::NotifyError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, to: &ChannelAddress, text: &str) -> Result<(), NotifyError>;
}

/// Provider-backed notifier: Telegram bot API and Twilio WhatsApp. Transient
/// transport failures are retried with exponential backoff; 4xx rejections
/// are permanent and surface immediately.
pub struct ChannelNotifier {
    client: Client,
    telegram_bot_token: Option<String>,
    twilio: Option<TwilioConfig>,
}

impl ChannelNotifier {
    pub fn new(telegram_bot_token: Option<String>, twilio: Option<TwilioConfig>) -> Self {
        Self {
            client: Client::new(),
            telegram_bot_token,
            twilio,
        }
    }

    async fn send_telegram(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let token = self
            .telegram_bot_token
            .as_deref()
            .ok_or(NotifyError::Unconfigured("telegram"))?;
        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        check_status(response).await
    }

    async fn send_whatsapp(&self, number: &str, text: &str) -> Result<(), NotifyError> {
        let twilio = self
            .twilio
            .as_ref()
            .ok_or(NotifyError::Unconfigured("whatsapp"))?;
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            twilio.account_sid
        );

        // Twilio wants the destination with the whatsapp: routing prefix but
        // the sending number without it.
        let response = self
            .client
            .post(&url)
            .basic_auth(&twilio.account_sid, Some(&twilio.auth_token))
            .form(&[
                ("From", twilio.from_number.as_str()),
                ("To", &format!("whatsapp:{}", number)),
                ("Body", text),
            ])
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        check_status(response).await
    }

    async fn deliver_once(&self, to: &ChannelAddress, text: &str) -> Result<(), NotifyError> {
        match to {
            ChannelAddress::Telegram(chat_id) => self.send_telegram(*chat_id, text).await,
            ChannelAddress::Whatsapp(number) => self.send_whatsapp(number, text).await,
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body,
    })
}

fn classify(err: NotifyError) -> backoff::Error<NotifyError> {
    match err {
        // Provider-side rejections (bad chat id, malformed payload, auth) do
        // not heal on retry.
        NotifyError::Rejected { status, .. } if (400..500).contains(&status) => {
            backoff::Error::permanent(err)
        }
        NotifyError::Unconfigured(_) => backoff::Error::permanent(err),
        _ => backoff::Error::transient(err),
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send_message(&self, to: &ChannelAddress, text: &str) -> Result<(), NotifyError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(Some(Duration::from_secs(12)))
            .build();

        let result = backoff::future::retry(policy, || async {
            self.deliver_once(to, text).await.map_err(classify)
        })
        .await;

        match &result {
            Ok(()) => info!("✅ Message delivered to {}", to),
            Err(e) => warn!("❌ Giving up on message to {}: {}", to, e),
        }
        result
    }
}
