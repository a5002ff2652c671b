// src/channel.rs
// Canonical inbound-message shape for all chat channels.
//
// Each provider webhook (Twilio WhatsApp, Telegram bot) is normalized here
// into one InboundMessage before any business logic sees it, so the rest of
// the crate never branches on provider-specific field names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// A user's address on a messaging channel.
///
/// Stored in the users table as its `Display` form, e.g.
/// `whatsapp:+27821234567` or `telegram:5512345678`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelAddress {
    /// E.164 phone number, without the provider's `whatsapp:` routing prefix.
    Whatsapp(String),
    /// Telegram chat id.
    Telegram(i64),
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Whatsapp(number) => write!(f, "whatsapp:{}", number),
            ChannelAddress::Telegram(chat_id) => write!(f, "telegram:{}", chat_id),
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(number) = s.strip_prefix("whatsapp:") {
            return Ok(ChannelAddress::Whatsapp(number.to_string()));
        }
        if let Some(chat_id) = s.strip_prefix("telegram:") {
            let chat_id = chat_id
                .parse::<i64>()
                .map_err(|_| StoreError::Corrupt(format!("bad telegram chat id: {}", chat_id)))?;
            return Ok(ChannelAddress::Telegram(chat_id));
        }
        Err(StoreError::Corrupt(format!("unknown channel address: {}", s)))
    }
}

/// One normalized inbound chat message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Where replies for this conversation go.
    pub from: ChannelAddress,
    pub text: String,
    /// Telegram carries the sender's username; WhatsApp identifies the sender
    /// by phone number alone.
    pub sender_handle: Option<String>,
}

/// Twilio WhatsApp webhook form payload.
///
/// Twilio posts `From=whatsapp:+27821234567&Body=...`; the routing prefix is
/// stripped so the stored address is the bare phone number.
#[derive(Debug, Deserialize)]
pub struct TwilioInbound {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body")]
    pub body: String,
}

impl TwilioInbound {
    pub fn normalize(&self) -> InboundMessage {
        let number = self
            .from
            .strip_prefix("whatsapp:")
            .unwrap_or(&self.from)
            .to_string();
        InboundMessage {
            from: ChannelAddress::Whatsapp(number),
            text: self.body.clone(),
            sender_handle: None,
        }
    }
}

/// Telegram bot webhook payload. Updates without a message (edits, channel
/// posts) normalize to None and are acknowledged without further work.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    pub text: Option<String>,
    pub from: Option<TelegramSender>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramSender {
    pub username: Option<String>,
}

impl TelegramUpdate {
    pub fn normalize(&self) -> Option<InboundMessage> {
        let message = self.message.as_ref()?;
        Some(InboundMessage {
            from: ChannelAddress::Telegram(message.chat.id),
            text: message.text.clone().unwrap_or_default(),
            sender_handle: message
                .from
                .as_ref()
                .and_then(|s| s.username.as_ref())
                .map(|u| format!("@{}", u)),
        })
    }
}
