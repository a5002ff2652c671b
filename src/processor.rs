// src/processor.rs
// Typed client for the external payment processor. The processor is the
// service of record for custody, balances and on-chain transfers; this crate
// only relays.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;

/// Request/response surface the relay consumes. Implemented over HTTP by
/// `ProcessorClient`; tests substitute their own implementation.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn create_user(&self, req: &CreateUserRequest) -> Result<ProcessorUser, ProcessorError>;
    async fn enable_gas(&self, user_id: &str) -> Result<(), ProcessorError>;
    async fn mint_funds(&self, req: &MintRequest) -> Result<(), ProcessorError>;
    async fn transfer_funds(
        &self,
        sender_id: &str,
        req: &TransferRequest,
    ) -> Result<TransferResponse, ProcessorError>;
    async fn get_balance(&self, user_id: &str) -> Result<Vec<TokenBalance>, ProcessorError>;
    async fn get_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<ProcessorTransaction>, ProcessorError>;
    async fn create_charge(
        &self,
        merchant_id: &str,
        req: &CreateChargeRequest,
    ) -> Result<ProcessorCharge, ProcessorError>;
    async fn get_charge(&self, charge_id: &str) -> Result<ProcessorCharge, ProcessorError>;
    async fn update_charge(
        &self,
        merchant_id: &str,
        charge_id: &str,
        status: &str,
    ) -> Result<(), ProcessorError>;
    async fn get_all_coupons(&self) -> Result<Vec<Coupon>, ProcessorError>;
}

#[derive(Debug, Serialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ProcessorUser {
    pub id: String,
    #[serde(rename = "paymentIdentifier")]
    pub payment_identifier: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    #[serde(rename = "transactionAmount")]
    pub amount: Decimal,
    #[serde(rename = "transactionRecipient")]
    pub recipient_payment_id: String,
    #[serde(rename = "transactionNotes")]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MintRequest {
    #[serde(rename = "transactionAmount")]
    pub amount: Decimal,
    #[serde(rename = "transactionRecipient")]
    pub recipient_payment_id: String,
    #[serde(rename = "transactionNotes")]
    pub notes: String,
}

/// A transfer response. The receipt is the ledger's word: HTTP success with a
/// missing or non-1 receipt status means the funds did NOT move.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferResponse {
    pub receipt: Option<TransferReceipt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferReceipt {
    pub status: i64,
}

impl TransferResponse {
    pub fn committed(&self) -> bool {
        matches!(&self.receipt, Some(receipt) if receipt.status == 1)
    }
}

/// One entry of the processor's token balance list. The balance comes over
/// the wire as a string ("39.0").
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBalance {
    pub name: Option<String>,
    pub balance: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorTransaction {
    #[serde(rename = "txType")]
    pub tx_type: String,
    pub value: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct CreateChargeRequest {
    #[serde(rename = "paymentId")]
    pub payment_id: String,
    pub amount: Decimal,
    pub note: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorCharge {
    pub id: String,
    pub status: String,
    pub amount: Decimal,
    #[serde(default)]
    pub note: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Coupon {
    pub id: String,
    pub code: String,
    pub title: String,
}

// Internal response envelopes
#[derive(Deserialize)]
struct UserEnvelope {
    user: ProcessorUser,
}

#[derive(Deserialize)]
struct TokensEnvelope {
    #[serde(default)]
    tokens: Vec<TokenBalance>,
}

#[derive(Deserialize)]
struct TransactionsEnvelope {
    #[serde(default)]
    transactions: Vec<ProcessorTransaction>,
}

#[derive(Deserialize)]
struct ChargeEnvelope {
    charge: ProcessorCharge,
}

/// HTTP client for the processor REST API.
#[derive(Clone)]
pub struct ProcessorClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl ProcessorClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .bearer_auth(&self.api_key)
    }

    /// Send a request, mapping non-2xx responses to `ProcessorError::Api`
    /// with the body preserved for operator diagnosis.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ProcessorError> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn send_ignore_body(&self, req: RequestBuilder) -> Result<(), ProcessorError> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for ProcessorClient {
    async fn create_user(&self, req: &CreateUserRequest) -> Result<ProcessorUser, ProcessorError> {
        let envelope: UserEnvelope = self
            .send(self.request(Method::POST, "/users").json(req))
            .await?;
        Ok(envelope.user)
    }

    async fn enable_gas(&self, user_id: &str) -> Result<(), ProcessorError> {
        self.send_ignore_body(
            self.request(Method::POST, &format!("/activate-pay/{}", user_id))
                .json(&serde_json::json!({})),
        )
        .await
    }

    async fn mint_funds(&self, req: &MintRequest) -> Result<(), ProcessorError> {
        self.send_ignore_body(self.request(Method::POST, "/mint").json(req))
            .await
    }

    async fn transfer_funds(
        &self,
        sender_id: &str,
        req: &TransferRequest,
    ) -> Result<TransferResponse, ProcessorError> {
        self.send(
            self.request(Method::POST, &format!("/transfer/{}", sender_id))
                .json(req),
        )
        .await
    }

    async fn get_balance(&self, user_id: &str) -> Result<Vec<TokenBalance>, ProcessorError> {
        let envelope: TokensEnvelope = self
            .send(self.request(Method::GET, &format!("/{}/balance", user_id)))
            .await?;
        Ok(envelope.tokens)
    }

    async fn get_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<ProcessorTransaction>, ProcessorError> {
        let envelope: TransactionsEnvelope = self
            .send(self.request(Method::GET, &format!("/{}/transactions", user_id)))
            .await?;
        Ok(envelope.transactions)
    }

    async fn create_charge(
        &self,
        merchant_id: &str,
        req: &CreateChargeRequest,
    ) -> Result<ProcessorCharge, ProcessorError> {
        let envelope: ChargeEnvelope = self
            .send(
                self.request(Method::POST, &format!("/charge/{}/create", merchant_id))
                    .json(req),
            )
            .await?;
        Ok(envelope.charge)
    }

    async fn get_charge(&self, charge_id: &str) -> Result<ProcessorCharge, ProcessorError> {
        let envelope: ChargeEnvelope = self
            .send(self.request(Method::GET, &format!("/retrieve-charge/{}", charge_id)))
            .await?;
        Ok(envelope.charge)
    }

    async fn update_charge(
        &self,
        merchant_id: &str,
        charge_id: &str,
        status: &str,
    ) -> Result<(), ProcessorError> {
        self.send_ignore_body(
            self.request(
                Method::PUT,
                &format!("/charge/{}/{}/update", merchant_id, charge_id),
            )
            .json(&serde_json::json!({ "status": status })),
        )
        .await
    }

    async fn get_all_coupons(&self) -> Result<Vec<Coupon>, ProcessorError> {
        self.send(self.request(Method::GET, "/coupons")).await
    }
}
