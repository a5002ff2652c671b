// src/api.rs
// Axum-based API router: channel webhooks, merchant charge creation, user
// registration, merchant dashboard reads.

use axum::extract::{Extension, Path};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::channel::{ChannelAddress, TelegramUpdate, TwilioInbound};
use crate::chat::ChatRelay;
use crate::config::RelayConfig;
use crate::error::{ProcessorError, StoreError};
use crate::processor::{CreateChargeRequest, CreateUserRequest, MintRequest, Processor};
use crate::store::{Charge, ChargeStatus, Store, User};
use crate::transfer::zar;

type ApiResult = Result<Response, ApiError>;

#[derive(Debug, Error)]
enum ApiError {
    #[error("storage error")]
    Store(#[from] StoreError),

    #[error("processor error")]
    Processor(#[from] ProcessorError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Store(e) => {
                error!("storage error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
            ApiError::Processor(e) => {
                error!("processor error: {:?}", e);
                (StatusCode::BAD_GATEWAY, "processor error".to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };
        let body_json = serde_json::json!({ "error": body });
        (status, Json(body_json)).into_response()
    }
}

///////////////////////////////////////////////////////////////////////////
// POST /api/whatsapp/webhook
///////////////////////////////////////////////////////////////////////////
async fn whatsapp_webhook(
    Extension(relay): Extension<Arc<ChatRelay>>,
    Form(payload): Form<TwilioInbound>,
) -> impl IntoResponse {
    let inbound = payload.normalize();

    // Acknowledge before the work: the provider retries on anything but 2xx,
    // and the business outcome is reported over the channel itself.
    tokio::spawn(async move {
        relay.handle_inbound(inbound).await;
    });

    (StatusCode::OK, "OK")
}

///////////////////////////////////////////////////////////////////////////
// POST /api/telegram/webhook
///////////////////////////////////////////////////////////////////////////
async fn telegram_webhook(
    Extension(relay): Extension<Arc<ChatRelay>>,
    Json(update): Json<TelegramUpdate>,
) -> impl IntoResponse {
    let Some(inbound) = update.normalize() else {
        warn!("⚠️ Received webhook without message, ignoring");
        return (StatusCode::OK, "OK");
    };

    tokio::spawn(async move {
        relay.handle_inbound(inbound).await;
    });

    (StatusCode::OK, "OK")
}

///////////////////////////////////////////////////////////////////////////
// POST /api/merchants/charge
///////////////////////////////////////////////////////////////////////////
#[derive(Debug, Deserialize)]
struct CreateChargeBody {
    /// Merchant handle, `@name` form.
    #[serde(rename = "merchantId")]
    merchant_handle: String,
    amount: Decimal,
    notes: Option<String>,
}

async fn create_charge(
    Extension(store): Extension<Arc<dyn Store>>,
    Extension(processor): Extension<Arc<dyn Processor>>,
    Json(body): Json<CreateChargeBody>,
) -> ApiResult {
    if body.merchant_handle.trim().is_empty() {
        return Err(ApiError::BadRequest("merchantId (handle) is required".into()));
    }
    if body.amount <= Decimal::ZERO {
        return Err(ApiError::BadRequest("amount must be positive".into()));
    }

    let merchant = store
        .find_user_by_handle(&body.merchant_handle)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "Merchant with handle '{}' not found.",
                body.merchant_handle
            ))
        })?;

    let notes = body.notes.unwrap_or_default();
    let created = processor
        .create_charge(
            &merchant.id,
            &CreateChargeRequest {
                payment_id: merchant.payment_identifier.clone(),
                amount: body.amount,
                note: notes.clone(),
            },
        )
        .await?;

    // The processor issues the id; the local row is the lifecycle record the
    // redemption path claims against.
    let charge = Charge {
        id: created.id.clone(),
        merchant_id: merchant.id.clone(),
        customer_id: None,
        customer_handle: None,
        amount: body.amount,
        notes,
        status: ChargeStatus::Pending,
        created_at: Utc::now(),
    };
    store.save_charge(&charge).await?;

    info!("Charge created: {} for {}", charge.id, zar(charge.amount));

    let body = serde_json::json!({
        "message": "Charge created successfully.",
        "chargeId": charge.id,
        "qrContent": format!("pay {}", charge.id),
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

///////////////////////////////////////////////////////////////////////////
// POST /api/users/register
///////////////////////////////////////////////////////////////////////////
#[derive(Debug, Deserialize)]
struct RegisterBody {
    handle: String,
    email: String,
    #[serde(rename = "whatsappNumber")]
    whatsapp_number: Option<String>,
    #[serde(rename = "telegramChatId")]
    telegram_chat_id: Option<i64>,
    #[serde(rename = "firstName")]
    first_name: Option<String>,
    #[serde(rename = "lastName")]
    last_name: Option<String>,
}

async fn register_user(
    Extension(store): Extension<Arc<dyn Store>>,
    Extension(processor): Extension<Arc<dyn Processor>>,
    Extension(config): Extension<RelayConfig>,
    Json(body): Json<RegisterBody>,
) -> ApiResult {
    if body.handle.trim().is_empty() || body.email.trim().is_empty() {
        return Err(ApiError::BadRequest("handle and email are required".into()));
    }
    let channel_address = match (&body.whatsapp_number, body.telegram_chat_id) {
        (Some(number), _) if !number.trim().is_empty() => {
            ChannelAddress::Whatsapp(number.trim().to_string())
        }
        (_, Some(chat_id)) => ChannelAddress::Telegram(chat_id),
        _ => {
            return Err(ApiError::BadRequest(
                "whatsappNumber or telegramChatId is required".into(),
            ))
        }
    };

    // The processor is the system of record: it assigns the user id and the
    // payment identifier, which are mirrored locally.
    info!("Creating user '{}' with the processor...", body.handle);
    let created = processor
        .create_user(&CreateUserRequest {
            email: body.email.clone(),
            first_name: body.first_name.unwrap_or_else(|| "ZarLink".into()),
            last_name: body.last_name.unwrap_or_else(|| "User".into()),
        })
        .await?;
    info!("Processor user created with ID: {}", created.id);

    let user = User {
        id: created.id.clone(),
        payment_identifier: created.payment_identifier.clone(),
        handle: body.handle.clone(),
        channel_address,
        created_at: Utc::now(),
    };
    store.save_user(&user).await?;

    // Gas activation and the welcome bonus are slow; run them after the
    // response, like every other side effect of an accepted request.
    let bonus = config.welcome_bonus;
    tokio::spawn(async move {
        provision_welcome_bonus(processor, created.id, created.payment_identifier, bonus).await;
    });

    let body = serde_json::json!({
        "message": "User registration successful. Welcome bonus is being processed.",
        "userId": user.id,
        "handle": user.handle,
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn provision_welcome_bonus(
    processor: Arc<dyn Processor>,
    user_id: String,
    payment_id: String,
    bonus: Decimal,
) {
    info!("[Background] Starting bonus provisioning for user: {}", user_id);

    if let Err(e) = processor.enable_gas(&user_id).await {
        error!("[Background] FAILED to enable gas for user {}: {}", user_id, e);
        return;
    }
    info!("[Background] Gas enabled for user: {}. Waiting...", user_id);

    // The processor needs a moment after gas activation before the account
    // can receive a mint.
    tokio::time::sleep(Duration::from_secs(10)).await;

    match processor
        .mint_funds(&MintRequest {
            amount: bonus,
            recipient_payment_id: payment_id,
            notes: "Welcome bonus".into(),
        })
        .await
    {
        Ok(()) => info!(
            "[Background] SUCCESS: {} welcome bonus minted for user: {}",
            zar(bonus),
            user_id
        ),
        Err(e) => error!(
            "[Background] FAILED to provision bonus for user {}: {}",
            user_id, e
        ),
    }
}

///////////////////////////////////////////////////////////////////////////
// GET /api/dashboard/:merchant_id/...
///////////////////////////////////////////////////////////////////////////
async fn dashboard_stats(
    Path(merchant_id): Path<String>,
    Extension(store): Extension<Arc<dyn Store>>,
) -> ApiResult {
    let stats = store.merchant_stats(&merchant_id).await?;
    Ok((StatusCode::OK, Json(serde_json::json!(stats))).into_response())
}

async fn dashboard_transactions(
    Path(merchant_id): Path<String>,
    Extension(store): Extension<Arc<dyn Store>>,
) -> ApiResult {
    let charges = store.merchant_charges(&merchant_id).await?;
    let out: Vec<_> = charges
        .iter()
        .map(|charge| {
            serde_json::json!({
                "id": charge.id,
                "created_at": charge.created_at,
                "customer_handle": charge.customer_handle,
                "amount": charge.amount,
                "status": charge.status.as_str(),
            })
        })
        .collect();
    Ok((StatusCode::OK, Json(out)).into_response())
}

async fn dashboard_customers(
    Path(merchant_id): Path<String>,
    Extension(store): Extension<Arc<dyn Store>>,
) -> ApiResult {
    let customers = store.merchant_customers(&merchant_id).await?;
    Ok((StatusCode::OK, Json(serde_json::json!(customers))).into_response())
}

///////////////////////////////////////////////////////////////////////////
// GET /health
///////////////////////////////////////////////////////////////////////////
async fn health(Extension(store): Extension<Arc<dyn Store>>) -> impl IntoResponse {
    match store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        Err(e) => {
            error!("health: store error: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "store-unavailable" })),
            )
        }
    }
}

/// Request logging middleware.
async fn logging_middleware<B>(req: Request<B>, next: Next<B>) -> Result<Response, StatusCode> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    info!("{} {} {} - {:.3}s", method, path, status, latency);

    Ok(response)
}

/// Build the router (call from main).
pub fn router(
    relay: Arc<ChatRelay>,
    store: Arc<dyn Store>,
    processor: Arc<dyn Processor>,
    config: RelayConfig,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/whatsapp/webhook", post(whatsapp_webhook))
        .route("/api/telegram/webhook", post(telegram_webhook))
        .route("/api/merchants/charge", post(create_charge))
        .route("/api/users/register", post(register_user))
        .route("/api/dashboard/:merchant_id/stats", get(dashboard_stats))
        .route(
            "/api/dashboard/:merchant_id/transactions",
            get(dashboard_transactions),
        )
        .route(
            "/api/dashboard/:merchant_id/customers",
            get(dashboard_customers),
        )
        .layer(middleware::from_fn(logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(relay))
        .layer(Extension(store))
        .layer(Extension(processor))
        .layer(Extension(config))
}
