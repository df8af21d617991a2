#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tally_adapter::{
    AdapterHealthResponse, AdapterReply, AdapterRuntime, AdapterStoreCounters,
    CampaignAdapterResponse, CampaignAuditAdapterResponse, CampaignDonationsAdapterResponse,
    VerifyDonationAdapterRequest, VerifyDonationAdapterResponse, WebhookAdapterResponse,
    WEBHOOK_SIGNATURE_HEADER,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct AdapterState {
    runtime: AdapterRuntime,
    request_timeout: Duration,
}

type SharedState = Arc<AdapterState>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let bind = env::var("TALLY_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let request_timeout_ms = parse_request_timeout_ms_from_env();

    let runtime = AdapterRuntime::default_from_env()?;
    let gateway_mode = runtime.gateway_mode();
    let webhook_enabled = runtime.webhook_enabled();
    let state = Arc::new(AdapterState {
        runtime,
        request_timeout: Duration::from_millis(request_timeout_ms),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/donations/verify", post(verify_donation))
        .route("/v1/campaigns/:campaign_id", get(campaign))
        .route("/v1/campaigns/:campaign_id/donations", get(campaign_donations))
        .route("/v1/campaigns/:campaign_id/audit", get(campaign_audit))
        .route("/v1/webhooks/gateway", post(gateway_webhook))
        .with_state(state);

    info!(
        %addr,
        gateway_mode,
        webhook_enabled,
        request_timeout_ms,
        "tally_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn parse_request_timeout_ms_from_env() -> u64 {
    env::var("TALLY_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (100..=120_000).contains(v))
        .unwrap_or(10_000)
}

/// Runs synchronous runtime work on the blocking pool under the request timeout.
/// `on_failure` builds the body for a timeout (503) or a panicked worker (500).
async fn run_blocking<T, F, E>(
    state: SharedState,
    work: F,
    on_failure: E,
) -> (StatusCode, Json<T>)
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdapterRuntime) -> AdapterReply<T> + Send + 'static,
    E: FnOnce(String) -> T,
{
    let timeout = state.request_timeout;
    let task = tokio::task::spawn_blocking(move || work(&state.runtime));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(reply)) => (
            StatusCode::from_u16(reply.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(reply.body),
        ),
        Ok(Err(join_err)) => {
            error!(error = %join_err, "adapter worker failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(on_failure("adapter worker failed".to_string())),
            )
        }
        Err(_) => {
            error!(timeout_ms = timeout.as_millis() as u64, "adapter request timed out");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(on_failure("request timed out; retry later".to_string())),
            )
        }
    }
}

async fn healthz(State(state): State<SharedState>) -> (StatusCode, Json<AdapterHealthResponse>) {
    match state.runtime.health_report() {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(reason),
                gateway_mode: state.runtime.gateway_mode().to_string(),
                webhook_enabled: state.runtime.webhook_enabled(),
                store: AdapterStoreCounters::default(),
            }),
        ),
    }
}

async fn verify_donation(
    State(state): State<SharedState>,
    Json(request): Json<VerifyDonationAdapterRequest>,
) -> (StatusCode, Json<VerifyDonationAdapterResponse>) {
    run_blocking(
        state,
        move |runtime| runtime.verify_donation(request),
        |reason| VerifyDonationAdapterResponse {
            status: "error".to_string(),
            outcome: "RETRY".to_string(),
            retryable: true,
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

async fn campaign(
    State(state): State<SharedState>,
    Path(campaign_id): Path<String>,
) -> (StatusCode, Json<CampaignAdapterResponse>) {
    run_blocking(
        state,
        move |runtime| runtime.campaign(&campaign_id),
        |reason| CampaignAdapterResponse {
            status: "error".to_string(),
            campaign: None,
            reason: Some(reason),
        },
    )
    .await
}

async fn campaign_donations(
    State(state): State<SharedState>,
    Path(campaign_id): Path<String>,
) -> (StatusCode, Json<CampaignDonationsAdapterResponse>) {
    run_blocking(
        state,
        move |runtime| runtime.campaign_donations(&campaign_id),
        |reason| CampaignDonationsAdapterResponse {
            status: "error".to_string(),
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

async fn campaign_audit(
    State(state): State<SharedState>,
    Path(campaign_id): Path<String>,
) -> (StatusCode, Json<CampaignAuditAdapterResponse>) {
    run_blocking(
        state,
        move |runtime| runtime.campaign_audit(&campaign_id),
        |reason| CampaignAuditAdapterResponse {
            status: "error".to_string(),
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

async fn gateway_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookAdapterResponse>) {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    run_blocking(
        state,
        move |runtime| runtime.handle_webhook(&body, signature.as_deref()),
        |reason| WebhookAdapterResponse {
            status: "error".to_string(),
            outcome: "RETRY".to_string(),
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(request_timeout: Duration) -> SharedState {
        Arc::new(AdapterState {
            runtime: AdapterRuntime::default(),
            request_timeout,
        })
    }

    fn retry_body(reason: String) -> VerifyDonationAdapterResponse {
        VerifyDonationAdapterResponse {
            status: "error".to_string(),
            outcome: "RETRY".to_string(),
            retryable: true,
            reason: Some(reason),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn at_http_01_slow_work_times_out_as_retryable_without_writes() {
        let state = state(Duration::from_millis(50));
        let shared = state.clone();
        let (status, Json(body)) = run_blocking(
            state,
            |_runtime| {
                std::thread::sleep(Duration::from_millis(300));
                AdapterReply {
                    http_status: 200,
                    body: VerifyDonationAdapterResponse::default(),
                }
            },
            retry_body,
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.retryable);
        assert_eq!(body.outcome, "RETRY");
        assert_eq!(shared.runtime.health_report().unwrap().store.commits, 0);
    }

    #[tokio::test]
    async fn at_http_02_fast_work_keeps_its_status() {
        let (status, Json(body)) = run_blocking(
            state(Duration::from_secs(5)),
            |_runtime| AdapterReply {
                http_status: 202,
                body: VerifyDonationAdapterResponse {
                    status: "pending".to_string(),
                    ..Default::default()
                },
            },
            retry_body,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.status, "pending");
    }
}
