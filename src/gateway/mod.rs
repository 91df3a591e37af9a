//! HTTP and WebSocket front for browsers.
//!
//! REST calls and shell sessions are forwarded to the broker. Judge updates
//! arrive over one broker `Updates` stream and are fanned out to WebSocket
//! clients through a hub of their own.

mod api;
mod ws;

use std::sync::Arc;

use axum::extract::ws::Message;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::{self, BrokerClient};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::hub::Hub;
use crate::model::JudgeUpdate;
use crate::proto::judge::UpdatesRequest;

/// Hub of WebSocket observers. Each update is encoded to JSON once.
pub type WsHub = Hub<JudgeUpdate, Message>;

pub fn ws_hub(mailbox: usize) -> WsHub {
    Hub::spawn(mailbox, |update: JudgeUpdate| {
        // Serializing plain data into a string cannot fail.
        let json = serde_json::to_string(&update).unwrap_or_default();
        Message::Text(json.into())
    })
}

#[derive(Clone)]
pub struct GatewayState {
    pub client: BrokerClient,
    pub hub: WsHub,
    pub config: Arc<GatewayConfig>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = broker::connect_lazy(
            &config.broker_addr,
            config.auth_token.as_deref(),
            &config.keepalive,
        )?;
        let hub = ws_hub(config.observer_mailbox);
        Ok(Self {
            client,
            hub,
            config: Arc::new(config),
        })
    }
}

pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/submit", post(api::submit))
        .route("/api/submission", get(api::submissions))
        .route("/api/ws/judge", get(ws::judge))
        .route("/api/ws/shell", get(ws::shell))
        .layer(DefaultBodyLimit::max(state.config.body_limit))
        .layer(cors)
        .with_state(state)
}

/// Keep one `Updates` subscription to the broker alive and republish what
/// it yields to the WebSocket hub.
pub async fn relay_updates(state: GatewayState, shutdown: CancellationToken) {
    loop {
        let mut client = state.client.clone();
        let outcome = tokio::select! {
            outcome = follow(&mut client, &state.hub) => outcome,
            _ = shutdown.cancelled() => break,
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "Broker update stream ended");
        }
        tokio::select! {
            _ = tokio::time::sleep(state.config.reconnect_interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn follow(client: &mut BrokerClient, hub: &WsHub) -> Result<()> {
    let mut updates = client.updates(UpdatesRequest {}).await?.into_inner();
    tracing::info!("Following broker updates");
    while let Some(update) = updates.message().await? {
        match JudgeUpdate::try_from(update) {
            Ok(update) => {
                if hub.publish(update).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed update"),
        }
    }
    Ok(())
}

pub async fn run(config: GatewayConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    serve_with_listener(config, listener, shutdown).await
}

pub async fn serve_with_listener(
    config: GatewayConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = GatewayState::new(config)?;
    tokio::spawn(relay_updates(state.clone(), shutdown.clone()));

    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, broker = %state.config.broker_addr, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Gateway stopped");
    Ok(())
}
