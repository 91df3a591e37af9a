//! The dispatch broker: intake, the shared job queue, worker streams, the
//! update loop and the observer stream.

pub mod queue;
pub mod server;
pub mod service;
pub mod updater;

pub use queue::{JobQueue, QueuedJob};
pub use server::Broker;
pub use service::BrokerService;
pub use updater::{update_hub, UpdateHub, Updater};

use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::auth::AttachToken;
use crate::config::KeepaliveConfig;
use crate::error::Result;
use crate::keepalive;
use crate::proto::judge::judge_service_client::JudgeServiceClient;

/// Largest gRPC message accepted or sent; submissions carry all test data.
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

pub type BrokerClient = JudgeServiceClient<InterceptedService<Channel, AttachToken>>;

fn client(channel: Channel, token: Option<&str>) -> Result<BrokerClient> {
    Ok(JudgeServiceClient::with_interceptor(channel, AttachToken::new(token)?)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE))
}

/// Connect to a broker, attaching `token` to every call when set.
pub async fn connect(
    addr: &str,
    token: Option<&str>,
    cfg: &KeepaliveConfig,
) -> Result<BrokerClient> {
    let channel = keepalive::client_endpoint(addr, cfg)?
        .connect()
        .await?;
    client(channel, token)
}

/// Like [`connect`], but the connection is made on first use.
pub fn connect_lazy(addr: &str, token: Option<&str>, cfg: &KeepaliveConfig) -> Result<BrokerClient> {
    let channel = keepalive::client_endpoint(addr, cfg)?.connect_lazy();
    client(channel, token)
}
