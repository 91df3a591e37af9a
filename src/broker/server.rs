use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;

use super::queue::JobQueue;
use super::service::BrokerService;
use super::updater::{update_hub, UpdateHub, Updater};
use super::MAX_MESSAGE_SIZE;
use crate::auth::RequireToken;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::keepalive;
use crate::proto::judge::judge_service_server::JudgeServiceServer;
use crate::sandbox::Sandbox;
use crate::shell::ShellRelay;
use crate::store::SubmissionStore;

/// A wired-up broker: queue, update loop, hub and gRPC service.
pub struct Broker {
    config: BrokerConfig,
    service: BrokerService,
    queue: Arc<JobQueue>,
    hub: UpdateHub,
    shutdown: CancellationToken,
    update_loop: JoinHandle<()>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn SubmissionStore>,
        sandbox: Arc<dyn Sandbox>,
        shutdown: CancellationToken,
    ) -> Self {
        let queue = Arc::new(JobQueue::with_capacity(config.queue_capacity));
        let hub = update_hub(config.observer_mailbox);
        let (updater, update_loop) = Updater::spawn(store.clone(), hub.clone(), config.update_buffer);
        let shell = ShellRelay::new(sandbox, store.clone(), config.shell.clone());
        let service = BrokerService::new(
            store,
            queue.clone(),
            updater,
            hub.clone(),
            shell,
            shutdown.clone(),
        );
        Self {
            config,
            service,
            queue,
            hub,
            shutdown,
            update_loop,
        }
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub fn hub(&self) -> UpdateHub {
        self.hub.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve_with_listener(listener).await
    }

    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            addr = %addr,
            queue_capacity = self.config.queue_capacity,
            auth = self.config.auth_token.is_some(),
            "Broker listening"
        );

        let server = JudgeServiceServer::new(self.service)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        let service = InterceptedService::new(
            server,
            RequireToken::new(self.config.auth_token.as_deref()),
        );
        let shutdown = self.shutdown.clone();

        keepalive::server_builder(&self.config.keepalive)
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await?;

        tracing::info!(pending = self.queue.len(), "Broker stopped");
        self.update_loop.abort();
        Ok(())
    }
}
