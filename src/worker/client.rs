use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::grader::Grader;
use crate::broker;
use crate::config::WorkerConfig;
use crate::error::{JudgeError, Result};
use crate::model::{JudgeRequest, JudgeUpdate, Verdict};
use crate::proto::judge as pb;
use crate::sandbox::Sandbox;

const UPDATE_BUFFER: usize = 64;

/// Upper bound of the random delay added to every reconnect.
const MAX_JITTER_MS: u64 = 1000;

/// Grading worker: holds one judge stream to the broker and grades whatever
/// it is handed, one request at a time.
pub struct Worker {
    config: WorkerConfig,
    grader: Grader,
}

impl Worker {
    pub fn new(config: WorkerConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        let grader = Grader::new(sandbox, config.limits);
        Self { config, grader }
    }

    /// Serve the broker until `shutdown` fires, reconnecting after every
    /// failure.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let outcome = tokio::select! {
                outcome = self.session() => outcome,
                _ = shutdown.cancelled() => break,
            };
            match outcome {
                Ok(()) => tracing::info!(broker = %self.config.broker_addr, "Broker closed the judge stream"),
                Err(e) => tracing::warn!(broker = %self.config.broker_addr, error = %e, "Judge stream failed"),
            }

            let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
            let delay = self.config.reconnect_interval + Duration::from_millis(jitter);
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting to broker");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::info!("Worker stopped");
    }

    async fn session(&self) -> Result<()> {
        let mut client = broker::connect(
            &self.config.broker_addr,
            self.config.auth_token.as_deref(),
            &self.config.keepalive,
        )
        .await?;

        let (tx, rx) = mpsc::channel::<pb::JudgeUpdate>(UPDATE_BUFFER);
        let mut requests = client.judge(ReceiverStream::new(rx)).await?.into_inner();
        tracing::info!(broker = %self.config.broker_addr, "Connected to broker");

        while let Some(request) = requests.message().await? {
            let id = request.id.clone();
            match JudgeRequest::try_from(request) {
                Ok(request) => self.handle(request, &tx).await?,
                Err(e) => {
                    tracing::warn!(submission_id = %id, error = %e, "Rejecting malformed judge request");
                    let update = JudgeUpdate::finished(id, Verdict::JudgementFailed.to_string(), Vec::new());
                    tx.send(update.into())
                        .await
                        .map_err(|_| JudgeError::Internal("judge stream closed".into()))?;
                }
            }
        }
        Ok(())
    }

    /// Grade one request while streaming its updates to the broker. A broken
    /// stream aborts the grading.
    async fn handle(&self, request: JudgeRequest, tx: &mpsc::Sender<pb::JudgeUpdate>) -> Result<()> {
        let id = request.id.clone();
        tracing::info!(
            submission_id = %id,
            language = %request.language.name,
            cases = request.cases.len(),
            "Grading"
        );

        let (updates, mut pending) = mpsc::channel::<JudgeUpdate>(UPDATE_BUFFER);
        let grader = self.grader.clone();
        let grading = async move { Ok::<_, JudgeError>(grader.grade(request, &updates).await) };
        let forwarding = async {
            while let Some(update) = pending.recv().await {
                tx.send(update.into())
                    .await
                    .map_err(|_| JudgeError::Internal("judge stream closed".into()))?;
            }
            Ok::<_, JudgeError>(())
        };

        let (verdict, ()) = tokio::try_join!(grading, forwarding)?;
        tracing::debug!(submission_id = %id, verdict = %verdict, "Request done");
        Ok(())
    }
}
