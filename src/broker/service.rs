use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use super::queue::{JobQueue, QueuedJob};
use super::updater::{UpdateHub, Updater};
use crate::error::JudgeError;
use crate::model::{
    JudgeRequest, JudgeUpdate, Language, NewSubmission, STATUS_REJECTED_QUEUE_FULL,
};
use crate::proto::judge::judge_service_server::JudgeService;
use crate::proto::judge::{
    JudgeRequest as PbJudgeRequest, JudgeUpdate as PbJudgeUpdate, ShellInput, ShellOutput,
    SubmissionRequest, SubmissionResponse, SubmitRequest, SubmitResponse, UpdatesRequest,
};
use crate::shell::{ClientFrame, ShellRelay};
use crate::store::SubmissionStore;

type BoxStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send>>;

const SHELL_BUFFER: usize = 32;

/// gRPC face of the broker.
#[derive(Clone)]
pub struct BrokerService {
    store: Arc<dyn SubmissionStore>,
    queue: Arc<JobQueue>,
    updater: Updater,
    hub: UpdateHub,
    shell: ShellRelay,
    shutdown: CancellationToken,
}

impl BrokerService {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        queue: Arc<JobQueue>,
        updater: Updater,
        hub: UpdateHub,
        shell: ShellRelay,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            updater,
            hub,
            shell,
            shutdown,
        }
    }

    /// Persist, announce and enqueue a submission.
    async fn accept(&self, req: SubmitRequest) -> crate::error::Result<String> {
        let language: Language = req
            .language
            .ok_or_else(|| JudgeError::InvalidRequest("language is required".into()))?
            .into();
        language.validate()?;
        if req.source.trim().is_empty() {
            return Err(JudgeError::InvalidRequest("source cannot be empty".into()));
        }

        let submission = self
            .store
            .insert(NewSubmission {
                language: language.clone(),
                source: req.source.clone(),
            })
            .await?;
        let id = submission.id.clone();

        // Goes through the update loop ahead of anything a worker can send.
        self.updater.send(JudgeUpdate::queued(&submission)).await?;

        let request = JudgeRequest {
            id: id.clone(),
            language,
            source: req.source,
            cases: req.cases.into_iter().map(Into::into).collect(),
        };
        let cases = request.cases.len();
        if let Err(e) = self.queue.push(request) {
            tracing::warn!(submission_id = %id, error = %e, "Rejecting submission");
            self.updater
                .send(JudgeUpdate::finished(id, STATUS_REJECTED_QUEUE_FULL, Vec::new()))
                .await?;
            return Err(e);
        }

        tracing::info!(
            submission_id = %id,
            language = %submission.language.name,
            cases,
            "Submission queued"
        );
        Ok(id)
    }
}

/// Serve one worker stream: hand out one request at a time and relay its
/// updates until the finished one. Whatever is in flight when the stream
/// breaks goes back to the tail of the queue.
async fn dispatch(
    queue: Arc<JobQueue>,
    updater: Updater,
    mut inbound: Streaming<PbJudgeUpdate>,
    outbound: mpsc::Sender<Result<PbJudgeRequest, Status>>,
    shutdown: CancellationToken,
) {
    loop {
        let job: QueuedJob = tokio::select! {
            job = queue.pop() => job,
            _ = outbound.closed() => {
                tracing::info!("Worker disconnected while idle");
                return;
            }
            _ = shutdown.cancelled() => return,
        };
        let id = job.request.id.clone();

        if outbound.send(Ok(job.request.clone().into())).await.is_err() {
            tracing::warn!(submission_id = %id, "Worker stream closed before dispatch");
            queue.requeue(job);
            return;
        }
        tracing::info!(submission_id = %id, attempts = job.attempts, "Dispatched judge request");

        loop {
            let message = tokio::select! {
                message = inbound.message() => message,
                _ = shutdown.cancelled() => {
                    abandon(&queue, job, &outbound, "broker shutting down");
                    return;
                }
            };
            let update = match message {
                Ok(Some(update)) => update,
                Ok(None) => {
                    tracing::warn!(submission_id = %id, "Worker closed stream mid-job");
                    abandon(&queue, job, &outbound, "update stream closed before the verdict");
                    return;
                }
                Err(status) => {
                    tracing::warn!(submission_id = %id, error = %status, "Worker stream failed");
                    abandon(&queue, job, &outbound, "update stream failed");
                    return;
                }
            };
            let update = match JudgeUpdate::try_from(update) {
                Ok(update) if update.id == id => update,
                Ok(update) => {
                    tracing::warn!(
                        submission_id = %id,
                        update_id = %update.id,
                        "Ignoring update for another submission"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(submission_id = %id, error = %e, "Ignoring malformed update");
                    continue;
                }
            };
            let finished = update.is_finished();
            if updater.send(update).await.is_err() {
                abandon(&queue, job, &outbound, "broker shutting down");
                return;
            }
            if finished {
                tracing::info!(submission_id = %id, "Judge request finished");
                break;
            }
        }
    }
}

/// Put the in-flight job back and fail the worker's call, so the worker can
/// tell a requeue from a clean close.
fn abandon(
    queue: &JobQueue,
    job: QueuedJob,
    outbound: &mpsc::Sender<Result<PbJudgeRequest, Status>>,
    reason: &str,
) {
    let id = job.request.id.clone();
    queue.requeue(job);
    let status = Status::unavailable(format!("judge request {} requeued: {}", id, reason));
    // Nothing to tell when the worker is already gone.
    let _ = outbound.try_send(Err(status));
}

#[tonic::async_trait]
impl JudgeService for BrokerService {
    type JudgeStream = BoxStream<PbJudgeRequest>;
    type UpdatesStream = BoxStream<PbJudgeUpdate>;
    type ShellStream = BoxStream<ShellOutput>;

    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let id = self.accept(request.into_inner()).await?;
        Ok(Response::new(SubmitResponse { id }))
    }

    async fn submission(
        &self,
        request: Request<SubmissionRequest>,
    ) -> Result<Response<SubmissionResponse>, Status> {
        let req = request.into_inner();
        let cursor = Some(req.id.as_str()).filter(|id| !id.is_empty());
        let submissions = self.store.query(cursor).await?;
        Ok(Response::new(SubmissionResponse {
            submissions: submissions.into_iter().map(Into::into).collect(),
        }))
    }

    async fn judge(
        &self,
        request: Request<Streaming<PbJudgeUpdate>>,
    ) -> Result<Response<Self::JudgeStream>, Status> {
        let remote = request.remote_addr();
        tracing::info!(remote = ?remote, "Worker connected");

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(dispatch(
            self.queue.clone(),
            self.updater.clone(),
            request.into_inner(),
            tx,
            self.shutdown.child_token(),
        ));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::JudgeStream))
    }

    async fn updates(
        &self,
        _request: Request<UpdatesRequest>,
    ) -> Result<Response<Self::UpdatesStream>, Status> {
        let mut observer = self
            .hub
            .subscribe()
            .await
            .map_err(|_| Status::from(JudgeError::ShuttingDown))?;
        let shutdown = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let observer_id = observer.id();
            tracing::debug!(observer_id, "Observer subscribed");
            loop {
                let update = tokio::select! {
                    update = observer.recv() => update,
                    _ = tx.closed() => break,
                    _ = shutdown.cancelled() => break,
                };
                let Some(update) = update else {
                    // Evicted for being too slow.
                    let _ = tx.send(Err(Status::resource_exhausted("observer too slow"))).await;
                    break;
                };
                if tx.send(Ok(update.as_ref().clone())).await.is_err() {
                    break;
                }
            }
            tracing::debug!(observer_id, "Observer gone");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::UpdatesStream))
    }

    async fn shell(
        &self,
        request: Request<Streaming<ShellInput>>,
    ) -> Result<Response<Self::ShellStream>, Status> {
        let session = self.shell.open().await?;
        let inbound = request
            .into_inner()
            .map_while(|msg| msg.ok())
            .filter_map(ClientFrame::from_proto);
        let (tx, rx) = mpsc::channel(SHELL_BUFFER);
        let relay = self.shell.clone();
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            relay.run(session, Box::pin(inbound), tx, cancel).await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::ShellStream))
    }
}
