use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{JudgeError, Result};
use crate::hub::Hub;
use crate::model::JudgeUpdate;
use crate::proto::judge as pb;
use crate::store::SubmissionStore;

const FINISHED_ATTEMPTS: u32 = 3;
const FINISHED_BACKOFF: Duration = Duration::from_millis(100);

/// Hub fanning judge updates out to `Updates` subscribers. Each update is
/// encoded to its protobuf form once.
pub type UpdateHub = Hub<JudgeUpdate, Arc<pb::JudgeUpdate>>;

pub fn update_hub(mailbox: usize) -> UpdateHub {
    Hub::spawn(mailbox, |update: JudgeUpdate| Arc::new(update.into()))
}

/// Entry point of the single update-application loop. Every update, from
/// intake or from a worker, goes through here so a submission only ever
/// has one writer.
#[derive(Clone)]
pub struct Updater {
    tx: mpsc::Sender<JudgeUpdate>,
}

impl Updater {
    pub fn spawn(
        store: Arc<dyn SubmissionStore>,
        hub: UpdateHub,
        buffer: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(run(rx, store, hub));
        (Self { tx }, handle)
    }

    pub async fn send(&self, update: JudgeUpdate) -> Result<()> {
        self.tx
            .send(update)
            .await
            .map_err(|_| JudgeError::ShuttingDown)
    }
}

async fn run(mut rx: mpsc::Receiver<JudgeUpdate>, store: Arc<dyn SubmissionStore>, hub: UpdateHub) {
    while let Some(update) = rx.recv().await {
        match persist(store.as_ref(), &update).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    submission_id = %update.id,
                    status = %update.status,
                    "Ignoring update for finished submission"
                );
                continue;
            }
            Err(e) => {
                if update.is_finished() {
                    tracing::error!(
                        submission_id = %update.id,
                        status = %update.status,
                        error = %e,
                        "Dropping finished update after repeated persistence failures"
                    );
                } else {
                    tracing::warn!(
                        submission_id = %update.id,
                        status = %update.status,
                        error = %e,
                        "Dropping progress update"
                    );
                }
                continue;
            }
        }

        tracing::debug!(submission_id = %update.id, status = %update.status, "Publishing update");
        if hub.publish(update).await.is_err() {
            tracing::warn!("Update hub stopped, ending update loop");
            break;
        }
    }
    tracing::debug!("Update loop stopped");
}

/// Progress is written once. Finished updates are retried with a short
/// backoff before giving up.
async fn persist(store: &dyn SubmissionStore, update: &JudgeUpdate) -> Result<bool> {
    let attempts = if update.is_finished() {
        FINISHED_ATTEMPTS
    } else {
        1
    };
    let mut attempt = 1;
    loop {
        match store.update(update).await {
            Ok(applied) => return Ok(applied),
            Err(e @ JudgeError::SubmissionNotFound(_)) => return Err(e),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::warn!(
                    submission_id = %update.id,
                    attempt,
                    error = %e,
                    "Failed to persist finished update, retrying"
                );
                attempt += 1;
                tokio::time::sleep(FINISHED_BACKOFF).await;
            }
        }
    }
}
