//! Persistence of submissions and shell transcripts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{JudgeError, Result};
use crate::model::{JudgeUpdate, NewSubmission, Submission};

/// Largest page returned by [`SubmissionStore::query`].
pub const PAGE_SIZE: usize = 10;

/// Input and output of one interactive shell session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub stdin: Vec<u8>,
    pub stdout: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[tonic::async_trait]
pub trait SubmissionStore: Send + Sync + 'static {
    /// Persist a new submission and assign its id.
    async fn insert(&self, new: NewSubmission) -> Result<Submission>;

    /// Apply a worker update. Returns false if the store ignored it because
    /// the submission had already finished.
    async fn update(&self, update: &JudgeUpdate) -> Result<bool>;

    /// Up to [`PAGE_SIZE`] submissions, newest first, strictly older than
    /// `cursor` when one is given.
    async fn query(&self, cursor: Option<&str>) -> Result<Vec<Submission>>;

    async fn store_transcript(&self, transcript: Transcript) -> Result<()>;
}

#[derive(Default)]
struct Data {
    seq: u64,
    submissions: BTreeMap<u64, Submission>,
    transcripts: Vec<Transcript>,
}

/// Process-local store. Ids are zero-padded hex of an increasing counter so
/// that their lexical order is creation order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Data>>,
}

fn format_id(seq: u64) -> String {
    format!("{:016x}", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    if id.len() != 16 {
        return None;
    }
    u64::from_str_radix(id, 16).ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Data>> {
        self.data
            .lock()
            .map_err(|_| JudgeError::Storage("memory store lock poisoned".into()))
    }

    pub fn get(&self, id: &str) -> Result<Submission> {
        let seq = parse_id(id).ok_or_else(|| JudgeError::SubmissionNotFound(id.to_string()))?;
        self.lock()?
            .submissions
            .get(&seq)
            .cloned()
            .ok_or_else(|| JudgeError::SubmissionNotFound(id.to_string()))
    }

    pub fn transcripts(&self) -> Result<Vec<Transcript>> {
        Ok(self.lock()?.transcripts.clone())
    }
}

#[tonic::async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert(&self, new: NewSubmission) -> Result<Submission> {
        let mut data = self.lock()?;
        data.seq += 1;
        let seq = data.seq;
        let submission = Submission::new(format_id(seq), new, Utc::now());
        data.submissions.insert(seq, submission.clone());
        Ok(submission)
    }

    async fn update(&self, update: &JudgeUpdate) -> Result<bool> {
        let seq = parse_id(&update.id)
            .ok_or_else(|| JudgeError::SubmissionNotFound(update.id.clone()))?;
        let mut data = self.lock()?;
        let submission = data
            .submissions
            .get_mut(&seq)
            .ok_or_else(|| JudgeError::SubmissionNotFound(update.id.clone()))?;
        Ok(submission.apply(&update.status, update.kind, &update.results))
    }

    async fn query(&self, cursor: Option<&str>) -> Result<Vec<Submission>> {
        let upper = match cursor.filter(|c| !c.is_empty()) {
            Some(c) => parse_id(c).ok_or_else(|| JudgeError::InvalidCursor(c.to_string()))?,
            None => u64::MAX,
        };
        let data = self.lock()?;
        Ok(data
            .submissions
            .range(..upper)
            .rev()
            .take(PAGE_SIZE)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn store_transcript(&self, transcript: Transcript) -> Result<()> {
        self.lock()?.transcripts.push(transcript);
        Ok(())
    }
}
