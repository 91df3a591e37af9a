use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::Language;
use crate::error::{JudgeError, Result};
use crate::proto::judge as pb;

/// Status of a freshly persisted submission.
pub const STATUS_SUBMITTED: &str = "Submitted";
/// Status of the first update published for a submission.
pub const STATUS_QUEUED: &str = "Queued";
/// Finished status when intake could not enqueue the request.
pub const STATUS_REJECTED_QUEUE_FULL: &str = "Rejected: queue full";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: Vec<u8>,
    pub answer: Vec<u8>,
}

/// Captured outcome of one sandbox invocation. Index 0 of a result list is
/// always the compile step; index `i + 1` is case `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub time_ms: u64,
    pub memory_kib: u64,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Progress,
    Finished,
}

/// Work item handed to a grading worker. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub id: String,
    pub language: Language,
    pub source: String,
    pub cases: Vec<TestCase>,
}

/// Fields carried only by the first update of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intake {
    pub language: Language,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeUpdate {
    pub id: String,
    pub kind: UpdateKind,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none", flatten)]
    pub intake: Option<Intake>,
}

impl JudgeUpdate {
    pub fn progress(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: UpdateKind::Progress,
            status: status.into(),
            results: Vec::new(),
            intake: None,
        }
    }

    pub fn finished(
        id: impl Into<String>,
        status: impl Into<String>,
        results: Vec<CaseResult>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: UpdateKind::Finished,
            status: status.into(),
            results,
            intake: None,
        }
    }

    /// The "Queued" update that opens the event sequence of a submission.
    pub fn queued(submission: &Submission) -> Self {
        Self {
            intake: Some(Intake {
                language: submission.language.clone(),
                source: submission.source.clone(),
                created_at: submission.created_at,
            }),
            ..Self::progress(submission.id.clone(), STATUS_QUEUED)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.kind == UpdateKind::Finished
    }
}

/// Fields supplied by a client at intake, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub language: Language,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub language: Language,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    /// Sum of case times, compile step excluded.
    pub total_time_ms: u64,
    /// Peak memory over all cases, compile step excluded.
    pub max_memory_kib: u64,
    pub results: Vec<CaseResult>,
    /// Set once a finished update has been applied.
    #[serde(default)]
    pub finished: bool,
}

impl Submission {
    pub fn new(id: String, new: NewSubmission, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            language: new.language,
            source: new.source,
            created_at,
            status: STATUS_SUBMITTED.to_string(),
            total_time_ms: 0,
            max_memory_kib: 0,
            results: Vec::new(),
            finished: false,
        }
    }

    /// Apply a worker update. Returns false when the update was ignored.
    ///
    /// A finished submission only accepts further finished updates, so a late
    /// progress tick from a requeued run cannot roll its status back.
    /// Applying the same finished update twice yields the same state.
    pub fn apply(&mut self, status: &str, kind: UpdateKind, results: &[CaseResult]) -> bool {
        if self.finished && kind == UpdateKind::Progress {
            return false;
        }
        self.status = status.to_string();
        if kind == UpdateKind::Finished || !results.is_empty() {
            self.results = results.to_vec();
            let cases = self.results.iter().skip(1);
            self.total_time_ms = cases.clone().map(|r| r.time_ms).sum();
            self.max_memory_kib = cases.map(|r| r.memory_kib).max().unwrap_or(0);
        }
        if kind == UpdateKind::Finished {
            self.finished = true;
        }
        true
    }
}

fn timestamp_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

impl From<pb::TestCase> for TestCase {
    fn from(c: pb::TestCase) -> Self {
        Self {
            input: c.input,
            answer: c.answer,
        }
    }
}

impl From<TestCase> for pb::TestCase {
    fn from(c: TestCase) -> Self {
        Self {
            input: c.input,
            answer: c.answer,
        }
    }
}

impl From<pb::CaseResult> for CaseResult {
    fn from(r: pb::CaseResult) -> Self {
        Self {
            time_ms: r.time_ms,
            memory_kib: r.memory_kib,
            stdin: r.stdin,
            stdout: r.stdout,
            stderr: r.stderr,
            log: r.log,
        }
    }
}

impl From<CaseResult> for pb::CaseResult {
    fn from(r: CaseResult) -> Self {
        Self {
            time_ms: r.time_ms,
            memory_kib: r.memory_kib,
            stdin: r.stdin,
            stdout: r.stdout,
            stderr: r.stderr,
            log: r.log,
        }
    }
}

impl From<JudgeRequest> for pb::JudgeRequest {
    fn from(r: JudgeRequest) -> Self {
        Self {
            id: r.id,
            language: Some(r.language.into()),
            source: r.source,
            cases: r.cases.into_iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<pb::JudgeRequest> for JudgeRequest {
    type Error = JudgeError;

    fn try_from(r: pb::JudgeRequest) -> Result<Self> {
        let language = r
            .language
            .ok_or_else(|| JudgeError::InvalidRequest("judge request without language".into()))?;
        Ok(Self {
            id: r.id,
            language: language.into(),
            source: r.source,
            cases: r.cases.into_iter().map(Into::into).collect(),
        })
    }
}

impl From<JudgeUpdate> for pb::JudgeUpdate {
    fn from(u: JudgeUpdate) -> Self {
        let kind = match u.kind {
            UpdateKind::Progress => pb::UpdateKind::Progress,
            UpdateKind::Finished => pb::UpdateKind::Finished,
        };
        let (language, source, created_at_ms) = match u.intake {
            Some(intake) => (
                Some(intake.language.into()),
                Some(intake.source),
                Some(intake.created_at.timestamp_millis()),
            ),
            None => (None, None, None),
        };
        Self {
            id: u.id,
            kind: kind as i32,
            status: u.status,
            results: u.results.into_iter().map(Into::into).collect(),
            language,
            source,
            created_at_ms,
        }
    }
}

impl TryFrom<pb::JudgeUpdate> for JudgeUpdate {
    type Error = JudgeError;

    fn try_from(u: pb::JudgeUpdate) -> Result<Self> {
        if u.id.is_empty() {
            return Err(JudgeError::InvalidRequest("update without submission id".into()));
        }
        let kind = match u.kind() {
            pb::UpdateKind::Progress => UpdateKind::Progress,
            pb::UpdateKind::Finished => UpdateKind::Finished,
            pb::UpdateKind::Unspecified => {
                return Err(JudgeError::InvalidRequest(format!(
                    "update for {} has no kind",
                    u.id
                )))
            }
        };
        let intake = match (u.language, u.source) {
            (Some(language), Some(source)) => Some(Intake {
                language: language.into(),
                source,
                created_at: timestamp_ms(u.created_at_ms.unwrap_or_default()),
            }),
            _ => None,
        };
        Ok(Self {
            id: u.id,
            kind,
            status: u.status,
            results: u.results.into_iter().map(Into::into).collect(),
            intake,
        })
    }
}

impl From<Submission> for pb::Submission {
    fn from(s: Submission) -> Self {
        Self {
            id: s.id,
            language: Some(s.language.into()),
            source: s.source,
            created_at_ms: s.created_at.timestamp_millis(),
            status: s.status,
            total_time_ms: s.total_time_ms,
            max_memory_kib: s.max_memory_kib,
            results: s.results.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<pb::Submission> for Submission {
    fn from(s: pb::Submission) -> Self {
        Self {
            id: s.id,
            language: s.language.map(Into::into).unwrap_or_default(),
            source: s.source,
            created_at: timestamp_ms(s.created_at_ms),
            status: s.status,
            total_time_ms: s.total_time_ms,
            max_memory_kib: s.max_memory_kib,
            results: s.results.into_iter().map(Into::into).collect(),
            finished: false,
        }
    }
}
