//! Domain types shared by the broker, the workers and the gateway.

mod language;
mod submission;
mod verdict;

pub use language::{split_command, Language};
pub use submission::{
    CaseResult, Intake, JudgeRequest, JudgeUpdate, NewSubmission, Submission, TestCase,
    UpdateKind, STATUS_QUEUED, STATUS_REJECTED_QUEUE_FULL, STATUS_SUBMITTED,
};
pub use verdict::{UnknownVerdict, Verdict};
