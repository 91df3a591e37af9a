use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Graded outcome of one case or of a whole submission.
///
/// Variants are declared in ascending severity, so the derived `Ord` is the
/// severity order and the overall verdict is simply the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    FileError,
    NonzeroExitStatus,
    Signalled,
    DangerousSyscall,
    CompileError,
    InternalError,
    JudgementFailed,
}

impl Verdict {
    pub const ALL: [Verdict; 12] = [
        Verdict::Accepted,
        Verdict::WrongAnswer,
        Verdict::MemoryLimitExceeded,
        Verdict::TimeLimitExceeded,
        Verdict::OutputLimitExceeded,
        Verdict::FileError,
        Verdict::NonzeroExitStatus,
        Verdict::Signalled,
        Verdict::DangerousSyscall,
        Verdict::CompileError,
        Verdict::InternalError,
        Verdict::JudgementFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "WrongAnswer",
            Verdict::MemoryLimitExceeded => "MemoryLimitExceeded",
            Verdict::TimeLimitExceeded => "TimeLimitExceeded",
            Verdict::OutputLimitExceeded => "OutputLimitExceeded",
            Verdict::FileError => "FileError",
            Verdict::NonzeroExitStatus => "NonzeroExitStatus",
            Verdict::Signalled => "Signalled",
            Verdict::DangerousSyscall => "DangerousSyscall",
            Verdict::CompileError => "CompileError",
            Verdict::InternalError => "InternalError",
            Verdict::JudgementFailed => "JudgementFailed",
        }
    }

    /// Most severe verdict in `verdicts`; an empty set is `Accepted`.
    pub fn worst<I>(verdicts: I) -> Verdict
    where
        I: IntoIterator<Item = Verdict>,
    {
        verdicts.into_iter().max().unwrap_or(Verdict::Accepted)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown verdict: {0}")]
pub struct UnknownVerdict(pub String);

impl FromStr for Verdict {
    type Err = UnknownVerdict;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verdict::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| UnknownVerdict(s.to_string()))
    }
}
