//! Interface to the sandbox executor that runs untrusted code.
//!
//! The executor itself is an external service. [`GrpcSandbox`] talks to it
//! over gRPC; [`LocalSandbox`] runs commands as plain child processes and is
//! meant for development machines only.

mod grpc;
mod local;

pub use grpc::GrpcSandbox;
pub use local::LocalSandbox;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ResourceLimits;
use crate::model::Verdict;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("executor unreachable: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("executor call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("executor protocol error: {0}")]
    Protocol(String),

    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// File placed into the sandbox before a command starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFile {
    Memory(Vec<u8>),
    /// A file previously copied out with `copy_out_cached`.
    Cached(String),
}

/// One resource-limited, non-interactive command.
#[derive(Debug, Clone)]
pub struct Cmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub stdin: Vec<u8>,
    pub limits: ResourceLimits,
    pub copy_in: HashMap<String, InputFile>,
    /// Files returned by content, in addition to stdout and stderr.
    pub copy_out: Vec<String>,
    /// Files kept by the executor and returned as cache ids.
    pub copy_out_cached: Vec<String>,
}

impl Cmd {
    pub fn new(args: Vec<String>, env: Vec<String>, limits: ResourceLimits) -> Self {
        Self {
            args,
            env,
            stdin: Vec::new(),
            limits,
            copy_in: HashMap::new(),
            copy_out: Vec::new(),
            copy_out_cached: Vec::new(),
        }
    }
}

/// Interactive command attached to a terminal.
#[derive(Debug, Clone)]
pub struct SessionCmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub limits: ResourceLimits,
}

/// Completion status reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Invalid,
    Accepted,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    FileError,
    NonzeroExitStatus,
    Signalled,
    DangerousSyscall,
    InternalError,
}

impl ExecStatus {
    pub fn verdict(self) -> Verdict {
        match self {
            ExecStatus::Accepted => Verdict::Accepted,
            ExecStatus::MemoryLimitExceeded => Verdict::MemoryLimitExceeded,
            ExecStatus::TimeLimitExceeded => Verdict::TimeLimitExceeded,
            ExecStatus::OutputLimitExceeded => Verdict::OutputLimitExceeded,
            ExecStatus::FileError => Verdict::FileError,
            ExecStatus::NonzeroExitStatus => Verdict::NonzeroExitStatus,
            ExecStatus::Signalled => Verdict::Signalled,
            ExecStatus::DangerousSyscall => Verdict::DangerousSyscall,
            ExecStatus::Invalid | ExecStatus::InternalError => Verdict::InternalError,
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecStatus::Invalid => "Invalid",
            ExecStatus::Accepted => "Accepted",
            ExecStatus::MemoryLimitExceeded => "Memory Limit Exceeded",
            ExecStatus::TimeLimitExceeded => "Time Limit Exceeded",
            ExecStatus::OutputLimitExceeded => "Output Limit Exceeded",
            ExecStatus::FileError => "File Error",
            ExecStatus::NonzeroExitStatus => "Nonzero Exit Status",
            ExecStatus::Signalled => "Signalled",
            ExecStatus::DangerousSyscall => "Dangerous Syscall",
            ExecStatus::InternalError => "Internal Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub exit_status: i32,
    pub error: String,
    pub time: Duration,
    pub memory_bytes: u64,
    pub files: HashMap<String, Vec<u8>>,
    pub file_ids: HashMap<String, String>,
}

impl ExecResult {
    pub fn new(status: ExecStatus) -> Self {
        Self {
            status,
            exit_status: 0,
            error: String::new(),
            time: Duration::ZERO,
            memory_bytes: 0,
            files: HashMap::new(),
            file_ids: HashMap::new(),
        }
    }

    pub fn file(&self, name: &str) -> &[u8] {
        self.files.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn file_lossy(&self, name: &str) -> String {
        String::from_utf8_lossy(self.file(name)).into_owned()
    }

    pub fn time_ms(&self) -> u64 {
        (self.time.as_nanos() as f64 / 1e6).round() as u64
    }

    pub fn memory_kib(&self) -> u64 {
        self.memory_bytes >> 10
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u32,
    pub cols: u32,
    pub x: u32,
    pub y: u32,
}

/// Client to process traffic of an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInput {
    Input(Vec<u8>),
    Resize(TermSize),
}

/// Process to client traffic of an interactive session.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Output(Vec<u8>),
    Exited(ExecResult),
}

/// Handles of a running interactive command. Dropping `input` closes the
/// process' terminal input.
pub struct ExecSession {
    pub input: mpsc::Sender<StreamInput>,
    pub events: mpsc::Receiver<Result<StreamEvent, SandboxError>>,
}

#[tonic::async_trait]
pub trait Sandbox: Send + Sync + 'static {
    async fn exec(&self, cmd: Cmd) -> Result<ExecResult, SandboxError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), SandboxError>;

    async fn exec_stream(&self, cmd: SessionCmd) -> Result<ExecSession, SandboxError>;
}
