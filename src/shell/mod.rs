//! Interactive shell relay.
//!
//! A session bridges one client connection to one sandboxed terminal. Two
//! forwarding loops run side by side under a shared cancellation token;
//! whichever ends first stops the other. Everything typed and printed is
//! kept and stored as a transcript once the session is over.

use std::sync::Arc;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ShellConfig;
use crate::error::Result;
use crate::proto::judge::{self as pb, shell_input, shell_output};
use crate::sandbox::{ExecSession, Sandbox, SessionCmd, StreamEvent, StreamInput, TermSize};
use crate::store::{SubmissionStore, Transcript};

/// Client to shell traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Keys(Vec<u8>),
    Resize(TermSize),
}

/// Shell to client traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Output(Vec<u8>),
    Exited { status: String, exit_status: i32 },
}

impl ClientFrame {
    pub fn from_proto(input: pb::ShellInput) -> Option<Self> {
        match input.event? {
            shell_input::Event::Input(bytes) => Some(ClientFrame::Keys(bytes)),
            shell_input::Event::Resize(size) => Some(ClientFrame::Resize(TermSize {
                rows: size.rows,
                cols: size.cols,
                x: size.x,
                y: size.y,
            })),
        }
    }
}

impl From<ClientFrame> for pb::ShellInput {
    fn from(frame: ClientFrame) -> Self {
        let event = match frame {
            ClientFrame::Keys(bytes) => shell_input::Event::Input(bytes),
            ClientFrame::Resize(size) => shell_input::Event::Resize(pb::TermSize {
                rows: size.rows,
                cols: size.cols,
                x: size.x,
                y: size.y,
            }),
        };
        pb::ShellInput { event: Some(event) }
    }
}

impl ServerFrame {
    pub fn from_proto(output: pb::ShellOutput) -> Option<Self> {
        match output.event? {
            shell_output::Event::Output(bytes) => Some(ServerFrame::Output(bytes)),
            shell_output::Event::Exit(exit) => Some(ServerFrame::Exited {
                status: exit.status,
                exit_status: exit.exit_status,
            }),
        }
    }
}

impl From<ServerFrame> for pb::ShellOutput {
    fn from(frame: ServerFrame) -> Self {
        let event = match frame {
            ServerFrame::Output(bytes) => shell_output::Event::Output(bytes),
            ServerFrame::Exited {
                status,
                exit_status,
            } => shell_output::Event::Exit(pb::ShellExit {
                status,
                exit_status,
            }),
        };
        pb::ShellOutput { event: Some(event) }
    }
}

impl From<ServerFrame> for std::result::Result<pb::ShellOutput, tonic::Status> {
    fn from(frame: ServerFrame) -> Self {
        Ok(frame.into())
    }
}

#[derive(Clone)]
pub struct ShellRelay {
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn SubmissionStore>,
    config: ShellConfig,
}

impl ShellRelay {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn SubmissionStore>,
        config: ShellConfig,
    ) -> Self {
        Self {
            sandbox,
            store,
            config,
        }
    }

    /// Start the interactive process.
    pub async fn open(&self) -> Result<ExecSession> {
        let cmd = SessionCmd {
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            limits: self.config.limits,
        };
        Ok(self.sandbox.exec_stream(cmd).await?)
    }

    /// Run both forwarding loops until either side ends or `cancel` fires,
    /// then store the transcript in the background.
    pub async fn run<I, T>(
        &self,
        session: ExecSession,
        inbound: I,
        outbound: mpsc::Sender<T>,
        cancel: CancellationToken,
    ) -> Transcript
    where
        I: Stream<Item = ClientFrame> + Send + Unpin,
        T: From<ServerFrame> + Send,
    {
        let session_id = Uuid::new_v4();
        tracing::info!(session_id = %session_id, "Shell session started");
        let transcript = relay(session, inbound, outbound, cancel).await;
        tracing::info!(
            session_id = %session_id,
            input_bytes = transcript.stdin.len(),
            output_bytes = transcript.stdout.len(),
            "Shell session ended"
        );

        let store = self.store.clone();
        let saved = transcript.clone();
        tokio::spawn(async move {
            if let Err(e) = store.store_transcript(saved).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to store shell transcript");
            }
        });
        transcript
    }
}

async fn relay<I, T>(
    session: ExecSession,
    mut inbound: I,
    outbound: mpsc::Sender<T>,
    cancel: CancellationToken,
) -> Transcript
where
    I: Stream<Item = ClientFrame> + Send + Unpin,
    T: From<ServerFrame> + Send,
{
    let started_at = Utc::now();
    let ExecSession { input, mut events } = session;
    let token = cancel.child_token();

    let client_to_process = async {
        let mut typed = Vec::new();
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = inbound.next() => frame,
            };
            let forwarded = match frame {
                Some(ClientFrame::Keys(bytes)) => {
                    typed.extend_from_slice(&bytes);
                    input.send(StreamInput::Input(bytes)).await
                }
                Some(ClientFrame::Resize(size)) => input.send(StreamInput::Resize(size)).await,
                None => break,
            };
            if forwarded.is_err() {
                break;
            }
        }
        token.cancel();
        typed
    };

    let process_to_client = async {
        let mut printed = Vec::new();
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(Ok(StreamEvent::Output(bytes))) => {
                    printed.extend_from_slice(&bytes);
                    if outbound.send(ServerFrame::Output(bytes).into()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(StreamEvent::Exited(result))) => {
                    let frame = ServerFrame::Exited {
                        status: result.status.to_string(),
                        exit_status: result.exit_status,
                    };
                    let _ = outbound.send(frame.into()).await;
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Shell executor stream failed");
                    break;
                }
                None => break,
            }
        }
        token.cancel();
        printed
    };

    let (stdin, stdout) = tokio::join!(client_to_process, process_to_client);
    Transcript {
        stdin,
        stdout,
        started_at,
        ended_at: Utc::now(),
    }
}
