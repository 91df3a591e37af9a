use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;

use super::{
    Cmd, ExecResult, ExecSession, ExecStatus, InputFile, Sandbox, SandboxError, SessionCmd,
    StreamEvent, StreamInput,
};
use crate::config::{KeepaliveConfig, ResourceLimits};
use crate::keepalive;
use crate::proto::sandbox::executor_client::ExecutorClient;
use crate::proto::sandbox::{
    self as pb, file, stream_request, stream_response, Status as PbStatus,
};

const STREAM_BUFFER: usize = 32;

/// Client of a remote sandbox executor.
#[derive(Clone)]
pub struct GrpcSandbox {
    client: ExecutorClient<Channel>,
}

impl GrpcSandbox {
    /// Connect lazily; the first call fails if the executor is unreachable.
    pub fn connect_lazy(addr: &str, cfg: &KeepaliveConfig) -> Result<Self, SandboxError> {
        let channel = keepalive::client_endpoint(addr, cfg)?.connect_lazy();
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            client: ExecutorClient::new(channel).max_decoding_message_size(64 << 20),
        }
    }
}

fn memory(content: Vec<u8>) -> pb::File {
    pb::File {
        file: Some(file::File::Memory(pb::MemoryFile { content })),
    }
}

fn pipe(name: &str, max: u64) -> pb::File {
    pb::File {
        file: Some(file::File::Pipe(pb::PipeCollector {
            name: name.to_string(),
            max: max as i64,
        })),
    }
}

fn stream_in(name: &str) -> pb::File {
    pb::File {
        file: Some(file::File::StreamIn(pb::StreamInput {
            name: name.to_string(),
        })),
    }
}

fn stream_out(name: &str) -> pb::File {
    pb::File {
        file: Some(file::File::StreamOut(pb::StreamOutput {
            name: name.to_string(),
        })),
    }
}

fn limited(args: Vec<String>, env: Vec<String>, limits: &ResourceLimits) -> pb::Command {
    pb::Command {
        args,
        env,
        cpu_time_limit: limits.cpu_time.as_nanos() as u64,
        clock_time_limit: limits.wall_time.as_nanos() as u64,
        memory_limit: limits.memory_bytes,
        proc_limit: limits.proc_limit,
        ..Default::default()
    }
}

fn to_command(cmd: Cmd) -> pb::Command {
    let output = cmd.limits.output_bytes;
    let copy_in: HashMap<String, pb::File> = cmd
        .copy_in
        .into_iter()
        .map(|(name, f)| {
            let f = match f {
                InputFile::Memory(content) => memory(content),
                InputFile::Cached(file_id) => pb::File {
                    file: Some(file::File::Cached(pb::CachedFile { file_id })),
                },
            };
            (name, f)
        })
        .collect();
    pb::Command {
        files: vec![memory(cmd.stdin), pipe("stdout", output), pipe("stderr", output)],
        copy_in,
        copy_out: cmd.copy_out,
        copy_out_cached: cmd.copy_out_cached,
        ..limited(cmd.args, cmd.env, &cmd.limits)
    }
}

fn from_status(status: PbStatus) -> ExecStatus {
    match status {
        PbStatus::Invalid => ExecStatus::Invalid,
        PbStatus::Accepted => ExecStatus::Accepted,
        PbStatus::MemoryLimitExceeded => ExecStatus::MemoryLimitExceeded,
        PbStatus::TimeLimitExceeded => ExecStatus::TimeLimitExceeded,
        PbStatus::OutputLimitExceeded => ExecStatus::OutputLimitExceeded,
        PbStatus::FileError => ExecStatus::FileError,
        PbStatus::NonzeroExitStatus => ExecStatus::NonzeroExitStatus,
        PbStatus::Signalled => ExecStatus::Signalled,
        PbStatus::DangerousSyscall => ExecStatus::DangerousSyscall,
        PbStatus::InternalError => ExecStatus::InternalError,
    }
}

fn from_response(resp: pb::ExecResponse) -> Result<ExecResult, SandboxError> {
    if !resp.error.is_empty() {
        return Err(SandboxError::Protocol(resp.error));
    }
    let result = resp
        .results
        .into_iter()
        .next()
        .ok_or_else(|| SandboxError::Protocol("executor returned no result".into()))?;
    Ok(ExecResult {
        status: from_status(result.status()),
        exit_status: result.exit_status,
        error: result.error,
        time: std::time::Duration::from_nanos(result.time),
        memory_bytes: result.memory,
        files: result.files,
        file_ids: result.file_ids,
    })
}

fn to_stream_request(input: StreamInput) -> pb::StreamRequest {
    let request = match input {
        StreamInput::Input(content) => stream_request::Request::ExecInput(stream_request::Input {
            name: "stdin".to_string(),
            content,
        }),
        StreamInput::Resize(size) => stream_request::Request::ExecResize(stream_request::Resize {
            rows: size.rows,
            cols: size.cols,
            x: size.x,
            y: size.y,
        }),
    };
    pb::StreamRequest {
        request: Some(request),
    }
}

#[tonic::async_trait]
impl Sandbox for GrpcSandbox {
    async fn exec(&self, cmd: Cmd) -> Result<ExecResult, SandboxError> {
        let request = pb::ExecRequest {
            cmd: vec![to_command(cmd)],
        };
        let resp = self.client.clone().exec(request).await?.into_inner();
        from_response(resp)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), SandboxError> {
        self.client
            .clone()
            .file_delete(pb::FileId {
                file_id: file_id.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn exec_stream(&self, cmd: SessionCmd) -> Result<ExecSession, SandboxError> {
        let (req_tx, req_rx) = mpsc::channel(STREAM_BUFFER);
        let start = pb::StreamRequest {
            request: Some(stream_request::Request::ExecRequest(pb::ExecRequest {
                cmd: vec![pb::Command {
                    files: vec![stream_in("stdin"), stream_out("stdout"), stream_out("stderr")],
                    tty: true,
                    ..limited(cmd.args, cmd.env, &cmd.limits)
                }],
            })),
        };
        req_tx
            .send(start)
            .await
            .map_err(|_| SandboxError::Protocol("request stream closed".into()))?;

        let mut responses = self
            .client
            .clone()
            .exec_stream(ReceiverStream::new(req_rx))
            .await?
            .into_inner();

        let (input_tx, mut input_rx) = mpsc::channel::<StreamInput>(STREAM_BUFFER);
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                if req_tx.send(to_stream_request(input)).await.is_err() {
                    break;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::channel(STREAM_BUFFER);
        // Dropping `responses` resets the call, which stops the remote process
        // once the session owner has gone away.
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = event_tx.closed() => break,
                    message = responses.message() => message,
                };
                let event = match message {
                    Ok(Some(pb::StreamResponse {
                        response: Some(stream_response::Response::ExecOutput(out)),
                    })) => Ok(StreamEvent::Output(out.content)),
                    Ok(Some(pb::StreamResponse {
                        response: Some(stream_response::Response::ExecResponse(resp)),
                    })) => from_response(resp).map(StreamEvent::Exited),
                    Ok(Some(pb::StreamResponse { response: None })) => continue,
                    Ok(None) => break,
                    Err(status) => Err(SandboxError::Rpc(status)),
                };
                let last = !matches!(event, Ok(StreamEvent::Output(_)));
                if event_tx.send(event).await.is_err() || last {
                    break;
                }
            }
        });

        Ok(ExecSession {
            input: input_tx,
            events: event_rx,
        })
    }
}
