use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Cmd, ExecResult, ExecSession, ExecStatus, InputFile, Sandbox, SandboxError, SessionCmd,
    StreamEvent, StreamInput,
};

const CHUNK: usize = 4096;
const STREAM_BUFFER: usize = 32;

/// Runs commands as ordinary child processes in throwaway directories.
///
/// Only wall-clock time and captured output are enforced; CPU, memory and
/// process limits are ignored and memory usage is reported as zero. There is
/// no isolation whatsoever, so never point this at untrusted code.
#[derive(Clone, Default)]
pub struct LocalSandbox {
    cache: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, file_id: &str) -> Option<Vec<u8>> {
        self.cache.lock().ok()?.get(file_id).cloned()
    }

    fn cache_file(&self, content: Vec<u8>) -> Result<String, SandboxError> {
        let id = Uuid::new_v4().simple().to_string();
        self.cache
            .lock()
            .map_err(|_| SandboxError::Protocol("file cache poisoned".into()))?
            .insert(id.clone(), content);
        Ok(id)
    }

    /// Write the inputs of `cmd` into `dir`. Returns the name of the first
    /// cached file that no longer exists.
    async fn copy_in(
        &self,
        dir: &Path,
        files: HashMap<String, InputFile>,
    ) -> Result<Option<String>, SandboxError> {
        for (name, file) in files {
            let content = match file {
                InputFile::Memory(content) => content,
                InputFile::Cached(id) => match self.cached(&id) {
                    Some(content) => content,
                    None => return Ok(Some(id)),
                },
            };
            let path = dir.join(&name);
            tokio::fs::write(&path, content).await?;
            make_executable(&path).await?;
        }
        Ok(None)
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Resolve a bare program name against the working directory first, so a
/// run command of `a` finds the compiled `a` next to it.
fn resolve_program(dir: &Path, program: &str) -> PathBuf {
    if !program.contains('/') {
        let local = dir.join(program);
        if local.is_file() {
            return local;
        }
    }
    PathBuf::from(program)
}

fn command(dir: &Path, args: &[String], env: &[String]) -> Result<Command, SandboxError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| SandboxError::Protocol("empty command".into()))?;
    let mut command = Command::new(resolve_program(dir, program));
    command
        .args(rest)
        .current_dir(dir)
        .env_clear()
        .envs(env.iter().filter_map(|kv| kv.split_once('=')))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(command)
}

/// Read everything from `reader`, keeping at most `limit` bytes. The rest is
/// drained so the writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: u64,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut overflow = false;
    let mut buf = [0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok((kept, overflow));
        }
        let room = (limit as usize).saturating_sub(kept.len());
        if n > room {
            overflow = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
}

fn classify(status: ExitStatus) -> (ExecStatus, i32) {
    match status.code() {
        Some(0) => (ExecStatus::Accepted, 0),
        Some(code) => (ExecStatus::NonzeroExitStatus, code),
        None => (ExecStatus::Signalled, 0),
    }
}

fn failed(status: ExecStatus, error: impl Into<String>) -> ExecResult {
    ExecResult {
        error: error.into(),
        ..ExecResult::new(status)
    }
}

async fn run_to_completion(
    child: &mut Child,
    stdin: Vec<u8>,
    limit: u64,
) -> std::io::Result<(ExitStatus, (Vec<u8>, bool), (Vec<u8>, bool))> {
    let mut input = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let feed = async move {
        if let Some(pipe) = input.as_mut() {
            // The program may exit without reading its input.
            let _ = pipe.write_all(&stdin).await;
        }
        drop(input);
        Ok::<_, std::io::Error>(())
    };
    let out = async move {
        match stdout {
            Some(pipe) => read_capped(pipe, limit).await,
            None => Ok((Vec::new(), false)),
        }
    };
    let err = async move {
        match stderr {
            Some(pipe) => read_capped(pipe, limit).await,
            None => Ok((Vec::new(), false)),
        }
    };
    let (_, out, err) = tokio::try_join!(feed, out, err)?;
    let status = child.wait().await?;
    Ok((status, out, err))
}

#[tonic::async_trait]
impl Sandbox for LocalSandbox {
    async fn exec(&self, cmd: Cmd) -> Result<ExecResult, SandboxError> {
        let dir = tempfile::tempdir()?;
        if let Some(missing) = self.copy_in(dir.path(), cmd.copy_in).await? {
            return Ok(failed(
                ExecStatus::FileError,
                format!("cached file {} not found", missing),
            ));
        }

        let mut child = match command(dir.path(), &cmd.args, &cmd.env)?.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(program = ?cmd.args.first(), error = %e, "Failed to start command");
                return Ok(failed(ExecStatus::FileError, e.to_string()));
            }
        };

        let start = Instant::now();
        let wall = cmd.limits.wall_time;
        let outcome = tokio::time::timeout(
            wall,
            run_to_completion(&mut child, cmd.stdin, cmd.limits.output_bytes),
        )
        .await;
        let elapsed = start.elapsed();

        let (exit, (stdout, out_overflow), (stderr, err_overflow)) = match outcome {
            Ok(res) => res?,
            Err(_) => {
                let _ = child.kill().await;
                let mut result = failed(ExecStatus::TimeLimitExceeded, "wall clock limit exceeded");
                result.time = wall;
                return Ok(result);
            }
        };

        let (mut status, exit_status) = classify(exit);
        if out_overflow || err_overflow {
            status = ExecStatus::OutputLimitExceeded;
        }
        let mut result = ExecResult {
            exit_status,
            time: elapsed,
            ..ExecResult::new(status)
        };
        result.files.insert("stdout".to_string(), stdout);
        result.files.insert("stderr".to_string(), stderr);

        for name in &cmd.copy_out {
            match tokio::fs::read(dir.path().join(name)).await {
                Ok(content) => {
                    result.files.insert(name.clone(), content);
                }
                Err(e) => return Ok(missing_output(result, name, e)),
            }
        }
        for name in &cmd.copy_out_cached {
            match tokio::fs::read(dir.path().join(name)).await {
                Ok(content) => {
                    let id = self.cache_file(content)?;
                    result.file_ids.insert(name.clone(), id);
                }
                Err(e) => return Ok(missing_output(result, name, e)),
            }
        }
        Ok(result)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), SandboxError> {
        let removed = self
            .cache
            .lock()
            .map_err(|_| SandboxError::Protocol("file cache poisoned".into()))?
            .remove(file_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(SandboxError::Protocol(format!("file {} not found", file_id))),
        }
    }

    async fn exec_stream(&self, cmd: SessionCmd) -> Result<ExecSession, SandboxError> {
        let dir = tempfile::tempdir()?;
        let mut child = command(dir.path(), &cmd.args, &cmd.env)?.spawn()?;
        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (input_tx, mut input_rx) = mpsc::channel::<StreamInput>(STREAM_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                match (input, stdin.as_mut()) {
                    (StreamInput::Input(bytes), Some(pipe)) => {
                        if pipe.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    // Plain pipes have no window size.
                    (StreamInput::Resize(_), _) => {}
                    (_, None) => break,
                }
            }
        });

        let pumps: Vec<_> = [
            stdout.map(|p| Box::new(p) as Box<dyn AsyncRead + Send + Unpin>),
            stderr.map(|p| Box::new(p) as Box<dyn AsyncRead + Send + Unpin>),
        ]
        .into_iter()
        .flatten()
        .map(|pipe| tokio::spawn(pump(pipe, event_tx.clone())))
        .collect();

        let wall = cmd.limits.wall_time;
        tokio::spawn(async move {
            let _workdir = dir;
            let start = Instant::now();
            let result = match tokio::time::timeout(wall, child.wait()).await {
                Ok(Ok(exit)) => {
                    for pump in pumps {
                        let _ = pump.await;
                    }
                    let (status, exit_status) = classify(exit);
                    Ok(ExecResult {
                        exit_status,
                        time: start.elapsed(),
                        ..ExecResult::new(status)
                    })
                }
                Ok(Err(e)) => Err(SandboxError::Io(e)),
                Err(_) => {
                    let _ = child.kill().await;
                    Ok(ExecResult {
                        time: wall,
                        ..failed(ExecStatus::TimeLimitExceeded, "wall clock limit exceeded")
                    })
                }
            };
            let _ = event_tx.send(result.map(StreamEvent::Exited)).await;
        });

        Ok(ExecSession {
            input: input_tx,
            events: event_rx,
        })
    }
}

async fn pump(
    mut pipe: Box<dyn AsyncRead + Send + Unpin>,
    events: mpsc::Sender<Result<StreamEvent, SandboxError>>,
) {
    let mut buf = [0u8; CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if events
                    .send(Ok(StreamEvent::Output(buf[..n].to_vec())))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn missing_output(mut result: ExecResult, name: &str, err: std::io::Error) -> ExecResult {
    if result.status == ExecStatus::Accepted {
        result.status = ExecStatus::FileError;
    }
    result.error = format!("copy out {}: {}", name, err);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use std::time::Duration;

    fn sh(script: &str) -> Cmd {
        Cmd::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()],
            ResourceLimits::run(),
        )
    }

    #[tokio::test]
    async fn captures_stdout_and_stdin() {
        let sandbox = LocalSandbox::new();
        let mut cmd = sh("read a b; echo $((a + b))");
        cmd.stdin = b"1 1\n".to_vec();
        let res = sandbox.exec(cmd).await.unwrap();
        assert_eq!(res.status, ExecStatus::Accepted);
        assert_eq!(res.file_lossy("stdout"), "2\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let sandbox = LocalSandbox::new();
        let res = sandbox.exec(sh("echo oops >&2; exit 3")).await.unwrap();
        assert_eq!(res.status, ExecStatus::NonzeroExitStatus);
        assert_eq!(res.exit_status, 3);
        assert_eq!(res.file_lossy("stderr"), "oops\n");
    }

    #[tokio::test]
    async fn missing_program_is_file_error() {
        let sandbox = LocalSandbox::new();
        let cmd = Cmd::new(
            vec!["/nonexistent/compiler".to_string()],
            vec![],
            ResourceLimits::compile(),
        );
        let res = sandbox.exec(cmd).await.unwrap();
        assert_eq!(res.status, ExecStatus::FileError);
        assert!(!res.error.is_empty());
    }

    #[tokio::test]
    async fn wall_clock_limit_kills() {
        let sandbox = LocalSandbox::new();
        let mut cmd = sh("sleep 5");
        cmd.limits.wall_time = Duration::from_millis(200);
        let res = sandbox.exec(cmd).await.unwrap();
        assert_eq!(res.status, ExecStatus::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn output_is_capped() {
        let sandbox = LocalSandbox::new();
        let mut cmd = sh("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done");
        cmd.limits.output_bytes = 100;
        let res = sandbox.exec(cmd).await.unwrap();
        assert_eq!(res.status, ExecStatus::OutputLimitExceeded);
        assert_eq!(res.file("stdout").len(), 100);
    }

    #[tokio::test]
    async fn cached_files_flow_between_runs() {
        let sandbox = LocalSandbox::new();
        let mut build = sh("printf '#!/bin/sh\\necho built\\n' > a");
        build.copy_out_cached = vec!["a".to_string()];
        let built = sandbox.exec(build).await.unwrap();
        assert_eq!(built.status, ExecStatus::Accepted);
        let id = built.file_ids.get("a").cloned().unwrap();

        let mut run = Cmd::new(vec!["a".to_string()], vec![], ResourceLimits::run());
        run.copy_in.insert("a".to_string(), InputFile::Cached(id.clone()));
        let res = sandbox.exec(run).await.unwrap();
        assert_eq!(res.status, ExecStatus::Accepted);
        assert_eq!(res.file_lossy("stdout"), "built\n");

        sandbox.delete_file(&id).await.unwrap();
        assert!(sandbox.delete_file(&id).await.is_err());
    }

    #[tokio::test]
    async fn missing_copy_out_is_file_error() {
        let sandbox = LocalSandbox::new();
        let mut cmd = sh("true");
        cmd.copy_out_cached = vec!["a".to_string()];
        let res = sandbox.exec(cmd).await.unwrap();
        assert_eq!(res.status, ExecStatus::FileError);
        assert!(res.file_ids.is_empty());
    }

    #[tokio::test]
    async fn interactive_session_echoes_and_exits() {
        let sandbox = LocalSandbox::new();
        let mut session = sandbox
            .exec_stream(SessionCmd {
                args: vec!["/bin/sh".to_string()],
                env: vec!["PATH=/usr/bin:/bin".to_string()],
                limits: ResourceLimits::shell(),
            })
            .await
            .unwrap();
        session
            .input
            .send(StreamInput::Input(b"echo hi; exit 4\n".to_vec()))
            .await
            .unwrap();

        let mut output = Vec::new();
        let exit = loop {
            match session.events.recv().await.unwrap().unwrap() {
                StreamEvent::Output(bytes) => output.extend(bytes),
                StreamEvent::Exited(res) => break res,
            }
        };
        assert_eq!(output, b"hi\n");
        assert_eq!(exit.status, ExecStatus::NonzeroExitStatus);
        assert_eq!(exit.exit_status, 4);
    }
}
