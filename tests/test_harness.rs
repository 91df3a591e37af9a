//! Test harness for broker integration tests.
//!
//! Starts a real broker on an ephemeral port, wires workers to it and
//! provides a scripted sandbox that behaves like a tiny C toolchain.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use judgehub::broker::{self, Broker, BrokerClient, UpdateHub};
use judgehub::config::{BrokerConfig, KeepaliveConfig, WorkerConfig};
use judgehub::model::Submission;
use judgehub::proto::judge::{Language, SubmitRequest, TestCase};
use judgehub::sandbox::{
    Cmd, ExecResult, ExecSession, ExecStatus, InputFile, Sandbox, SandboxError, SessionCmd,
    StreamEvent, StreamInput,
};
use judgehub::store::MemoryStore;
use judgehub::worker::Worker;

/// A sandbox that pretends to be gcc plus a program adding the numbers on
/// stdin.
///
/// Compile commands must start with `gcc`; anything else is a missing
/// binary. A source containing `syntax error` fails to compile and one
/// containing `off_by_one` prints the sum plus one. Interactive sessions
/// echo their input and exit on `exit\n`.
#[derive(Default)]
pub struct ScriptedSandbox {
    programs: Mutex<HashMap<String, String>>,
    next_file: AtomicU64,
    pub deleted: Mutex<Vec<String>>,
    pub runs: AtomicU64,
}

impl ScriptedSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cached_files(&self) -> usize {
        self.programs.lock().unwrap().len()
    }

    fn compile(&self, cmd: &Cmd) -> ExecResult {
        if cmd.args[0] != "gcc" {
            let mut res = ExecResult::new(ExecStatus::FileError);
            res.error = format!("{}: no such file or directory", cmd.args[0]);
            return res;
        }
        let source = cmd
            .copy_in
            .values()
            .find_map(|f| match f {
                InputFile::Memory(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                InputFile::Cached(_) => None,
            })
            .unwrap_or_default();
        if source.contains("syntax error") {
            let mut res = ExecResult::new(ExecStatus::NonzeroExitStatus);
            res.exit_status = 1;
            res.files
                .insert("stderr".into(), b"a.c:1:1: error: expected ';'\n".to_vec());
            return res;
        }

        let mut res = ExecResult::new(ExecStatus::Accepted);
        res.time = Duration::from_millis(120);
        let mut programs = self.programs.lock().unwrap();
        for name in &cmd.copy_out_cached {
            let id = format!("file-{}", self.next_file.fetch_add(1, Ordering::SeqCst));
            programs.insert(id.clone(), source.clone());
            res.file_ids.insert(name.clone(), id);
        }
        res
    }

    fn run(&self, cmd: &Cmd) -> ExecResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let program = cmd.copy_in.values().find_map(|f| match f {
            InputFile::Cached(id) => self.programs.lock().unwrap().get(id).cloned(),
            InputFile::Memory(_) => None,
        });
        let Some(program) = program else {
            return ExecResult::new(ExecStatus::FileError);
        };

        let input = String::from_utf8_lossy(&cmd.stdin);
        let mut sum: i64 = input
            .split_whitespace()
            .filter_map(|n| n.parse::<i64>().ok())
            .sum();
        if program.contains("off_by_one") {
            sum += 1;
        }
        let mut res = ExecResult::new(ExecStatus::Accepted);
        res.time = Duration::from_millis(3);
        res.memory_bytes = 1 << 20;
        res.files.insert("stdout".into(), format!("{}\n", sum).into_bytes());
        res
    }
}

#[tonic::async_trait]
impl Sandbox for ScriptedSandbox {
    async fn exec(&self, cmd: Cmd) -> Result<ExecResult, SandboxError> {
        if cmd.args.is_empty() {
            return Err(SandboxError::Protocol("empty command".into()));
        }
        if cmd.copy_out_cached.is_empty() && cmd.args[0] != "gcc" {
            Ok(self.run(&cmd))
        } else {
            Ok(self.compile(&cmd))
        }
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), SandboxError> {
        self.programs.lock().unwrap().remove(file_id);
        self.deleted.lock().unwrap().push(file_id.to_string());
        Ok(())
    }

    async fn exec_stream(&self, _cmd: SessionCmd) -> Result<ExecSession, SandboxError> {
        let (input_tx, mut input_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let event = match input {
                    StreamInput::Input(bytes) if bytes == b"exit\n" => {
                        let _ = events_tx
                            .send(Ok(StreamEvent::Exited(ExecResult::new(ExecStatus::Accepted))))
                            .await;
                        return;
                    }
                    StreamInput::Input(bytes) => StreamEvent::Output(bytes),
                    StreamInput::Resize(size) => {
                        StreamEvent::Output(format!("[{}x{}]", size.rows, size.cols).into_bytes())
                    }
                };
                if events_tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Ok(ExecSession {
            input: input_tx,
            events: events_rx,
        })
    }
}

/// Handle to a broker serving on 127.0.0.1 with an in-memory store.
pub struct TestBroker {
    pub addr: String,
    pub store: MemoryStore,
    pub token: Option<String>,
    pub hub: UpdateHub,
    pub shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start(sandbox: Arc<dyn Sandbox>) -> Self {
        Self::start_with(BrokerConfig::new("127.0.0.1:0".parse().unwrap()), sandbox).await
    }

    pub async fn start_with(config: BrokerConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let token = config.auth_token.clone();

        let broker = Broker::new(config, Arc::new(store.clone()), sandbox, shutdown.clone());
        let hub = broker.hub();
        let handle = tokio::spawn(async move {
            if let Err(e) = broker.serve_with_listener(listener).await {
                panic!("broker failed: {}", e);
            }
        });

        Self {
            addr,
            store,
            token,
            hub,
            shutdown,
            handle,
        }
    }

    pub async fn client(&self) -> BrokerClient {
        broker::connect(&self.addr, self.token.as_deref(), &KeepaliveConfig::default())
            .await
            .unwrap()
    }

    /// Start a worker grading with `sandbox`. Stop it with the returned token.
    pub fn spawn_worker(&self, sandbox: Arc<dyn Sandbox>) -> CancellationToken {
        let config = WorkerConfig {
            auth_token: self.token.clone(),
            reconnect_interval: Duration::from_millis(100),
            ..WorkerConfig::new(self.addr.clone())
        };
        let stop = self.shutdown.child_token();
        let worker = Worker::new(config, sandbox);
        let token = stop.clone();
        tokio::spawn(async move { worker.run(token).await });
        stop
    }

    /// Poll the store until the submission has finished.
    pub async fn wait_finished(&self, id: &str, timeout: Duration) -> Submission {
        let store = self.store.clone();
        let id = id.to_string();
        assert_eventually(
            || {
                let store = store.clone();
                let id = id.clone();
                async move { store.get(&id).map(|s| s.finished).unwrap_or(false) }
            },
            timeout,
            "submission should finish",
        )
        .await;
        self.store.get(&id).unwrap()
    }

    /// Wait until `n` observers follow the update stream.
    pub async fn wait_observers(&self, n: usize) {
        let hub = self.hub.clone();
        assert_eventually(
            || {
                let hub = hub.clone();
                async move { hub.observer_count().await.unwrap_or(0) >= n }
            },
            Duration::from_secs(5),
            "observers should subscribe",
        )
        .await;
    }

    /// Wait until nobody follows the update stream any more.
    pub async fn wait_no_observers(&self) {
        let hub = self.hub.clone();
        assert_eventually(
            || {
                let hub = hub.clone();
                async move { hub.observer_count().await.map(|n| n == 0).unwrap_or(false) }
            },
            Duration::from_secs(5),
            "observers should be gone",
        )
        .await;
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

pub fn c_language() -> Language {
    Language {
        name: "c".to_string(),
        source_file_name: "a.c".to_string(),
        compile_cmd: "gcc -o a a.c".to_string(),
        run_cmd: "./a".to_string(),
        executables: vec!["a".to_string()],
    }
}

pub fn submit_request(source: &str, cases: &[(&str, &str)]) -> SubmitRequest {
    SubmitRequest {
        language: Some(c_language()),
        source: source.to_string(),
        cases: cases
            .iter()
            .map(|(input, answer)| TestCase {
                input: input.as_bytes().to_vec(),
                answer: answer.as_bytes().to_vec(),
            })
            .collect(),
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
