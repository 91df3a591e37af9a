use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::diff;
use crate::config::GradingLimits;
use crate::model::{CaseResult, JudgeRequest, JudgeUpdate, TestCase, Verdict};
use crate::sandbox::{Cmd, ExecResult, ExecStatus, InputFile, Sandbox};

/// Environment of every compile and run command.
pub const ENV: [&str; 2] = ["PATH=/usr/local/bin:/usr/bin:/bin", "HOME=/tmp"];

fn env() -> Vec<String> {
    ENV.iter().map(|s| s.to_string()).collect()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn captured(res: &ExecResult) -> CaseResult {
    CaseResult {
        time_ms: res.time_ms(),
        memory_kib: res.memory_kib(),
        stdin: String::new(),
        stdout: res.file_lossy("stdout"),
        stderr: res.file_lossy("stderr"),
        log: res.error.clone(),
    }
}

/// Executor cache entries held by one grading run. Entries still held when
/// the guard is dropped are deleted in the background, so a cancelled run
/// does not leak them.
struct CachedFiles {
    sandbox: Arc<dyn Sandbox>,
    /// Executable name to executor cache id.
    ids: HashMap<String, String>,
}

impl CachedFiles {
    fn new(sandbox: Arc<dyn Sandbox>, ids: HashMap<String, String>) -> Self {
        Self { sandbox, ids }
    }

    async fn release(mut self) {
        let ids = std::mem::take(&mut self.ids);
        delete_files(self.sandbox.as_ref(), &ids).await;
    }
}

impl Drop for CachedFiles {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let sandbox = self.sandbox.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(files = ids.len(), "Deleting cached files of an abandoned run");
                runtime.spawn(async move { delete_files(sandbox.as_ref(), &ids).await });
            }
            Err(_) => tracing::warn!(files = ids.len(), "No runtime left to delete cached files"),
        }
    }
}

async fn delete_files(sandbox: &dyn Sandbox, ids: &HashMap<String, String>) {
    for (name, file_id) in ids {
        if let Err(e) = sandbox.delete_file(file_id).await {
            tracing::warn!(file = %name, file_id = %file_id, error = %e, "Failed to delete cached file");
        }
    }
}

/// Output of a successful compile step.
struct Compiled {
    result: CaseResult,
    files: CachedFiles,
}

/// Why a run stopped at the compile step.
struct CompileFailure {
    status: String,
    result: CaseResult,
}

/// Compiles a submission once and runs every case against the result.
#[derive(Clone)]
pub struct Grader {
    sandbox: Arc<dyn Sandbox>,
    limits: GradingLimits,
}

impl Grader {
    pub fn new(sandbox: Arc<dyn Sandbox>, limits: GradingLimits) -> Self {
        Self { sandbox, limits }
    }

    /// Grade `request`, sending progress and the final update on `updates`.
    ///
    /// Cases run concurrently; dropping the returned future aborts them.
    pub async fn grade(&self, request: JudgeRequest, updates: &mpsc::Sender<JudgeUpdate>) -> Verdict {
        let id = request.id.clone();
        emit(updates, JudgeUpdate::progress(id.clone(), "Compiling")).await;

        let compiled = match self.compile(&request).await {
            Ok(compiled) => compiled,
            Err(failure) => {
                tracing::info!(submission_id = %id, status = %failure.status, "Compile failed");
                let update = JudgeUpdate::finished(id, failure.status, vec![failure.result]);
                emit(updates, update).await;
                return Verdict::CompileError;
            }
        };
        emit(updates, JudgeUpdate::progress(id.clone(), "Compiled")).await;

        let (verdicts, cases) = self.run_cases(&request, &compiled.files.ids, updates).await;
        let verdict = Verdict::worst(verdicts);

        let mut results = Vec::with_capacity(cases.len() + 1);
        results.push(compiled.result);
        results.extend(cases);
        tracing::info!(submission_id = %id, verdict = %verdict, cases = request.cases.len(), "Graded");
        emit(updates, JudgeUpdate::finished(id, verdict.to_string(), results)).await;

        compiled.files.release().await;
        verdict
    }

    async fn compile(&self, request: &JudgeRequest) -> Result<Compiled, CompileFailure> {
        let language = &request.language;
        let Some(args) = language.compile_args() else {
            return Err(CompileFailure {
                status: format!("Invalid compile command: {}", language.compile_cmd),
                result: CaseResult {
                    log: format!("cannot split {:?}", language.compile_cmd),
                    ..Default::default()
                },
            });
        };

        let mut cmd = Cmd::new(args, env(), self.limits.compile);
        cmd.copy_in.insert(
            language.source_file_name.clone(),
            InputFile::Memory(request.source.clone().into_bytes()),
        );
        cmd.copy_out_cached = language.executables.clone();

        let res = match self.sandbox.exec(cmd).await {
            Ok(res) => res,
            Err(e) => {
                return Err(CompileFailure {
                    status: format!("Compile Error: {}", e),
                    result: CaseResult {
                        log: e.to_string(),
                        ..Default::default()
                    },
                })
            }
        };

        let result = captured(&res);
        let files = CachedFiles::new(self.sandbox.clone(), res.file_ids);
        if res.status != ExecStatus::Accepted {
            files.release().await;
            return Err(CompileFailure {
                status: format!("Compile Error: {}", res.status),
                result,
            });
        }
        Ok(Compiled { result, files })
    }

    /// Run all cases at once. Results keep the order of `request.cases`
    /// whatever order they complete in.
    async fn run_cases(
        &self,
        request: &JudgeRequest,
        file_ids: &HashMap<String, String>,
        updates: &mpsc::Sender<JudgeUpdate>,
    ) -> (Vec<Verdict>, Vec<CaseResult>) {
        let total = request.cases.len();
        let mut verdicts = vec![Verdict::JudgementFailed; total];
        let mut results: Vec<CaseResult> = request
            .cases
            .iter()
            .map(|case| CaseResult {
                stdin: lossy(&case.input),
                ..Default::default()
            })
            .collect();

        let Some(args) = request.language.run_args() else {
            for result in &mut results {
                result.log = format!("Invalid run command: {}", request.language.run_cmd);
            }
            return (verdicts, results);
        };
        let limits = self.limits.run_limits_for(&request.language.name);
        let copy_in: HashMap<String, InputFile> = file_ids
            .iter()
            .map(|(name, id)| (name.clone(), InputFile::Cached(id.clone())))
            .collect();

        let done = Arc::new(AtomicUsize::new(0));
        let mut cases = JoinSet::new();
        for (index, case) in request.cases.iter().cloned().enumerate() {
            let sandbox = self.sandbox.clone();
            let mut cmd = Cmd::new(args.clone(), env(), limits);
            cmd.copy_in = copy_in.clone();
            let done = done.clone();
            let updates = updates.clone();
            let id = request.id.clone();
            cases.spawn(async move {
                let outcome = run_case(sandbox.as_ref(), cmd, case).await;
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                emit(&updates, JudgeUpdate::progress(id, format!("Judging ({} / {})", n, total)))
                    .await;
                (index, outcome)
            });
        }

        while let Some(joined) = cases.join_next().await {
            match joined {
                Ok((index, (verdict, result))) => {
                    verdicts[index] = verdict;
                    results[index] = result;
                }
                Err(e) => {
                    tracing::error!(submission_id = %request.id, error = %e, "Case task failed");
                }
            }
        }
        (verdicts, results)
    }

}

async fn run_case(sandbox: &dyn Sandbox, mut cmd: Cmd, case: TestCase) -> (Verdict, CaseResult) {
    let stdin = lossy(&case.input);
    cmd.stdin = case.input;
    let res = match sandbox.exec(cmd).await {
        Ok(res) => res,
        Err(e) => {
            let result = CaseResult {
                stdin,
                log: e.to_string(),
                ..Default::default()
            };
            return (Verdict::JudgementFailed, result);
        }
    };

    let mut verdict = res.status.verdict();
    let mut result = CaseResult {
        stdin,
        ..captured(&res)
    };
    if let Err(mismatch) = diff::compare(&case.answer, res.file("stdout")) {
        // A limit or runtime failure already outranks the wrong output.
        if verdict == Verdict::Accepted {
            verdict = Verdict::WrongAnswer;
            result.log = mismatch.to_string();
        }
    }
    (verdict, result)
}

async fn emit(updates: &mpsc::Sender<JudgeUpdate>, update: JudgeUpdate) {
    if updates.send(update).await.is_err() {
        tracing::debug!("Update receiver gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Language, UpdateKind};
    use crate::sandbox::{ExecSession, SandboxError, SessionCmd};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Compiles anything with `cc`, fails every other compiler, and runs
    /// programs that add two numbers. Input `boom` breaks the executor and
    /// input `spin` exceeds the time limit.
    #[derive(Default)]
    struct AddingSandbox {
        deleted: Mutex<Vec<String>>,
        wrong: bool,
    }

    #[tonic::async_trait]
    impl Sandbox for AddingSandbox {
        async fn exec(&self, cmd: Cmd) -> Result<ExecResult, SandboxError> {
            if !cmd.copy_out_cached.is_empty() || cmd.args[0].ends_with("cc") {
                if cmd.args[0] != "cc" {
                    let mut res = ExecResult::new(ExecStatus::FileError);
                    res.error = format!("{}: not found", cmd.args[0]);
                    return Ok(res);
                }
                let mut res = ExecResult::new(ExecStatus::Accepted);
                for name in &cmd.copy_out_cached {
                    res.file_ids.insert(name.clone(), format!("cache-{}", name));
                }
                return Ok(res);
            }

            assert_eq!(cmd.copy_in.get("a"), Some(&InputFile::Cached("cache-a".into())));
            let input = String::from_utf8_lossy(&cmd.stdin).into_owned();
            match input.as_str() {
                "boom" => return Err(SandboxError::Protocol("executor crashed".into())),
                "spin" => return Ok(ExecResult::new(ExecStatus::TimeLimitExceeded)),
                "hang" => std::future::pending::<()>().await,
                _ => {}
            }
            let nums: Vec<u64> = input.split_whitespace().filter_map(|n| n.parse().ok()).collect();
            // Later cases finish first.
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(nums[0] * 10))).await;
            let mut sum: u64 = nums.iter().sum();
            if self.wrong {
                sum += 1;
            }
            let mut res = ExecResult::new(ExecStatus::Accepted);
            res.files.insert("stdout".into(), format!("{}\n", sum).into_bytes());
            Ok(res)
        }

        async fn delete_file(&self, file_id: &str) -> Result<(), SandboxError> {
            self.deleted.lock().unwrap().push(file_id.to_string());
            Ok(())
        }

        async fn exec_stream(&self, _cmd: SessionCmd) -> Result<ExecSession, SandboxError> {
            Err(SandboxError::Protocol("not interactive".into()))
        }
    }

    fn request(compile_cmd: &str, cases: &[(&str, &str)]) -> JudgeRequest {
        JudgeRequest {
            id: "0000000000000001".to_string(),
            language: Language {
                name: "c".to_string(),
                source_file_name: "a.c".to_string(),
                compile_cmd: compile_cmd.to_string(),
                run_cmd: "./a".to_string(),
                executables: vec!["a".to_string()],
            },
            source: "int main() {}".to_string(),
            cases: cases
                .iter()
                .map(|(i, a)| TestCase {
                    input: i.as_bytes().to_vec(),
                    answer: a.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    async fn grade(sandbox: Arc<AddingSandbox>, req: JudgeRequest) -> (Verdict, Vec<JudgeUpdate>) {
        let grader = Grader::new(sandbox, GradingLimits::default());
        let (tx, mut rx) = mpsc::channel(64);
        let verdict = grader.grade(req, &tx).await;
        drop(tx);
        let mut updates = Vec::new();
        while let Some(u) = rx.recv().await {
            updates.push(u);
        }
        (verdict, updates)
    }

    #[tokio::test]
    async fn accepted_run_reports_every_case_in_order() {
        let sandbox = Arc::new(AddingSandbox::default());
        let req = request("cc -o a a.c", &[("0 0", "0"), ("1 1", "2"), ("2 2", "4"), ("3 3", "6")]);
        let (verdict, updates) = grade(sandbox.clone(), req).await;
        assert_eq!(verdict, Verdict::Accepted);

        let statuses: Vec<_> = updates.iter().map(|u| u.status.as_str()).collect();
        assert_eq!(statuses[0], "Compiling");
        assert_eq!(statuses[1], "Compiled");
        assert!(statuses.contains(&"Judging (4 / 4)"));
        assert_eq!(statuses.iter().filter(|s| s.starts_with("Judging")).count(), 4);

        let last = updates.last().unwrap();
        assert_eq!(last.kind, UpdateKind::Finished);
        assert_eq!(last.status, "Accepted");
        assert_eq!(last.results.len(), 5);
        for (i, input) in ["0 0", "1 1", "2 2", "3 3"].iter().enumerate() {
            assert_eq!(last.results[i + 1].stdin, *input);
        }
        assert_eq!(updates.iter().filter(|u| u.is_finished()).count(), 1);
        assert_eq!(*sandbox.deleted.lock().unwrap(), vec!["cache-a".to_string()]);
    }

    #[tokio::test]
    async fn wrong_output_is_wrong_answer() {
        let sandbox = Arc::new(AddingSandbox {
            wrong: true,
            ..Default::default()
        });
        let (verdict, updates) = grade(sandbox, request("cc -o a a.c", &[("1 1", "2")])).await;
        assert_eq!(verdict, Verdict::WrongAnswer);
        let last = updates.last().unwrap();
        assert_eq!(last.status, "WrongAnswer");
        assert!(last.results[1].log.contains("expected \"2\""));
    }

    #[tokio::test]
    async fn worse_verdict_beats_wrong_answer() {
        let sandbox = Arc::new(AddingSandbox::default());
        let (verdict, updates) =
            grade(sandbox, request("cc -o a a.c", &[("1 1", "3"), ("spin", "0")])).await;
        assert_eq!(verdict, Verdict::TimeLimitExceeded);
        assert_eq!(updates.last().unwrap().status, "TimeLimitExceeded");
    }

    #[tokio::test]
    async fn executor_failure_is_isolated_to_its_case() {
        let sandbox = Arc::new(AddingSandbox::default());
        let (verdict, updates) =
            grade(sandbox, request("cc -o a a.c", &[("boom", "0"), ("1 2", "3")])).await;
        assert_eq!(verdict, Verdict::JudgementFailed);
        let last = updates.last().unwrap();
        assert_eq!(last.results.len(), 3);
        assert!(last.results[1].log.contains("executor crashed"));
        assert_eq!(last.results[2].stdout, "3\n");
        assert!(last.results[2].log.is_empty());
    }

    #[tokio::test]
    async fn missing_compiler_stops_before_cases() {
        let sandbox = Arc::new(AddingSandbox::default());
        let (verdict, updates) =
            grade(sandbox, request("nonexistent-cc -o a a.c", &[("1 1", "2")])).await;
        assert_eq!(verdict, Verdict::CompileError);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].status, "Compiling");
        let last = &updates[1];
        assert!(last.is_finished());
        assert_eq!(last.status, "Compile Error: File Error");
        assert_eq!(last.results.len(), 1);
        assert!(updates.iter().all(|u| !u.status.starts_with("Judging")));
    }

    #[tokio::test]
    async fn unsplittable_compile_command() {
        let sandbox = Arc::new(AddingSandbox::default());
        let (verdict, updates) = grade(sandbox, request("cc \"a.c", &[("1 1", "2")])).await;
        assert_eq!(verdict, Verdict::CompileError);
        assert!(updates[1].status.starts_with("Invalid compile command"));
    }

    #[tokio::test]
    async fn no_cases_is_compile_only() {
        let sandbox = Arc::new(AddingSandbox::default());
        let (verdict, updates) = grade(sandbox, request("cc -o a a.c", &[])).await;
        assert_eq!(verdict, Verdict::Accepted);
        assert_eq!(updates.last().unwrap().results.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_still_deletes_cached_files() {
        let sandbox = Arc::new(AddingSandbox::default());
        let grader = Grader::new(sandbox.clone(), GradingLimits::default());
        let (tx, mut rx) = mpsc::channel(64);
        let req = request("cc -o a a.c", &[("hang", "0"), ("hang", "0")]);
        let grading = tokio::spawn(async move { grader.grade(req, &tx).await });

        loop {
            let update = rx.recv().await.unwrap();
            if update.status == "Compiled" {
                break;
            }
        }
        grading.abort();
        assert!(grading.await.unwrap_err().is_cancelled());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while sandbox.deleted.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "cached files leaked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*sandbox.deleted.lock().unwrap(), vec!["cache-a".to_string()]);
    }
}
