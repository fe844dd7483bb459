/// Execution Engine - Sandboxed Process Lifecycle
///
/// **Core Responsibility:**
/// Run a command inside a fresh, resource-bounded sandbox and capture its raw
/// outcome (exit status, stdout, stderr, timeout flag).
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (child process, rlimits, process group, timeout)
/// - Engine does NOT know which language it runs (runner's job)
/// - Engine does NOT evaluate correctness (evaluator's job)
///
/// **Lifecycle:**
/// `SandboxPool::acquire` -> `SandboxLease::run` (any number of times) -> drop.
/// Dropping a lease removes its workspace and frees its pool slot. Dropping a
/// `run` future mid-flight kills the whole process tree.

use crate::error::EvalError;
use crate::reaper;
use anyhow::{Context, Result};
use proctor_common::config::MAX_SANDBOXES;
use proctor_common::types::{ExecutionResult, ExitStatus};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Fallback search path when the host has no PATH set
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to keep draining pipes after the process group is gone
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Cap on files the sandboxed process may write
const MAX_FILE_SIZE_BYTES: u64 = 16 * 1024 * 1024; // 16MB

const MAX_OPEN_FILES: u64 = 256;

/// Tasks a sandbox may add on top of what its user already runs.
/// `RLIMIT_NPROC` is per user, so the cap is set relative to the current count.
const MAX_EXTRA_PROCESSES: u64 = 64;

const TRUNCATION_NOTICE: &str = "\n[output truncated]";

/// A command to run inside a sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set on top of the cleared environment
    pub env: Vec<(String, String)>,
    /// Bytes fed to the child's stdin; stdin is closed when `None`
    pub stdin: Option<Vec<u8>>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }
}

/// Resource bounds applied to every process in a sandbox
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_limit_mb: u32,
    pub max_output_bytes: usize,
}

/// Bounded pool of sandbox slots.
///
/// Requests beyond capacity queue for at most `queue_wait`, then get
/// `EvalError::PoolSaturated` instead of spawning more processes.
#[derive(Debug, Clone)]
pub struct SandboxPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    queue_wait: Duration,
}

impl SandboxPool {
    pub fn new(capacity: usize, queue_wait: Duration) -> Self {
        let capacity = capacity.clamp(1, MAX_SANDBOXES);
        reaper::adopt_orphans();
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_wait,
        }
    }

    /// Take a slot and create a fresh workspace for one submission
    pub async fn acquire(&self) -> Result<SandboxLease, EvalError> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.queue_wait,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(EvalError::Sandbox(anyhow::anyhow!("Sandbox pool is closed")));
            }
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, capacity = self.capacity, "Sandbox pool saturated");
                return Err(EvalError::PoolSaturated { waited_ms });
            }
        };

        let id = Uuid::new_v4();
        let workspace = tempfile::Builder::new()
            .prefix(&format!("proctor-{}-", id))
            .tempdir()
            .context("Failed to create sandbox workspace")?;

        debug!(
            sandbox_id = %id,
            workspace = %workspace.path().display(),
            queued_ms = started.elapsed().as_millis() as u64,
            "Sandbox acquired"
        );

        Ok(SandboxLease {
            id,
            workspace,
            _permit: permit,
        })
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One submission's sandbox: a pool slot plus a private workspace directory.
/// Never shared or reused across submissions.
#[derive(Debug)]
pub struct SandboxLease {
    id: Uuid,
    workspace: TempDir,
    _permit: OwnedSemaphorePermit,
}

impl SandboxLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.workspace.path()
    }

    /// Write a file into the workspace and return its path
    pub async fn materialize(&self, file_name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.path().join(file_name);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {} into sandbox workspace", file_name))?;
        Ok(path)
    }

    /// Run a command in this sandbox under `limits`
    #[instrument(skip(self, spec, limits), fields(sandbox_id = %self.id, program = %spec.program, timeout_ms = limits.timeout.as_millis() as u64))]
    pub async fn run(&self, spec: &ProcessSpec, limits: &SandboxLimits) -> Result<ExecutionResult> {
        run_sandboxed(spec, self.path(), limits).await
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        debug!(sandbox_id = %self.id, "Sandbox released");
    }
}

/// Owns a sandbox root's process tree.
///
/// Dropping it kills the root, its process group and every descendant,
/// including ones that left the group with `setsid`. That covers timeouts,
/// errors and cancellation of the surrounding future.
struct ProcessTreeGuard {
    root: Option<i32>,
}

impl ProcessTreeGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            root: pid.map(|p| p as i32),
        }
    }

    /// Kill the tree while the root may still be running
    fn kill(&self) {
        if let Some(root) = self.root {
            kill_tree(root);
        }
    }

    /// Once the root has been reaped: kill what is left of its group and
    /// collect anything that was re-parented to the host.
    fn finish(mut self) {
        if let Some(root) = self.root.take() {
            kill_group(root);
            reaper::live_roots().remove(&root);
            reaper::sweep_orphans();
        }
    }
}

impl Drop for ProcessTreeGuard {
    fn drop(&mut self) {
        if let Some(root) = self.root.take() {
            kill_tree(root);
            reaper::live_roots().remove(&root);
        }
    }
}

fn kill_tree(root: i32) {
    // Descendants first: the root keeps them in its tree only while it lives
    reaper::kill_descendants(root);
    kill_group(root);
    // SAFETY: kill has no memory-safety preconditions; ESRCH is ignored.
    unsafe {
        libc::kill(root, libc::SIGKILL);
    }
}

fn kill_group(pgid: i32) {
    // SAFETY: killpg has no memory-safety preconditions. ESRCH (group
    // already gone) is expected and ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Captured bytes from one output stream
#[derive(Debug, Default)]
struct Captured {
    data: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_NOTICE);
        }
        text
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes.
/// Keeps draining past the limit so the writer never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, limit: usize) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.data.len());
        captured.data.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            captured.truncated = true;
        }
    }
    Ok(captured)
}

async fn collect_output(task: JoinHandle<io::Result<Captured>>, stream: &str) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, task).await {
        Ok(Ok(Ok(captured))) => captured.into_string(),
        Ok(Ok(Err(e))) => {
            warn!(stream, error = %e, "Failed to read sandbox output");
            String::new()
        }
        Ok(Err(e)) => {
            warn!(stream, error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            // A descendant outside the process group still holds the pipe
            abort.abort();
            warn!(stream, "Output pipe still open after process exit; discarding");
            String::new()
        }
    }
}

fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signal(signal);
        }
    }
    ExitStatus::Code(-1)
}

/// Kernel resource limits applied in the child between fork and exec
#[cfg(target_os = "linux")]
fn apply_rlimits(memory_bytes: u64, cpu_secs: u64, max_processes: u64) -> io::Result<()> {
    let plan = [
        (libc::RLIMIT_DATA, memory_bytes),
        (libc::RLIMIT_CPU, cpu_secs),
        (libc::RLIMIT_FSIZE, MAX_FILE_SIZE_BYTES),
        (libc::RLIMIT_NOFILE, MAX_OPEN_FILES),
        (libc::RLIMIT_NPROC, max_processes),
        (libc::RLIMIT_CORE, 0),
    ];

    for (resource, limit) in plan {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `current` is a valid, writable rlimit; resource is a libc constant.
        if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Never try to raise the hard limit; unprivileged processes cannot.
        let limit = (limit as libc::rlim_t).min(current.rlim_max);
        let rlim = libc::rlimit {
            rlim_cur: limit,
            rlim_max: limit,
        };
        // SAFETY: `rlim` is a valid rlimit; resource is a libc constant.
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Run one process with a hard wall-clock timeout.
///
/// **Safety Guarantees:**
/// - Cleared environment (PATH only), closed or fed stdin, piped stdout/stderr
/// - Own process group, and a subreaper root so detached descendants stay
///   trackable; the whole tree is killed on timeout, error, exit and drop
/// - rlimits on memory, CPU time, file size, open files, processes and core
///   dumps (Linux)
/// - Output capped per stream; partial output kept on timeout
async fn run_sandboxed(spec: &ProcessSpec, workdir: &Path, limits: &SandboxLimits) -> Result<ExecutionResult> {
    let path_env = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(workdir)
        .env_clear()
        .env("PATH", &path_env)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(target_os = "linux")]
    {
        let memory_bytes = u64::from(limits.memory_limit_mb) * 1024 * 1024;
        let cpu_secs = limits.timeout.as_secs().saturating_mul(2).saturating_add(1);
        let max_processes = reaper::user_task_count().saturating_add(MAX_EXTRA_PROCESSES);
        // SAFETY: the hook only calls getrlimit/setrlimit/prctl, which are
        // async-signal-safe, and does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                reaper::set_child_subreaper()?;
                apply_rlimits(memory_bytes, cpu_secs, max_processes)
            });
        }
    }

    let start_time = Instant::now();
    let (mut child, tree) = {
        // Registered under the lock so no concurrent sweep mistakes it for an orphan
        let mut roots = reaper::live_roots();
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", spec.program))?;
        if let Some(pid) = child.id() {
            roots.insert(pid as i32);
        }
        let tree = ProcessTreeGuard::new(child.id());
        (child, tree)
    };

    let stdout = child.stdout.take().context("Child stdout was not captured")?;
    let stderr = child.stderr.take().context("Child stderr was not captured")?;
    let stdout_task = tokio::spawn(read_capped(stdout, limits.max_output_bytes));
    let stderr_task = tokio::spawn(read_capped(stderr, limits.max_output_bytes));

    let stdin_task = match (child.stdin.take(), spec.stdin.clone()) {
        (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
            // A child that exits without reading yields EPIPE; that is not our failure
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        })),
        _ => None,
    };

    let (exit_status, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
        Ok(Ok(status)) => (convert_status(status), false),
        Ok(Err(e)) => {
            return Err(e).context("Failed to wait for sandboxed process");
        }
        Err(_) => {
            warn!(timeout_ms = limits.timeout.as_millis() as u64, "Execution timed out - killing process tree");
            tree.kill();
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "start_kill after tree kill");
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap timed-out process");
            }
            (ExitStatus::Killed, true)
        }
    };

    // Reap anything the submission left running in the background
    tree.finish();
    if let Some(task) = stdin_task {
        task.abort();
    }

    let stdout = collect_output(stdout_task, "stdout").await;
    let mut stderr = collect_output(stderr_task, "stderr").await;
    if timed_out {
        stderr.push_str(&format!("\n[Execution timed out after {}s]", limits.timeout.as_secs()));
    }

    let duration_ms = start_time.elapsed().as_millis() as u64;

    debug!(
        exit_status = %exit_status,
        timed_out,
        duration_ms,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Sandboxed process finished"
    );

    Ok(ExecutionResult {
        exit_status,
        stdout,
        stderr,
        timed_out,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_truncates_but_drains() {
        let data = vec![b'x'; 50_000];
        let captured = read_capped(&data[..], 1024).await.unwrap();
        assert_eq!(captured.data.len(), 1024);
        assert!(captured.truncated);
        assert!(captured.into_string().ends_with(TRUNCATION_NOTICE));
    }

    #[tokio::test]
    async fn test_read_capped_under_limit() {
        let captured = read_capped(&b"hello\n"[..], 1024).await.unwrap();
        assert!(!captured.truncated);
        assert_eq!(captured.into_string(), "hello\n");
    }

    #[tokio::test]
    async fn test_lease_workspace_is_unique_and_removed() {
        let pool = SandboxPool::new(2, Duration::from_secs(1));
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(pool.available(), 0);

        let unit = first.materialize("submission.py", b"print(1)").await.unwrap();
        assert!(unit.exists());
        let workspace = first.path().to_path_buf();

        drop(first);
        assert!(!workspace.exists());
        assert_eq!(pool.available(), 1);

        drop(second);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_pool_capacity_is_bounded() {
        assert_eq!(SandboxPool::new(0, Duration::from_secs(1)).capacity(), 1);
        let huge = SandboxPool::new(usize::MAX, Duration::from_secs(1));
        assert_eq!(huge.capacity(), MAX_SANDBOXES);
        assert_eq!(huge.available(), MAX_SANDBOXES);
    }

    #[tokio::test]
    async fn test_pool_saturation_is_backpressure() {
        let pool = SandboxPool::new(1, Duration::from_millis(50));
        let _held = pool.acquire().await.unwrap();

        match pool.acquire().await {
            Err(EvalError::PoolSaturated { waited_ms }) => assert!(waited_ms >= 40),
            other => panic!("expected PoolSaturated, got {:?}", other.map(|l| l.id())),
        }
    }

    #[tokio::test]
    async fn test_queued_request_gets_freed_slot() {
        let pool = SandboxPool::new(1, Duration::from_secs(5));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(pool.available(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let pool = SandboxPool::new(1, Duration::from_secs(1));
        let lease = pool.acquire().await.unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(5),
            memory_limit_mb: 256,
            max_output_bytes: 4096,
        };

        let spec = ProcessSpec::new("sh", vec!["-c".into(), "echo out; echo err >&2; exit 3".into()]);
        let result = lease.run(&spec, &limits).await.unwrap();

        assert_eq!(result.exit_status, ExitStatus::Code(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_feeds_stdin_and_clears_env() {
        let pool = SandboxPool::new(1, Duration::from_secs(1));
        let lease = pool.acquire().await.unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(5),
            memory_limit_mb: 256,
            max_output_bytes: 4096,
        };

        let spec = ProcessSpec::new(
            "sh",
            vec!["-c".into(), "cat; echo \"[${HOME:-unset}] [$GREETING]\"".into()],
        )
        .with_env("GREETING", "hi")
        .with_stdin(b"payload\n".to_vec());
        let result = lease.run(&spec, &limits).await.unwrap();

        assert!(result.exit_status.success());
        assert_eq!(result.stdout, "payload\n[unset] [hi]\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out_and_kills() {
        let pool = SandboxPool::new(1, Duration::from_secs(1));
        let lease = pool.acquire().await.unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(1),
            memory_limit_mb: 256,
            max_output_bytes: 4096,
        };

        let started = Instant::now();
        let spec = ProcessSpec::new("sh", vec!["-c".into(), "echo started; sleep 30".into()]);
        let result = lease.run(&spec, &limits).await.unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_status, ExitStatus::Killed);
        assert_eq!(result.stdout.trim(), "started");
        assert!(result.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    fn on_path(program: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_detached_descendant_does_not_outlive_run() {
        if !on_path("setsid") {
            return;
        }
        let pool = SandboxPool::new(1, Duration::from_secs(1));
        let lease = pool.acquire().await.unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(5),
            memory_limit_mb: 256,
            max_output_bytes: 4096,
        };

        let spec = ProcessSpec::new(
            "sh",
            vec![
                "-c".into(),
                "setsid sleep 41 </dev/null >/dev/null 2>&1 & echo $!".into(),
            ],
        );
        let result = lease.run(&spec, &limits).await.unwrap();
        assert!(result.exit_status.success());
        assert!(!result.timed_out);

        let pid: i32 = result.stdout.trim().parse().unwrap();
        assert!(reaper::wait_until_gone(pid).await, "detached process {} survived the run", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_detached_descendant_killed_on_timeout() {
        if !on_path("setsid") {
            return;
        }
        let pool = SandboxPool::new(1, Duration::from_secs(1));
        let lease = pool.acquire().await.unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(1),
            memory_limit_mb: 256,
            max_output_bytes: 4096,
        };

        let spec = ProcessSpec::new(
            "sh",
            vec![
                "-c".into(),
                "setsid sleep 42 </dev/null >/dev/null 2>&1 & echo $!; sleep 30".into(),
            ],
        );
        let result = lease.run(&spec, &limits).await.unwrap();
        assert!(result.timed_out);

        let pid: i32 = result.stdout.trim().parse().unwrap();
        assert!(reaper::wait_until_gone(pid).await, "detached process {} survived the timeout", pid);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let pool = SandboxPool::new(1, Duration::from_secs(1));
        let lease = pool.acquire().await.unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(1),
            memory_limit_mb: 256,
            max_output_bytes: 4096,
        };

        let spec = ProcessSpec::new("definitely-not-a-real-interpreter", vec![]);
        assert!(lease.run(&spec, &limits).await.is_err());
    }
}
