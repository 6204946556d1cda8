use crate::materialize::PLAN_FILE;
use crate::RuntimeError;
use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use terraplane_schema::{StepLog, TimeoutSection, ToolSection};
use tracing::{debug, warn};

/// Leading bytes of output always kept.
const CAPTURE_HEAD_BYTES: usize = 1024 * 1024;
/// Trailing bytes of output always kept; the tool reports errors last.
const CAPTURE_TAIL_BYTES: usize = 7 * 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for a SIGKILLed process and its pipes after termination.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// The fixed verb vocabulary of the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Init,
    Plan,
    Apply,
    Destroy,
    Output,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Init => "init",
            Verb::Plan => "plan",
            Verb::Apply => "apply",
            Verb::Destroy => "destroy",
            Verb::Output => "output",
        }
    }

    pub fn args(self) -> Vec<String> {
        match self {
            Verb::Init => vec!["init".to_owned()],
            Verb::Plan => vec![
                "plan".to_owned(),
                format!("-out={PLAN_FILE}"),
                "-json".to_owned(),
            ],
            // Apply consumes the saved plan, never a fresh one.
            Verb::Apply => vec!["apply".to_owned(), PLAN_FILE.to_owned()],
            Verb::Destroy => vec!["destroy".to_owned(), "-auto-approve".to_owned()],
            Verb::Output => vec!["output".to_owned(), "-json".to_owned()],
        }
    }
}

/// Per-verb wall-clock bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTable {
    pub init: Duration,
    pub plan: Duration,
    pub apply: Duration,
    pub destroy: Duration,
    pub output: Duration,
}

impl TimeoutTable {
    pub fn from_config(section: &TimeoutSection) -> Self {
        Self {
            init: Duration::from_secs(section.init_secs),
            plan: Duration::from_secs(section.plan_secs),
            apply: Duration::from_secs(section.apply_secs),
            destroy: Duration::from_secs(section.destroy_secs),
            output: Duration::from_secs(section.output_secs),
        }
    }

    /// The same bound for every verb.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            init: timeout,
            plan: timeout,
            apply: timeout,
            destroy: timeout,
            output: timeout,
        }
    }

    pub fn for_verb(&self, verb: Verb) -> Duration {
        match verb {
            Verb::Init => self.init,
            Verb::Plan => self.plan,
            Verb::Apply => self.apply,
            Verb::Destroy => self.destroy,
            Verb::Output => self.output,
        }
    }
}

/// Shared cancellation flag between a worker and whoever may cancel it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    /// Killed by a signal the executor did not send.
    Signaled,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ToolRun {
    pub verb: Verb,
    pub status: RunStatus,
    /// Combined stdout/stderr in arrival order.
    pub output: String,
    pub duration: Duration,
}

impl ToolRun {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            RunStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn to_step_log(&self) -> StepLog {
        StepLog {
            verb: self.verb.as_str().to_owned(),
            exit_code: self.exit_code(),
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            output: self.output.clone(),
        }
    }
}

/// Combined output bounded to a fixed head plus a rolling tail.
#[derive(Debug)]
struct Capture {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_limit: usize,
    tail_limit: usize,
    dropped: usize,
}

impl Default for Capture {
    fn default() -> Self {
        Self::with_limits(CAPTURE_HEAD_BYTES, CAPTURE_TAIL_BYTES)
    }
}

impl Capture {
    fn with_limits(head_limit: usize, tail_limit: usize) -> Self {
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_limit,
            tail_limit,
            dropped: 0,
        }
    }

    fn push(&mut self, mut chunk: &[u8]) {
        let room = self.head_limit.saturating_sub(self.head.len());
        if room > 0 {
            let take = room.min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }
        self.tail.extend(chunk);
        let excess = self.tail.len().saturating_sub(self.tail_limit);
        if excess > 0 {
            self.tail.drain(..excess);
            self.dropped += excess;
        }
    }

    fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.head).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[... {} bytes of output truncated ...]\n", self.dropped));
        }
        let (front, back) = self.tail.as_slices();
        let mut tail = Vec::with_capacity(self.tail.len());
        tail.extend_from_slice(front);
        tail.extend_from_slice(back);
        text.push_str(&String::from_utf8_lossy(&tail));
        text
    }
}

/// Runs the external IaC binary inside a workspace root.
///
/// Every invocation is bounded by the verb's timeout and watches a
/// [`CancelToken`]. On either, the whole process group gets SIGTERM, then
/// SIGKILL once the grace period lapses; the call only returns after the
/// child has been reaped.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    binary: PathBuf,
    global_args: Vec<String>,
    timeouts: TimeoutTable,
    grace: Duration,
}

impl ToolExecutor {
    pub fn new(
        binary: impl Into<PathBuf>,
        global_args: Vec<String>,
        timeouts: TimeoutTable,
        grace: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            global_args,
            timeouts,
            grace,
        }
    }

    pub fn from_config(tool: &ToolSection, timeouts: &TimeoutSection) -> Self {
        Self::new(
            tool.binary.clone(),
            tool.global_args.clone(),
            TimeoutTable::from_config(timeouts),
            timeouts.grace(),
        )
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeouts(&self) -> &TimeoutTable {
        &self.timeouts
    }

    pub fn run(
        &self,
        verb: Verb,
        workdir: &Path,
        cancel: &CancelToken,
    ) -> Result<ToolRun, RuntimeError> {
        let args = verb.args();
        let timeout = self.timeouts.for_verb(verb);
        debug!(
            "running {} {} {} in {} (timeout {timeout:?})",
            self.binary.display(),
            self.global_args.join(" "),
            args.join(" "),
            workdir.display()
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.global_args)
            .args(&args)
            .current_dir(workdir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so termination reaches the tool's children too.
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;

        let capture = Arc::new(Mutex::new(Capture::default()));
        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|p| spawn_reader(p, &capture)),
            child.stderr.take().map(|p| spawn_reader(p, &capture)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let deadline = start + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(exit)) => {
                    break exit.code().map_or(RunStatus::Signaled, RunStatus::Exited);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("failed to poll {} {}: {e}", self.binary.display(), verb.as_str());
                    self.terminate(&mut child);
                    return Err(RuntimeError::Io(e));
                }
            }
            if cancel.is_cancelled() {
                warn!("{} cancelled, terminating pid {}", verb.as_str(), child.id());
                self.terminate(&mut child);
                break RunStatus::Cancelled;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} exceeded {timeout:?}, terminating pid {}",
                    verb.as_str(),
                    child.id()
                );
                self.terminate(&mut child);
                break RunStatus::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        };

        join_readers(readers);
        let output = capture.lock().expect("capture lock poisoned").render();

        let run = ToolRun {
            verb,
            status,
            output,
            duration: start.elapsed(),
        };
        debug!(
            "{} finished with {:?} after {:?}",
            verb.as_str(),
            run.status,
            run.duration
        );
        Ok(run)
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL whatever
    /// is left of the group. Descendants are killed even when the direct
    /// child exits on TERM.
    fn terminate(&self, child: &mut Child) {
        signal_group(child, Signal::Term);

        let grace_deadline = Instant::now() + self.grace;
        let mut reaped = false;
        while Instant::now() < grace_deadline {
            if !reaped {
                reaped = !matches!(child.try_wait(), Ok(None));
            }
            if reaped && !group_alive(child) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }

        if reaped {
            warn!(
                "process group {} outlived its leader by {:?}, sending SIGKILL",
                child.id(),
                self.grace
            );
        } else {
            warn!(
                "pid {} still running after {:?} grace, sending SIGKILL",
                child.id(),
                self.grace
            );
        }
        signal_group(child, Signal::Kill);
        if reaped {
            return;
        }
        let _ = child.kill();

        let reap_deadline = Instant::now() + REAP_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) if Instant::now() >= reap_deadline => {
                    warn!("pid {} could not be reaped", child.id());
                    return;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    capture: &Arc<Mutex<Capture>>,
) -> JoinHandle<()> {
    let capture = Arc::clone(capture);
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => capture
                    .lock()
                    .expect("capture lock poisoned")
                    .push(&buf[..n]),
            }
        }
    })
}

/// Join pipe readers, giving up on any still blocked after [`REAP_TIMEOUT`]
/// (a descendant that escaped the process group may hold the pipe open).
fn join_readers(readers: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + REAP_TIMEOUT;
    for reader in readers {
        while !reader.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if reader.is_finished() {
            let _ = reader.join();
        } else {
            warn!("output reader still blocked; detaching");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill() with a negative pid signals a process group; the group
    // was created for this child via process_group(0) and pgid fits in i32.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, sig) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to signal process group {pgid}: {errno}");
        }
    }
}

/// Whether any process is left in the child's group.
#[cfg(unix)]
fn group_alive(child: &Child) -> bool {
    let Ok(pgid) = i32::try_from(child.id()) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the group exists.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {}

#[cfg(not(unix))]
fn group_alive(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_vocabulary_is_fixed() {
        assert_eq!(Verb::Init.args(), vec!["init"]);
        assert_eq!(Verb::Plan.args(), vec!["plan", "-out=tfplan", "-json"]);
        assert_eq!(Verb::Apply.args(), vec!["apply", "tfplan"]);
        assert_eq!(Verb::Destroy.args(), vec!["destroy", "-auto-approve"]);
        assert_eq!(Verb::Output.args(), vec!["output", "-json"]);
    }

    #[test]
    fn timeout_table_from_config() {
        let section = TimeoutSection {
            init_secs: 1,
            plan_secs: 2,
            apply_secs: 3,
            destroy_secs: 4,
            output_secs: 5,
            grace_millis: 100,
        };
        let table = TimeoutTable::from_config(&section);
        assert_eq!(table.for_verb(Verb::Init), Duration::from_secs(1));
        assert_eq!(table.for_verb(Verb::Apply), Duration::from_secs(3));
        assert_eq!(table.for_verb(Verb::Output), Duration::from_secs(5));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn step_log_carries_exit_code() {
        let run = ToolRun {
            verb: Verb::Apply,
            status: RunStatus::Exited(1),
            output: "partial".to_owned(),
            duration: Duration::from_millis(1500),
        };
        assert!(!run.success());
        let log = run.to_step_log();
        assert_eq!(log.verb, "apply");
        assert_eq!(log.exit_code, Some(1));
        assert_eq!(log.duration_ms, 1500);

        let timed_out = ToolRun {
            status: RunStatus::TimedOut,
            ..run
        };
        assert_eq!(timed_out.to_step_log().exit_code, None);
    }

    #[test]
    fn capture_keeps_head_and_rolling_tail() {
        let mut cap = Capture::with_limits(4, 6);
        cap.push(b"abcdefg");
        cap.push(b"hijklmnop");
        assert_eq!(
            cap.render(),
            "abcd\n[... 6 bytes of output truncated ...]\nklmnop"
        );
    }

    #[test]
    fn capture_under_limits_is_verbatim() {
        let mut cap = Capture::with_limits(4, 6);
        cap.push(b"abc");
        cap.push(b"defg");
        assert_eq!(cap.render(), "abcdefg");
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ToolExecutor::new(
            dir.path().join("no-such-binary"),
            Vec::new(),
            TimeoutTable::uniform(Duration::from_secs(5)),
            Duration::from_millis(100),
        );
        let err = exec
            .run(Verb::Init, dir.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }
}
