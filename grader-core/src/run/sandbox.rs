use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use libc::{
    c_int, rusage, wait4, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WNOHANG, WSTOPSIG,
    WTERMSIG,
};
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::ptrace;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{setsid, Pid};
use serde_derive::{Deserialize, Serialize};

use super::{CancelFlag, IsolationPolicy, ResourceLimits, RlimitConfigs};
use crate::error::GraderCoreError;
use crate::utils::io::{read_bounded, write_all_and_close, CapturedStream, SharedCapture};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long output may stay open after the process group is gone before the
/// processes still holding it are hunted down.
const DRAIN_GRACE: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeLimit {
    Cpu,
    Wall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "kebab-case")]
pub enum TerminationCause {
    Normal,
    Timeout { limit: TimeLimit },
    Oom,
    OutputTruncated,
    Signaled { signal: i32 },
}

/// Raw outcome of one sandboxed invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
    pub termination: TerminationCause,
}

impl ExecutionResult {
    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    WallTime,
    Memory,
    Output,
    Cancelled,
}

/// What the monitor saw, before it is turned into a [`TerminationCause`].
#[derive(Debug, Clone, Copy)]
struct RawOutcome {
    exit_code: Option<i32>,
    signal: Option<i32>,
    cpu_time: Duration,
    peak_memory_bytes: u64,
    /// Highest virtual size seen, read at exit when tracing is available.
    peak_virtual_bytes: u64,
    /// Soft `RLIMIT_AS` the process ran under.
    address_space_limit: Option<u64>,
    kill_reason: Option<KillReason>,
    truncated: bool,
}

impl RawOutcome {
    fn from_wait_status(status: c_int) -> (Option<i32>, Option<i32>) {
        if WIFEXITED(status) {
            (Some(WEXITSTATUS(status)), None)
        } else if WIFSIGNALED(status) {
            (None, Some(WTERMSIG(status)))
        } else {
            (None, None)
        }
    }

    fn ended_abnormally(&self) -> bool {
        self.signal.is_some() || self.exit_code != Some(0)
    }

    /// Within a quarter of the limit counts as having hit it: the last
    /// failing allocation is never seen.
    fn near_memory_limit(&self, limits: &ResourceLimits) -> bool {
        let resident = limits.memory_bytes > 0
            && self.peak_memory_bytes.saturating_mul(4) >= limits.memory_bytes.saturating_mul(3);
        let virtual_size = match self.address_space_limit {
            Some(limit) if limit > 0 => {
                self.peak_virtual_bytes.saturating_mul(4) >= limit.saturating_mul(3)
            }
            _ => false,
        };
        resident || virtual_size
    }
}

fn classify(outcome: &RawOutcome, limits: &ResourceLimits) -> TerminationCause {
    let cpu_limit = Duration::from_secs(limits.cpu_seconds);
    let cpu_exhausted = limits.cpu_seconds > 0 && outcome.cpu_time >= cpu_limit;

    match outcome.kill_reason {
        Some(KillReason::Memory) => return TerminationCause::Oom,
        Some(KillReason::WallTime) => {
            return TerminationCause::Timeout {
                limit: TimeLimit::Wall,
            }
        }
        _ => {}
    }

    let cpu_signal = match outcome.signal {
        Some(libc::SIGXCPU) => true,
        Some(libc::SIGKILL) => cpu_exhausted,
        _ => false,
    };
    if cpu_signal || (limits.cpu_seconds > 0 && outcome.cpu_time > cpu_limit) {
        return TerminationCause::Timeout {
            limit: TimeLimit::Cpu,
        };
    }

    if outcome.truncated || outcome.kill_reason == Some(KillReason::Output) {
        return TerminationCause::OutputTruncated;
    }

    if outcome.ended_abnormally() && outcome.near_memory_limit(limits) {
        return TerminationCause::Oom;
    }

    match outcome.signal {
        Some(signal) => TerminationCause::Signaled { signal },
        None => TerminationCause::Normal,
    }
}

/// Identity maps written right after entering a fresh user namespace so files
/// in the working directory keep their owner.
#[derive(Debug, Clone)]
struct IdMaps {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdMaps {
    fn current() -> Self {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        Self {
            uid_map: format!("{} {} 1\n", uid, uid).into_bytes(),
            gid_map: format!("{} {} 1\n", gid, gid).into_bytes(),
        }
    }

    fn write(&self) -> io::Result<()> {
        write_proc_file(c"/proc/self/setgroups", b"deny")?;
        write_proc_file(c"/proc/self/uid_map", &self.uid_map)?;
        write_proc_file(c"/proc/self/gid_map", &self.gid_map)
    }
}

fn write_proc_file(path: &CStr, data: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    let result = if written < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    result
}

fn enter_isolation(policy: IsolationPolicy, id_maps: &IdMaps) -> io::Result<()> {
    if policy == IsolationPolicy::Off {
        return Ok(());
    }
    let result = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
        .map_err(io::Error::from)
        .and_then(|_| id_maps.write())
        .and_then(|_| deny_sockets());
    match (result, policy) {
        (Err(e), IsolationPolicy::Strict) => Err(e),
        _ => Ok(()),
    }
}

#[cfg(feature = "seccomp")]
fn deny_sockets() -> io::Result<()> {
    use libseccomp::{error::SeccompError, ScmpAction, ScmpFilterContext, ScmpSyscall};

    let to_io = |e: SeccompError| io::Error::new(io::ErrorKind::Other, e.to_string());
    let mut filter = ScmpFilterContext::new_filter(ScmpAction::Allow).map_err(to_io)?;
    let socket = ScmpSyscall::from_name("socket").map_err(to_io)?;
    filter
        .add_rule(ScmpAction::Errno(libc::EACCES), socket)
        .map_err(to_io)?;
    filter.load().map_err(to_io)
}

#[cfg(not(feature = "seccomp"))]
fn deny_sockets() -> io::Result<()> {
    Ok(())
}

fn is_isolation_errno(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EPERM) | Some(libc::EINVAL) | Some(libc::EUSERS) | Some(libc::ENOSPC)
    )
}

fn kill_group(pid: i32) {
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to kill process group {}: {}", pid, e),
    }
}

/// Memory figures of a live process, in bytes.
#[derive(Debug, Default, Clone, Copy)]
struct MemoryUsage {
    resident: u64,
    peak_virtual: u64,
}

impl MemoryUsage {
    fn read(pid: i32) -> Option<Self> {
        let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        let kib = |value: &str| -> u64 {
            value
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0)
                .saturating_mul(1024)
        };
        let mut usage = Self::default();
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("VmRSS:") {
                usage.resident = kib(value);
            } else if let Some(value) = line.strip_prefix("VmPeak:") {
                usage.peak_virtual = kib(value);
            }
        }
        Some(usage)
    }
}

/// Ptrace state of the main sandboxed process.
///
/// The process asks to be traced before exec; the monitor then sees it stop
/// once more at exit, while its memory map is still readable.
#[derive(Debug, Default)]
struct Tracee {
    armed: bool,
    peak_virtual: u64,
}

impl Tracee {
    fn resume(&mut self, pid: i32, status: c_int) {
        let pid = Pid::from_raw(pid);
        let stop_signal = WSTOPSIG(status);
        let event = status >> 16;
        let forward = if event == libc::PTRACE_EVENT_EXIT {
            if let Some(usage) = MemoryUsage::read(pid.as_raw()) {
                self.peak_virtual = self.peak_virtual.max(usage.peak_virtual);
            }
            None
        } else if event != 0 {
            None
        } else if stop_signal == libc::SIGTRAP && !self.armed {
            self.armed = true;
            let options = ptrace::Options::PTRACE_O_TRACEEXIT
                | ptrace::Options::PTRACE_O_TRACEEXEC
                | ptrace::Options::PTRACE_O_EXITKILL;
            if let Err(e) = ptrace::setoptions(pid, options) {
                log::debug!("Failed to set ptrace options on {}: {}", pid, e);
            }
            None
        } else if matches!(
            stop_signal,
            libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
        ) {
            None
        } else {
            Signal::try_from(stop_signal).ok()
        };
        match ptrace::cont(pid, forward) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to resume traced process {}: {}", pid, e),
        }
    }
}

fn pipe_inode(stream: &impl AsRawFd) -> Option<u64> {
    fs::metadata(format!("/proc/self/fd/{}", stream.as_raw_fd()))
        .ok()
        .map(|meta| meta.ino())
}

fn holds_write_end(pid: &str, fd: &str) -> bool {
    let fdinfo = match fs::read_to_string(format!("/proc/{}/fdinfo/{}", pid, fd)) {
        Ok(fdinfo) => fdinfo,
        Err(_) => return false,
    };
    fdinfo
        .lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|flags| u32::from_str_radix(flags.trim(), 8).ok())
        .map_or(false, |flags| flags & libc::O_ACCMODE as u32 != libc::O_RDONLY as u32)
}

/// Kill every process still able to write into one of `inodes`.
///
/// Catches descendants that left the process group (`setsid`, `setpgid`)
/// and keep the output pipes open.
fn kill_pipe_writers(inodes: &[u64]) -> usize {
    let own_pid = std::process::id().to_string();
    let targets: Vec<String> = inodes.iter().map(|ino| format!("pipe:[{}]", ino)).collect();
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to list processes: {}", e);
            return 0;
        }
    };
    let mut killed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let pid = match name.parse::<i32>() {
            Ok(pid) if name != own_pid => pid,
            _ => continue,
        };
        let fds = match fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        let writes_output = fds.flatten().any(|fd| {
            let fd_name = fd.file_name().to_string_lossy().into_owned();
            fs::read_link(fd.path())
                .map(|link| targets.iter().any(|target| link.as_os_str() == target.as_str()))
                .unwrap_or(false)
                && holds_write_end(&name, &fd_name)
        });
        if writes_output {
            log::debug!("Killing process {} still holding sandbox output", pid);
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(Errno::ESRCH) => {}
                Err(e) => log::warn!("Failed to kill process {}: {}", pid, e),
            }
        }
    }
    killed
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}

/// One output stream of the sandboxed process, drained on its own thread.
struct StreamReader {
    name: &'static str,
    capture: SharedCapture,
    done: mpsc::Receiver<()>,
    finished: bool,
    pipe_inode: Option<u64>,
}

impl StreamReader {
    fn spawn(
        name: &'static str,
        stream: Option<impl io::Read + AsRawFd + Send + 'static>,
        cap: usize,
        overflow: Arc<AtomicBool>,
    ) -> Self {
        let (tx, done) = mpsc::channel();
        let capture = SharedCapture::default();
        let pipe_inode = stream.as_ref().and_then(pipe_inode);
        let finished = match stream {
            Some(stream) => {
                let capture = capture.clone();
                thread::spawn(move || {
                    read_bounded(stream, cap, &overflow, &capture);
                    let _ = tx.send(());
                });
                false
            }
            None => true,
        };
        Self {
            name,
            capture,
            done,
            finished,
            pipe_inode,
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> bool {
        if !self.finished {
            let timeout = deadline.saturating_duration_since(Instant::now());
            self.finished = !matches!(
                self.done.recv_timeout(timeout),
                Err(mpsc::RecvTimeoutError::Timeout)
            );
        }
        self.finished
    }

    /// Bytes read so far. A stream still open at this point is cut short
    /// and flagged as truncated.
    fn finish(self) -> CapturedStream {
        let mut captured = self.capture.snapshot();
        if !self.finished {
            log::warn!("Timed out draining {} of sandboxed process", self.name);
            captured.truncated = true;
        }
        captured
    }
}

/// Wait for both streams to reach EOF, killing whoever keeps them open past
/// the grace period.
fn drain(readers: &mut [StreamReader]) {
    let grace = Instant::now() + DRAIN_GRACE;
    if readers.iter_mut().all(|reader| reader.wait_until(grace)) {
        return;
    }
    let inodes: Vec<u64> = readers
        .iter()
        .filter(|reader| !reader.finished)
        .filter_map(|reader| reader.pipe_inode)
        .collect();
    let killed = kill_pipe_writers(&inodes);
    if killed > 0 {
        log::info!("Killed {} processes that escaped the sandbox group", killed);
    }
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    for reader in readers.iter_mut() {
        reader.wait_until(deadline);
    }
}

/// Runs commands inside a private working directory under resource limits.
///
/// One sandbox is created per job; every [`Sandbox::run`] spawns a fresh
/// process group, so invocations never share state.
#[derive(Debug, Clone)]
pub struct Sandbox {
    working_dir: PathBuf,
    isolation: IsolationPolicy,
    cancel: CancelFlag,
}

impl Sandbox {
    pub fn new(working_dir: &Path, isolation: IsolationPolicy, cancel: CancelFlag) -> Self {
        log::debug!(
            "Create sandbox in {:?} with isolation={:?}",
            working_dir,
            isolation
        );
        Self {
            working_dir: working_dir.to_path_buf(),
            isolation,
            cancel,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn command(&self, command: &[String]) -> Result<Command, GraderCoreError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GraderCoreError::InvalidJob("empty command line".to_string()))?;
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .env("PATH", path)
            .env("HOME", &self.working_dir)
            .env("TMPDIR", &self.working_dir)
            .env("LANG", "C.UTF-8")
            .env("LD_LIBRARY_PATH", &self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }

    fn spawn(
        &self,
        command: &[String],
        rlimit_configs: RlimitConfigs,
    ) -> Result<Child, GraderCoreError> {
        let mut cmd = self.command(command)?;
        let isolation = self.isolation;
        let id_maps = IdMaps::current();
        // Runs between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                setsid()?;
                rlimit_configs.load()?;
                // Exit-time memory figures are a bonus; run untraced if refused.
                let _ = ptrace::traceme();
                enter_isolation(isolation, &id_maps)
            });
        }
        cmd.spawn().map_err(|source| {
            if isolation == IsolationPolicy::Strict && is_isolation_errno(&source) {
                GraderCoreError::SandboxUnavailable(format!(
                    "cannot isolate `{}`: {}",
                    command[0], source
                ))
            } else {
                GraderCoreError::SpawnError {
                    program: command[0].clone(),
                    source,
                }
            }
        })
    }

    /// Run `command` with `stdin` fed to it and wait for it under `limits`.
    ///
    /// Student misbehaviour is described by the returned
    /// [`ExecutionResult::termination`]; `Err` means the invocation itself could
    /// not be carried out or was cancelled.
    pub fn run(
        &self,
        command: &[String],
        stdin: &[u8],
        limits: &ResourceLimits,
        limit_address_space: bool,
    ) -> Result<ExecutionResult, GraderCoreError> {
        if self.cancel.is_cancelled() {
            return Err(GraderCoreError::Cancelled);
        }

        let mut rlimit_configs = RlimitConfigs::from_limits(limits, limit_address_space);
        // Address space is reserved generously; resident memory is watched below.
        if let Some((soft, hard)) = rlimit_configs.as_limit {
            rlimit_configs.as_limit = Some((soft.saturating_mul(2), hard.saturating_mul(2)));
        }
        log::debug!("Spawning {:?} with {:?}", command, rlimit_configs);

        let start = Instant::now();
        let mut child = self.spawn(command, rlimit_configs)?;
        let pid = child.id() as i32;

        if let Some(child_stdin) = child.stdin.take() {
            if !stdin.is_empty() {
                let input = stdin.to_vec();
                thread::spawn(move || write_all_and_close(child_stdin, &input));
            }
        }

        let cap = match limits.output_bytes {
            0 => usize::MAX,
            bytes => usize::try_from(bytes).unwrap_or(usize::MAX),
        };
        let overflow = Arc::new(AtomicBool::new(false));
        let mut readers = [
            StreamReader::spawn("stdout", child.stdout.take(), cap, overflow.clone()),
            StreamReader::spawn("stderr", child.stderr.take(), cap, overflow.clone()),
        ];

        let wall_seconds = match limits.wall_seconds {
            0 => ResourceLimits::default().wall_seconds,
            seconds => seconds,
        };
        let deadline = start + Duration::from_secs(wall_seconds);
        let mut tracee = Tracee::default();
        let mut peak_rss = 0u64;
        let mut kill_reason = None;

        let (status, usage) = loop {
            let mut status: c_int = 0;
            let mut usage: rusage = unsafe { std::mem::zeroed() };
            let ret = unsafe { wait4(pid, &mut status, WNOHANG, &mut usage) };
            if ret == pid {
                if WIFSTOPPED(status) {
                    tracee.resume(pid, status);
                    continue;
                }
                break (status, usage);
            }
            if ret < 0 {
                let errno = Errno::last();
                if errno != Errno::EINTR {
                    kill_group(pid);
                    return Err(GraderCoreError::NixErrno(errno));
                }
            }

            if kill_reason.is_none() {
                if let Some(usage) = MemoryUsage::read(pid) {
                    peak_rss = peak_rss.max(usage.resident);
                    tracee.peak_virtual = tracee.peak_virtual.max(usage.peak_virtual);
                }
                kill_reason = if self.cancel.is_cancelled() {
                    Some(KillReason::Cancelled)
                } else if Instant::now() >= deadline {
                    Some(KillReason::WallTime)
                } else if limits.memory_bytes > 0 && peak_rss > limits.memory_bytes {
                    Some(KillReason::Memory)
                } else if overflow.load(Ordering::SeqCst) {
                    Some(KillReason::Output)
                } else {
                    None
                };
                if let Some(reason) = kill_reason {
                    log::debug!("Killing process group {} for {:?}", pid, reason);
                    kill_group(pid);
                }
            }
            thread::sleep(POLL_INTERVAL);
        };
        let wall_time = start.elapsed();
        // Sweep children left behind by the main process.
        kill_group(pid);

        drain(&mut readers);
        let [stdout, stderr] = readers.map(StreamReader::finish);

        if kill_reason == Some(KillReason::Cancelled) {
            log::info!("Sandboxed process {} cancelled", pid);
            return Err(GraderCoreError::Cancelled);
        }

        let (exit_code, signal) = RawOutcome::from_wait_status(status);
        let outcome = RawOutcome {
            exit_code,
            signal,
            cpu_time: timeval_duration(usage.ru_utime) + timeval_duration(usage.ru_stime),
            peak_memory_bytes: peak_rss.max((usage.ru_maxrss.max(0) as u64) * 1024),
            peak_virtual_bytes: tracee.peak_virtual,
            address_space_limit: rlimit_configs.as_limit.map(|(soft, _)| soft),
            kill_reason,
            truncated: stdout.truncated || stderr.truncated,
        };
        let termination = classify(&outcome, limits);
        log::debug!(
            "Process {} finished: {:?} -> {:?} in {:?}",
            pid,
            outcome,
            termination,
            wall_time
        );

        Ok(ExecutionResult {
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            wall_time,
            cpu_time: outcome.cpu_time,
            peak_memory_bytes: outcome.peak_memory_bytes,
            termination,
        })
    }
}
