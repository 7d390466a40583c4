//! Hub daemon management — PID file, spawn, stop, status.
//!
//! `homelink start` re-executes the current binary with the `run`
//! subcommand as a detached child, appends its output to
//! `<app_dir>/logs/homelink.log`, and records the child in
//! `<app_dir>/homelink.pid`. `stop` terminates that PID with a
//! graceful-then-forced escalation; `status` reports whether the recorded
//! PID is still alive. Process inspection goes through `sysinfo` so the
//! same code serves macOS, Linux, and Windows.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

/// How long `stop` waits for a graceful exit before forcing a kill.
const STOP_GRACE: Duration = Duration::from_secs(2);

// ── PID file ────────────────────────────────────────────────────────────────

/// The hub's PID file at `<app_dir>/homelink.pid`.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn in_dir(app_dir: &Path) -> Self {
        Self {
            path: app_dir.join("homelink.pid"),
        }
    }

    /// The recorded PID, if the file exists and parses.
    pub fn read(&self) -> Option<u32> {
        let raw = fs::read_to_string(&self.path).ok()?;
        raw.trim().parse().ok()
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, pid.to_string())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Hub log file at `<app_dir>/logs/homelink.log`.
pub fn log_path(app_dir: &Path) -> PathBuf {
    app_dir.join("logs").join("homelink.log")
}

// ── Process inspection ──────────────────────────────────────────────────────

/// Whether a process with this PID currently exists.
pub fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    refresh_one(&mut sys, pid);
    sys.process(Pid::from_u32(pid)).is_some()
}

fn refresh_one(sys: &mut System, pid: u32) {
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
}

// ── Status ──────────────────────────────────────────────────────────────────

/// Status of the hub daemon.
#[derive(Debug, Clone)]
pub enum DaemonStatus {
    Running { pid: u32 },
    /// PID file exists but no such process.
    Stale { pid: u32 },
    /// No PID file — not running.
    Stopped,
}

pub fn status(app_dir: &Path) -> DaemonStatus {
    match PidFile::in_dir(app_dir).read() {
        None => DaemonStatus::Stopped,
        Some(pid) if process_alive(pid) => DaemonStatus::Running { pid },
        Some(pid) => DaemonStatus::Stale { pid },
    }
}

// ── Start ───────────────────────────────────────────────────────────────────

/// Spawn `homelink run` as a detached background process and record its
/// PID.
pub fn start(app_dir: &Path, model_api_key: Option<&str>) -> Result<u32> {
    let pid_file = PidFile::in_dir(app_dir);
    if let DaemonStatus::Running { pid } = status(app_dir) {
        bail!("hub is already running (PID {pid})");
    }
    pid_file.clear();

    let mut cmd = relaunch_command(app_dir)?;
    // The model API key travels by environment so the daemon never needs a
    // credentials store.
    if let Some(key) = model_api_key {
        cmd.env(crate::agent::API_KEY_ENV, key);
    }
    detach(&mut cmd);

    let child = cmd.spawn().context("failed to spawn the hub process")?;
    let pid = child.id();
    pid_file.write(pid)?;
    Ok(pid)
}

/// Build the `homelink run --app-dir <dir>` re-exec with stdout/stderr
/// appended to the hub log.
fn relaunch_command(app_dir: &Path) -> Result<Command> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;

    let log = log_path(app_dir);
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent)?;
    }
    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .with_context(|| format!("failed to open hub log at {}", log.display()))?;
    let stderr = stdout.try_clone().context("failed to clone log handle")?;

    let mut cmd = Command::new(exe);
    cmd.arg("run")
        .arg("--app-dir")
        .arg(app_dir)
        .stdout(stdout)
        .stderr(stderr);
    Ok(cmd)
}

// ── Stop ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StopResult {
    Stopped { pid: u32 },
    WasStale { pid: u32 },
    WasNotRunning,
}

/// Stop the running hub: ask politely, escalate to a hard kill if it
/// ignores the request past [`STOP_GRACE`].
pub fn stop(app_dir: &Path) -> Result<StopResult> {
    let pid_file = PidFile::in_dir(app_dir);
    match status(app_dir) {
        DaemonStatus::Stopped => Ok(StopResult::WasNotRunning),
        DaemonStatus::Stale { pid } => {
            pid_file.clear();
            Ok(StopResult::WasStale { pid })
        }
        DaemonStatus::Running { pid } => {
            terminate(pid);
            pid_file.clear();
            Ok(StopResult::Stopped { pid })
        }
    }
}

/// Graceful-then-forced termination: SIGTERM where the platform has it,
/// and a hard kill once the grace period lapses (immediately on platforms
/// that cannot deliver a termination signal).
fn terminate(pid: u32) {
    let sys_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    refresh_one(&mut sys, pid);
    let Some(process) = sys.process(sys_pid) else {
        return;
    };

    let asked_nicely = process.kill_with(Signal::Term) == Some(true);
    let deadline = Instant::now() + STOP_GRACE;
    while asked_nicely && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
        refresh_one(&mut sys, pid);
        if sys.process(sys_pid).is_none() {
            return;
        }
    }

    refresh_one(&mut sys, pid);
    if let Some(process) = sys.process(sys_pid) {
        process.kill();
    }
}

// ── Detach ──────────────────────────────────────────────────────────────────

/// Put a child in its own process group (and off the console on Windows)
/// so terminal signals and group-level termination don't cross the
/// parent/child boundary. Shared by the daemon spawn and the plugin
/// supervisor's channel subprocesses.
pub(crate) fn detach(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = cmd;
    }
}
