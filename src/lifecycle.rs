//! Container lifecycle: `run`, `start`, `stop`, `list` and friends.
//!
//! Each invocation is its own process; the state store is the only thing
//! shared between them. A background container moves through
//! `starting -> running -> stopping` and its record is deleted once the
//! process is confirmed dead.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};

use crate::cgroups::{self, Cgroup};
use crate::config::{self, CliOverrides, ContainerSpec, EnvOverrides, FileConfig};
use crate::container::{self, Sandbox};
use crate::error::{Error, LifecycleError, Result};
use crate::state::{self, ContainerRecord, ContainerStatus, StateStore};

/// Upper bound for a container to reach exec after it was cloned.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What `list` reports for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Live(ContainerStatus),
    /// The recorded process no longer exists.
    Stale,
}

impl fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportedStatus::Live(status) => fmt::Display::fmt(status, f),
            ReportedStatus::Stale => f.write_str("stale"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub record: ContainerRecord,
    pub status: ReportedStatus,
}

pub struct LifecycleManager {
    store: StateStore,
}

impl LifecycleManager {
    pub fn new(store: StateStore) -> Self {
        LifecycleManager { store }
    }

    /// Runs a container in the foreground and returns the workload's exit code.
    pub fn run(&self, spec: &ContainerSpec) -> Result<i32> {
        preflight(spec)?;

        let name = format!("run-{}", std::process::id());
        let cgroup = Cgroup::create(&name, &spec.resources)?;
        let result = run_attached(spec, &cgroup);
        if let Err(e) = cgroup.remove() {
            // the workload's status is still the answer to this invocation
            tracing::warn!(error = %e, "failed to clean up cgroup");
        }
        result
    }

    /// Starts a container in the background and records it under `name`.
    pub fn start(
        &self,
        spec: &ContainerSpec,
        name: &str,
        config_path: Option<&Path>,
    ) -> Result<ContainerRecord> {
        state::validate_name(name)?;
        if self.store.contains(name) {
            return Err(LifecycleError::DuplicateName(name.to_string()).into());
        }
        preflight(spec)?;

        // the record owns the name before any cgroup is touched
        let mut record = self.reserve(spec, name, config_path)?;
        let started = Cgroup::create(name, &spec.resources).and_then(|cgroup| {
            self.launch(spec, &mut record, &cgroup).inspect_err(|_| {
                if let Err(e) = cgroup.remove() {
                    tracing::warn!(name, error = %e, "failed to clean up cgroup");
                }
            })
        });
        if let Err(e) = started {
            if let Err(e) = self.store.delete(name) {
                tracing::warn!(name, error = %e, "failed to delete record");
            }
            return Err(e);
        }

        tracing::info!(name, pid = record.pid, "container started");
        Ok(record)
    }

    /// Claims `name` with a `starting` record that has no process yet.
    fn reserve(
        &self,
        spec: &ContainerSpec,
        name: &str,
        config_path: Option<&Path>,
    ) -> Result<ContainerRecord> {
        let record = ContainerRecord {
            name: name.to_string(),
            pid: 0,
            start_time: 0,
            cgroup_path: cgroups::group_path(name),
            created_at: Utc::now(),
            status: ContainerStatus::Starting,
            hostname: spec.hostname.clone(),
            config_path: config_path.map(Path::to_path_buf),
        };
        self.store.create(&record)?;
        Ok(record)
    }

    fn launch(
        &self,
        spec: &ContainerSpec,
        record: &mut ContainerRecord,
        cgroup: &Cgroup,
    ) -> Result<()> {
        let mut sandbox = container::spawn(spec, true)?;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let result = self.confirm(&mut sandbox, record, cgroup, deadline);
        if result.is_err() {
            sandbox.abort();
        }
        result
    }

    /// Records the cloned process and waits until it has exec'd.
    fn confirm(
        &self,
        sandbox: &mut Sandbox,
        record: &mut ContainerRecord,
        cgroup: &Cgroup,
        deadline: Instant,
    ) -> Result<()> {
        record.pid = sandbox.pid().as_raw();
        record.start_time = process_start_time(sandbox.pid())
            .ok_or_else(|| Error::sandbox("container process exited before setup"))?;
        record.cgroup_path = cgroup.path().to_path_buf();
        self.store.update(record)?;

        release(sandbox, cgroup)?;
        sandbox.wait_ready(deadline)?;
        sandbox.wait_exec(deadline)?;

        record.status = ContainerStatus::Running;
        self.store.update(record)
    }

    /// Terminates a background container and removes its state.
    pub fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let mut record = self
            .store
            .read(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if container_alive(&record) {
            record.status = ContainerStatus::Stopping;
            self.store.update(&record)?;
            terminate(name, Pid::from_raw(record.pid), record.start_time, grace)?;
        } else {
            tracing::info!(name, pid = record.pid, "process already gone, reclaiming record");
        }

        Cgroup::open(&record.cgroup_path).remove()?;
        self.store.delete(name)?;
        tracing::info!(name, "container stopped");
        Ok(())
    }

    /// Every recorded container with a liveness verdict. Never blocks on a
    /// container process.
    pub fn list(&self) -> Result<Vec<ListEntry>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|record| ListEntry {
                status: reported_status(&record),
                record,
            })
            .collect())
    }

    /// Stops a container if needed and starts it again from its config file.
    pub fn restart(&self, name: &str, env: &EnvOverrides, grace: Duration) -> Result<ContainerRecord> {
        let record = self
            .store
            .read(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        let config_path: PathBuf = record.config_path.ok_or_else(|| {
            Error::config(format!("container '{}' was not started from a config file", name))
        })?;

        // validate before tearing down the running container
        let file = FileConfig::load(&config_path)?;
        let spec = config::resolve(&CliOverrides::default(), env, Some(&file))?;

        self.stop(name, grace)?;
        self.start(&spec, name, Some(&config_path))
    }

    /// Deletes the record and cgroup of a container that is no longer running.
    pub fn remove(&self, name: &str) -> Result<()> {
        let record = self
            .store
            .read(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if container_alive(&record) {
            return Err(LifecycleError::InvalidState {
                name: name.to_string(),
                state: "still running, stop it first".into(),
            }
            .into());
        }
        Cgroup::open(&record.cgroup_path).remove()?;
        self.store.delete(name)?;
        Ok(())
    }

    /// Runs an extra command inside a running container.
    pub fn exec(&self, name: &str, command: &str, args: &[String]) -> Result<i32> {
        let record = self
            .store
            .read(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if !container_alive(&record) {
            return Err(LifecycleError::InvalidState {
                name: name.to_string(),
                state: "not running".into(),
            }
            .into());
        }
        container::check_privileges()?;
        container::exec_in(
            Pid::from_raw(record.pid),
            &Cgroup::open(&record.cgroup_path),
            command,
            args,
        )
    }
}

fn preflight(spec: &ContainerSpec) -> Result<()> {
    if !spec.rootfs_path.is_dir() {
        return Err(Error::config(format!(
            "rootfs does not exist: {}",
            spec.rootfs_path.display()
        )));
    }
    container::check_privileges()
}

/// Puts the child in its cgroup, then lets it continue.
fn release(sandbox: &mut Sandbox, cgroup: &Cgroup) -> Result<()> {
    cgroup.add_process(sandbox.pid())?;
    sandbox.release()
}

fn run_attached(spec: &ContainerSpec, cgroup: &Cgroup) -> Result<i32> {
    let mut sandbox = container::spawn(spec, false)?;
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let started = release(&mut sandbox, cgroup)
        .and_then(|_| sandbox.wait_ready(deadline))
        .and_then(|_| sandbox.wait_exec(deadline));
    if let Err(e) = started {
        sandbox.abort();
        return Err(e);
    }

    let code = sandbox.wait()?;
    tracing::debug!(pid = sandbox.pid().as_raw(), code, "workload exited");
    Ok(code)
}

/// SIGTERM, wait `grace`, then SIGKILL.
///
/// The pid is init of its pid namespace, which only receives SIGTERM when the
/// workload installed a handler; other workloads always run into SIGKILL.
fn terminate(name: &str, pid: Pid, start_time: u64, grace: Duration) -> Result<()> {
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => return Err(Error::sandbox(format!("failed to signal pid {}: {}", pid, e))),
    }
    if wait_until_gone(pid, start_time, grace) {
        return Ok(());
    }

    tracing::warn!(name, pid = pid.as_raw(), "grace period elapsed, sending SIGKILL");
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(Error::sandbox(format!("failed to kill pid {}: {}", pid, e))),
    }
    if wait_until_gone(pid, start_time, KILL_TIMEOUT) {
        return Ok(());
    }
    Err(LifecycleError::Timeout(format!(
        "container '{}' (pid {}) is still alive after SIGKILL",
        name, pid
    ))
    .into())
}

fn wait_until_gone(pid: Pid, start_time: u64, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process_alive(pid, start_time) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn reported_status(record: &ContainerRecord) -> ReportedStatus {
    if container_alive(record) {
        ReportedStatus::Live(record.status)
    } else if record.pid == 0 && record.status == ContainerStatus::Starting {
        // name reserved, process not cloned yet
        ReportedStatus::Live(ContainerStatus::Starting)
    } else {
        ReportedStatus::Stale
    }
}

/// Whether the recorded process still runs. A pid that now belongs to
/// another process counts as gone.
fn container_alive(record: &ContainerRecord) -> bool {
    process_alive(Pid::from_raw(record.pid), record.start_time)
}

/// Non-blocking liveness probe for the process `pid` that started at
/// `start_time`. Zombies count as dead.
fn process_alive(pid: Pid, start_time: u64) -> bool {
    if pid.as_raw() <= 0 {
        return false;
    }
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    match read_stat(pid) {
        Some(stat) => !matches!(stat.state, 'Z' | 'X') && stat.start_time == start_time,
        None => false,
    }
}

/// Start time of `pid` in clock ticks since boot.
fn process_start_time(pid: Pid) -> Option<u64> {
    read_stat(pid).map(|stat| stat.start_time)
}

#[derive(Debug, PartialEq, Eq)]
struct ProcStat {
    state: char,
    start_time: u64,
}

fn read_stat(pid: Pid) -> Option<ProcStat> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&stat)
}

/// Parses the contents of `/proc/<pid>/stat`.
fn parse_stat(stat: &str) -> Option<ProcStat> {
    // the command name may itself contain ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // state is field 3, starttime field 22
    let state = fields.next()?.chars().next()?;
    let start_time = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}
