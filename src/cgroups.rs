use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::unistd::Pid;

use crate::config::Resources;
use crate::error::{Error, Result};

const CGROUP_PATH: &str = "/sys/fs/cgroup/";
/// Overrides the cgroup v2 mount point.
pub const CGROUP_ROOT_ENV: &str = "MUN_OS_CGROUP_ROOT";
/// All container groups live below this node.
const PARENT_GROUP: &str = "mun-os";

const REMOVE_ATTEMPTS: u32 = 6;
const REMOVE_BACKOFF: Duration = Duration::from_millis(20);

/// A dedicated cgroup v2 node for one container.
///
/// Removal is explicit: a background container's group has to outlive the
/// invocation that created it.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

/// Mount point of the unified hierarchy.
pub fn cgroup_root() -> PathBuf {
    std::env::var_os(CGROUP_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CGROUP_PATH))
}

/// Path of the group `create` makes for `name`.
pub fn group_path(name: &str) -> PathBuf {
    cgroup_root().join(PARENT_GROUP).join(name)
}

impl Cgroup {
    /// Creates the group for `name` and writes the requested limits.
    pub fn create(name: &str, resources: &Resources) -> Result<Self> {
        Self::create_in(&cgroup_root(), name, resources)
    }

    pub fn create_in(root: &Path, name: &str, resources: &Resources) -> Result<Self> {
        let parent = root.join(PARENT_GROUP);
        ensure_parent_cgroup(root, &parent, resources)?;

        let path = parent.join(name);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // leftover of a container that died without cleanup; a group
                // that still has members cannot be removed
                fs::remove_dir(&path).map_err(|e| {
                    Error::resource(format!("cgroup {} is in use: {}", path.display(), e))
                })?;
                fs::create_dir(&path).map_err(|e| {
                    Error::resource(format!("failed to create cgroup {}: {}", path.display(), e))
                })?;
            }
            Err(e) => {
                return Err(Error::resource(format!(
                    "failed to create cgroup {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        tracing::debug!(path = %path.display(), "cgroup created");

        let cgroup = Cgroup { path };
        if let Err(e) = cgroup.apply(resources) {
            let _ = cgroup.remove();
            return Err(e);
        }
        Ok(cgroup)
    }

    /// Handle to an existing group, as recorded in the state store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Cgroup { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply(&self, resources: &Resources) -> Result<()> {
        if let Some(mb) = resources.memory_limit_mb {
            self.set_memory_limit(mb)?;
        }
        if let Some(pids) = resources.pids_limit {
            self.set_pids_limit(pids)?;
        }
        Ok(())
    }

    /// Sets `memory.max` to `mb` mebibytes and disables swap for the group.
    pub fn set_memory_limit(&self, mb: u64) -> Result<()> {
        let bytes = mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| Error::resource(format!("memory limit {}MB is too large", mb)))?;
        self.write("memory.max", &bytes.to_string())?;

        // without this the kernel pages out instead of enforcing the ceiling
        let swap_max = self.path.join("memory.swap.max");
        if swap_max.exists() {
            self.write("memory.swap.max", "0")?;
        }
        Ok(())
    }

    /// Sets `pids.max`.
    pub fn set_pids_limit(&self, pids: u64) -> Result<()> {
        self.write("pids.max", &pids.to_string())
    }

    /// Adds a process to this cgroup.
    pub fn add_process(&self, pid: Pid) -> Result<()> {
        self.write("cgroup.procs", &pid.as_raw().to_string())
            .map_err(|e| Error::resource(format!("failed to add process {} to cgroup: {}", pid, e)))
    }

    /// Removes the group, retrying while the kernel still reports members.
    pub fn remove(&self) -> Result<()> {
        let mut delay = REMOVE_BACKOFF;
        for attempt in 1..=REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    tracing::debug!(path = %self.path.display(), "cgroup removed");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    tracing::debug!(path = %self.path.display(), attempt, "cgroup busy, retrying");
                    if attempt < REMOVE_ATTEMPTS {
                        thread::sleep(delay);
                        delay *= 2;
                    }
                }
                Err(e) => {
                    return Err(Error::resource(format!(
                        "failed to remove cgroup {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        }
        Err(Error::resource(format!(
            "cgroup {} still has member processes after {} attempts",
            self.path.display(),
            REMOVE_ATTEMPTS
        )))
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        let target = self.path.join(file);
        fs::write(&target, value)
            .map_err(|e| Error::resource(format!("failed to write {:?}: {}", target, e)))
    }
}

/// Ensures the parent group exists and delegates the needed controllers to it.
fn ensure_parent_cgroup(root: &Path, parent: &Path, resources: &Resources) -> Result<()> {
    fs::create_dir_all(parent).map_err(|e| {
        Error::resource(format!("failed to create cgroup {}: {}", parent.display(), e))
    })?;

    let mut controllers = Vec::new();
    if resources.memory_limit_mb.is_some() {
        controllers.push("+memory");
    }
    if resources.pids_limit.is_some() {
        controllers.push("+pids");
    }
    if controllers.is_empty() {
        return Ok(());
    }
    let controllers = controllers.join(" ");

    // already-enabled controllers and read-only roots are not fatal here; a
    // missing controller shows up when the limit file is written
    for subtree_control in [
        root.join("cgroup.subtree_control"),
        parent.join("cgroup.subtree_control"),
    ] {
        if let Err(e) = fs::write(&subtree_control, &controllers) {
            tracing::debug!(path = %subtree_control.display(), error = %e, "cannot enable controllers");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(memory: Option<u64>, pids: Option<u64>) -> Resources {
        Resources {
            memory_limit_mb: memory,
            pids_limit: pids,
        }
    }

    #[test]
    fn test_create_writes_limits() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::create_in(root.path(), "web", &limits(Some(20), Some(10))).unwrap();

        assert_eq!(cgroup.path(), root.path().join("mun-os/web"));
        assert_eq!(
            fs::read_to_string(cgroup.path().join("memory.max")).unwrap(),
            "20971520"
        );
        assert_eq!(fs::read_to_string(cgroup.path().join("pids.max")).unwrap(), "10");
        assert!(!cgroup.path().join("memory.swap.max").exists());
        assert_eq!(
            fs::read_to_string(root.path().join("mun-os/cgroup.subtree_control")).unwrap(),
            "+memory +pids"
        );
    }

    #[test]
    fn test_create_without_limits() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::create_in(root.path(), "plain", &Resources::default()).unwrap();
        assert!(cgroup.path().is_dir());
        assert!(!cgroup.path().join("memory.max").exists());
        assert!(!root.path().join("mun-os/cgroup.subtree_control").exists());
    }

    #[test]
    fn test_create_replaces_empty_leftover() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("mun-os/web")).unwrap();
        assert!(Cgroup::create_in(root.path(), "web", &Resources::default()).is_ok());
    }

    #[test]
    fn test_create_refuses_group_in_use() {
        let root = tempfile::tempdir().unwrap();
        let busy = root.path().join("mun-os/web");
        fs::create_dir_all(&busy).unwrap();
        fs::write(busy.join("cgroup.procs"), "42").unwrap();

        let err = Cgroup::create_in(root.path(), "web", &Resources::default()).unwrap_err();
        assert!(matches!(err, Error::ResourceLimit(_)));
    }

    #[test]
    fn test_add_process() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::create_in(root.path(), "web", &Resources::default()).unwrap();
        cgroup.add_process(Pid::from_raw(4242)).unwrap();
        assert_eq!(
            fs::read_to_string(cgroup.path().join("cgroup.procs")).unwrap(),
            "4242"
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::create_in(root.path(), "web", &Resources::default()).unwrap();
        cgroup.remove().unwrap();
        assert!(!cgroup.path().exists());
        cgroup.remove().unwrap();
        Cgroup::open(root.path().join("never-created")).remove().unwrap();
    }

    #[test]
    fn test_group_path_under_parent() {
        assert!(group_path("web").ends_with("mun-os/web"));
    }

    #[test]
    fn test_memory_limit_overflow() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::create_in(root.path(), "web", &Resources::default()).unwrap();
        assert!(cgroup.set_memory_limit(u64::MAX).is_err());
    }
}
