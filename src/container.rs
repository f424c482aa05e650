//! The isolated container process.
//!
//! The child is cloned into new UTS, mount and pid namespaces and then
//! blocks on a "go" pipe until the parent has placed it in its cgroup. It
//! reports progress on a close-on-exec status pipe:
//!
//! | bytes              | meaning                                  |
//! |--------------------|------------------------------------------|
//! | `F` message        | setup failed, nothing was executed       |
//! | `R`                | ready, about to exec the target          |
//! | `X` code message   | exec failed, child exits with `code`     |
//! | EOF after `R`      | exec succeeded                           |

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use caps::{CapSet, Capability};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sched::{CloneFlags, clone, setns},
    sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, kill, signal, sigprocmask},
    unistd::{ForkResult, Pid, chdir, execvp, fork, getpid, pipe2, sethostname, setsid},
};

use crate::cgroups::Cgroup;
use crate::config::ContainerSpec;
use crate::error::{EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND, EXIT_RUNTIME_FAILURE, Error, LifecycleError, Result};
use crate::fs;

const STACK_SIZE: usize = 1024 * 1024;

const STATUS_FAILED: u8 = b'F';
const STATUS_READY: u8 = b'R';
const STATUS_EXEC_FAILED: u8 = b'X';
const GO: u8 = b'G';

/// Capability needed to create namespaces and mount filesystems.
const REQUIRED_CAPABILITY: &str = "CAP_SYS_ADMIN";

/// Fails with a permission error unless the runtime may create namespaces.
pub fn check_privileges() -> Result<()> {
    match caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::Permission {
            capability: REQUIRED_CAPABILITY,
            message: "creating namespaces requires root privileges".into(),
        }),
        Err(e) => Err(Error::Permission {
            capability: REQUIRED_CAPABILITY,
            message: format!("cannot read process capabilities: {}", e),
        }),
    }
}

/// Everything the child needs, prepared before cloning.
struct ChildSetup {
    hostname: String,
    rootfs: PathBuf,
    command: CString,
    argv: Vec<CString>,
    /// Replacement for stdin/stdout/stderr of a detached container.
    detached_stdio: Option<File>,
}

/// A cloned container process that has not been waited for.
pub struct Sandbox {
    pid: Pid,
    go: Option<File>,
    handshake: Handshake,
}

/// Spawns the container process. It stays blocked until [`Sandbox::release`].
///
/// With `detach` the process starts its own session and its standard streams
/// point at `/dev/null`, so it outlives the invoking terminal.
pub fn spawn(spec: &ContainerSpec, detach: bool) -> Result<Sandbox> {
    let (command, argv) = build_argv(&spec.command, &spec.args)?;
    let detached_stdio = if detach {
        let null = File::options()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(|e| Error::sandbox(format!("failed to open /dev/null: {}", e)))?;
        Some(null)
    } else {
        None
    };
    let setup = ChildSetup {
        hostname: spec.hostname.clone(),
        rootfs: spec.rootfs_path.clone(),
        command,
        argv,
        detached_stdio,
    };

    let (go_read, go_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::sandbox(format!("pipe: {}", e)))?;
    let (status_read, status_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::sandbox(format!("pipe: {}", e)))?;
    let go_read_raw = go_read.as_raw_fd();
    let go_write_raw = go_write.as_raw_fd();
    let status_read_raw = status_read.as_raw_fd();
    let status_write_raw = status_write.as_raw_fd();

    let clone_flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWNS;
    // allocate stack for the child process
    let mut stack = vec![0u8; STACK_SIZE];

    let child_fn = Box::new(move || {
        // SAFETY: closes the parent's ends of the pipes in the child's copy of
        // the descriptor table
        unsafe {
            libc::close(go_write_raw);
            libc::close(status_read_raw);
        }
        child(&setup, go_read_raw, status_write_raw) as isize
    });

    let child_pid = unsafe {
        clone(
            child_fn,
            &mut stack,
            clone_flags,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| match e {
        Errno::EPERM => Error::Permission {
            capability: REQUIRED_CAPABILITY,
            message: "clone into new namespaces was refused".into(),
        },
        e => Error::sandbox(format!("failed to clone process: {}", e)),
    })?;

    drop(go_read);
    drop(status_write);
    tracing::debug!(pid = child_pid.as_raw(), hostname = %spec.hostname, "container process cloned");

    Ok(Sandbox {
        pid: child_pid,
        go: Some(File::from(go_write)),
        handshake: Handshake {
            status: File::from(status_read),
        },
    })
}

impl Sandbox {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Lets the child proceed with its setup.
    pub fn release(&mut self) -> Result<()> {
        if let Some(mut go) = self.go.take() {
            go.write_all(&[GO])
                .map_err(|e| Error::sandbox(format!("container process went away: {}", e)))?;
        }
        Ok(())
    }

    /// Waits until the child has entered its namespaces and root filesystem.
    pub fn wait_ready(&mut self, deadline: Instant) -> Result<()> {
        self.handshake.wait_ready(deadline)
    }

    /// Waits until the child has replaced itself with the target command.
    pub fn wait_exec(&mut self, deadline: Instant) -> Result<()> {
        self.handshake.wait_exec(deadline)
    }

    /// Blocks until the process exits and returns its exit code.
    pub fn wait(&self) -> Result<i32> {
        wait_for_child(self.pid)
    }

    /// Kills and reaps a container that failed to start.
    pub fn abort(&mut self) {
        self.go.take();
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = wait_for_child(self.pid);
    }
}

/// Reader side of the status pipe.
struct Handshake {
    status: File,
}

impl Handshake {
    fn wait_ready(&mut self, deadline: Instant) -> Result<()> {
        match self.read_byte(deadline)? {
            Some(STATUS_READY) => Ok(()),
            Some(STATUS_FAILED) => Err(Error::sandbox(self.read_message(deadline)?)),
            Some(other) => Err(Error::sandbox(format!(
                "unexpected handshake byte {:#04x}",
                other
            ))),
            None => Err(Error::sandbox("container process exited during setup")),
        }
    }

    fn wait_exec(&mut self, deadline: Instant) -> Result<()> {
        match self.read_byte(deadline)? {
            None => Ok(()),
            Some(STATUS_EXEC_FAILED) => {
                let code = self.read_byte(deadline)?.unwrap_or(EXIT_NOT_EXECUTABLE);
                Err(Error::Sandbox {
                    message: self.read_message(deadline)?,
                    exit_code: Some(code),
                })
            }
            Some(other) => Err(Error::sandbox(format!(
                "unexpected handshake byte {:#04x}",
                other
            ))),
        }
    }

    fn read_message(&mut self, deadline: Instant) -> Result<String> {
        let mut message = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            match self.read(&mut buf, deadline)? {
                0 => break,
                n => message.extend_from_slice(&buf[..n]),
            }
        }
        Ok(String::from_utf8_lossy(&message).into_owned())
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.read(&mut buf, deadline)? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }

    /// Reads from the status pipe, giving up at `deadline`.
    fn read(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LifecycleError::Timeout(
                    "container did not finish its startup handshake".into(),
                )
                .into());
            }
            let millis = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
            let polled = {
                let mut fds = [PollFd::new(self.status.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::from(millis))
            };
            match polled {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => return Err(Error::sandbox(format!("poll: {}", e))),
            }
            match self.status.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::sandbox(format!("handshake read: {}", e))),
            }
        }
    }
}

/// Runs in the cloned process. Returns only on failure.
fn child(setup: &ChildSetup, go: RawFd, status: RawFd) -> i32 {
    let mut byte = [0u8; 1];
    // SAFETY: `go` is this process's copy of the pipe's read end
    let n = unsafe { libc::read(go, byte.as_mut_ptr().cast(), 1) };
    unsafe { libc::close(go) };
    if n != 1 {
        // the parent gave up before attaching us to the cgroup
        return i32::from(EXIT_RUNTIME_FAILURE);
    }

    if let Err(e) = prepare(setup) {
        report(status, &[STATUS_FAILED], &format!("{:#}", e));
        return i32::from(EXIT_RUNTIME_FAILURE);
    }
    report(status, &[STATUS_READY], "");

    // execvp replaces the current process, so this only returns on error
    let err = match execvp(&setup.command, &setup.argv) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    let code = if err == Errno::ENOENT {
        EXIT_NOT_FOUND
    } else {
        EXIT_NOT_EXECUTABLE
    };
    report(
        status,
        &[STATUS_EXEC_FAILED, code],
        &format!("cannot execute {:?}: {}", setup.command, err),
    );
    i32::from(code)
}

fn prepare(setup: &ChildSetup) -> anyhow::Result<()> {
    reset_signals().context("reset signal dispositions")?;
    if let Some(null) = &setup.detached_stdio {
        setsid().context("setsid")?;
        for target in 0..=2 {
            // SAFETY: dup2 onto the standard descriptors of this process
            if unsafe { libc::dup2(null.as_raw_fd(), target) } < 0 {
                return Err(std::io::Error::last_os_error()).context("redirect stdio");
            }
        }
    }
    sethostname(&setup.hostname).context("sethostname")?;
    fs::enter_rootfs(&setup.rootfs)
        .with_context(|| format!("switch root to {:?}", setup.rootfs))?;
    Ok(())
}

/// Restores the signal state an exec'd program expects. The Rust runtime
/// ignores SIGPIPE, and ignored dispositions and the mask survive exec.
fn reset_signals() -> nix::Result<()> {
    // SAFETY: SigDfl installs no handler
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

fn report(status: RawFd, header: &[u8], message: &str) {
    let mut payload = header.to_vec();
    payload.extend_from_slice(message.as_bytes());
    // SAFETY: `status` is this process's copy of the pipe's write end
    unsafe {
        libc::write(status, payload.as_ptr().cast(), payload.len());
    }
}

/// Runs `command` inside the namespaces and cgroup of a running container.
pub fn exec_in(pid: Pid, cgroup: &Cgroup, command: &str, args: &[String]) -> Result<i32> {
    let (command, argv) = build_argv(command, args)?;

    // open every namespace first, /proc changes meaning once mnt is joined
    let mut namespaces = Vec::new();
    for (name, flag) in [
        ("uts", CloneFlags::CLONE_NEWUTS),
        ("pid", CloneFlags::CLONE_NEWPID),
        ("mnt", CloneFlags::CLONE_NEWNS),
    ] {
        let path = format!("/proc/{}/ns/{}", pid, name);
        let file = File::open(&path)
            .map_err(|e| Error::sandbox(format!("cannot open {}: {}", path, e)))?;
        namespaces.push((name, file, flag));
    }

    cgroup.add_process(getpid())?;
    for (name, file, flag) in &namespaces {
        setns(file, *flag).map_err(|e| match e {
            Errno::EPERM => Error::Permission {
                capability: REQUIRED_CAPABILITY,
                message: format!("joining the {} namespace was refused", name),
            },
            e => Error::sandbox(format!("setns {}: {}", name, e)),
        })?;
    }

    // the pid namespace only applies to children of the caller
    match unsafe { fork() }.map_err(|e| Error::sandbox(format!("fork: {}", e)))? {
        ForkResult::Parent { child } => wait_for_child(child),
        ForkResult::Child => {
            if let Err(e) = reset_signals() {
                eprintln!("Error: cannot reset signals: {}", e);
                // SAFETY: leave the forked child without running the parent's destructors
                unsafe { libc::_exit(i32::from(EXIT_RUNTIME_FAILURE)) }
            }
            let _ = chdir("/");
            let err = match execvp(&command, &argv) {
                Ok(never) => match never {},
                Err(e) => e,
            };
            eprintln!("Error: cannot execute {:?}: {}", command, err);
            let code = if err == Errno::ENOENT {
                EXIT_NOT_FOUND
            } else {
                EXIT_NOT_EXECUTABLE
            };
            // SAFETY: leave the forked child without running the parent's destructors
            unsafe { libc::_exit(i32::from(code)) }
        }
    }
}

fn build_argv(command: &str, args: &[String]) -> Result<(CString, Vec<CString>)> {
    // Convert command to CString
    let cmd_cstring = CString::new(command)
        .map_err(|_| Error::config(format!("command {:?} contains a NUL byte", command)))?;

    // The first argument should be the program name itself
    let mut c_args: Vec<CString> = vec![cmd_cstring.clone()];
    for arg in args {
        c_args.push(
            CString::new(arg.as_str())
                .map_err(|_| Error::config(format!("argument {:?} contains a NUL byte", arg)))?,
        );
    }
    Ok((cmd_cstring, c_args))
}

/// Waits for a child process; a signal death maps to `128 + signal`.
pub fn wait_for_child(pid: Pid) -> Result<i32> {
    use nix::sys::wait::{WaitStatus, waitpid};

    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(Error::sandbox(format!(
                    "failed to wait for process {}: {}",
                    pid, e
                )));
            }
        }
    }
}
