//! POSIX launch backend: fork (or clone3-into-cgroup) and exec.

use std::ffi::{CStr, CString, OsStr};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use tracing::{debug, warn};

use super::Command;
use crate::exit::ExitStatus;

/// Exit code the child uses when stdio setup or the pre-exec hook fails.
const CHILD_SETUP_FAILED: libc::c_int = 126;
/// Exit code the child uses when `execve` itself fails.
const CHILD_EXEC_FAILED: libc::c_int = 127;

/// Errors surfaced by [`Command::start`] before or during process creation.
///
/// Failures inside the child (stdio duplication, hook, exec) cannot cross
/// the process boundary; they show up as the child terminating with
/// 126/127 instead.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("argument or environment contains an interior null byte")]
    NullByte,

    #[error("failed to fork: {0}")]
    ForkFailed(#[source] Errno),

    #[cfg(target_os = "linux")]
    #[error("failed to open cgroup directory {}: {source}", .path.display())]
    CgroupOpenFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(target_os = "linux")]
    #[error("failed to clone into cgroup: {0}")]
    CloneIntoCgroupFailed(#[source] Errno),
}

/// Errors from reaping a child.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("failed to wait for pid {pid}: {source}")]
    WaitFailed {
        pid: libc::pid_t,
        #[source]
        source: Errno,
    },
}

/// A launched child process, owned by the caller until reaped.
///
/// Reaping happens exactly once against the OS; after the first terminal
/// status, [`Child::wait`] and [`Child::try_wait`] serve a cached copy so
/// the pid (which the kernel may reuse) is never touched again.
#[derive(Debug)]
pub struct Child {
    pid: libc::pid_t,
    status: Option<ExitStatus>,
}

impl Child {
    /// The child's process id.
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Block until the child terminates, reaping it.
    pub fn wait(&mut self) -> Result<ExitStatus, WaitError> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let mut raw: libc::c_int = 0;
        loop {
            // SAFETY: waitpid writes the status through a valid pointer.
            let rc = unsafe { libc::waitpid(self.pid, &mut raw, 0) };
            if rc == self.pid {
                break;
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(WaitError::WaitFailed {
                    pid: self.pid,
                    source: errno,
                });
            }
        }

        let status = ExitStatus::from_wait_status(raw);
        self.remember(status);
        Ok(status)
    }

    /// A single non-blocking reap attempt.
    ///
    /// `Ok(None)` means the child is still running, which is never a
    /// terminal result. Callers poll again later (e.g. once per event-loop
    /// tick); abandoning the poll leaves a zombie.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, WaitError> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }

        let mut raw: libc::c_int = 0;
        let rc = loop {
            // SAFETY: as in wait().
            let rc = unsafe { libc::waitpid(self.pid, &mut raw, libc::WNOHANG) };
            if rc >= 0 {
                break rc;
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(WaitError::WaitFailed {
                    pid: self.pid,
                    source: errno,
                });
            }
        };
        if rc == 0 {
            return Ok(None);
        }

        let status = ExitStatus::from_wait_status(raw);
        self.remember(status);
        Ok(Some(status))
    }

    fn remember(&mut self, status: ExitStatus) {
        // A stopped child has not been reaped; only terminal statuses are
        // cached.
        if !matches!(status, ExitStatus::Stopped(_)) {
            self.status = Some(status);
        }
    }
}

pub(super) fn start(mut cmd: Command) -> Result<Child, SpawnError> {
    // Every buffer exec needs is computed here, before the process
    // duplicates. The child inherits a frozen snapshot of the allocator's
    // internals (locks included), so nothing below the fork may allocate.
    let program = to_cstring(cmd.program.as_os_str())?;

    let mut argv = Vec::with_capacity(cmd.args.len());
    for arg in &cmd.args {
        argv.push(to_cstring(arg)?);
    }

    let envp = match &cmd.env {
        Some(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, value) in map {
                entries.push(env_entry(key, value)?);
            }
            entries
        }
        // The single, well-defined read of the process-global environment.
        None => std::env::vars_os()
            .map(|(key, value)| env_entry(&key, &value))
            .collect::<Result<Vec<_>, _>>()?,
    };

    let cwd = match &cmd.cwd {
        Some(dir) => {
            if !dir.is_dir() {
                // chdir failure is non-fatal in the child, and the child
                // cannot log; flag the likely cause from the parent.
                warn!(dir = %dir.display(), "configured working directory does not exist");
            }
            Some(to_cstring(dir.as_os_str())?)
        }
        None => None,
    };

    let argv_ptrs = nulled_ptrs(&argv);
    let envp_ptrs = nulled_ptrs(&envp);

    let pid = duplicate_process(&cmd)?;
    if pid == 0 {
        // Child branch; never returns.
        child_exec(&mut cmd, &program, &argv_ptrs, &envp_ptrs, cwd.as_deref());
    }

    debug!(pid, program = %cmd.program.display(), "child started");
    Ok(Child { pid, status: None })
}

fn to_cstring(os: &OsStr) -> Result<CString, SpawnError> {
    CString::new(os.as_bytes()).map_err(|_| SpawnError::NullByte)
}

fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString, SpawnError> {
    let mut bytes = Vec::with_capacity(key.len() + value.len() + 1);
    bytes.extend_from_slice(key.as_bytes());
    bytes.push(b'=');
    bytes.extend_from_slice(value.as_bytes());
    CString::new(bytes).map_err(|_| SpawnError::NullByte)
}

/// Build the null-terminated pointer array exec expects. The pointers stay
/// valid because the `CString` buffers outlive the fork/exec window.
fn nulled_ptrs(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Fork, or on Linux with a cgroup configured, clone3 directly into it.
fn duplicate_process(cmd: &Command) -> Result<libc::pid_t, SpawnError> {
    #[cfg(target_os = "linux")]
    if let Some(path) = &cmd.cgroup {
        use std::os::unix::fs::OpenOptionsExt;

        let dir = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| SpawnError::CgroupOpenFailed {
                path: path.clone(),
                source,
            })?;
        return clone_into_cgroup(dir.as_raw_fd());
    }

    // SAFETY: the child branch confines itself to async-signal-safe calls
    // until exec (see child_exec).
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(SpawnError::ForkFailed(Errno::last()));
    }
    Ok(pid)
}

/// `clone3(CLONE_INTO_CGROUP)`: the new process is a member of the target
/// cgroup from its first instruction: there is no window where it exists
/// outside the group, which a fork-then-migrate sequence cannot avoid.
#[cfg(target_os = "linux")]
fn clone_into_cgroup(cgroup_fd: RawFd) -> Result<libc::pid_t, SpawnError> {
    // Argument block from include/uapi/linux/sched.h.
    #[repr(C)]
    #[derive(Default)]
    struct CloneArgs {
        flags: u64,
        pidfd: u64,
        child_tid: u64,
        parent_tid: u64,
        exit_signal: u64,
        stack: u64,
        stack_size: u64,
        tls: u64,
        set_tid: u64,
        set_tid_size: u64,
        cgroup: u64,
    }
    const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

    let mut args = CloneArgs {
        flags: CLONE_INTO_CGROUP,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: cgroup_fd as u64,
        ..CloneArgs::default()
    };

    // SAFETY: without CLONE_VM/CLONE_VFORK this behaves like fork; the
    // kernel reads the argument block before returning.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };
    if rc < 0 {
        return Err(SpawnError::CloneIntoCgroupFailed(Errno::last()));
    }
    Ok(rc as libc::pid_t)
}

/// The child branch, between fork and exec.
///
/// Async-signal-safe calls only, and every failure path ends in `_exit`:
/// returning from here would hand the parent's entire remaining logic
/// (test harness included) to a second process.
fn child_exec(
    cmd: &mut Command,
    program: &CStr,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    cwd: Option<&CStr>,
) -> ! {
    unsafe {
        if let Some(fd) = &cmd.stdin {
            if !setup_stdio(fd.as_raw_fd(), libc::STDIN_FILENO) {
                libc::_exit(CHILD_SETUP_FAILED);
            }
        }
        if let Some(fd) = &cmd.stdout {
            if !setup_stdio(fd.as_raw_fd(), libc::STDOUT_FILENO) {
                libc::_exit(CHILD_SETUP_FAILED);
            }
        }
        if let Some(fd) = &cmd.stderr {
            if !setup_stdio(fd.as_raw_fd(), libc::STDERR_FILENO) {
                libc::_exit(CHILD_SETUP_FAILED);
            }
        }
        if let Some(dir) = cwd {
            // Not entering the directory is not worth killing an otherwise
            // viable launch over.
            let _ = libc::chdir(dir.as_ptr());
        }
    }

    if let Some(hook) = cmd.pre_exec.as_mut() {
        if hook().is_err() {
            // SAFETY: _exit is async-signal-safe.
            unsafe { libc::_exit(CHILD_SETUP_FAILED) };
        }
    }

    // SAFETY: all three pointer arguments are null-terminated buffers built
    // before the fork.
    unsafe {
        libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
        // execve only comes back on failure.
        libc::_exit(CHILD_EXEC_FAILED);
    }
}

/// Duplicate `src` onto a standard descriptor, clearing close-on-exec so
/// the copy survives the image replacement.
unsafe fn setup_stdio(src: RawFd, target: RawFd) -> bool {
    if libc::dup2(src, target) < 0 {
        return false;
    }
    // dup2 clears the flag on the copy except when src == target.
    let flags = libc::fcntl(target, libc::F_GETFD);
    flags >= 0 && libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) >= 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::Pty;
    use crate::winsize::WinSize;

    use std::fs::File;
    use std::time::{Duration, Instant};

    /// A /bin/sh invocation running `script`, argv[0] set explicitly.
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("sh").arg("-c").arg(script);
        cmd
    }

    fn poll_until_exit(child: &mut Child) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(status) = child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(Instant::now() < deadline, "child did not exit in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn wait_reports_the_real_exit_code() {
        let mut child = sh("exit 7").start().expect("start");
        assert_eq!(child.wait().expect("wait"), ExitStatus::Exited(7));
        // Reaped once; the second call serves the cached status.
        assert_eq!(child.wait().expect("wait again"), ExitStatus::Exited(7));
    }

    #[test]
    fn pre_exec_hook_runs_in_the_child_before_exec() {
        let mut cmd = sh("exit 0");
        unsafe {
            cmd.pre_exec(|| libc::_exit(42));
        }
        let mut child = cmd.start().expect("start");
        // 42, not 0: the hook fired in the child before the image was
        // replaced, and in the child only.
        assert_eq!(child.wait().expect("wait"), ExitStatus::Exited(42));
    }

    #[test]
    fn failed_exec_exits_with_the_distinct_code() {
        let mut cmd = Command::new("/nonexistent/corvid-no-such-binary");
        cmd.arg("corvid-no-such-binary");
        let mut child = cmd.start().expect("fork itself succeeds");
        assert_eq!(child.wait().expect("wait"), ExitStatus::Exited(127));
    }

    #[test]
    fn interior_null_byte_is_rejected_before_fork() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("sh\0oops");
        assert!(matches!(cmd.start(), Err(SpawnError::NullByte)));
    }

    #[test]
    fn stdout_redirects_to_a_file_unmodified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");

        let mut cmd = sh("printf 'hello from the child'");
        cmd.stdout(File::create(&path).expect("create"));
        let mut child = cmd.start().expect("start");
        assert!(child.wait().expect("wait").success());

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(contents, "hello from the child");
    }

    #[test]
    fn env_override_is_exactly_the_supplied_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");

        // One supplied variable visible, inherited ones (HOME) gone.
        let mut cmd = sh("echo \"${CORVID_MARKER:-missing}:${HOME:-scrubbed}\"");
        cmd.env("CORVID_MARKER", "present");
        cmd.stdout(File::create(&path).expect("create"));
        let mut child = cmd.start().expect("start");
        assert!(child.wait().expect("wait").success());

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(contents.trim(), "present:scrubbed");
    }

    #[test]
    fn absent_env_override_inherits_the_host_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");

        let mut cmd = sh("echo \"${PATH:+inherited}\"");
        cmd.stdout(File::create(&path).expect("create"));
        let mut child = cmd.start().expect("start");
        assert!(child.wait().expect("wait").success());

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(contents.trim(), "inherited");
    }

    #[test]
    fn current_dir_is_applied_in_the_child() {
        let out_dir = tempfile::tempdir().expect("tempdir");
        let work_dir = tempfile::tempdir().expect("tempdir");
        let path = out_dir.path().join("out");

        let mut cmd = sh("pwd");
        cmd.current_dir(work_dir.path());
        cmd.stdout(File::create(&path).expect("create"));
        let mut child = cmd.start().expect("start");
        assert!(child.wait().expect("wait").success());

        let contents = std::fs::read_to_string(&path).expect("read back");
        let expected = work_dir.path().canonicalize().expect("canonicalize");
        assert_eq!(contents.trim(), expected.to_str().expect("utf-8 path"));
    }

    #[test]
    fn try_wait_never_reports_a_running_child_as_terminal() {
        // Close-on-exec keeps the child from inheriting the write end, so
        // dropping ours is enough to EOF the shell's stdin. The read end
        // reaches the child through dup2, which clears the flag.
        let (read_end, write_end) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).expect("pipe");

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("sh").arg("-c").arg("read _line");
        cmd.stdin(read_end);
        let mut child = cmd.start().expect("start");

        // Blocked on stdin: polling keeps returning "still running".
        for _ in 0..5 {
            assert_eq!(child.try_wait().expect("try_wait"), None);
            std::thread::sleep(Duration::from_millis(10));
        }

        // EOF on stdin lets the shell exit.
        drop(write_end);
        let status = poll_until_exit(&mut child);
        assert!(matches!(status, ExitStatus::Exited(_)));

        // Exactly one reap: the cache answers now, and the kernel has
        // nothing left for this pid (no zombie).
        assert_eq!(child.try_wait().expect("cached"), Some(status));
        let rc = unsafe { libc::waitpid(child.pid(), std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(rc, -1);
    }

    #[test]
    fn shell_attached_to_a_pty_exits_cleanly() {
        let pty = Pty::open(WinSize::new(24, 80)).expect("open pty");
        let setup = pty.child_setup();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("sh");
        cmd.stdin(pty.slave().try_clone_to_owned().expect("dup slave"));
        cmd.stdout(pty.slave().try_clone_to_owned().expect("dup slave"));
        cmd.stderr(pty.slave().try_clone_to_owned().expect("dup slave"));
        unsafe {
            cmd.pre_exec(move || {
                setup.activate()?;
                Ok(())
            });
        }

        let mut child = cmd.start().expect("start");
        nix::unistd::write(pty.master(), b"exit\n").expect("write to master");
        assert!(child.wait().expect("wait").success());
    }
}
