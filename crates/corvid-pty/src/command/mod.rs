//! Subprocess launching.
//!
//! [`Command`] is the immutable description of a child process: executable
//! path, argv (argument zero included; it is never derived from the path),
//! optional environment override, working directory, stdio handles, and a
//! pre-exec hook. [`Command::start`] consumes the description and hands back
//! a [`Child`], which the caller must reap exactly once via
//! [`Child::wait`] or [`Child::try_wait`].
//!
//! One public surface, one backend per platform, selected at compile time:
//! fork/exec on POSIX, CreateProcess (optionally bound to a pseudo console)
//! on Windows.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(windows)]
use std::os::windows::io::OwnedHandle;

#[cfg(windows)]
use windows_sys::Win32::System::Console::HPCON;

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::{Child, SpawnError, WaitError};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{Child, SpawnError, WaitError};

/// Hook run in the child after fork, before exec.
///
/// Restricted to async-signal-safe operations: no allocation, no locking,
/// no blocking I/O. A returned error aborts the child (it exits with the
/// setup-failure code; the error itself cannot cross the process boundary).
pub type PreExecHook = Box<dyn FnMut() -> io::Result<()> + Send>;

/// Description of a child process to launch.
///
/// Build one with the setter methods, then call [`Command::start`]. Start
/// consumes the value, so a description can never be mutated or reused
/// after the launch begins.
pub struct Command {
    program: PathBuf,
    args: Vec<OsString>,
    env: Option<HashMap<OsString, OsString>>,
    cwd: Option<PathBuf>,
    #[cfg(unix)]
    stdin: Option<OwnedFd>,
    #[cfg(unix)]
    stdout: Option<OwnedFd>,
    #[cfg(unix)]
    stderr: Option<OwnedFd>,
    #[cfg(windows)]
    stdin: Option<OwnedHandle>,
    #[cfg(windows)]
    stdout: Option<OwnedHandle>,
    #[cfg(windows)]
    stderr: Option<OwnedHandle>,
    #[cfg(unix)]
    pre_exec: Option<PreExecHook>,
    #[cfg(target_os = "linux")]
    cgroup: Option<PathBuf>,
    #[cfg(windows)]
    pseudo_console: Option<HPCON>,
}

impl Command {
    /// Start a description for the executable at `program`.
    ///
    /// The path is used as-is; resolve bare command names first (see
    /// [`expand_path`]). No argument zero is added; push it explicitly
    /// with [`Command::arg`].
    ///
    /// [`expand_path`]: crate::expand_path
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            stdin: None,
            stdout: None,
            stderr: None,
            #[cfg(unix)]
            pre_exec: None,
            #[cfg(target_os = "linux")]
            cgroup: None,
            #[cfg(windows)]
            pseudo_console: None,
        }
    }

    /// Append one argument. The first argument appended becomes argv[0].
    pub fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one variable in the environment override.
    ///
    /// Calling this (or [`Command::envs`]) switches the child from
    /// inheriting the host environment to seeing exactly the override map;
    /// a map with one entry means the child observes one variable.
    pub fn env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the environment override wholesale.
    pub fn envs(&mut self, env: HashMap<OsString, OsString>) -> &mut Self {
        self.env = Some(env);
        self
    }

    /// Set the child's working directory.
    ///
    /// A directory that cannot be entered does not abort the launch; the
    /// child starts in the parent's directory instead.
    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Redirect the child's stdin to the given handle.
    #[cfg(unix)]
    pub fn stdin(&mut self, fd: impl Into<OwnedFd>) -> &mut Self {
        self.stdin = Some(fd.into());
        self
    }

    /// Redirect the child's stdout to the given handle.
    #[cfg(unix)]
    pub fn stdout(&mut self, fd: impl Into<OwnedFd>) -> &mut Self {
        self.stdout = Some(fd.into());
        self
    }

    /// Redirect the child's stderr to the given handle.
    #[cfg(unix)]
    pub fn stderr(&mut self, fd: impl Into<OwnedFd>) -> &mut Self {
        self.stderr = Some(fd.into());
        self
    }

    /// Redirect the child's stdin to the given handle.
    #[cfg(windows)]
    pub fn stdin(&mut self, handle: impl Into<OwnedHandle>) -> &mut Self {
        self.stdin = Some(handle.into());
        self
    }

    /// Redirect the child's stdout to the given handle.
    #[cfg(windows)]
    pub fn stdout(&mut self, handle: impl Into<OwnedHandle>) -> &mut Self {
        self.stdout = Some(handle.into());
        self
    }

    /// Redirect the child's stderr to the given handle.
    #[cfg(windows)]
    pub fn stderr(&mut self, handle: impl Into<OwnedHandle>) -> &mut Self {
        self.stderr = Some(handle.into());
        self
    }

    /// Run `hook` in the child between fork and exec.
    ///
    /// Typical use is finishing PTY setup with a captured
    /// [`ChildPtySetup`]. Context reaches the hook by closure capture;
    /// prefer capturing `Copy` values.
    ///
    /// # Safety
    ///
    /// The hook executes in a forked child where only the calling thread
    /// survives. It must stick to async-signal-safe operations: raw
    /// syscalls, no allocation, no locks, no stdio.
    ///
    /// [`ChildPtySetup`]: crate::ChildPtySetup
    #[cfg(unix)]
    pub unsafe fn pre_exec<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut() -> io::Result<()> + Send + 'static,
    {
        self.pre_exec = Some(Box::new(hook));
        self
    }

    /// Place the child into the cgroup at `path` atomically at creation.
    ///
    /// Uses `clone3(CLONE_INTO_CGROUP)`, so the process never exists
    /// outside the group: there is no create-then-migrate window. The
    /// launch fails if the kernel does not support `clone3`.
    #[cfg(target_os = "linux")]
    pub fn cgroup(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.cgroup = Some(path.into());
        self
    }

    /// Attach the child to a pseudo console.
    ///
    /// When set, all stdio redirection is ignored: the console owns the
    /// child's stdio. The handle must stay valid until the child exits.
    #[cfg(windows)]
    pub fn pseudo_console(&mut self, pcon: HPCON) -> &mut Self {
        self.pseudo_console = Some(pcon);
        self
    }

    /// The configured executable path.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Launch the child.
    ///
    /// Returns as soon as the new process exists; it never waits for the
    /// child to reach exec or to exit. The caller owns the returned
    /// [`Child`] and must reap it.
    #[cfg(unix)]
    pub fn start(self) -> Result<Child, SpawnError> {
        posix::start(self)
    }

    /// Launch the child.
    ///
    /// Returns as soon as the new process exists; it never waits for the
    /// child to exit. The caller owns the returned [`Child`] and must reap
    /// it.
    #[cfg(windows)]
    pub fn start(self) -> Result<Child, SpawnError> {
        windows::start(self)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Command");
        debug
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("cwd", &self.cwd);
        #[cfg(unix)]
        debug.field("has_pre_exec", &self.pre_exec.is_some());
        debug.finish_non_exhaustive()
    }
}
