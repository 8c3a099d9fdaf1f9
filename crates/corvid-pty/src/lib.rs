//! Subprocess and pseudo-terminal lifecycle for corvid.
//!
//! This crate is the layer between the terminal surface and the OS: it
//! allocates the PTY (or Windows pseudo console), launches the shell
//! attached to it, and reports why the process stopped. The VT parser,
//! grid model, and rendering consume the master side elsewhere; only the
//! device and process lifecycle live here.
//!
//! The usual flow: resolve the executable with [`expand_path`] (picking it
//! with [`default_shell`]), open a [`Pty`] sized to the initial grid, build
//! a [`Command`] whose stdio is the slave side and whose pre-exec hook
//! activates the captured [`ChildPtySetup`], then [`Command::start`] and
//! poll the returned [`Child`].

pub mod command;
pub mod exit;
pub mod path;
pub mod pty;
pub mod shell;
pub mod winsize;

pub use command::{Child, Command, PreExecHook, SpawnError, WaitError};
pub use exit::ExitStatus;
pub use path::{expand_path, ExpandPathError};
#[cfg(unix)]
pub use pty::ChildPtySetup;
pub use pty::{Pty, PtyError};
pub use shell::{default_shell, login_args};
pub use winsize::WinSize;
