//! Pseudo-terminal device management.
//!
//! Owns the master/slave descriptor pair on POSIX (allocation, window-size
//! ioctls, and the child-side session/controlling-terminal setup that runs
//! between fork and exec), and a ConPTY pseudo console on Windows. Reading
//! and writing the master side is the caller's business; only the device
//! lifecycle lives here.

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::{ChildPtySetup, Pty, PtyError};

#[cfg(windows)]
mod conpty;
#[cfg(windows)]
pub use conpty::{Pty, PtyError};
