//! POSIX pseudo-terminal backend: openpty, winsize ioctls, child session
//! setup.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::pty::openpty;
use tracing::debug;

use crate::winsize::WinSize;

/// Errors from PTY allocation and control.
///
/// Every variant carries the raw `errno`, so the [`io::Error`] conversion
/// below is a plain integer passthrough; it does not allocate, which keeps
/// it legal inside a pre-exec hook running between fork and exec.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to allocate PTY pair: {0}")]
    OpenFailed(#[source] Errno),

    #[error("terminal attribute operation failed: {0}")]
    IoctlFailed(#[source] Errno),

    #[error("failed to create session in child: {0}")]
    ProcessGroupFailed(#[source] Errno),

    #[error("failed to attach controlling terminal: {0}")]
    SetControllingTerminalFailed(#[source] Errno),
}

impl From<PtyError> for io::Error {
    fn from(err: PtyError) -> Self {
        let errno = match err {
            PtyError::OpenFailed(e)
            | PtyError::IoctlFailed(e)
            | PtyError::ProcessGroupFailed(e)
            | PtyError::SetControllingTerminalFailed(e) => e,
        };
        io::Error::from_raw_os_error(errno as i32)
    }
}

/// A master/slave pseudo-terminal pair.
///
/// The master descriptor stays with the parent for terminal I/O; the slave
/// is handed to the child as stdio. Both descriptors are owned, so they are
/// closed exactly once, when the `Pty` drops.
///
/// Resize calls have no internal locking; callers that resize from one
/// thread while another reads the master must serialize per instance.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    /// Allocate a PTY pair, applying `size` atomically with creation.
    ///
    /// On Linux the master is additionally switched to UTF-8-aware input
    /// processing (`IUTF8`), which is not the default there.
    pub fn open(size: WinSize) -> Result<Self, PtyError> {
        let ws: libc::winsize = size.into();
        let pair = openpty(Some(&ws), None).map_err(PtyError::OpenFailed)?;

        let pty = Self {
            master: pair.master,
            slave: pair.slave,
        };
        pty.force_utf8_mode()?;

        debug!(
            master = pty.master.as_raw_fd(),
            slave = pty.slave.as_raw_fd(),
            rows = size.rows,
            cols = size.cols,
            "opened pty pair"
        );
        Ok(pty)
    }

    /// Set `IUTF8` on the master so line editing treats input as UTF-8.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn force_utf8_mode(&self) -> Result<(), PtyError> {
        // SAFETY: tcgetattr/tcsetattr write only the termios out-param and
        // operate on a descriptor we own.
        unsafe {
            let mut attrs: libc::termios = mem::zeroed();
            if libc::tcgetattr(self.master.as_raw_fd(), &mut attrs) != 0 {
                return Err(PtyError::IoctlFailed(Errno::last()));
            }
            attrs.c_iflag |= libc::IUTF8;
            if libc::tcsetattr(self.master.as_raw_fd(), libc::TCSANOW, &attrs) != 0 {
                return Err(PtyError::IoctlFailed(Errno::last()));
            }
        }
        Ok(())
    }

    /// UTF-8 input processing is already the default on the BSD family.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn force_utf8_mode(&self) -> Result<(), PtyError> {
        Ok(())
    }

    /// The parent-side master descriptor, for terminal I/O.
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// The slave descriptor, to be duplicated onto the child's stdio.
    pub fn slave(&self) -> BorrowedFd<'_> {
        self.slave.as_fd()
    }

    /// Current window size of the terminal, from `TIOCGWINSZ`.
    pub fn get_size(&self) -> Result<WinSize, PtyError> {
        // SAFETY: TIOCGWINSZ writes a winsize struct through the pointer.
        unsafe {
            let mut ws: libc::winsize = mem::zeroed();
            if libc::ioctl(self.master.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) < 0 {
                return Err(PtyError::IoctlFailed(Errno::last()));
            }
            Ok(ws.into())
        }
    }

    /// Apply a new window size via `TIOCSWINSZ`.
    ///
    /// Cheap enough to call once per live window resize.
    pub fn set_size(&self, size: WinSize) -> Result<(), PtyError> {
        let ws: libc::winsize = size.into();
        // SAFETY: TIOCSWINSZ reads a winsize struct through the pointer.
        unsafe {
            if libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) < 0 {
                return Err(PtyError::IoctlFailed(Errno::last()));
            }
        }
        Ok(())
    }

    /// Capture the descriptor pair for use inside a pre-exec hook.
    ///
    /// The returned value is `Copy` and holds raw descriptor numbers only,
    /// so moving it into the hook closure involves no allocation and no
    /// ownership transfer; the parent's `Pty` stays valid and is dropped
    /// normally on the parent side.
    pub fn child_setup(&self) -> ChildPtySetup {
        ChildPtySetup {
            master: self.master.as_raw_fd(),
            slave: self.slave.as_raw_fd(),
        }
    }
}

/// The child-side half of PTY setup, run between fork and exec.
#[derive(Debug, Clone, Copy)]
pub struct ChildPtySetup {
    master: RawFd,
    slave: RawFd,
}

impl ChildPtySetup {
    /// Make the child a session leader with the slave as its controlling
    /// terminal, then drop the descriptor copies inherited from the parent.
    ///
    /// Must be called exactly once, from inside the freshly forked child,
    /// before exec. Only the calling thread exists in the child, so this
    /// restricts itself to async-signal-safe raw syscalls: no allocation,
    /// no locking, no stdio. The child's actual stdio descriptors are the
    /// ones the launcher already duplicated onto 0/1/2, not these.
    pub fn activate(&self) -> Result<(), PtyError> {
        // SAFETY: setsid/ioctl/close are async-signal-safe; the descriptors
        // are the forked copies of a pair the parent keeps alive.
        unsafe {
            if libc::setsid() < 0 {
                return Err(PtyError::ProcessGroupFailed(Errno::last()));
            }
            if libc::ioctl(self.slave, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(PtyError::SetControllingTerminalFailed(Errno::last()));
            }
            libc::close(self.master);
            libc::close(self.slave);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_initial_size() {
        let pty = Pty::open(WinSize::new(50, 80)).expect("open pty");
        let size = pty.get_size().expect("get size");
        assert_eq!(size.rows, 50);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn set_size_is_reflected_by_get_size() {
        let pty = Pty::open(WinSize::new(24, 80)).expect("open pty");

        pty.set_size(WinSize::new(100, 80)).expect("set size");
        let size = pty.get_size().expect("get size");
        assert_eq!(size.rows, 100);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn pixel_dimensions_survive_the_ioctl_round_trip() {
        let pty = Pty::open(WinSize {
            rows: 30,
            cols: 90,
            pixel_width: 900,
            pixel_height: 600,
        })
        .expect("open pty");

        let size = pty.get_size().expect("get size");
        assert_eq!(size.pixel_width, 900);
        assert_eq!(size.pixel_height, 600);
    }

    #[test]
    fn slave_is_a_terminal() {
        let pty = Pty::open(WinSize::default()).expect("open pty");
        let is_tty = unsafe { libc::isatty(pty.slave().as_raw_fd()) };
        assert_eq!(is_tty, 1);
    }

    #[test]
    fn child_setup_is_copy_and_carries_the_pair() {
        let pty = Pty::open(WinSize::default()).expect("open pty");
        let setup = pty.child_setup();
        let copy = setup;
        assert_eq!(format!("{setup:?}"), format!("{copy:?}"));
    }
}
