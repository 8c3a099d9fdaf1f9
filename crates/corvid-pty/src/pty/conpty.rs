//! Windows pseudo console (ConPTY) backend.
//!
//! ConPTY has no master/slave descriptor pair: the console is an opaque
//! handle fed by one pipe per direction, and it attaches to a process via a
//! proc-thread attribute list at creation time (see the launcher's Windows
//! backend). The surface here mirrors the POSIX `Pty` where the concepts
//! line up: open with an initial size, resize, owned teardown.

use std::cell::Cell;
use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;

use tracing::debug;

use windows_sys::Win32::Foundation::{HANDLE, S_OK};
use windows_sys::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows_sys::Win32::System::Pipes::CreatePipe;

use crate::winsize::WinSize;

/// Errors from pseudo console allocation and control.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to allocate pseudo console: {0}")]
    OpenFailed(#[source] io::Error),

    #[error("failed to resize pseudo console: {0}")]
    IoctlFailed(#[source] io::Error),
}

/// A Windows pseudo console and the parent-side ends of its pipe pair.
///
/// `output` carries everything the console renders (the analogue of reading
/// the POSIX master); `input` feeds keystrokes to the console. The console
/// handle itself goes to [`Command::pseudo_console`] so the launcher can
/// bind it to the child process.
///
/// [`Command::pseudo_console`]: crate::Command::pseudo_console
#[derive(Debug)]
pub struct Pty {
    pcon: HPCON,
    /// Parent reads terminal output here.
    output: OwnedHandle,
    /// Parent writes terminal input here.
    input: OwnedHandle,
    /// ConPTY has no size query; remember the last applied size.
    size: Cell<WinSize>,
}

impl Pty {
    /// Create a pseudo console of the given size with a fresh pipe pair.
    pub fn open(size: WinSize) -> Result<Self, PtyError> {
        let (conpty_input, our_input) = pipe().map_err(PtyError::OpenFailed)?;
        let (our_output, conpty_output) = pipe().map_err(PtyError::OpenFailed)?;

        let coord = COORD {
            X: size.cols as i16,
            Y: size.rows as i16,
        };

        let mut pcon: HPCON = ptr::null_mut();
        // SAFETY: both handles are valid pipe ends we just created; the
        // console duplicates them internally, so our ends close on drop.
        let hr = unsafe {
            CreatePseudoConsole(
                coord,
                conpty_input.as_raw_handle() as HANDLE,
                conpty_output.as_raw_handle() as HANDLE,
                0,
                &mut pcon,
            )
        };
        if hr != S_OK {
            return Err(PtyError::OpenFailed(io::Error::from_raw_os_error(hr)));
        }

        debug!(rows = size.rows, cols = size.cols, "created pseudo console");
        Ok(Self {
            pcon,
            output: our_output,
            input: our_input,
            size: Cell::new(size),
        })
    }

    /// The console handle for the launcher's attribute list.
    pub fn pseudo_console(&self) -> HPCON {
        self.pcon
    }

    /// Parent-side handle carrying the console's rendered output.
    pub fn output(&self) -> RawHandle {
        self.output.as_raw_handle()
    }

    /// Parent-side handle feeding input to the console.
    pub fn input(&self) -> RawHandle {
        self.input.as_raw_handle()
    }

    /// The last size applied to the console.
    ///
    /// ConPTY offers no query call, so this reports the cached value.
    pub fn get_size(&self) -> Result<WinSize, PtyError> {
        Ok(self.size.get())
    }

    /// Resize the console.
    pub fn set_size(&self, size: WinSize) -> Result<(), PtyError> {
        let coord = COORD {
            X: size.cols as i16,
            Y: size.rows as i16,
        };
        // SAFETY: the console handle is valid until drop.
        let hr = unsafe { ResizePseudoConsole(self.pcon, coord) };
        if hr != S_OK {
            return Err(PtyError::IoctlFailed(io::Error::from_raw_os_error(hr)));
        }
        self.size.set(size);
        Ok(())
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        // SAFETY: pcon is the console created in open(); the pipe ends are
        // OwnedHandles and close themselves.
        unsafe { ClosePseudoConsole(self.pcon) };
    }
}

/// Create an anonymous pipe, returning `(read, write)` as owned handles.
fn pipe() -> io::Result<(OwnedHandle, OwnedHandle)> {
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    // SAFETY: CreatePipe writes two valid handles on success.
    unsafe {
        if CreatePipe(&mut read, &mut write, ptr::null(), 0) == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((
            OwnedHandle::from_raw_handle(read as RawHandle),
            OwnedHandle::from_raw_handle(write as RawHandle),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_reports_initial_size() {
        let pty = Pty::open(WinSize::new(50, 80)).expect("open conpty");
        let size = pty.get_size().expect("get size");
        assert_eq!(size.rows, 50);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn resize_updates_cached_size() {
        let pty = Pty::open(WinSize::new(24, 80)).expect("open conpty");
        pty.set_size(WinSize::new(100, 80)).expect("resize");
        assert_eq!(pty.get_size().expect("get size"), WinSize::new(100, 80));
    }
}
