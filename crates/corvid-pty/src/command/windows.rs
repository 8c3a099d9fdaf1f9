//! Windows launch backend: CreateProcessW, optionally bound to a pseudo
//! console through a proc-thread attribute list.

use std::ffi::{c_void, OsStr, OsString};
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;

use tracing::debug;

use windows_sys::Win32::Foundation::{
    CloseHandle, SetHandleInformation, GENERIC_READ, GENERIC_WRITE, HANDLE, HANDLE_FLAG_INHERIT,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Console::HPCON;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, UpdateProcThreadAttribute, WaitForSingleObject,
    CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
    STARTF_USESTDHANDLES, STARTUPINFOEXW, STARTUPINFOW,
};

use super::Command;
use crate::exit::ExitStatus;

/// Errors surfaced by [`Command::start`] on Windows.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("argument or environment contains an interior null character")]
    NullByte,

    #[error("failed to build process attribute list: {0}")]
    AttributeListFailed(#[source] io::Error),

    #[error("failed to prepare stdio handles: {0}")]
    StdioSetupFailed(#[source] io::Error),

    #[error("CreateProcessW failed: {0}")]
    CreateProcessFailed(#[source] io::Error),
}

/// Errors from reaping a child.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("failed to wait for process: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("failed to read process exit code: {0}")]
    ExitCodeFailed(#[source] io::Error),
}

/// A launched child process, owned by the caller until reaped.
///
/// Windows has no zombie concept, but the exactly-once contract holds all
/// the same: the first terminal status is cached and later calls serve the
/// copy. The process handle closes when the `Child` drops.
#[derive(Debug)]
pub struct Child {
    process: OwnedHandle,
    status: Option<ExitStatus>,
}

impl Child {
    /// The child's process handle.
    pub fn process_handle(&self) -> RawHandle {
        self.process.as_raw_handle()
    }

    /// Block until the child terminates, then read its exit code.
    pub fn wait(&mut self) -> Result<ExitStatus, WaitError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        // SAFETY: the handle is owned and open.
        let waited = unsafe { WaitForSingleObject(self.process.as_raw_handle() as HANDLE, INFINITE) };
        if waited != WAIT_OBJECT_0 {
            return Err(WaitError::WaitFailed(io::Error::last_os_error()));
        }
        self.read_exit_code()
    }

    /// A single non-blocking check.
    ///
    /// `Ok(None)` means the child is still running, never a terminal
    /// result; keep polling.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, WaitError> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        // SAFETY: the handle is owned and open.
        match unsafe { WaitForSingleObject(self.process.as_raw_handle() as HANDLE, 0) } {
            WAIT_OBJECT_0 => self.read_exit_code().map(Some),
            WAIT_TIMEOUT => Ok(None),
            _ => Err(WaitError::WaitFailed(io::Error::last_os_error())),
        }
    }

    fn read_exit_code(&mut self) -> Result<ExitStatus, WaitError> {
        let mut code: u32 = 0;
        // SAFETY: GetExitCodeProcess writes through a valid pointer.
        let ok =
            unsafe { GetExitCodeProcess(self.process.as_raw_handle() as HANDLE, &mut code) };
        if ok == 0 {
            return Err(WaitError::ExitCodeFailed(io::Error::last_os_error()));
        }
        let status = ExitStatus::Exited(code);
        self.status = Some(status);
        Ok(status)
    }
}

pub(super) fn start(cmd: Command) -> Result<Child, SpawnError> {
    let program = wide_null(cmd.program.as_os_str())?;
    let mut command_line = build_command_line(&cmd.args)?;
    let env_block = match &cmd.env {
        Some(map) => Some(build_env_block(map)?),
        None => None,
    };
    let cwd = cmd.cwd.as_ref().map(|p| wide_null(p.as_os_str())).transpose()?;

    // SAFETY: zeroed STARTUPINFOEXW is the documented starting state.
    let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };

    let mut creation_flags: u32 = 0;
    if env_block.is_some() {
        creation_flags |= CREATE_UNICODE_ENVIRONMENT;
    }

    // Handles opened for unset streams; must stay alive across the create
    // call.
    let mut nul_handles: Vec<OwnedHandle> = Vec::new();
    let mut attribute_list = None;
    let mut inherit_handles = 0;

    if let Some(pcon) = cmd.pseudo_console {
        // The console owns the child's stdio; redirection targets are
        // ignored in this mode.
        let list = AttributeList::for_pseudo_console(pcon)?;
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        startup.lpAttributeList = attribute_list.insert(list).as_mut_ptr();
        creation_flags |= EXTENDED_STARTUPINFO_PRESENT;
    } else {
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOW>() as u32;
        startup.StartupInfo.dwFlags |= STARTF_USESTDHANDLES;
        startup.StartupInfo.hStdInput = stdio_handle(&cmd.stdin, GENERIC_READ, &mut nul_handles)?;
        startup.StartupInfo.hStdOutput =
            stdio_handle(&cmd.stdout, GENERIC_WRITE, &mut nul_handles)?;
        startup.StartupInfo.hStdError = stdio_handle(&cmd.stderr, GENERIC_WRITE, &mut nul_handles)?;
        inherit_handles = 1;
    }

    // SAFETY: zeroed PROCESS_INFORMATION is the documented out-param state.
    let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: every pointer argument refers to a live buffer built above;
    // the command line is mutable as CreateProcessW requires.
    let created = unsafe {
        CreateProcessW(
            program.as_ptr(),
            command_line.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            inherit_handles,
            creation_flags,
            env_block
                .as_ref()
                .map_or(ptr::null(), |block| block.as_ptr() as *const c_void),
            cwd.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
            &startup.StartupInfo,
            &mut info,
        )
    };
    if created == 0 {
        return Err(SpawnError::CreateProcessFailed(io::Error::last_os_error()));
    }

    // SAFETY: both handles were just returned to us; we keep only the
    // process handle.
    unsafe { CloseHandle(info.hThread) };
    debug!(pid = info.dwProcessId, program = %cmd.program.display(), "child started");

    Ok(Child {
        // SAFETY: hProcess is a fresh handle we now own.
        process: unsafe { OwnedHandle::from_raw_handle(info.hProcess as RawHandle) },
        status: None,
    })
}

/// An initialized proc-thread attribute list in an owned buffer.
struct AttributeList {
    buf: Vec<u8>,
}

impl AttributeList {
    /// Build a one-entry list binding the pseudo console to the new
    /// process.
    fn for_pseudo_console(pcon: HPCON) -> Result<Self, SpawnError> {
        let mut size = 0usize;
        // First call only reports the required buffer size.
        // SAFETY: a null list with a size out-param is the documented
        // size-query form.
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size) };

        let mut buf = vec![0u8; size];
        let list = buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        // SAFETY: the buffer has the size the first call asked for; the
        // pseudo console attribute takes the handle itself as the value.
        unsafe {
            if InitializeProcThreadAttributeList(list, 1, 0, &mut size) == 0 {
                return Err(SpawnError::AttributeListFailed(io::Error::last_os_error()));
            }
            if UpdateProcThreadAttribute(
                list,
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                pcon,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null_mut(),
            ) == 0
            {
                let err = io::Error::last_os_error();
                DeleteProcThreadAttributeList(list);
                return Err(SpawnError::AttributeListFailed(err));
            }
        }
        Ok(Self { buf })
    }

    fn as_mut_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        // SAFETY: the list was fully initialized in the only constructor.
        unsafe { DeleteProcThreadAttributeList(self.as_mut_ptr()) };
    }
}

/// Resolve one stdio slot: the configured handle (made inheritable) or a
/// fresh inheritable handle on the NUL device.
fn stdio_handle(
    configured: &Option<OwnedHandle>,
    access: u32,
    keep_alive: &mut Vec<OwnedHandle>,
) -> Result<HANDLE, SpawnError> {
    match configured {
        Some(handle) => {
            let raw = handle.as_raw_handle() as HANDLE;
            // Only inheritable handles reach the child.
            // SAFETY: the handle is owned by the Command being started.
            let ok = unsafe { SetHandleInformation(raw, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT) };
            if ok == 0 {
                return Err(SpawnError::StdioSetupFailed(io::Error::last_os_error()));
            }
            Ok(raw)
        }
        None => {
            let nul = open_nul(access)?;
            let raw = nul.as_raw_handle() as HANDLE;
            keep_alive.push(nul);
            Ok(raw)
        }
    }
}

/// Open the NUL device with an inheritable handle.
fn open_nul(access: u32) -> Result<OwnedHandle, SpawnError> {
    let name: Vec<u16> = "NUL".encode_utf16().chain(std::iter::once(0)).collect();
    let security = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    };
    // SAFETY: name is null-terminated and the security struct is fully
    // initialized.
    let handle = unsafe {
        CreateFileW(
            name.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            &security,
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(SpawnError::StdioSetupFailed(io::Error::last_os_error()));
    }
    // SAFETY: a valid handle we now own.
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

/// Encode as UTF-16 with a terminating null, rejecting interior nulls.
fn wide_null(os: &OsStr) -> Result<Vec<u16>, SpawnError> {
    let mut wide: Vec<u16> = os.encode_wide().collect();
    if wide.contains(&0) {
        return Err(SpawnError::NullByte);
    }
    wide.push(0);
    Ok(wide)
}

/// Join arguments into a single command line using the platform quoting
/// rules: quote an argument containing spaces, tabs, or quotes (or an empty
/// one); double backslashes only when they immediately precede a quote
/// (literal or the closing one) and pass them through otherwise.
fn build_command_line(args: &[OsString]) -> Result<Vec<u16>, SpawnError> {
    let mut line: Vec<u16> = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(b' ' as u16);
        }
        append_quoted(arg, &mut line)?;
    }
    line.push(0);
    Ok(line)
}

fn append_quoted(arg: &OsStr, line: &mut Vec<u16>) -> Result<(), SpawnError> {
    const QUOTE: u16 = b'"' as u16;
    const BACKSLASH: u16 = b'\\' as u16;

    let wide: Vec<u16> = arg.encode_wide().collect();
    if wide.contains(&0) {
        return Err(SpawnError::NullByte);
    }

    let needs_quotes = wide.is_empty()
        || wide
            .iter()
            .any(|&c| c == b' ' as u16 || c == b'\t' as u16 || c == QUOTE);
    if !needs_quotes {
        line.extend_from_slice(&wide);
        return Ok(());
    }

    line.push(QUOTE);
    let mut backslashes = 0usize;
    for &c in &wide {
        if c == BACKSLASH {
            backslashes += 1;
            line.push(c);
            continue;
        }
        if c == QUOTE {
            // Double the run just emitted, plus one to escape the quote.
            line.extend(std::iter::repeat(BACKSLASH).take(backslashes + 1));
        }
        backslashes = 0;
        line.push(c);
    }
    // A trailing run would otherwise escape the closing quote.
    line.extend(std::iter::repeat(BACKSLASH).take(backslashes));
    line.push(QUOTE);
    Ok(())
}

/// Serialize an environment map as the double-null-terminated wide block
/// CreateProcessW expects.
fn build_env_block(
    env: &std::collections::HashMap<OsString, OsString>,
) -> Result<Vec<u16>, SpawnError> {
    let mut block: Vec<u16> = Vec::new();
    for (key, value) in env {
        let key_wide: Vec<u16> = key.encode_wide().collect();
        let value_wide: Vec<u16> = value.encode_wide().collect();
        if key_wide.contains(&0) || value_wide.contains(&0) {
            return Err(SpawnError::NullByte);
        }
        block.extend_from_slice(&key_wide);
        block.push(b'=' as u16);
        block.extend_from_slice(&value_wide);
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn line(args: &[&str]) -> String {
        let wide =
            build_command_line(&args.iter().map(OsString::from).collect::<Vec<_>>()).expect("line");
        String::from_utf16(&wide[..wide.len() - 1]).expect("utf-16")
    }

    #[test]
    fn plain_arguments_pass_through() {
        assert_eq!(line(&["cmd.exe", "/c", "dir"]), r"cmd.exe /c dir");
    }

    #[test]
    fn spaces_force_quoting() {
        assert_eq!(
            line(&["cmd.exe", "C:\\Program Files\\tool.exe"]),
            r#"cmd.exe "C:\Program Files\tool.exe""#
        );
    }

    #[test]
    fn embedded_quote_is_escaped() {
        assert_eq!(line(&["say", "a\"b"]), r#"say "a\"b""#);
    }

    #[test]
    fn backslashes_before_a_quote_are_doubled() {
        assert_eq!(line(&["say", "a\\\"b"]), r#"say "a\\\"b""#);
    }

    #[test]
    fn trailing_backslash_in_quoted_argument_is_doubled() {
        assert_eq!(
            line(&["cd", "C:\\Program Files\\"]),
            r#"cd "C:\Program Files\\""#
        );
    }

    #[test]
    fn bare_backslashes_are_not_doubled() {
        assert_eq!(line(&["type", "C:\\dir\\file.txt"]), r"type C:\dir\file.txt");
    }

    #[test]
    fn empty_argument_is_quoted() {
        assert_eq!(line(&["run", ""]), r#"run """#);
    }

    #[test]
    fn env_block_is_double_null_terminated() {
        let mut env = std::collections::HashMap::new();
        env.insert(OsString::from("KEY"), OsString::from("value"));
        let block = build_env_block(&env).expect("block");
        let text: Vec<u16> = "KEY=value".encode_utf16().collect();
        assert_eq!(&block[..text.len()], &text[..]);
        assert_eq!(&block[block.len() - 2..], &[0, 0]);
    }

    #[test]
    fn empty_env_block_is_still_double_null_terminated() {
        let block = build_env_block(&std::collections::HashMap::new()).expect("block");
        assert_eq!(block, vec![0, 0]);
    }
}
