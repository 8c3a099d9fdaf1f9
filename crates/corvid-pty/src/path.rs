//! Executable lookup along the `PATH` environment variable.

use std::env;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

/// Errors from [`expand_path`].
///
/// "Command not found" is deliberately not an error; the search reports it
/// as `Ok(None)` so callers can distinguish a missing command from a broken
/// lookup.
#[derive(Debug, thiserror::Error)]
pub enum ExpandPathError {
    /// At least one `PATH` candidate existed but was not accessible, and
    /// nothing else matched.
    #[error("access denied while searching PATH")]
    AccessDenied,

    /// An open attempt failed for a reason other than not-found or
    /// permission-denied (for example an over-long candidate path).
    #[error("error probing PATH candidate: {0}")]
    Io(#[from] io::Error),
}

/// Resolve a command name to an absolute executable path using `PATH`.
///
/// A command that already contains a path separator is returned unchanged:
/// it is taken as absolute or explicitly relative, and `PATH` is not
/// consulted. Otherwise each `PATH` directory is probed in order; the first
/// candidate that opens and is executable wins. Candidates that do not exist
/// are skipped silently; candidates that exist but are not accessible are
/// remembered, and surface as [`ExpandPathError::AccessDenied`] only if the
/// whole search comes up empty.
///
/// Returns `Ok(None)` when the command is not present in any `PATH`
/// directory.
pub fn expand_path(cmd: &str) -> Result<Option<PathBuf>, ExpandPathError> {
    if cmd.chars().any(std::path::is_separator) {
        return Ok(Some(PathBuf::from(cmd)));
    }

    let path_var = env::var_os("PATH").unwrap_or_default();
    search_dirs(cmd, env::split_paths(&path_var))
}

/// The `PATH` walk, separated from the environment read for testability.
fn search_dirs<I>(cmd: &str, dirs: I) -> Result<Option<PathBuf>, ExpandPathError>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut saw_access_denied = false;

    for dir in dirs {
        // Skip empty PATH entries rather than treating them as the cwd.
        if dir.as_os_str().is_empty() {
            continue;
        }

        let candidate = dir.join(cmd);
        match probe(&candidate) {
            Ok(true) => {
                trace!(candidate = %candidate.display(), "resolved command on PATH");
                return Ok(Some(candidate));
            }
            Ok(false) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                saw_access_denied = true;
            }
            Err(err) => return Err(err.into()),
        }
    }

    if saw_access_denied {
        return Err(ExpandPathError::AccessDenied);
    }
    trace!(cmd, "command not found on PATH");
    Ok(None)
}

/// Open a candidate and report whether it is an executable regular file.
///
/// On Unix "executable" means any execute permission bit is set; on Windows
/// existing is enough, since executability there is an extension convention.
fn probe(candidate: &Path) -> io::Result<bool> {
    let file = File::open(candidate)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Ok(false);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(metadata.permissions().mode() & 0o111 != 0)
    }

    #[cfg(not(unix))]
    {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_with_separator_is_returned_unchanged() {
        let cmd = format!("no{}such-dir-anywhere", std::path::MAIN_SEPARATOR);
        // Not probed, not searched: even a nonexistent path comes back as-is.
        let resolved = expand_path(&cmd).expect("no error").expect("some path");
        assert_eq!(resolved, PathBuf::from(cmd));
    }

    #[test]
    fn missing_command_is_none_not_error() {
        let dirs = vec![std::env::temp_dir()];
        let result = search_dirs("corvid-definitely-not-a-command", dirs).expect("no error");
        assert_eq!(result, None);
    }

    #[test]
    fn empty_path_entries_are_skipped() {
        let dirs = vec![PathBuf::new(), PathBuf::new()];
        let result = search_dirs("sh", dirs).expect("no error");
        assert_eq!(result, None);
    }

    #[test]
    #[cfg(unix)]
    fn finds_command_in_search_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("corvid-probe");
        std::fs::write(&exe, b"#!/bin/sh\nexit 0\n").expect("write");
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let dirs = vec![std::env::temp_dir(), dir.path().to_path_buf()];
        let resolved = search_dirs("corvid-probe", dirs)
            .expect("no error")
            .expect("found");
        assert_eq!(resolved, exe);
    }

    #[test]
    #[cfg(unix)]
    fn non_executable_candidate_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let plain = dir.path().join("corvid-plain");
        std::fs::write(&plain, b"data").expect("write");
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        let result = search_dirs("corvid-plain", vec![dir.path().to_path_buf()]).expect("no error");
        assert_eq!(result, None);
    }

    #[test]
    #[cfg(unix)]
    fn first_match_wins_across_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        for dir in [&first, &second] {
            let exe = dir.path().join("corvid-dup");
            std::fs::write(&exe, b"#!/bin/sh\n").expect("write");
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        }

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let resolved = search_dirs("corvid-dup", dirs).expect("no error").expect("found");
        assert_eq!(resolved, first.path().join("corvid-dup"));
    }
}
