//! Default-shell detection for the owning surface.
//!
//! Picks the executable a new terminal pane should run and the flags that
//! make it an interactive login shell. The result feeds [`Command`]: the
//! program plus argument zero and any login flags.
//!
//! [`Command`]: crate::Command

use std::path::Path;

/// The user's default shell.
///
/// - Unix: the `SHELL` environment variable, falling back to `/bin/sh`.
/// - Windows: the `COMSPEC` environment variable, falling back to `cmd.exe`.
pub fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }

    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
}

/// Login flags for the given shell binary, if it takes any.
///
/// bash and zsh read their profile files only when started as a login
/// shell, so panes launched through them get `--login`. Other shells (fish,
/// dash, cmd.exe) behave interactively without extra flags.
pub fn login_args(shell: &str) -> &'static [&'static str] {
    let name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);

    match name {
        "bash" | "zsh" => &["--login"],
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_is_non_empty() {
        assert!(!default_shell().is_empty());
    }

    #[test]
    fn bash_and_zsh_get_login_flag() {
        assert_eq!(login_args("/bin/bash"), &["--login"]);
        assert_eq!(login_args("/usr/local/bin/zsh"), &["--login"]);
        assert_eq!(login_args("zsh"), &["--login"]);
    }

    #[test]
    fn other_shells_get_no_flags() {
        assert!(login_args("/usr/bin/fish").is_empty());
        assert!(login_args("/bin/dash").is_empty());
        assert!(login_args("cmd.exe").is_empty());
    }

    #[test]
    fn lookalike_names_are_not_matched() {
        // Suffix matching would mistake these for bash/zsh.
        assert!(login_args("/opt/tools/notbash").is_empty());
        assert!(login_args("/home/user/mybash").is_empty());
    }
}
