/// Terminal plumbing: colour decisions, escape stripping, and stream
/// redirection at shutdown.
use clap::ValueEnum;
use regex::Regex;
use std::borrow::Cow;
use std::io::IsTerminal;
use std::sync::LazyLock;

/// SGR colour sequences as emitted by nvd, nix and friends.
static COLOR_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]+m").unwrap());

pub const NO_COLOR_ENV: &str = "NO_COLOR";

/// `--color` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

/// Which standard streams get coloured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coloring {
    pub stdout: bool,
    pub stderr: bool,
}

impl Coloring {
    pub fn resolve(choice: ColorChoice) -> Self {
        match choice {
            ColorChoice::Always => Self::both(true),
            ColorChoice::Never => Self::both(false),
            ColorChoice::Auto => Self::detect(
                |name| std::env::var_os(name).is_some(),
                std::env::var("TERM").ok().as_deref(),
                std::io::stdout().is_terminal(),
                std::io::stderr().is_terminal(),
            ),
        }
    }

    fn both(on: bool) -> Self {
        Self {
            stdout: on,
            stderr: on,
        }
    }

    fn detect(
        env_set: impl Fn(&str) -> bool,
        term: Option<&str>,
        stdout_tty: bool,
        stderr_tty: bool,
    ) -> Self {
        if env_set("FORCE_COLOR") {
            return Self::both(true);
        }
        if env_set(NO_COLOR_ENV) || env_set("ANSI_COLORS_DISABLED") || term == Some("dumb") {
            return Self::both(false);
        }
        Self {
            stdout: stdout_tty,
            stderr: stderr_tty,
        }
    }
}

/// Remove colour escape sequences.
pub fn strip_color(text: &str) -> Cow<'_, str> {
    COLOR_SEQUENCE.replace_all(text, "")
}

/// Point non-terminal stdout/stderr at `/dev/null` so late writes during
/// shutdown can't fail on a closed pipe.
pub fn std_streams_to_devnull() {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    use nix::unistd::dup2;

    let devnull = match open("/dev/null", OFlag::O_WRONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::debug!(error = %e, "failed to open /dev/null");
            return;
        }
    };
    if !std::io::stdout().is_terminal() {
        let _ = dup2(devnull, nix::libc::STDOUT_FILENO);
    }
    if !std::io::stderr().is_terminal() {
        let _ = dup2(devnull, nix::libc::STDERR_FILENO);
    }
    let _ = nix::unistd::close(devnull);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_color_removes_sgr_sequences() {
        let text = "\x1b[1;32m[U.]\x1b[0m firefox: 120.0 -> 121.0";
        assert_eq!(strip_color(text), "[U.] firefox: 120.0 -> 121.0");
    }

    #[test]
    fn test_strip_color_leaves_plain_text_borrowed() {
        assert!(matches!(strip_color("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn test_strip_color_ignores_non_sgr_escape() {
        // Cursor movement, not a colour sequence.
        assert_eq!(strip_color("\x1b[2Kdone"), "\x1b[2Kdone");
    }

    #[test]
    fn test_force_color_wins() {
        let c = Coloring::detect(|n| n == "FORCE_COLOR" || n == NO_COLOR_ENV, None, false, false);
        assert_eq!(c, Coloring::both(true));
    }

    #[test]
    fn test_no_color_env_disables() {
        let c = Coloring::detect(|n| n == NO_COLOR_ENV, None, true, true);
        assert_eq!(c, Coloring::both(false));
    }

    #[test]
    fn test_dumb_terminal_disables() {
        let c = Coloring::detect(|_| false, Some("dumb"), true, true);
        assert_eq!(c, Coloring::both(false));
    }

    #[test]
    fn test_auto_follows_tty_per_stream() {
        let c = Coloring::detect(|_| false, Some("xterm-256color"), false, true);
        assert_eq!(
            c,
            Coloring {
                stdout: false,
                stderr: true
            }
        );
    }

    #[test]
    fn test_explicit_choices() {
        assert_eq!(Coloring::resolve(ColorChoice::Always), Coloring::both(true));
        assert_eq!(Coloring::resolve(ColorChoice::Never), Coloring::both(false));
    }
}
