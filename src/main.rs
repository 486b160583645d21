mod channel;
mod config;
mod diff;
mod logging;
mod signals;
mod supervisor;
mod term;
mod upgrade;

use clap::{ArgAction, Parser};
use channel::{Liveness, PrivilegedChannel};
use config::{LaunchEnv, UpgradeConfig};
use nix::sys::signal::{SigSet, Signal};
use signals::{Disposition, PreservePolicy, SignalContext, SignalRegistry, Termination};
use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use term::{ColorChoice, Coloring};
use upgrade::{Outcome, UpgradeError, UpgradeOptions, Upgrader};

/// Updates a NixOS flake, shows changed packages, and switches to the new
/// system on confirmation.
#[derive(Parser, Debug, Default)]
#[command(name = "nixos-upgrade", version, about)]
pub struct Cli {
    /// NixOS flake dir (default: /etc/nixos/)
    #[arg(long)]
    flake: Option<PathBuf>,

    /// Do not update flake.lock
    #[arg(short = 'u', long)]
    no_update_lock_file: bool,

    /// Add a commit message
    #[arg(short = 'm', long, default_value = "")]
    commit_message: String,

    /// Assume "yes" at the upgrade prompt
    #[arg(short = 'y', long, conflicts_with = "assume_no")]
    assume_yes: bool,

    /// Assume "no" at the upgrade prompt
    #[arg(short = 'n', long)]
    assume_no: bool,

    /// Do not commit the flake repo
    #[arg(short = 'c', long)]
    no_commit: bool,

    /// Increase verbosity
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity
    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,

    /// When to display output using colors
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Settings file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    fn verbosity(&self) -> i32 {
        i32::from(self.verbose) - i32::from(self.quiet)
    }
}

fn init_logging(verbosity: i32, ansi: bool) {
    let level = match verbosity {
        v if v <= -1 => "error",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    // Messages are prefixed with the name the launcher gives us, if any.
    let name = std::env::var(config::NAME_ENV)
        .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string());
    logging::init(&name, level, ansi);
}

fn on_termination(signal: Signal, ctx: &SignalContext) -> Result<(), Termination> {
    let termination = Termination::new(signal);
    tracing::error!(sender_pid = ctx.sender_pid, "{termination}");
    Err(termination)
}

fn install_signals(env: &LaunchEnv) -> Result<SignalRegistry, UpgradeError> {
    let handlers = env
        .term_signals
        .iter()
        .map(|sig| (*sig, Disposition::Handler(Box::new(on_termination))));
    let registry = SignalRegistry::install(handlers, PreservePolicy::Auto)?;

    // The launcher may have left signals blocked for us.
    if let Err(e) = SigSet::all().thread_unblock() {
        tracing::warn!(error = %e, "failed to unblock inherited signal mask");
    }
    Ok(registry)
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read hostname");
            "localhost".to_string()
        }
    }
}

/// Log an error and produce its exit code.
fn report(err: &UpgradeError) -> i32 {
    if !err.already_reported() {
        tracing::error!("{err}");
    }
    err.exit_code()
}

/// Print the outcome of a successful run and produce the exit code.
fn conclude(result: Result<Outcome, UpgradeError>, out: &mut impl Write) -> i32 {
    match result.and_then(|outcome| upgrade::write_line(out, &outcome.to_string())) {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn exit(code: i32) -> ! {
    term::std_streams_to_devnull();
    std::process::exit(code)
}

fn main() {
    let (cli, usage_error) = match Cli::try_parse() {
        Ok(cli) => (cli, None),
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => (Cli::default(), Some(e)),
    };

    let coloring = Coloring::resolve(cli.color);
    init_logging(cli.verbosity(), coloring.stderr);

    if let Some(e) = usage_error {
        let rendered = e.to_string();
        let first = rendered.lines().next().unwrap_or_default();
        let msg = first.trim_start_matches("error: ").to_string();
        exit(report(&UpgradeError::Usage(msg)));
    }
    tracing::debug!(?cli, "parsed CLI arguments");

    let env = match LaunchEnv::from_env() {
        Ok(env) => env,
        Err(e) => exit(report(&e.into())),
    };

    let config = match &cli.config {
        Some(path) => UpgradeConfig::load(path),
        None => Ok(UpgradeConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => exit(report(&e.into())),
    };

    let options = UpgradeOptions {
        flake: cli
            .flake
            .clone()
            .unwrap_or_else(|| config.flake.default_dir.clone()),
        update_lock_file: !cli.no_update_lock_file,
        commit: !cli.no_commit,
        commit_message: cli.commit_message.clone(),
        assume: match (cli.assume_yes, cli.assume_no) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        },
        debug: cli.verbosity() >= 2,
        coloring,
    };

    // SAFETY: the launcher opened these descriptors for us alone; nothing
    // else in this process wraps them.
    let (channel, commit_msg) = unsafe {
        (
            PrivilegedChannel::from_raw_fds(
                env.request_fd,
                env.result_fd,
                env.separator,
                Liveness::from(&config.channel),
            ),
            File::from_raw_fd(env.commit_msg_fd),
        )
    };

    let signals = install_signals(&env);
    let mut upgrader = Upgrader::new(env, config, options, hostname(), channel, commit_msg);
    let result = signals.and_then(|mut signals| upgrader.run(&mut signals));

    let code = conclude(result, &mut std::io::stdout().lock());

    upgrader.shutdown();
    exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["nixos-upgrade"]).unwrap();
        assert!(cli.flake.is_none());
        assert!(!cli.no_update_lock_file);
        assert_eq!(cli.color, ColorChoice::Auto);
        assert_eq!(cli.verbosity(), 0);
    }

    #[test]
    fn test_cli_verbosity_counts() {
        let cli = Cli::try_parse_from(["nixos-upgrade", "-vvv", "-q"]).unwrap();
        assert_eq!(cli.verbosity(), 2);
        let cli = Cli::try_parse_from(["nixos-upgrade", "-qq"]).unwrap();
        assert_eq!(cli.verbosity(), -2);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "nixos-upgrade",
            "--flake",
            "/home/me/flake",
            "-u",
            "-c",
            "-y",
            "-m",
            "bump",
            "--color",
            "never",
        ])
        .unwrap();
        assert_eq!(cli.flake, Some(PathBuf::from("/home/me/flake")));
        assert!(cli.no_update_lock_file);
        assert!(cli.no_commit);
        assert!(cli.assume_yes);
        assert_eq!(cli.commit_message, "bump");
        assert_eq!(cli.color, ColorChoice::Never);
    }

    #[test]
    fn test_cli_assume_yes_and_no_conflict() {
        assert!(Cli::try_parse_from(["nixos-upgrade", "-y", "-n"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_argument() {
        let err = Cli::try_parse_from(["nixos-upgrade", "--bogus"]).unwrap_err();
        assert!(err.use_stderr());
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_conclude_prints_outcome() {
        let mut out = Vec::new();
        assert_eq!(conclude(Ok(Outcome::Upgraded), &mut out), 0);
        assert_eq!(out, b"system upgraded\n");
    }

    #[test]
    fn test_conclude_with_closed_stdout_exits_as_sigpipe() {
        assert_eq!(conclude(Ok(Outcome::NoChanges), &mut ClosedPipe), 128 + 13);
    }

    #[test]
    fn test_conclude_failure_skips_outcome() {
        let mut out = Vec::new();
        let code = conclude(Err(UpgradeError::Usage("bad flag".into())), &mut out);
        assert_eq!(code, 64);
        assert!(out.is_empty());
    }

    #[test]
    fn test_termination_handler_requests_exit() {
        let err = on_termination(Signal::SIGQUIT, &SignalContext::default()).unwrap_err();
        assert_eq!(err.exit_code(), 128 + 3);
    }
}
