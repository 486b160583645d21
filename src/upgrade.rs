/// The upgrade sequence: resolve the flake, update its lock file, build,
/// diff, ask, switch, commit.
///
/// Every step runs through [`SignalRegistry::guarded`], so a termination
/// request queued since the last step is acted on before the next one
/// starts.
use crate::channel::{ChannelError, PrivilegedChannel};
use crate::config::{ConfigError, LaunchEnv, UpgradeConfig};
use crate::diff::{self, ChangeStats};
use crate::signals::{SignalError, SignalRegistry, Termination, EXIT_SIGNAL_SHIFT};
use crate::supervisor::{RunOptions, Supervisor, SupervisorError};
use crate::term::Coloring;
use nix::sys::signal::Signal;
use std::fs::File;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 64;

const TASK_OK: &str = "OK";
const ANSWER_NO: &str = "n";
const ANSWER_YES: &str = "y";

/// How a run ended successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoChanges,
    Declined,
    Upgraded,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::NoChanges => write!(f, "no changes found"),
            Outcome::Declined => write!(f, "nothing changed"),
            Outcome::Upgraded => write!(f, "system upgraded"),
        }
    }
}

/// Anything that ends a run unsuccessfully.
#[derive(Debug)]
pub enum UpgradeError {
    Usage(String),
    Config(ConfigError),
    Signals(SignalError),
    Channel(ChannelError),
    Subprocess(SupervisorError),
    /// The worker reported a failed task.
    Task(String),
    Terminated(Termination),
    /// Standard output went away.
    BrokenPipe,
    Io {
        op: &'static str,
        source: std::io::Error,
    },
}

impl std::fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeError::Usage(msg) => write!(f, "{msg}"),
            UpgradeError::Config(e) => write!(f, "{e}"),
            UpgradeError::Signals(e) => write!(f, "{e}"),
            UpgradeError::Channel(e) => write!(f, "{e}"),
            UpgradeError::Subprocess(e) => write!(f, "{e}"),
            UpgradeError::Task(msg) => write!(f, "{msg}"),
            UpgradeError::Terminated(t) => write!(f, "{t}"),
            UpgradeError::BrokenPipe => write!(f, "{}", Termination::new(Signal::SIGPIPE)),
            UpgradeError::Io { op, source } => write!(f, "failed to {op}: {source}"),
        }
    }
}

impl std::error::Error for UpgradeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpgradeError::Config(e) => Some(e),
            UpgradeError::Signals(e) => Some(e),
            UpgradeError::Channel(e) => Some(e),
            UpgradeError::Subprocess(e) => Some(e),
            UpgradeError::Terminated(t) => Some(t),
            UpgradeError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for UpgradeError {
    fn from(e: ConfigError) -> Self {
        UpgradeError::Config(e)
    }
}

impl From<SignalError> for UpgradeError {
    fn from(e: SignalError) -> Self {
        UpgradeError::Signals(e)
    }
}

impl From<Termination> for UpgradeError {
    fn from(t: Termination) -> Self {
        UpgradeError::Terminated(t)
    }
}

impl From<ChannelError> for UpgradeError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Terminated(t) => UpgradeError::Terminated(t),
            other => UpgradeError::Channel(other),
        }
    }
}

impl From<SupervisorError> for UpgradeError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Terminated { termination, .. } => UpgradeError::Terminated(termination),
            other => UpgradeError::Subprocess(other),
        }
    }
}

impl UpgradeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeError::Usage(_) => EXIT_USAGE,
            UpgradeError::Terminated(t) => t.exit_code(),
            UpgradeError::Subprocess(SupervisorError::Failed { code, .. }) => *code,
            UpgradeError::BrokenPipe => EXIT_SIGNAL_SHIFT + Signal::SIGPIPE as i32,
            _ => EXIT_FAILURE,
        }
    }

    /// Errors that were logged where they happened.
    pub fn already_reported(&self) -> bool {
        matches!(
            self,
            UpgradeError::Terminated(_)
                | UpgradeError::Subprocess(SupervisorError::Failed { .. })
        )
    }
}

fn write_stdout(text: &str) -> Result<(), UpgradeError> {
    write_line(&mut std::io::stdout().lock(), text)
}

/// Print one line and flush. A closed pipe is [`UpgradeError::BrokenPipe`].
pub fn write_line(out: &mut impl Write, text: &str) -> Result<(), UpgradeError> {
    writeln!(out, "{text}")
        .and_then(|_| out.flush())
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => UpgradeError::BrokenPipe,
            _ => UpgradeError::Io {
                op: "write to stdout",
                source: e,
            },
        })
}

/// Run-time choices from the command line.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub flake: PathBuf,
    pub update_lock_file: bool,
    pub commit: bool,
    pub commit_message: String,
    /// Pre-answered prompt: `Some(true)` for yes.
    pub assume: Option<bool>,
    pub debug: bool,
    pub coloring: Coloring,
}

/// State carried across the upgrade steps.
pub struct Upgrader {
    env: LaunchEnv,
    config: UpgradeConfig,
    options: UpgradeOptions,
    hostname: String,
    channel: PrivilegedChannel,
    commit_msg: Option<File>,
    supervisor: Supervisor,
    current_closure: String,
    upgraded_closure: String,
    diff: String,
}

impl Upgrader {
    pub fn new(
        env: LaunchEnv,
        config: UpgradeConfig,
        options: UpgradeOptions,
        hostname: String,
        channel: PrivilegedChannel,
        commit_msg: File,
    ) -> Self {
        let supervisor = Supervisor::from_config(&config.supervisor);
        Self {
            env,
            config,
            options,
            hostname,
            channel,
            commit_msg: Some(commit_msg),
            supervisor,
            current_closure: String::new(),
            upgraded_closure: String::new(),
            diff: String::new(),
        }
    }

    pub fn run(&mut self, signals: &mut SignalRegistry) -> Result<Outcome, UpgradeError> {
        signals.guarded(|s| self.query_current_closure(s))?;
        signals.guarded(|s| self.check_flake_dir(s))?;
        if self.options.update_lock_file {
            signals.guarded(|s| self.update_lock_file(s))?;
        }
        signals.guarded(|s| self.build_system(s))?;
        if !signals.guarded(|s| self.diff_closures(s))? {
            return Ok(Outcome::NoChanges);
        }
        signals.guarded(|s| self.print_updates(s))?;
        signals.guarded(|s| self.upgrade_system(s))
    }

    /// Tell the worker we're done. Errors are irrelevant at this point.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.channel.write_request(&["exit"]) {
            tracing::debug!(error = %e, "failed to send exit request");
        }
    }

    fn task(
        &mut self,
        signals: &mut SignalRegistry,
        name: &str,
        args: &[&str],
    ) -> Result<String, UpgradeError> {
        Ok(self.channel.run_task(name, args, signals)?)
    }

    fn task_ok(
        &mut self,
        signals: &mut SignalRegistry,
        name: &str,
        args: &[&str],
        failure: impl FnOnce() -> String,
    ) -> Result<(), UpgradeError> {
        if self.task(signals, name, args)? == TASK_OK {
            Ok(())
        } else {
            Err(UpgradeError::Task(failure()))
        }
    }

    fn query_current_closure(&mut self, signals: &mut SignalRegistry) -> Result<(), UpgradeError> {
        self.current_closure = self.task(signals, "get_current_system_closure", &[])?;
        tracing::debug!(current_closure = %self.current_closure);
        Ok(())
    }

    fn check_flake_dir(&mut self, signals: &mut SignalRegistry) -> Result<(), UpgradeError> {
        let requested = self.options.flake.display().to_string();
        tracing::debug!(flake_dir = %requested);

        let flake_dir = self.task(signals, "resolve_flake_dir", &[&requested])?;
        tracing::debug!("  resolved to {flake_dir:?}");

        self.task_ok(signals, "is_dir_flake_exists", &[], || {
            format!("{flake_dir}: no such directory")
        })?;
        tracing::debug!("  exists");

        self.task_ok(signals, "is_flake_file_exists", &[], || {
            format!("{flake_dir}: this dir is not a flake")
        })?;
        tracing::debug!("  and it's a flake");

        self.task_ok(signals, "setup_tmp_dir", &[], || {
            "copying flake dir problem".to_string()
        })?;

        self.task_ok(signals, "check_nixos_config", &[], || {
            format!("{flake_dir}: flake: nixosConfigurations not found")
        })?;
        tracing::debug!("  with nixos configuration");

        tracing::info!("found a nixos flake '{flake_dir}'");
        self.options.flake = PathBuf::from(flake_dir);
        Ok(())
    }

    fn update_lock_file(&mut self, signals: &mut SignalRegistry) -> Result<(), UpgradeError> {
        self.task_ok(signals, "update_lock_file", &[], || {
            "updating lock file error".to_string()
        })
    }

    fn build_target(&self) -> String {
        format!(
            "{}#nixosConfigurations.{}.config.system.build.toplevel",
            self.env.tmp_dir.display(),
            self.hostname
        )
    }

    fn build_system(&mut self, signals: &mut SignalRegistry) -> Result<(), UpgradeError> {
        let target = self.build_target();
        tracing::debug!(nixos_config = %target);

        tracing::info!("building nixos system...");
        self.task_ok(signals, "build", &[&target], || {
            "building nixos system subprocess error".to_string()
        })?;
        tracing::info!("ok");

        // The build task sends the new closure as a second result line.
        self.upgraded_closure = self.channel.read_line()?;
        tracing::debug!(upgraded_closure = %self.upgraded_closure);
        Ok(())
    }

    /// Diff the closures. `false` when there is nothing to diff.
    fn diff_closures(&mut self, signals: &mut SignalRegistry) -> Result<bool, UpgradeError> {
        if self.current_closure == self.upgraded_closure {
            return Ok(false);
        }

        let mut argv = self.config.flake.diff_command.clone();
        argv.push(self.current_closure.clone());
        argv.push(self.upgraded_closure.clone());

        tracing::info!("Comparing derivations...");
        // The diff ends up on stdout, so stdout's colouring decides.
        let options = RunOptions {
            separate_stderr: self.options.debug,
            no_color: !self.options.coloring.stdout,
            echo: self.options.debug,
            exit_on_error: true,
            env: Vec::new(),
        };
        self.diff = self.supervisor.run(&argv, &options, signals)?.output;

        if diff::has_package_changes(&self.diff) {
            tracing::warn!("package changes found");
        } else {
            tracing::warn!("config changes found");
        }
        Ok(true)
    }

    fn print_updates(&mut self, _signals: &mut SignalRegistry) -> Result<(), UpgradeError> {
        self.diff = diff::strip_header(&self.diff);
        write_stdout(&self.diff)
    }

    fn ask(&self, prompt: &str) -> Result<String, UpgradeError> {
        if let Some(yes) = self.options.assume {
            return Ok(if yes { ANSWER_YES } else { ANSWER_NO }.to_string());
        }

        if std::io::stdin().is_terminal() {
            if std::io::stdout().is_terminal() {
                print!("{prompt}");
                let _ = std::io::stdout().flush();
            } else if std::io::stderr().is_terminal() {
                eprint!("{prompt}");
            }
        }

        let mut answer = String::new();
        match std::io::stdin().read_line(&mut answer) {
            Ok(0) => Ok(ANSWER_NO.to_string()),
            Ok(_) => Ok(answer.trim_end_matches(['\n', '\r']).to_string()),
            Err(e) => Err(UpgradeError::Io {
                op: "read answer",
                source: e,
            }),
        }
    }

    fn upgrade_system(&mut self, signals: &mut SignalRegistry) -> Result<Outcome, UpgradeError> {
        let stats = ChangeStats::count(&self.diff);
        let prompt = format!(
            "{}. Upgrade system? ([{ANSWER_NO}]/{ANSWER_YES}): ",
            stats.summary()
        );
        let answer = self.ask(&prompt)?;
        tracing::warn!("{prompt}{answer}");

        if !answer.eq_ignore_ascii_case(ANSWER_YES) {
            return Ok(Outcome::Declined);
        }

        tracing::info!("switching to upgraded system...");
        let closure = self.upgraded_closure.clone();
        let upgraded = self.task(signals, "upgrade", &[&closure])? == TASK_OK;

        if upgraded && self.options.commit {
            // A half-written commit is worse than a late exit.
            let mut guard = signals.suspended();
            self.commit(&mut guard)?;
            guard.release()?;
        }

        if upgraded {
            Ok(Outcome::Upgraded)
        } else {
            Err(UpgradeError::Task(
                "switching to upgraded system error".to_string(),
            ))
        }
    }

    fn commit(&mut self, signals: &mut SignalRegistry) -> Result<(), UpgradeError> {
        let message = diff::commit_message(&self.env.name, &self.options.commit_message, &self.diff);
        // Dropping the file closes it; the worker reads up to EOF.
        if let Some(mut file) = self.commit_msg.take() {
            file.write_all(message.as_bytes())
                .map_err(|e| UpgradeError::Io {
                    op: "write commit message",
                    source: e,
                })?;
        }

        if self.task(signals, "commit", &[])? == TASK_OK {
            tracing::warn!("flake repo committed");
        } else {
            tracing::error!("flake repo committing subprocess error");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Liveness, PipeReader};
    use crate::config::{FlakeConfig, SupervisorConfig};
    use crate::signals::Disposition;
    use std::io::{BufRead, BufReader, Read};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;

    const CURRENT: &str = "/nix/store/aaa-nixos-system-24.05";
    const UPGRADED: &str = "/nix/store/bbb-nixos-system-24.05";

    type Requests = Arc<Mutex<Vec<String>>>;

    /// Fake worker: acknowledges every request, answers from `reply`.
    fn spawn_worker(
        requests_in: UnixStream,
        mut results_out: UnixStream,
        reply: fn(&[&str]) -> Vec<String>,
    ) -> (Requests, JoinHandle<()>) {
        let log: Requests = Arc::default();
        let seen = Arc::clone(&log);
        let handle = std::thread::spawn(move || {
            let reader = BufReader::new(requests_in);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                seen.lock().unwrap().push(line.clone());
                let fields: Vec<&str> = line.split('|').collect();
                if fields[0] == "exit" {
                    break;
                }
                let mut out = String::from("PONG\n");
                for l in reply(&fields) {
                    out.push_str(&l);
                    out.push('\n');
                }
                if results_out.write_all(out.as_bytes()).is_err() {
                    break;
                }
            }
        });
        (log, handle)
    }

    fn happy_worker(fields: &[&str]) -> Vec<String> {
        match fields[0] {
            "get_current_system_closure" => vec![CURRENT.into()],
            "resolve_flake_dir" => vec!["/etc/nixos".into()],
            "build" => vec!["OK".into(), UPGRADED.into()],
            _ => vec!["OK".into()],
        }
    }

    struct Harness {
        upgrader: Upgrader,
        requests: Requests,
        worker: JoinHandle<()>,
        commit_reader: UnixStream,
    }

    fn harness(
        reply: fn(&[&str]) -> Vec<String>,
        assume: Option<bool>,
        diff_script: &str,
    ) -> Harness {
        let (ours_out, theirs_in) = UnixStream::pair().unwrap();
        let (theirs_out, ours_in) = UnixStream::pair().unwrap();
        let (commit_writer, commit_reader) = UnixStream::pair().unwrap();
        let (requests, worker) = spawn_worker(theirs_in, theirs_out, reply);

        let env = LaunchEnv {
            name: "nixos-upgrade".to_string(),
            request_fd: -1,
            result_fd: -1,
            commit_msg_fd: -1,
            separator: '|',
            tmp_dir: PathBuf::from("/tmp/upgrade.test"),
            term_signals: vec![Signal::SIGINT],
        };
        let config = UpgradeConfig {
            supervisor: SupervisorConfig {
                poll_interval_ms: 10,
                term_grace_secs: 1,
            },
            flake: FlakeConfig {
                default_dir: PathBuf::from("/etc/nixos/"),
                diff_command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    diff_script.to_string(),
                    "diff".to_string(),
                ],
            },
            ..Default::default()
        };
        let options = UpgradeOptions {
            flake: PathBuf::from("/etc/nixos/"),
            update_lock_file: true,
            commit: true,
            commit_message: "weekly".to_string(),
            assume,
            debug: false,
            coloring: Coloring {
                stdout: false,
                stderr: false,
            },
        };
        let channel = PrivilegedChannel::new(
            File::from(OwnedFd::from(ours_out)),
            PipeReader::new(OwnedFd::from(ours_in)),
            '|',
            Liveness {
                token: "PONG".to_string(),
                attempts: 200,
                interval: Duration::from_millis(5),
            },
        );
        let upgrader = Upgrader::new(
            env,
            config,
            options,
            "testhost".to_string(),
            channel,
            File::from(OwnedFd::from(commit_writer)),
        );
        Harness {
            upgrader,
            requests,
            worker,
            commit_reader,
        }
    }

    const DIFF_SCRIPT: &str =
        r#"printf '<<< %s\n>>> %s\n\033[32m[U.]\033[0m  #1  firefox  120.0 -> 121.0\n' "$1" "$2""#;

    fn no_signals() -> SignalRegistry {
        SignalRegistry::detached(Vec::<(Signal, Disposition)>::new())
    }

    fn finish(mut h: Harness) -> Vec<String> {
        h.upgrader.shutdown();
        h.worker.join().unwrap();
        let requests = h.requests.lock().unwrap().clone();
        requests
    }

    #[test]
    fn test_full_upgrade_sends_expected_requests_and_commits() {
        let mut h = harness(happy_worker, Some(true), DIFF_SCRIPT);
        let outcome = h.upgrader.run(&mut no_signals()).unwrap();
        assert_eq!(outcome, Outcome::Upgraded);

        let mut message = String::new();
        h.commit_reader.read_to_string(&mut message).unwrap();
        assert_eq!(
            message,
            "nixos-upgrade: Auto commit\n\nweekly\n\n[U.]  #1  firefox  120.0 -> 121.0\n"
        );

        let requests = finish(h);
        assert_eq!(
            requests,
            vec![
                "get_current_system_closure".to_string(),
                "resolve_flake_dir|/etc/nixos/".to_string(),
                "is_dir_flake_exists".to_string(),
                "is_flake_file_exists".to_string(),
                "setup_tmp_dir".to_string(),
                "check_nixos_config".to_string(),
                "update_lock_file".to_string(),
                "build|/tmp/upgrade.test#nixosConfigurations.testhost.config.system.build.toplevel"
                    .to_string(),
                format!("upgrade|{UPGRADED}"),
                "commit".to_string(),
                "exit".to_string(),
            ]
        );
    }

    #[test]
    fn test_diff_colour_follows_stdout() {
        let mut h = harness(happy_worker, Some(false), DIFF_SCRIPT);
        h.upgrader.options.coloring = Coloring {
            stdout: true,
            stderr: false,
        };
        h.upgrader.run(&mut no_signals()).unwrap();
        assert!(h.upgrader.diff.contains("\x1b[32m[U.]"));
        finish(h);

        let mut h = harness(happy_worker, Some(false), DIFF_SCRIPT);
        h.upgrader.options.coloring = Coloring {
            stdout: false,
            stderr: true,
        };
        h.upgrader.run(&mut no_signals()).unwrap();
        assert!(!h.upgrader.diff.contains('\x1b'));
        finish(h);
    }

    #[test]
    fn test_declined_upgrade_changes_nothing() {
        let mut h = harness(happy_worker, Some(false), DIFF_SCRIPT);
        let outcome = h.upgrader.run(&mut no_signals()).unwrap();
        assert_eq!(outcome, Outcome::Declined);

        let requests = finish(h);
        assert!(!requests.iter().any(|r| r.starts_with("upgrade")));
        assert!(!requests.iter().any(|r| r == "commit"));
    }

    #[test]
    fn test_identical_closures_end_early() {
        fn same_closure(fields: &[&str]) -> Vec<String> {
            match fields[0] {
                "build" => vec!["OK".into(), CURRENT.into()],
                _ => happy_worker(fields),
            }
        }
        let mut h = harness(same_closure, Some(true), "exit 99");
        let outcome = h.upgrader.run(&mut no_signals()).unwrap();
        assert_eq!(outcome, Outcome::NoChanges);
        assert_eq!(outcome.to_string(), "no changes found");
        finish(h);
    }

    #[test]
    fn test_missing_flake_dir_is_task_error() {
        fn no_dir(fields: &[&str]) -> Vec<String> {
            match fields[0] {
                "is_dir_flake_exists" => vec!["NO".into()],
                _ => happy_worker(fields),
            }
        }
        let mut h = harness(no_dir, Some(true), DIFF_SCRIPT);
        let err = h.upgrader.run(&mut no_signals()).unwrap_err();
        assert_eq!(err.to_string(), "/etc/nixos: no such directory");
        assert_eq!(err.exit_code(), EXIT_FAILURE);

        let requests = finish(h);
        assert!(!requests.iter().any(|r| r.starts_with("build")));
    }

    #[test]
    fn test_failed_diff_exits_with_its_code() {
        let mut h = harness(happy_worker, Some(true), "exit 3");
        let err = h.upgrader.run(&mut no_signals()).unwrap_err();
        assert!(err.already_reported());
        assert_eq!(err.exit_code(), 3);
        finish(h);
    }

    #[test]
    fn test_pending_termination_stops_before_next_step() {
        let mut h = harness(happy_worker, Some(true), DIFF_SCRIPT);
        let mut signals = SignalRegistry::detached([(
            Signal::SIGINT,
            Disposition::Handler(Box::new(|sig, _| Err(Termination::new(sig)))),
        )]);
        signals.inject(Signal::SIGINT);

        let err = h.upgrader.run(&mut signals).unwrap_err();
        assert!(matches!(err, UpgradeError::Terminated(t) if t.signal == Signal::SIGINT));
        assert_eq!(err.exit_code(), 130);

        let requests = finish(h);
        assert_eq!(requests, vec!["exit".to_string()]);
    }

    /// Writer whose reader has gone away.
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
    fn test_write_line_to_closed_pipe_exits_as_sigpipe() {
        let err = write_line(&mut ClosedPipe, "system upgraded").unwrap_err();
        assert!(matches!(err, UpgradeError::BrokenPipe));
        assert_eq!(err.exit_code(), 141);
        assert!(!err.already_reported());
    }

    #[test]
    fn test_write_line_appends_newline() {
        let mut out = Vec::new();
        write_line(&mut out, "no changes found").unwrap();
        assert_eq!(out, b"no changes found\n");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(UpgradeError::Usage("bad".into()).exit_code(), EXIT_USAGE);
        assert_eq!(UpgradeError::BrokenPipe.exit_code(), 128 + 13);
        assert_eq!(
            UpgradeError::from(ChannelError::Unresponsive { attempts: 100 }).exit_code(),
            EXIT_FAILURE
        );
        assert!(matches!(
            UpgradeError::from(ChannelError::Terminated(Termination::new(Signal::SIGTERM))),
            UpgradeError::Terminated(_)
        ));
    }
}
