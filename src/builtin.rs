use crate::command::{CommandFactory, EXIT_USAGE, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::interpreter::Factory;
use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::env;
use std::io::Write;
use std::str::FromStr;

/// Built-in commands known to the shell at compile time.
///
/// Builtins run in the shell process itself and never fork, so whatever they change
/// (session variables, working directory, the exit flag) is seen by the next command.
pub(crate) trait BuiltinCommand: Sized {
    /// Canonical name of the command, e.g. "echo" or "cd".
    fn name() -> &'static str;

    /// Builds the command from its full argument vector (`args[0]` is the name).
    fn from_args(args: &[String]) -> Result<Self, InvalidArgs>;

    /// Executes the command.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(
        self,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        let result = <T as BuiltinCommand>::execute(*self, stdout, stderr, env);
        stdout.flush()?;
        match result {
            Ok(code) => Ok(code),
            Err(e) => {
                writeln!(stderr, "minishell: {:#}", e)?;
                Ok(1)
            }
        }
    }
}

/// A builtin invoked with arguments it cannot work with.
pub(crate) struct InvalidArgs {
    message: String,
    status: ExitCode,
}

impl InvalidArgs {
    fn new(message: impl Into<String>, status: ExitCode) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        _stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        writeln!(stderr, "minishell: {}", self.message)?;
        Ok(self.status)
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(
        &self,
        _env: &Environment,
        name: &str,
        args: &[String],
    ) -> Option<Box<dyn ExecutableCommand>> {
        if name != T::name() {
            return None;
        }
        Some(match T::from_args(args) {
            Ok(cmd) => Box::new(cmd),
            Err(invalid) => Box::new(invalid),
        })
    }
}

/// Write the arguments to standard output, separated by spaces.
///
/// A leading `-n` suppresses the trailing newline.
pub struct Echo {
    pub no_newline: bool,
    pub args: Vec<String>,
}

impl BuiltinCommand for Echo {
    fn name() -> &'static str {
        "echo"
    }

    fn from_args(args: &[String]) -> Result<Self, InvalidArgs> {
        let rest = args.get(1..).unwrap_or_default();
        let flags = rest.iter().take_while(|a| *a == "-n").count();
        Ok(Echo {
            no_newline: flags > 0,
            args: rest[flags..].to_vec(),
        })
    }

    fn execute(
        self,
        stdout: &mut dyn Write,
        _stderr: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let s = self.args.join(" ");
        if self.no_newline {
            write!(stdout, "{}", s)?;
        } else {
            writeln!(stdout, "{}", s)?;
        }
        Ok(0)
    }
}

/// Change the current working directory.
/// If no target is provided, changes to the directory named by `HOME`.
pub struct Cd {
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn from_args(args: &[String]) -> Result<Self, InvalidArgs> {
        Ok(Cd {
            target: args.get(1).cloned(),
        })
    }

    fn execute(
        self,
        _stdout: &mut dyn Write,
        _stderr: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        let target = match self.target {
            Some(t) => t,
            None => env
                .get_var("HOME")
                .map(str::to_string)
                .ok_or_else(|| anyhow!("cd: HOME not set"))?,
        };

        let previous = env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .ok()
            .or_else(|| env.get_var("PWD").map(str::to_string));

        env::set_current_dir(&target).with_context(|| format!("cd: {}", target))?;

        if let Some(previous) = previous {
            env.set_var("OLDPWD", previous);
        }
        let current = env::current_dir().context("cd: can't read new working directory")?;
        env.set_var("PWD", current.to_string_lossy());
        Ok(0)
    }
}

/// What `exit` was asked to exit with.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitArg {
    /// No argument: reuse the last status.
    LastStatus,
    Code(ExitCode),
    /// A non-numeric argument.
    Invalid(String),
}

/// Exit the shell after the current line.
pub struct Exit {
    pub arg: ExitArg,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn from_args(args: &[String]) -> Result<Self, InvalidArgs> {
        let arg = match args.get(1) {
            None => ExitArg::LastStatus,
            Some(text) => match text.parse::<i64>() {
                Ok(n) => ExitArg::Code((n & 0xFF) as ExitCode),
                Err(_) => ExitArg::Invalid(text.clone()),
            },
        };
        Ok(Exit { arg })
    }

    fn execute(
        self,
        _stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        env.should_exit = true;
        env.exit_code = match self.arg {
            ExitArg::LastStatus => env.last_return,
            ExitArg::Code(code) => code,
            ExitArg::Invalid(text) => {
                writeln!(stderr, "minishell: exit: {}: numeric argument required", text)?;
                EXIT_USAGE
            }
        };
        Ok(env.exit_code)
    }
}

/// Send a signal to processes.
///
/// `kill [-signum | -SIGNAME] pid...`, defaulting to `SIGTERM`.
pub struct Kill {
    /// `None` is the null signal (`-0`): only checks that the process exists.
    pub signal: Option<Signal>,
    pub pids: Vec<String>,
}

const KILL_USAGE: &str = "kill: usage: kill [-signum | -sigspec] pid...";

fn parse_signal(spec: &str) -> Result<Option<Signal>, InvalidArgs> {
    let invalid = || InvalidArgs::new(format!("kill: {}: invalid signal specification", spec), 1);
    if let Ok(n) = spec.parse::<i32>() {
        if n == 0 {
            return Ok(None);
        }
        return Signal::try_from(n).map(Some).map_err(|_| invalid());
    }
    let upper = spec.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map(Some).map_err(|_| invalid())
}

impl BuiltinCommand for Kill {
    fn name() -> &'static str {
        "kill"
    }

    fn from_args(args: &[String]) -> Result<Self, InvalidArgs> {
        let mut rest = args.get(1..).unwrap_or_default();
        let mut signal = Some(Signal::SIGTERM);

        if let Some(spec) = rest.first().and_then(|a| a.strip_prefix('-')) {
            signal = parse_signal(spec)?;
            rest = &rest[1..];
        }
        if rest.is_empty() {
            return Err(InvalidArgs::new(KILL_USAGE, 1));
        }

        Ok(Kill {
            signal,
            pids: rest.to_vec(),
        })
    }

    fn execute(
        self,
        _stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let mut status = 0;
        for text in &self.pids {
            let Ok(raw) = text.parse::<i32>() else {
                writeln!(
                    stderr,
                    "minishell: kill: {}: arguments must be process IDs",
                    text
                )?;
                status = 1;
                continue;
            };
            if let Err(errno) = signal::kill(Pid::from_raw(raw), self.signal) {
                writeln!(stderr, "minishell: kill: ({}) - {}", raw, errno.desc())?;
                status = 1;
            }
        }
        Ok(status)
    }
}

/// True if `name` is handled in-process.
pub fn is_builtin(name: &str) -> bool {
    [Echo::name(), Cd::name(), Exit::name(), Kill::name()].contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    /// Runs a builtin through its factory, returning (status, stdout, stderr).
    fn run<T: BuiltinCommand + 'static>(
        words: &[&str],
        env: &mut Environment,
    ) -> (ExitCode, String, String) {
        let args = argv(words);
        let cmd = Factory::<T>::default()
            .try_create(env, &args[0], &args)
            .expect("factory should recognize its own name");
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = cmd.execute(&mut out, &mut err, env).unwrap();
        (
            code,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_factory_ignores_other_names() {
        let env = Environment::default();
        let args = argv(&["ls"]);
        assert!(Factory::<Echo>::default().try_create(&env, "ls", &args).is_none());
    }

    #[test]
    fn test_echo_with_and_without_newline() {
        let mut env = Environment::default();

        let (code, out, _) = run::<Echo>(&["echo", "hello", "world"], &mut env);
        assert_eq!(code, 0);
        assert_eq!(out, "hello world\n");

        let (_, out, _) = run::<Echo>(&["echo", "-n", "foo", "bar"], &mut env);
        assert_eq!(out, "foo bar");

        let (_, out, _) = run::<Echo>(&["echo"], &mut env);
        assert_eq!(out, "\n");

        let (_, out, _) = run::<Echo>(&["echo", "-e", "-n"], &mut env);
        assert_eq!(out, "-e -n\n");
    }

    #[test]
    fn test_cd_to_absolute_path_updates_pwd_and_oldpwd() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();
        let orig = env::current_dir().unwrap();

        let mut env = Environment::default();
        let target = canonical_temp.to_string_lossy().to_string();
        let (code, _, _) = run::<Cd>(&["cd", &target], &mut env);

        let new_cwd = env::current_dir().unwrap();
        env::set_current_dir(&orig).expect("failed to restore cwd");

        assert_eq!(code, 0);
        assert_eq!(fs::canonicalize(new_cwd).unwrap(), canonical_temp);
        assert_eq!(env.get_var("PWD"), Some(target.as_str()));
        assert_eq!(
            env.get_var("OLDPWD").map(PathBuf::from),
            Some(orig.clone())
        );
    }

    #[test]
    fn test_cd_to_home_when_none() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();
        let orig = env::current_dir().unwrap();

        let mut env = Environment::from_vars([("HOME", canonical_temp.to_string_lossy())]);
        let (code, _, _) = run::<Cd>(&["cd"], &mut env);

        let new_cwd = env::current_dir().unwrap();
        env::set_current_dir(&orig).expect("failed to restore cwd");

        assert_eq!(code, 0);
        assert_eq!(fs::canonicalize(new_cwd).unwrap(), canonical_temp);
    }

    #[test]
    fn test_cd_without_home_fails() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let mut env = Environment::default();

        let (code, _, err) = run::<Cd>(&["cd"], &mut env);

        assert_eq!(code, 1);
        assert!(err.contains("HOME not set"), "stderr was: {err}");
        assert_eq!(env::current_dir().unwrap(), orig);
    }

    #[test]
    fn test_cd_nonexistent_path_leaves_state_alone() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let mut env = Environment::default();

        let name = format!("nonexistent_dir_for_minishell_test_{}", std::process::id());
        let (code, _, err) = run::<Cd>(&["cd", &name], &mut env);

        assert_ne!(code, 0);
        assert!(err.contains(&name), "stderr was: {err}");
        assert_eq!(env::current_dir().unwrap(), orig);
        assert_eq!(env.get_var("PWD"), None);
        assert_eq!(env.get_var("OLDPWD"), None);
    }

    #[test]
    fn test_exit_without_argument_uses_last_status() {
        let mut env = Environment {
            last_return: 3,
            ..Environment::default()
        };
        let (code, _, _) = run::<Exit>(&["exit"], &mut env);
        assert!(env.should_exit);
        assert_eq!(env.exit_code, 3);
        assert_eq!(code, 3);
    }

    #[test]
    fn test_exit_code_is_taken_modulo_256() {
        let mut env = Environment::default();
        run::<Exit>(&["exit", "300"], &mut env);
        assert!(env.should_exit);
        assert_eq!(env.exit_code, 44);

        let mut env = Environment::default();
        run::<Exit>(&["exit", "-1"], &mut env);
        assert_eq!(env.exit_code, 255);
    }

    #[test]
    fn test_exit_with_non_numeric_argument() {
        let mut env = Environment::default();
        let (code, _, err) = run::<Exit>(&["exit", "abc"], &mut env);
        assert_eq!(code, 2);
        assert!(env.should_exit);
        assert_eq!(env.exit_code, 2);
        assert!(err.contains("numeric argument required"));
    }

    #[test]
    fn test_kill_usage_errors() {
        let mut env = Environment::default();

        let (code, _, err) = run::<Kill>(&["kill"], &mut env);
        assert_eq!(code, 1);
        assert!(err.contains("usage"));

        let (code, _, err) = run::<Kill>(&["kill", "-9"], &mut env);
        assert_eq!(code, 1);
        assert!(err.contains("usage"));

        let (code, _, err) = run::<Kill>(&["kill", "-999", "1"], &mut env);
        assert_eq!(code, 1);
        assert!(err.contains("invalid signal"));
    }

    #[test]
    fn test_kill_null_signal_to_self() {
        let mut env = Environment::default();
        let me = std::process::id().to_string();
        let (code, _, err) = run::<Kill>(&["kill", "-0", &me], &mut env);
        assert_eq!(code, 0, "stderr was: {err}");

        let (code, _, _) = run::<Kill>(&["kill", "-SIGCONT", &me], &mut env);
        assert_eq!(code, 0);
    }

    #[test]
    fn test_kill_reports_failures_and_keeps_going() {
        let mut env = Environment::default();
        let me = std::process::id().to_string();
        let (code, _, err) = run::<Kill>(&["kill", "-0", "notapid", "2147483647", &me], &mut env);
        assert_eq!(code, 1);
        assert!(err.contains("notapid"));
        assert!(err.contains("No such process"), "stderr was: {err}");
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(parse_signal("9").ok(), Some(Some(Signal::SIGKILL)));
        assert_eq!(parse_signal("KILL").ok(), Some(Some(Signal::SIGKILL)));
        assert_eq!(parse_signal("sigint").ok(), Some(Some(Signal::SIGINT)));
        assert_eq!(parse_signal("0").ok(), Some(None));
        assert!(parse_signal("BOGUS").is_err());
    }

    #[test]
    fn test_is_builtin() {
        for name in ["echo", "cd", "exit", "kill"] {
            assert!(is_builtin(name));
        }
        assert!(!is_builtin("ls"));
        assert!(!is_builtin("pwd"));
    }
}
