use crate::command::{EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND, ExitCode};
use crate::env::Environment;
use crate::parser::SimpleCommand;
use crate::redirect::RedirectGuard;
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{AccessFlags, ForkResult, Pid, access, execve, fork};
use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Search path used when `PATH` is not set.
pub const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Why an external command could not be started.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("{0}: Permission denied")]
    PermissionDenied(String),
    #[error("{0}: argument contains a NUL byte")]
    BadArgument(String),
    #[error("fork: {0}")]
    Fork(#[source] Errno),
}

impl ExecError {
    /// The status the failing command reports.
    pub fn status(&self) -> ExitCode {
        match self {
            ExecError::NotFound(_) => EXIT_NOT_FOUND,
            ExecError::PermissionDenied(_) => EXIT_NOT_EXECUTABLE,
            ExecError::BadArgument(_) | ExecError::Fork(_) => 1,
        }
    }
}

/// Command that is not a builtin, resolved and ready to be forked off.
pub struct ExternalCommand<'a> {
    name: &'a str,
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    command: &'a SimpleCommand,
}

impl<'a> ExternalCommand<'a> {
    /// Resolves the command against `env`'s `PATH` and captures its environment.
    pub fn resolve(env: &Environment, command: &'a SimpleCommand) -> Result<Self, ExecError> {
        let name = command.name.as_deref().unwrap_or_default();
        let search_paths = env.get_var("PATH").unwrap_or(DEFAULT_PATH);
        let path = find_command_path(search_paths, name)
            .ok_or_else(|| ExecError::NotFound(name.to_string()))?;

        let bad_argument = |_| ExecError::BadArgument(name.to_string());
        let path = CString::new(path.as_os_str().as_bytes()).map_err(bad_argument)?;
        let argv = command
            .args
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(bad_argument)?;

        Ok(Self {
            name,
            path,
            argv,
            envp: env.to_envp(),
            command,
        })
    }

    /// Forks, applies redirections in the child, replaces the child's image and waits.
    pub fn execute(self) -> Result<ExitCode, ExecError> {
        flush_stdout();
        // SAFETY: the child only sets up descriptors and calls execve, or reports the
        // failure and exits; it never returns into the caller.
        match unsafe { fork() }.map_err(ExecError::Fork)? {
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, command = self.name, "spawned");
                Ok(wait_child(child))
            }
            ForkResult::Child => self.exec_in_child(),
        }
    }

    fn exec_in_child(self) -> ! {
        match RedirectGuard::apply(&self.command.redirections) {
            Ok(guard) => guard.keep(),
            Err(e) => {
                eprintln!("minishell: {}", e);
                std::process::exit(1);
            }
        }

        restore_default_sigpipe();
        let err = match execve(&self.path, &self.argv, &self.envp) {
            Err(Errno::EACCES) => ExecError::PermissionDenied(self.name.to_string()),
            Err(errno) => {
                tracing::debug!(command = self.name, %errno, "execve failed");
                ExecError::NotFound(self.name.to_string())
            }
            Ok(never) => match never {},
        };
        eprintln!("minishell: {}", err);
        std::process::exit(err.status());
    }
}

/// The Rust runtime ignores SIGPIPE; programs we start expect the default action.
fn restore_default_sigpipe() {
    // SAFETY: installs the default disposition, no handler code runs.
    if let Err(e) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        tracing::debug!(error = %e, "could not reset SIGPIPE");
    }
}

pub(crate) fn flush_stdout() {
    if let Err(e) = io::stdout().flush() {
        tracing::debug!(error = %e, "flushing stdout failed");
    }
}

/// Blocks until `pid` terminates and converts its wait status to an exit code.
///
/// A child that did not exit normally (e.g. it was killed by a signal) counts as 1.
pub(crate) fn wait_child(pid: Pid) -> ExitCode {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                tracing::debug!(%pid, ?sig, "child killed by signal");
                return 1;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(%pid, error = %e, "waitpid failed");
                return 1;
            }
        }
    }
}

/// Resolve a command name the way the shell does.
///
/// Behavior:
/// - Explicit path (`/...`, `./...`, `../...`): returned as is.
/// - Anything else: search each directory of `search_paths` (colon separated)
///   and return the first `dir/name` that is executable.
/// - Empty name: `None`.
pub fn find_command_path(search_paths: &str, name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.starts_with('/') || name.starts_with("./") || name.starts_with("../") {
        return Some(PathBuf::from(name));
    }
    search_paths
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| access(candidate.as_path(), AccessFlags::X_OK).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::os::unix::fs::PermissionsExt;

    fn executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).expect("touch");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn absolute_path_is_used_verbatim() {
        let found = find_command_path("/bin", "/bin/nonexisting");
        assert_eq!(found, Some(PathBuf::from("/bin/nonexisting")));
    }

    #[test]
    fn relative_explicit_paths_are_used_verbatim() {
        assert_eq!(find_command_path("", "./foo"), Some(PathBuf::from("./foo")));
        assert_eq!(find_command_path("", "../foo"), Some(PathBuf::from("../foo")));
    }

    #[test]
    fn single_component_found_in_path() {
        let found = find_command_path("/nonexistent/dir:/bin:/usr/bin", "sh")
            .expect("Expected to find 'sh' via PATH search");
        assert!(found.ends_with("sh"));
    }

    #[test]
    fn first_match_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = executable(first.path(), "tool");
        executable(second.path(), "tool");

        let search = format!("{}:{}", first.path().display(), second.path().display());
        assert_eq!(find_command_path(&search, "tool"), Some(expected));
    }

    #[test]
    fn non_executable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("data")).unwrap();
        let search = dir.path().to_string_lossy().to_string();
        assert_eq!(find_command_path(&search, "data"), None);
    }

    #[test]
    fn nested_relative_name_is_searched_in_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        let expected = executable(&dir.path().join("bin"), "run");
        let search = dir.path().to_string_lossy().to_string();
        assert_eq!(find_command_path(&search, "bin/run"), Some(expected));
    }

    #[test]
    fn single_component_not_found_in_path() {
        assert_eq!(find_command_path("/bin", "definitely_not_a_command"), None);
    }

    #[test]
    fn empty_name_is_none() {
        assert_eq!(find_command_path("/bin", ""), None);
    }

    #[test]
    fn resolve_uses_default_path_without_path_variable() {
        let env = Environment::default();
        let cmd = SimpleCommand {
            name: Some("sh".into()),
            args: vec!["sh".into()],
            ..SimpleCommand::default()
        };
        let resolved = ExternalCommand::resolve(&env, &cmd).expect("sh lives in /bin or /usr/bin");
        assert!(resolved.path.to_bytes().ends_with(b"/sh"));
        assert!(resolved.envp.is_empty());
    }

    #[test]
    fn resolve_reports_missing_commands_with_127() {
        let env = Environment::from_vars([("PATH", "/bin")]);
        let cmd = SimpleCommand {
            name: Some("definitely_not_a_command".into()),
            args: vec!["definitely_not_a_command".into()],
            ..SimpleCommand::default()
        };
        let err = ExternalCommand::resolve(&env, &cmd).err().unwrap();
        assert_eq!(err.status(), 127);
        assert_eq!(err.to_string(), "definitely_not_a_command: command not found");
    }
}
