use crate::env::Environment;
use anyhow::Result;
use std::io::Write;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Status for a command that could not be found.
pub const EXIT_NOT_FOUND: ExitCode = 127;
/// Status for a command that was found but could not be executed.
pub const EXIT_NOT_EXECUTABLE: ExitCode = 126;
/// Status for a usage error in a builtin.
pub const EXIT_USAGE: ExitCode = 2;

/// Object-safe trait for a command that runs inside the shell process.
///
/// Output goes to the writers it is handed; the interpreter passes the process's
/// current standard output and error, so any active redirection applies.
pub trait ExecutableCommand {
    /// Executes the command.
    fn execute(
        self: Box<Self>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

/// Factory that tries to create a command from a name and its argument vector.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// Attempt to create a command instance. `args[0]` is the command name.
    fn try_create(
        &self,
        env: &Environment,
        name: &str,
        args: &[String],
    ) -> Option<Box<dyn ExecutableCommand>>;
}
