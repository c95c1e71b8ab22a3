use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::external::{ExternalCommand, flush_stdout, wait_child};
use crate::parser::{self, AndOrOp, AstNode, SimpleCommand};
use crate::redirect::RedirectGuard;
use anyhow::Context;
use nix::unistd::{ForkResult, Pid, close, dup2, fork, pipe};
use std::io::{self, BufRead, IsTerminal};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;

/// Factory allows creating instances of ExecutableCommand.
///
/// One factory per builtin, matched by name.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

/// Knobs for behavior that differs between shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    /// Apply file redirections to builtins (restored once the builtin returns).
    /// When false, builtins write to the shell's own descriptors regardless.
    pub redirect_builtins: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            redirect_builtins: true,
        }
    }
}

/// Executes syntax trees against a session [`Environment`].
///
/// Builtins (`echo`, `cd`, `exit`, `kill`) run in-process; everything else is forked
/// and exec'd. Every node's status is recorded as the session's last return code.
///
/// Example
/// ```no_run
/// use minishell::{Environment, Interpreter};
/// let mut sh = Interpreter::new(Environment::new());
/// let code = sh.run_line("echo hello world");
/// assert_eq!(code, 0);
/// ```
pub struct Interpreter {
    env: Environment,
    builtins: Vec<Box<dyn CommandFactory>>,
    options: ExecOptions,
}

impl Interpreter {
    /// Create an interpreter for a session with default options.
    pub fn new(env: Environment) -> Self {
        Self::with_options(env, ExecOptions::default())
    }

    pub fn with_options(env: Environment, options: ExecOptions) -> Self {
        use crate::builtin::*;
        Self {
            env,
            builtins: vec![
                Box::new(Factory::<Echo>::default()),
                Box::new(Factory::<Cd>::default()),
                Box::new(Factory::<Exit>::default()),
                Box::new(Factory::<Kill>::default()),
            ],
            options,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// Set once `exit` ran; the caller should stop feeding lines.
    pub fn should_exit(&self) -> bool {
        self.env.should_exit
    }

    pub fn exit_code(&self) -> ExitCode {
        self.env.exit_code
    }

    /// Lex, parse and execute one line.
    ///
    /// A line that does not parse runs nothing and leaves the last status unchanged.
    pub fn run_line(&mut self, line: &str) -> ExitCode {
        match parser::parse_line(line) {
            Ok(Some(ast)) => self.exec_ast(&ast),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, line, "skipping line");
                self.env.last_return
            }
        }
    }

    /// Runs every line of `reader`, stopping early once `exit` has been called.
    ///
    /// Returns the `exit` status if the session was ended explicitly, otherwise the
    /// status of the last command.
    pub fn run_reader<R: BufRead>(&mut self, reader: R) -> anyhow::Result<ExitCode> {
        for line in reader.lines() {
            let line = line.context("failed to read input")?;
            self.run_line(line.strip_suffix('\r').unwrap_or(&line));
            if self.env.should_exit {
                return Ok(self.env.exit_code);
            }
        }
        Ok(self.env.last_return)
    }

    /// Reads commands from standard input, one line at a time.
    ///
    /// A `$ ` prompt goes to standard error when standard input is a terminal.
    pub fn repl(&mut self) -> anyhow::Result<ExitCode> {
        let stdin = io::stdin();
        let interactive = stdin.is_terminal();
        let mut line = String::new();

        while !self.env.should_exit {
            if interactive {
                eprint!("$ ");
            }
            line.clear();
            if stdin.lock().read_line(&mut line).context("failed to read input")? == 0 {
                return Ok(self.env.last_return);
            }
            self.run_line(line.trim_end_matches(['\n', '\r']));
        }
        Ok(self.env.exit_code)
    }

    /// Executes a tree and records its status as the last return code.
    pub fn exec_ast(&mut self, node: &AstNode) -> ExitCode {
        let status = match node {
            AstNode::Command(cmd) => self.exec_command(cmd),
            AstNode::Pipeline(left, right) => self.exec_pipeline(left, right),
            AstNode::AndOr { left, op, right } => self.exec_and_or(left, *op, right),
            AstNode::Sequence(left, right) => {
                self.exec_ast(left);
                self.exec_ast(right)
            }
        };
        self.env.last_return = status;
        status
    }

    fn exec_and_or(&mut self, left: &AstNode, op: AndOrOp, right: &AstNode) -> ExitCode {
        let status = self.exec_ast(left);
        let run_right = match op {
            AndOrOp::And => status == 0,
            AndOrOp::Or => status != 0,
        };
        if run_right { self.exec_ast(right) } else { status }
    }

    fn exec_command(&mut self, cmd: &SimpleCommand) -> ExitCode {
        let Some(name) = cmd.name.as_deref() else {
            return self.exec_assignments(cmd);
        };

        let builtin = self
            .builtins
            .iter()
            .find_map(|factory| factory.try_create(&self.env, name, &cmd.args));
        if let Some(builtin) = builtin {
            tracing::debug!(command = name, "builtin");
            return self.exec_builtin(builtin, cmd);
        }

        if cmd.assignments.is_empty() {
            run_external(&self.env, cmd)
        } else {
            let scoped = self.env.scoped(&cmd.assignments);
            run_external(&scoped, cmd)
        }
    }

    /// A command without a name: export its assignments into the session.
    /// Redirections are still opened, so `> file` creates or truncates `file`.
    fn exec_assignments(&mut self, cmd: &SimpleCommand) -> ExitCode {
        if !cmd.redirections.is_empty() {
            if let Err(e) = RedirectGuard::apply(&cmd.redirections) {
                eprintln!("minishell: {}", e);
                return 1;
            }
        }
        for assignment in &cmd.assignments {
            self.env.assign(assignment);
        }
        0
    }

    fn exec_builtin(&mut self, builtin: Box<dyn ExecutableCommand>, cmd: &SimpleCommand) -> ExitCode {
        let _guard = if self.options.redirect_builtins {
            match RedirectGuard::apply(&cmd.redirections) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    eprintln!("minishell: {}", e);
                    return 1;
                }
            }
        } else {
            None
        };

        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        builtin
            .execute(&mut stdout, &mut stderr, &mut self.env)
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, "builtin failed to write");
                1
            })
    }

    /// `left | right`: each side runs in its own child, connected by a pipe.
    /// Only the right-hand status is reported.
    fn exec_pipeline(&mut self, left: &AstNode, right: &AstNode) -> ExitCode {
        let (read_end, write_end) = match pipe() {
            Ok(ends) => ends,
            Err(e) => {
                eprintln!("minishell: pipe: {}", e.desc());
                return 1;
            }
        };

        let left_pid = match self.spawn_stage(left, &write_end, STDOUT_FD, &read_end) {
            Ok(pid) => pid,
            Err(e) => {
                eprintln!("minishell: fork: {}", e.desc());
                return 1;
            }
        };
        let right_pid = self.spawn_stage(right, &read_end, STDIN_FD, &write_end);

        drop(read_end);
        drop(write_end);

        let _ = wait_child(left_pid);
        match right_pid {
            Ok(pid) => wait_child(pid),
            Err(e) => {
                eprintln!("minishell: fork: {}", e.desc());
                1
            }
        }
    }

    /// Forks a child that evaluates `node` with `keep` moved onto `target` and
    /// `other` closed. The child exits with the node's status and never returns.
    fn spawn_stage(
        &mut self,
        node: &AstNode,
        keep: &OwnedFd,
        target: RawFd,
        other: &OwnedFd,
    ) -> nix::Result<Pid> {
        flush_stdout();
        // SAFETY: the child runs the shell's own evaluation on a private copy of the
        // parent's memory and leaves through `process::exit`.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, stage = %node, "pipeline stage");
                Ok(child)
            }
            ForkResult::Child => {
                // The OwnedFd destructors never run in the child: it exits below.
                let _ = close(other.as_raw_fd());
                if let Err(e) = dup2(keep.as_raw_fd(), target) {
                    eprintln!("minishell: dup2: {}", e.desc());
                    std::process::exit(1);
                }
                let _ = close(keep.as_raw_fd());

                let status = self.exec_ast(node);
                flush_stdout();
                std::process::exit(status);
            }
        }
    }
}

impl Default for Interpreter {
    /// An interpreter over a snapshot of the current process environment.
    fn default() -> Self {
        Self::new(Environment::new())
    }
}

/// Resolves and runs an external command with exactly the variables in `env`.
fn run_external(env: &Environment, cmd: &SimpleCommand) -> ExitCode {
    match ExternalCommand::resolve(env, cmd).and_then(ExternalCommand::execute) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("minishell: {}", e);
            e.status()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_redirect_builtins() {
        assert!(ExecOptions::default().redirect_builtins);
    }

    #[test]
    fn test_empty_and_unparsable_lines_run_nothing() {
        let mut sh = Interpreter::new(Environment::default());
        assert_eq!(sh.run_line(""), 0);

        sh.env_mut().last_return = 5;
        assert_eq!(sh.run_line("echo oops &"), 5);
        assert_eq!(sh.env().last_return, 5);
    }

    #[test]
    fn test_assignment_only_line_exports_to_session() {
        let mut sh = Interpreter::new(Environment::default());
        assert_eq!(sh.run_line("FOO=bar BAZ=qux"), 0);
        assert_eq!(sh.env().get_var("FOO"), Some("bar"));
        assert_eq!(sh.env().get_var("BAZ"), Some("qux"));
    }

    #[test]
    fn test_exit_sets_session_flags() {
        let mut sh = Interpreter::new(Environment::default());
        assert_eq!(sh.run_line("exit 7"), 7);
        assert!(sh.should_exit());
        assert_eq!(sh.exit_code(), 7);
        assert_eq!(sh.env().last_return, 7);
    }

    #[test]
    fn test_and_or_short_circuits_on_builtins() {
        let mut sh = Interpreter::new(Environment::default());
        // `exit abc` fails with 2 and `||` moves on to the right side.
        assert_eq!(sh.run_line("exit abc || exit 4"), 4);
        assert_eq!(sh.exit_code(), 4);

        let mut sh = Interpreter::new(Environment::default());
        assert_eq!(sh.run_line("exit abc && exit 4"), 2);
        assert_eq!(sh.exit_code(), 2);
    }

    #[test]
    fn test_sequence_runs_both_sides() {
        let mut sh = Interpreter::new(Environment::default());
        assert_eq!(sh.run_line("A=1 ; B=2"), 0);
        assert_eq!(sh.env().get_var("A"), Some("1"));
        assert_eq!(sh.env().get_var("B"), Some("2"));
    }

    #[test]
    fn test_run_reader_stops_after_exit() {
        let mut sh = Interpreter::new(Environment::default());
        let script = "A=1\r\nexit 3\nB=2\n";
        assert_eq!(sh.run_reader(script.as_bytes()).unwrap(), 3);
        assert_eq!(sh.env().get_var("A"), Some("1"));
        assert_eq!(sh.env().get_var("B"), None);
    }

    #[test]
    fn test_run_reader_reports_exit_status_over_last_status() {
        let mut sh = Interpreter::new(Environment::default());
        // `A=1` runs last, but the session still ends with the status of `exit`
        let script = "exit nope || A=1\nB=2\n";
        assert_eq!(sh.run_reader(script.as_bytes()).unwrap(), 2);
        assert_eq!(sh.env().last_return, 0);
        assert_eq!(sh.env().get_var("B"), None);
    }

    #[test]
    fn test_run_reader_without_exit_returns_last_status() {
        let mut sh = Interpreter::new(Environment::default());
        sh.env_mut().last_return = 9;
        assert_eq!(sh.run_reader("\n\n".as_bytes()).unwrap(), 9);
    }
}
