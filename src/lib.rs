//! A small POSIX-flavored shell.
//!
//! A line of input goes through three stages:
//!
//! - [`lexer`] splits it into words, assignment words, io numbers and operators.
//! - [`parser`] builds an [`AstNode`] tree of simple commands joined by `|`, `&&`,
//!   `||` and `;`.
//! - [`Interpreter`] walks the tree. `echo`, `cd`, `exit` and `kill` run in-process;
//!   anything else is looked up on `PATH`, forked and exec'd. Pipelines and
//!   redirections are plain descriptor plumbing (`pipe`, `dup2`, `waitpid`).
//!
//! Session state (variables, last status, the exit request) lives in [`Environment`].

mod builtin;
pub mod command;
pub mod env;
mod external;
mod interpreter;
pub mod lexer;
pub mod parser;
pub mod redirect;

pub use builtin::is_builtin;
pub use env::Environment;
pub use external::{DEFAULT_PATH, ExecError, find_command_path};
/// Just a convenient re-export of the command runner.
///
/// See [`Interpreter`] for the high-level API and examples.
pub use interpreter::{ExecOptions, Interpreter};
pub use parser::{AstNode, ParsingError, parse_line};
