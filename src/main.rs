use anyhow::Result;
use argh::FromArgs;
use minishell::{Environment, ExecOptions, Interpreter};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// A minimal shell: pipelines, `&&`/`||`/`;` lists, file redirections and the
/// `echo`, `cd`, `exit` and `kill` builtins.
#[derive(FromArgs)]
struct Cli {
    /// run this command line and exit
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// let builtins ignore file redirections
    #[argh(switch)]
    no_builtin_redirects: bool,

    /// read commands from this file instead of standard input
    #[argh(positional)]
    script: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<i32> {
    let options = ExecOptions {
        redirect_builtins: !cli.no_builtin_redirects,
    };
    let mut shell = Interpreter::with_options(Environment::new(), options);

    if let Some(command) = cli.command {
        shell.run_line(&command);
        return Ok(if shell.should_exit() {
            shell.exit_code()
        } else {
            shell.env().last_return
        });
    }

    match cli.script {
        Some(path) => match File::open(&path) {
            Ok(file) => shell.run_reader(BufReader::new(file)),
            Err(e) => {
                eprintln!(
                    "minishell: {}: {}",
                    path.display(),
                    minishell::redirect::os_message(&e)
                );
                Ok(1)
            }
        },
        None => shell.repl(),
    }
}

fn main() {
    // Logs go to stderr and are off unless RUST_LOG asks for them.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let code = match run(argh::from_env()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("minishell: {:#}", e);
            1
        }
    };
    if let Err(e) = io::stdout().flush() {
        tracing::debug!(error = %e, "flushing stdout failed");
    }
    std::process::exit(code);
}
