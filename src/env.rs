use crate::command::ExitCode;
use std::collections::BTreeMap;
use std::env as stdenv;
use std::ffi::CString;
use std::ops::{Deref, DerefMut};

/// Mutable session state threaded through the interpreter.
///
/// The environment contains:
/// - `vars`: variables exported to every external command.
/// - `last_return`: status of the most recently executed node.
/// - `should_exit` / `exit_code`: set by the `exit` builtin; the host loop checks
///   `should_exit` after each line and terminates with `exit_code`.
///
/// The working directory is not stored here: `cd` changes the process's own directory,
/// which children inherit.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub vars: BTreeMap<String, String>,
    pub last_return: ExitCode,
    pub should_exit: bool,
    pub exit_code: ExitCode,
}

impl Environment {
    /// Capture the current process environment into a new session.
    /// Variables that are not valid UTF-8 are left out.
    pub fn new() -> Self {
        Self::from_vars(
            stdenv::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Start a session from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..Self::default()
        }
    }

    /// Get the value of a session variable.
    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set or override a session variable.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Apply a `KEY=VALUE` assignment. Text without `=` is ignored.
    pub fn assign(&mut self, assignment: &str) {
        if let Some((key, value)) = assignment.split_once('=') {
            self.set_var(key, value);
        }
    }

    /// The variables as `KEY=VALUE` C strings, ready for `execve`.
    ///
    /// Entries containing an interior NUL cannot be passed to the OS and are skipped.
    pub fn to_envp(&self) -> Vec<CString> {
        self.vars
            .iter()
            .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
            .collect()
    }

    /// Temporarily replace the variables with exactly `assignments`.
    ///
    /// The previous variables come back when the returned guard is dropped, whichever
    /// way the scope is left.
    pub fn scoped<'a>(&'a mut self, assignments: &[String]) -> ScopedEnv<'a> {
        let mut scoped = BTreeMap::new();
        for assignment in assignments {
            if let Some((key, value)) = assignment.split_once('=') {
                scoped.insert(key.to_string(), value.to_string());
            }
        }
        let saved = std::mem::replace(&mut self.vars, scoped);
        ScopedEnv { env: self, saved }
    }
}

/// Guard returned by [`Environment::scoped`].
pub struct ScopedEnv<'a> {
    env: &'a mut Environment,
    saved: BTreeMap<String, String>,
}

impl Deref for ScopedEnv<'_> {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        self.env
    }
}

impl DerefMut for ScopedEnv<'_> {
    fn deref_mut(&mut self) -> &mut Environment {
        self.env
    }
}

impl Drop for ScopedEnv<'_> {
    fn drop(&mut self) {
        self.env.vars = std::mem::take(&mut self.saved);
    }
}
