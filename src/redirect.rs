//! File redirections applied to the shell's own descriptors.
//!
//! [`RedirectGuard::apply`] applies each redirection in order. Before a descriptor is
//! replaced for the first time, the guard keeps a close-on-exec copy of it (or notes
//! that it was closed). Dropping the guard puts every touched descriptor back the way it
//! was, which also happens when a redirection fails halfway.

use crate::parser::{RedirectOp, Redirection};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::{close, dup2};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use thiserror::Error;

/// Permission bits for files created by `>` and `>>`.
const CREATE_MODE: u32 = 0o644;

/// Saved copies are placed at or above this descriptor.
const SAVE_FLOOR: RawFd = 10;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("{path}: {}", os_message(.source))]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {}", .source.desc())]
    Dup {
        path: String,
        #[source]
        source: Errno,
    },
}

/// `strerror`-style text for an I/O error, without Rust's "(os error N)" suffix.
pub fn os_message(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).desc().to_string(),
        None => err.to_string(),
    }
}

/// State of one descriptor before the guard replaced it.
struct Saved {
    fd: RawFd,
    /// `None` if `fd` was not open.
    copy: Option<OwnedFd>,
}

/// Restores every descriptor it redirected when dropped.
#[must_use = "dropping the guard immediately restores the descriptors"]
pub struct RedirectGuard {
    saved: Vec<Saved>,
}

impl RedirectGuard {
    /// Applies `redirections` in list order. A later redirection of the same
    /// descriptor wins.
    pub fn apply(redirections: &[Redirection]) -> Result<Self, RedirectError> {
        flush_stdout();
        let mut guard = RedirectGuard { saved: Vec::new() };
        for redir in redirections {
            guard.redirect(redir)?;
        }
        Ok(guard)
    }

    /// Leaves the redirections in place for good.
    ///
    /// Used right before replacing the process image: the saved copies are
    /// close-on-exec, so they vanish with the old image.
    pub fn keep(self) {
        std::mem::forget(self);
    }

    /// Remembers the current state of `fd` unless it was already recorded.
    fn save(&mut self, fd: RawFd) -> nix::Result<()> {
        if self.saved.iter().any(|s| s.fd == fd) {
            return Ok(());
        }
        // An earlier copy may occupy `fd`; move it out of the way. `fd` was free
        // when that copy was made, so it counts as closed below.
        if let Some(holder) = self
            .saved
            .iter_mut()
            .find(|s| s.copy.as_ref().is_some_and(|c| c.as_raw_fd() == fd))
        {
            holder.copy = Some(dup_above(fd, fd + 1)?);
        }
        let copy = match dup_above(fd, SAVE_FLOOR) {
            Ok(copy) => Some(copy),
            Err(Errno::EBADF) => None,
            Err(e) => return Err(e),
        };
        self.saved.push(Saved { fd, copy });
        Ok(())
    }

    /// Opens the target of one redirection and moves it onto its descriptor.
    fn redirect(&mut self, redir: &Redirection) -> Result<(), RedirectError> {
        let target = redir.target_fd();
        let dup_error = |source: Errno| RedirectError::Dup {
            path: redir.word.clone(),
            source,
        };
        self.save(target).map_err(dup_error)?;

        let file = open_target(redir).map_err(|source| RedirectError::Open {
            path: redir.word.clone(),
            source,
        })?;
        if file.as_raw_fd() == target {
            // Already in place; keep it open and inheritable instead of closing it.
            let fd = file.into_raw_fd();
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(dup_error)?;
            return Ok(());
        }

        dup2(file.as_raw_fd(), target).map_err(dup_error)?;
        tracing::trace!(fd = target, file = %redir.word, op = redir.op.as_str(), "redirected");
        Ok(())
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        flush_stdout();
        for saved in self.saved.drain(..).rev() {
            let result = match &saved.copy {
                Some(copy) => dup2(copy.as_raw_fd(), saved.fd).map(drop),
                // Nothing to close if the redirection failed before reaching it.
                None => match close(saved.fd) {
                    Err(Errno::EBADF) => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = result {
                tracing::warn!(fd = saved.fd, error = %e, "failed to restore descriptor");
            }
        }
    }
}

/// Close-on-exec duplicate of `fd` on the lowest free descriptor `>= floor`.
fn dup_above(fd: RawFd, floor: RawFd) -> nix::Result<OwnedFd> {
    let copy = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    // SAFETY: `copy` is a freshly created descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(copy) })
}

fn flush_stdout() {
    if let Err(e) = io::stdout().flush() {
        tracing::debug!(error = %e, "flushing stdout failed");
    }
}

fn open_target(redir: &Redirection) -> io::Result<File> {
    let mut options = OpenOptions::new();
    match redir.op {
        RedirectOp::Input => options.read(true),
        RedirectOp::Output => options.write(true).create(true).truncate(true).mode(CREATE_MODE),
        RedirectOp::Append => options.append(true).create(true).mode(CREATE_MODE),
    };
    options.open(&redir.word)
}
