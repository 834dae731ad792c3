/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error handling.

use core::fmt;
use std::io;

use syscalls::Errno;
use thiserror::Error;

/// Context associated with [`Error`]. Useful for knowing which step of an
/// intercepted call failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Context {
    /// No context provided.
    Unknown,
    /// Creating the coordinator connection ahead of a fork failed.
    Connect,
    /// The fork itself failed.
    Fork,
    /// Creating or writing the lifeboat failed.
    Lifeboat,
    /// The exec primitive returned.
    Exec,
    /// Running a short-lived program under capture failed.
    Capture,
    /// Building the indirect invocation of a privileged program failed.
    Privileged,
    /// Adjusting resource limits failed.
    Limits,
    /// Collecting the argument vector failed.
    Args,
    /// Detaching from the controlling terminal failed.
    Daemon,
    /// Running a shell command failed.
    System,
}

impl Context {
    /// Returns a string representation of the context.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown failure",
            Self::Connect => "connecting to the coordinator failed",
            Self::Fork => "fork failed",
            Self::Lifeboat => "preparing the lifeboat failed",
            Self::Exec => "exec failed",
            Self::Capture => "capturing a short-lived process failed",
            Self::Privileged => "rewriting a privileged invocation failed",
            Self::Limits => "adjusting resource limits failed",
            Self::Args => "collecting arguments failed",
            Self::Daemon => "daemonizing failed",
            Self::System => "running a shell command failed",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from an intercepted call. This is a thin wrapper around
/// [`Errno`] so the caller sees exactly what the real libc call would have
/// reported, plus context for the logs.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("{context}: {errno}")]
pub struct Error {
    errno: Errno,
    context: Context,
}

impl Error {
    /// Creates a new `Error`.
    pub fn new(errno: Errno, context: Context) -> Self {
        Self { errno, context }
    }

    /// Gets the errno.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// Gets the error context.
    pub fn context(&self) -> Context {
        self.context
    }
}

impl From<Errno> for Error {
    fn from(err: Errno) -> Self {
        Self::new(err, Context::Unknown)
    }
}

impl From<Error> for Errno {
    fn from(err: Error) -> Errno {
        err.errno
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::from_raw_os_error(err.errno.into_raw())
    }
}

fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::EIO, Errno::new)
}

pub(crate) trait AddContext<T> {
    fn context(self, context: Context) -> Result<T, Error>;
}

impl<T> AddContext<T> for Result<T, Errno> {
    fn context(self, context: Context) -> Result<T, Error> {
        self.map_err(move |errno| Error::new(errno, context))
    }
}

impl<T> AddContext<T> for Result<T, io::Error> {
    fn context(self, context: Context) -> Result<T, Error> {
        self.map_err(move |err| Error::new(io_errno(&err), context))
    }
}

impl<T> AddContext<T> for Result<T, nix::errno::Errno> {
    fn context(self, context: Context) -> Result<T, Error> {
        self.map_err(move |errno| Error::new(Errno::new(errno as i32), context))
    }
}

/// Stores `errno` for the calling thread, the way a failing libc call does.
pub(crate) fn set_errno(errno: Errno) {
    unsafe { *libc::__errno_location() = errno.into_raw() };
}
