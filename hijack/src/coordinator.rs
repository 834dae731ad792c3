/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The control-plane link to the coordinator.

use std::io;
use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::OwnedFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use bincode::Options;
use serde::Deserialize;
use serde::Serialize;

use crate::config::PROTECTED_COORD_FD;
use crate::error::AddContext;
use crate::error::Context;
use crate::error::Error;
use crate::identity::UniquePid;
use crate::os::Os;
use crate::runtime::Runtime;

/// Messages a process sends to the coordinator.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First message on every new connection. `label` names the process the
    /// connection is for, which may not exist yet.
    Hello {
        label: String,
        parent: Option<UniquePid>,
    },
}

fn bincode_options() -> impl bincode::Options {
    // Both ends must agree on these options.
    bincode::DefaultOptions::new().with_limit(1 << 20)
}

/// Encodes `item` as a frame prefixed with its big-endian `u32` length.
pub fn encode<T>(item: &T, buf: &mut Vec<u8>) -> io::Result<()>
where
    T: Serialize,
{
    let mut cursor = io::Cursor::new(buf);
    cursor.write_all(&[0, 0, 0, 0])?;

    bincode_options()
        .serialize_into(&mut cursor, item)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("failed to encode frame: {}", e)))?;

    let buf = cursor.into_inner();
    let size = buf[4..].len() as u32;
    buf[0..4].copy_from_slice(&size.to_be_bytes());

    Ok(())
}

/// Reads one length-prefixed frame from `reader`.
pub fn decode_from<'a, T, R>(mut reader: R, buf: &'a mut Vec<u8>) -> io::Result<T>
where
    T: Deserialize<'a>,
    R: io::Read,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head)?;

    let len = u32::from_be_bytes(head) as usize;
    buf.resize(len, 0);
    reader.read_exact(buf)?;

    bincode_options()
        .deserialize(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("failed to decode frame: {}", e)))
}

/// Opens a new connection to the coordinator at `path` on behalf of the
/// process named `label`.
pub fn connect(path: &Path, label: &str, parent: Option<UniquePid>) -> Result<OwnedFd, Error> {
    let mut stream = UnixStream::connect(path).context(Context::Connect)?;

    let mut buf = Vec::with_capacity(256);
    encode(
        &Message::Hello {
            label: label.to_owned(),
            parent,
        },
        &mut buf,
    )
    .context(Context::Connect)?;
    stream.write_all(&buf).context(Context::Connect)?;

    Ok(OwnedFd::from(stream))
}

/// Tracks the connection created ahead of a fork until it is known which
/// side of the fork it belongs to.
#[derive(Debug)]
pub struct CoordinatorLink {
    pending: AtomicI32,
}

impl Default for CoordinatorLink {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorLink {
    pub const fn new() -> Self {
        Self {
            pending: AtomicI32::new(-1),
        }
    }

    /// Creates the connection the child of the next fork will use. When the
    /// runtime runs without a coordinator there is nothing to create.
    pub fn duplicate_before_fork<R: Runtime + ?Sized>(
        &self,
        runtime: &R,
        label: &str,
        parent: Option<UniquePid>,
    ) -> Result<(), Error> {
        if let Some(fd) = runtime.create_connection_before_fork(label, parent)? {
            let old = self.pending.swap(fd.into_raw_fd(), Ordering::SeqCst);
            debug_assert_eq!(old, -1, "leaked a pre-fork connection");
        }
        Ok(())
    }

    /// Returns the descriptor created by the last
    /// [`CoordinatorLink::duplicate_before_fork`], if it is still pending.
    pub fn pending(&self) -> Option<RawFd> {
        let fd = self.pending.load(Ordering::SeqCst);
        (fd >= 0).then_some(fd)
    }

    /// Makes the pre-fork connection the child's own. This replaces the
    /// connection inherited from the parent, which must not be shared.
    pub fn promote_in_child<O: Os + ?Sized>(&self, os: &O) {
        let fd = self.pending.swap(-1, Ordering::SeqCst);
        if fd < 0 {
            return;
        }
        if fd != PROTECTED_COORD_FD {
            if let Err(err) = os.dup2(fd, PROTECTED_COORD_FD) {
                tracing::error!("failed to install coordinator connection: {}", err);
            }
            let _ = os.close(fd);
        }
    }

    /// Drops the pre-fork connection on the parent side.
    pub fn discard_in_parent<O: Os + ?Sized>(&self, os: &O) {
        let fd = self.pending.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            let _ = os.close(fd);
        }
    }

    /// Closes this process's own connection.
    pub fn close<O: Os + ?Sized>(&self, os: &O) {
        let _ = os.close(PROTECTED_COORD_FD);
    }
}
