/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The lifeboat carries state across exec on a reserved descriptor. It is an
//! unlinked file, so it disappears once the last descriptor to it is closed.

use std::fs::File;
use std::io::Seek;
use std::io::SeekFrom;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use syscalls::Errno;

use crate::error::AddContext;
use crate::error::Context;
use crate::error::Error;
use crate::identity::UniquePid;
use crate::os::Os;

#[derive(Debug)]
pub struct Lifeboat {
    fd: RawFd,
}

impl Lifeboat {
    /// Creates a lifeboat in `tmpdir` holding `identity` and moves it to
    /// `fd`, replacing whatever was open there. The offset is left past the
    /// identity, so whatever subscribers write to `fd` is appended to it.
    pub fn launch<O: Os + ?Sized>(
        os: &O,
        tmpdir: &Path,
        identity: &UniquePid,
        fd: RawFd,
    ) -> Result<Self, Error> {
        let mut file = tempfile::tempfile_in(tmpdir).context(Context::Lifeboat)?;

        bincode::serialize_into(&mut file, identity)
            .map_err(|_| Error::new(Errno::EIO, Context::Lifeboat))?;

        os.dup2(file.as_raw_fd(), fd).context(Context::Lifeboat)?;

        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Closes the lifeboat. Only needed when the exec it was launched for
    /// failed; a successful exec hands it to the new image.
    pub fn close<O: Os + ?Sized>(self, os: &O) {
        if let Err(err) = os.close(self.fd) {
            tracing::warn!("failed to close lifeboat fd {}: {}", self.fd, err);
        }
    }
}

/// Consumes the lifeboat left on `fd` by the image that exec'd us, if any.
/// The descriptor is closed either way once it has been identified as a
/// lifeboat.
pub fn recover(fd: RawFd) -> Option<UniquePid> {
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return None;
    }

    let mut stat = core::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    // Only an unlinked regular file can be ours.
    if stat.st_mode & libc::S_IFMT != libc::S_IFREG || stat.st_nlink != 0 {
        return None;
    }

    let mut file = unsafe { File::from_raw_fd(fd) };
    // The offset is shared with the image that wrote it.
    file.seek(SeekFrom::Start(0)).ok()?;
    bincode::deserialize_from(&mut file).ok()
}
