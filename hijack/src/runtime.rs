/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The checkpoint runtime as seen from the interception layer.

use std::ffi::CStr;
use std::ffi::CString;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use crate::coordinator;
use crate::error::Error;
use crate::identity::UniquePid;

/// What the checkpoint worker of this process is doing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum WorkerState {
    Unknown = 0,
    Running = 1,
    Suspended = 2,
    Checkpointing = 3,
    Restarting = 4,
}

impl WorkerState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::Running),
            2 => Some(Self::Suspended),
            3 => Some(Self::Checkpointing),
            4 => Some(Self::Restarting),
            _ => None,
        }
    }

    /// True while a checkpoint or restart is under way. The runtime's own
    /// plugins may fork and exec during that time, and must not be
    /// intercepted.
    pub fn is_performing_ckpt_restart(self) -> bool {
        !matches!(self, Self::Unknown | Self::Running)
    }
}

static WORKER_STATE: AtomicU8 = AtomicU8::new(WorkerState::Unknown as u8);

/// Updates the process-wide worker state.
pub fn set_worker_state(state: WorkerState) {
    WORKER_STATE.store(state as u8, Ordering::SeqCst);
}

/// Reads the process-wide worker state.
pub fn worker_state() -> WorkerState {
    WorkerState::from_u8(WORKER_STATE.load(Ordering::SeqCst)).unwrap_or(WorkerState::Unknown)
}

/// The collaborators the interception layer calls out to.
pub trait Runtime: Send + Sync {
    fn worker_state(&self) -> WorkerState;

    /// Opens the coordinator connection for a process about to be forked.
    /// `None` means this process runs without a coordinator.
    fn create_connection_before_fork(
        &self,
        label: &str,
        parent: Option<UniquePid>,
    ) -> Result<Option<OwnedFd>, Error>;

    /// Reports a child created by fork, from the parent.
    fn on_child_forked(&self, child: &UniquePid);

    /// Maps a virtual pty name to the name of the real device.
    fn real_pty_name(&self, virt: &CStr) -> Option<CString>;

    /// Runs in a freshly forked child right after the interception layer has
    /// reset its own state.
    fn reset_threads_on_fork(&self) {}
}

/// The runtime used when the library is preloaded on its own.
#[derive(Debug, Default)]
pub struct DefaultRuntime {
    coord_sock: Option<PathBuf>,
}

impl DefaultRuntime {
    pub fn new(coord_sock: Option<PathBuf>) -> Self {
        Self { coord_sock }
    }
}

impl Runtime for DefaultRuntime {
    fn worker_state(&self) -> WorkerState {
        worker_state()
    }

    fn create_connection_before_fork(
        &self,
        label: &str,
        parent: Option<UniquePid>,
    ) -> Result<Option<OwnedFd>, Error> {
        match &self.coord_sock {
            Some(path) => coordinator::connect(path, label, parent).map(Some),
            None => Ok(None),
        }
    }

    fn on_child_forked(&self, child: &UniquePid) {
        tracing::debug!("forked child {}", child);
    }

    fn real_pty_name(&self, _virt: &CStr) -> Option<CString> {
        // No pty virtualization without a coordinator-side plugin.
        None
    }
}
