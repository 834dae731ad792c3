/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use core::fmt;
use std::collections::VecDeque;

use libc::pid_t;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

/// Identifies a process across checkpoint and restart. The pid alone is not
/// enough since it is reused, so it is combined with the host and the time
/// the process came into being.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UniquePid {
    host_id: u64,
    pid: pid_t,
    generation: u64,
}

impl UniquePid {
    pub const fn new(host_id: u64, pid: pid_t, generation: u64) -> Self {
        Self {
            host_id,
            pid,
            generation,
        }
    }

    /// The identity of a child of this process on the same host.
    pub const fn child(&self, pid: pid_t, generation: u64) -> Self {
        Self::new(self.host_id, pid, generation)
    }

    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for UniquePid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}-{}-{:x}", self.host_id, self.pid, self.generation)
    }
}

/// Number of forked children remembered by the registry. The runtime's
/// accounting sees every child; this is only the most recent ones.
pub const MAX_RECORDED_CHILDREN: usize = 1024;

/// The identity of the current process and the children it has forked.
pub struct IdentityRegistry {
    current: Mutex<Option<UniquePid>>,
    children: Mutex<VecDeque<UniquePid>>,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    pub const fn new() -> Self {
        Self {
            current: parking_lot::const_mutex(None),
            children: parking_lot::const_mutex(VecDeque::new()),
        }
    }

    pub fn current(&self) -> Option<UniquePid> {
        *self.current.lock()
    }

    pub fn set(&self, id: UniquePid) {
        *self.current.lock() = Some(id);
    }

    /// Records a forked child, forgetting the oldest one once
    /// [`MAX_RECORDED_CHILDREN`] are held.
    pub fn record_child(&self, child: UniquePid) {
        let mut children = self.children.lock();
        if children.len() == MAX_RECORDED_CHILDREN {
            children.pop_front();
        }
        children.push_back(child);
    }

    pub fn children(&self) -> Vec<UniquePid> {
        self.children.lock().iter().copied().collect()
    }

    /// Gives a freshly forked child its own identity. Another thread of the
    /// parent may have held either lock at the moment of the fork; that thread
    /// does not exist here so the locks are released first.
    pub fn reset_on_fork(&self, id: UniquePid) {
        if self.current.is_locked() {
            unsafe { self.current.force_unlock() };
        }
        if self.children.is_locked() {
            unsafe { self.children.force_unlock() };
        }
        *self.current.lock() = Some(id);
        self.children.lock().clear();
    }
}
