/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The lock that keeps fork, exec, `system` and `daemon` from ever being
//! interleaved with a checkpoint.

use core::cell::UnsafeCell;
use core::hint;
use core::marker::PhantomData;
use core::mem;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::*;

/// The lock word packs the holder's role and thread id so both can be
/// inspected (and reset) with a single atomic access:
///
/// |<---------------------- 64 Bits ---------------------->|
/// |<------ 32 Bits Role ----->|<---- 32 Bits Holder Tid ->|
///
/// A word of zero means nobody holds the lock.
const TID_BITS: u8 = 32;
const TID_MASK: u64 = (1 << TID_BITS) - 1;
const ROLE_SHIFT: u8 = TID_BITS;

/// Number of busy iterations before the waiter starts yielding its time
/// slice.
const SPIN_LIMIT: u32 = 64;

/// Who is holding the exclusive lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum Role {
    /// An intercepted fork, exec, `system` or `daemon` call.
    Wrapper = 1,
    /// The checkpoint trigger.
    Checkpoint = 2,
}

impl Role {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Wrapper),
            2 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

fn encode(role: Role, tid: u32) -> u64 {
    ((role as u64) << ROLE_SHIFT) | tid as u64
}

fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// A process-wide exclusive lock with two roles. Every guarded operation takes
/// it exclusively, so they are serialized against each other and against the
/// checkpoint trigger.
pub struct ExecGuard {
    state: AtomicU64,
}

impl Default for ExecGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecGuard {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Blocks until nobody else holds the lock and takes it for a wrapper
    /// call. Panics if the calling thread already holds it, since that can
    /// only happen if a wrapper re-entered itself.
    #[must_use]
    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire(Role::Wrapper)
    }

    /// Blocks until no guarded operation is in flight and takes the lock on
    /// behalf of the checkpoint trigger.
    #[must_use]
    pub fn lock_for_checkpoint(&self) -> ExclusiveGuard<'_> {
        self.acquire(Role::Checkpoint)
    }

    /// Takes the lock for the checkpoint trigger only if it is free right
    /// now. A signal handler interrupting a guarded operation on its own
    /// thread must use this, because waiting would never finish.
    #[must_use]
    pub fn try_lock_for_checkpoint(&self) -> Option<ExclusiveGuard<'_>> {
        let tid = current_tid();
        self.state
            .compare_exchange(0, encode(Role::Checkpoint, tid), Acquire, Relaxed)
            .ok()
            .map(|_| ExclusiveGuard::new(self))
    }

    fn acquire(&self, role: Role) -> ExclusiveGuard<'_> {
        let tid = current_tid();
        let wanted = encode(role, tid);
        let mut spins = 0;

        loop {
            match self.state.compare_exchange_weak(0, wanted, Acquire, Relaxed) {
                Ok(_) => return ExclusiveGuard::new(self),
                Err(held) => {
                    assert!(
                        held == 0 || (held & TID_MASK) as u32 != tid,
                        "exclusive execution lock re-acquired by thread {} which already holds it",
                        tid
                    );
                }
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn release(&self) {
        let prev = self.state.swap(0, Release);
        assert!(
            prev != 0,
            "exclusive execution lock released while not held, indicating a bug"
        );
    }

    /// Returns true if anyone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Acquire) != 0
    }

    /// Returns the role and thread id of the current holder.
    pub fn holder(&self) -> Option<(Role, u32)> {
        let state = self.state.load(Acquire);
        Role::from_raw((state >> ROLE_SHIFT) as u32).map(|role| (role, (state & TID_MASK) as u32))
    }

    /// Marks the lock free. Only valid in a freshly forked child, where the
    /// holder recorded by the parent no longer exists.
    pub fn reset_on_fork(&self) {
        self.state.store(0, SeqCst);
    }
}

/// Releases the exclusive lock when dropped. The phantom data here is to make
/// the guard `!Send`, since the lock is owned by a thread.
pub struct ExclusiveGuard<'a> {
    owner: &'a ExecGuard,
    _phantom: PhantomData<UnsafeCell<()>>,
}

impl<'a> ExclusiveGuard<'a> {
    fn new(owner: &'a ExecGuard) -> Self {
        ExclusiveGuard {
            owner,
            _phantom: Default::default(),
        }
    }

    /// Gives up the guard without releasing the lock. Used on the child
    /// branch of a fork where the lock has already been reset.
    pub fn disarm(self) {
        mem::forget(self)
    }
}

impl<'a> Drop for ExclusiveGuard<'a> {
    fn drop(&mut self) {
        self.owner.release()
    }
}
