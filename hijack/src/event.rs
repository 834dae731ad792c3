/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lifecycle events published to in-process plugins.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::args::BoundedArgs;
use crate::identity::UniquePid;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventKind {
    AtforkPrepare,
    AtforkParent,
    AtforkChild,
    PreExec,
}

/// The exec about to happen. Subscribers may rewrite the program and its
/// arguments, within the capacity of the copies.
#[derive(Debug)]
pub struct PreExec<'a> {
    pub filename: &'a mut CString,
    pub argv: &'a mut BoundedArgs,
    pub envp: &'a mut BoundedArgs,
    /// Anything written here is readable by the new image.
    pub serialization_fd: RawFd,
}

#[derive(Debug)]
pub enum Event<'a> {
    /// In the parent, right before the fork, with the execution lock held.
    AtforkPrepare,
    /// In the parent, after the fork returned. `child` is `None` if it failed.
    AtforkParent { child: Option<UniquePid> },
    /// In the child, from the fork child handler.
    AtforkChild,
    /// Before exec, after the arguments were copied and before they are
    /// rewritten.
    PreExec(PreExec<'a>),
}

impl<'a> Event<'a> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AtforkPrepare => EventKind::AtforkPrepare,
            Self::AtforkParent { .. } => EventKind::AtforkParent,
            Self::AtforkChild => EventKind::AtforkChild,
            Self::PreExec(_) => EventKind::PreExec,
        }
    }
}

pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &mut Event);
}

/// Synchronous, ordered delivery of events to subscribers.
///
/// Delivery order mirrors `pthread_atfork`: [`Event::AtforkPrepare`] goes to
/// the most recent subscriber first, every other event to the oldest
/// subscriber first.
#[derive(Default)]
pub struct EventHook {
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl EventHook {
    pub const fn new() -> Self {
        Self {
            subscribers: parking_lot::const_mutex(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    pub fn notify(&self, event: &mut Event) {
        // Subscribers run without the lock held so they may subscribe others.
        let subscribers = self.subscribers.lock().clone();

        if event.kind() == EventKind::AtforkPrepare {
            for subscriber in subscribers.iter().rev() {
                subscriber.on_event(event);
            }
        } else {
            for subscriber in subscribers.iter() {
                subscriber.on_event(event);
            }
        }
    }

    /// The subscriber list may have been locked by another thread of the
    /// parent at the time of the fork.
    pub fn reset_on_fork(&self) {
        if self.subscribers.is_locked() {
            unsafe { self.subscribers.force_unlock() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    #[test]
    fn prepare_runs_newest_first() {
        let hook = EventHook::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hook.subscribe(Arc::new(Recorder::named("first", log.clone())));
        hook.subscribe(Arc::new(Recorder::named("second", log.clone())));

        hook.notify(&mut Event::AtforkPrepare);
        hook.notify(&mut Event::AtforkChild);
        hook.notify(&mut Event::AtforkParent { child: None });

        assert_eq!(
            *log.lock(),
            [
                ("second", EventKind::AtforkPrepare),
                ("first", EventKind::AtforkPrepare),
                ("first", EventKind::AtforkChild),
                ("second", EventKind::AtforkChild),
                ("first", EventKind::AtforkParent),
                ("second", EventKind::AtforkParent),
            ]
        );
    }

    #[test]
    fn subscribers_may_rewrite_exec() {
        struct Rewriter;

        impl Subscriber for Rewriter {
            fn on_event(&self, event: &mut Event) {
                if let Event::PreExec(pre) = event {
                    *pre.filename = CString::new("/bin/echo").unwrap();
                    pre.argv.push(CString::new("extra").unwrap());
                }
            }
        }

        let hook = EventHook::new();
        hook.subscribe(Arc::new(Rewriter));

        let mut filename = CString::new("/bin/true").unwrap();
        let mut argv = BoundedArgs::from_items([CString::new("true").unwrap()], 1);
        let mut envp = BoundedArgs::with_capacity(0);
        hook.notify(&mut Event::PreExec(PreExec {
            filename: &mut filename,
            argv: &mut argv,
            envp: &mut envp,
            serialization_fd: -1,
        }));

        assert_eq!(filename.to_bytes(), b"/bin/echo");
        assert_eq!(argv.len(), 2);
        assert_eq!(argv.get(1).to_bytes(), b"extra");
    }

    #[test]
    fn reset_after_fork_unlocks() {
        let hook = EventHook::new();
        core::mem::forget(hook.subscribers.lock());
        hook.reset_on_fork();
        hook.notify(&mut Event::AtforkChild);
    }
}
