/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::config::Config;
use crate::config::PROTECTED_LIFEBOAT_FD;
use crate::coordinator::CoordinatorLink;
use crate::env;
use crate::env::ProcessEnv;
use crate::event::EventHook;
use crate::guard::ExecGuard;
use crate::identity::IdentityRegistry;
use crate::identity::UniquePid;
use crate::lifeboat;
use crate::log;
use crate::os::Os;
use crate::runtime::Runtime;

/// All process-wide state of the interception layer, together with the
/// collaborators it acts through. The exported libc overrides forward to a
/// single global instance.
pub struct Interceptor<O, R, E> {
    pub(crate) os: O,
    pub(crate) runtime: R,
    pub(crate) env: E,
    pub(crate) config: Config,
    pub(crate) guard: ExecGuard,
    pub(crate) identity: IdentityRegistry,
    pub(crate) coordinator: CoordinatorLink,
    pub(crate) hooks: EventHook,
    /// Set while our own fork is in flight, so the fork child handler only
    /// acts on forks that went through the wrapper.
    pub(crate) atfork_armed: AtomicBool,
    /// Generation of the child being forked, taken before the fork.
    pub(crate) child_time: AtomicU64,
    /// Host of the parent, so the child does not have to lock the registry.
    pub(crate) fork_host: AtomicU64,
}

impl<O, R, E> Interceptor<O, R, E>
where
    O: Os,
    R: Runtime,
    E: ProcessEnv,
{
    pub fn new(os: O, runtime: R, env: E, config: Config) -> Self {
        Self {
            os,
            runtime,
            env,
            config,
            guard: ExecGuard::new(),
            identity: IdentityRegistry::new(),
            coordinator: CoordinatorLink::new(),
            hooks: EventHook::new(),
            atfork_armed: AtomicBool::new(false),
            child_time: AtomicU64::new(0),
            fork_host: AtomicU64::new(0),
        }
    }

    pub fn guard(&self) -> &ExecGuard {
        &self.guard
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    pub fn hooks(&self) -> &EventHook {
        &self.hooks
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sets the process up when the library is loaded: hides the injection
    /// libraries from the application's environment and takes over the
    /// identity of the image that exec'd us, if there was one.
    pub fn on_load(&self) {
        env::restore_user_preload(&self.env);

        let pid = self.os.getpid();
        let identity = match lifeboat::recover(PROTECTED_LIFEBOAT_FD) {
            Some(id) if id.pid() == pid => id,
            _ => UniquePid::new(self.os.host_id(), pid, self.os.now()),
        };
        self.identity.set(identity);

        log::init(
            self.config.log.as_deref(),
            &self.config.tmpdir,
            &log::namespace(&self.os.program_name(), &identity),
        );

        tracing::debug!("loaded into {} as {}", self.os.program_name(), identity);
    }

    pub(crate) fn ckpt_in_progress(&self) -> bool {
        self.runtime.worker_state().is_performing_ckpt_restart()
    }

    /// The identity of this process. Created on first use if the library
    /// was never initialized.
    pub(crate) fn current_identity(&self) -> UniquePid {
        match self.identity.current() {
            Some(id) => id,
            None => {
                let id = UniquePid::new(self.os.host_id(), self.os.getpid(), self.os.now());
                self.identity.set(id);
                id
            }
        }
    }

    pub(crate) fn arm_atfork(&self, host_id: u64, child_time: u64) {
        self.fork_host.store(host_id, Ordering::SeqCst);
        self.child_time.store(child_time, Ordering::SeqCst);
        self.atfork_armed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disarm_atfork(&self) {
        self.atfork_armed.store(false, Ordering::SeqCst);
    }
}
