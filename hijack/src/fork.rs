/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `fork`, `vfork` and `daemon`.

use std::sync::atomic::Ordering;

use libc::pid_t;
use syscalls::Errno;

use crate::env::ProcessEnv;
use crate::error::AddContext;
use crate::error::Context;
use crate::error::Error;
use crate::event::Event;
use crate::identity::UniquePid;
use crate::interceptor::Interceptor;
use crate::log;
use crate::os::Os;
use crate::runtime::Runtime;

fn forked_label(program: &str) -> String {
    format!("{}_(forked)", program)
}

impl<O, R, E> Interceptor<O, R, E>
where
    O: Os,
    R: Runtime,
    E: ProcessEnv,
{
    /// Forks the process. The child gets a new identity and its own
    /// coordinator connection before anything else runs in it.
    pub fn fork(&self) -> Result<pid_t, Error> {
        if self.ckpt_in_progress() {
            return self.os.fork().context(Context::Fork);
        }

        let guard = self.guard.acquire_exclusive();

        self.hooks.notify(&mut Event::AtforkPrepare);

        // Both sides of the fork derive the child's identity from these.
        let child_time = self.os.now();
        let parent = self.current_identity();
        let label = forked_label(&self.os.program_name());

        if let Err(err) = self
            .coordinator
            .duplicate_before_fork(&self.runtime, &label, Some(parent))
        {
            tracing::error!("not forking {}: {}", label, err);
            return Err(err);
        }

        self.arm_atfork(parent.host_id(), child_time);

        let res = self.os.fork();

        if let Ok(0) = res {
            // The fork child handler normally did this already.
            self.on_fork_child();
            // Recreating threads allocates. Only now have the child handlers
            // registered after ours reset the locks they own.
            self.runtime.reset_threads_on_fork();
            guard.disarm();
            return Ok(0);
        }

        self.disarm_atfork();

        let child = res.ok().map(|pid| parent.child(pid, child_time));
        if let Some(child) = &child {
            self.identity.record_child(*child);
            self.runtime.on_child_forked(child);
            tracing::debug!("forked {}", child);
        }

        self.coordinator.discard_in_parent(&self.os);
        self.hooks.notify(&mut Event::AtforkParent { child });

        drop(guard);
        res.context(Context::Fork)
    }

    /// Runs first thing in the child of a fork made by [`Interceptor::fork`].
    /// Every lock another thread of the parent might have held is reset
    /// before any of them is taken.
    pub fn on_fork_child(&self) {
        if !self.atfork_armed.swap(false, Ordering::SeqCst) {
            return;
        }

        self.guard.reset_on_fork();

        let id = UniquePid::new(
            self.fork_host.load(Ordering::SeqCst),
            self.os.getpid(),
            self.child_time.load(Ordering::SeqCst),
        );
        self.identity.reset_on_fork(id);
        self.hooks.reset_on_fork();

        log::reopen_after_fork(
            &self.config.tmpdir,
            &log::namespace(&forked_label(&self.os.program_name()), &id),
        );

        self.coordinator.promote_in_child(&self.os);

        self.hooks.notify(&mut Event::AtforkChild);
        tracing::debug!("child of fork is {}", id);
    }

    /// `vfork` cannot be supported since the child shares our memory. It is
    /// an ordinary fork instead.
    pub fn vfork(&self) -> Result<pid_t, Error> {
        self.fork()
    }

    /// Detaches from the controlling terminal through the intercepted fork,
    /// so the daemon stays part of the checkpointed tree.
    pub fn daemon(&self, nochdir: bool, noclose: bool) -> Result<(), Error> {
        if self.fork()? != 0 {
            self.os.exit(0);
        }

        self.os.setsid().context(Context::Daemon)?;

        if !nochdir {
            if let Err(err) = self.os.chdir(c"/") {
                tracing::warn!("daemon could not change to /: {}", err);
            }
        }

        if !noclose {
            let fd = self
                .os
                .open(c"/dev/null", libc::O_RDWR)
                .map_err(|_| Error::new(Errno::ENODEV, Context::Daemon))?;
            for stdio in 0..3 {
                self.os.dup2(fd, stdio).context(Context::Daemon)?;
            }
            if fd > 2 {
                let _ = self.os.close(fd);
            }
        }

        Ok(())
    }
}
