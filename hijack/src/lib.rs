/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process creation under checkpoint control.
//!
//! Preloaded into every process of a checkpointed tree, this library
//! overrides `fork`, `vfork`, `daemon`, `system` and the `exec` family. A
//! forked child gets a fresh identity and its own coordinator connection. An
//! exec'd image gets the injection libraries and the reserved settings
//! propagated to it, along with the identity of the process it replaces. All
//! of it is serialized against checkpointing by an exclusive lock.

#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(feature = "variadic", feature(c_variadic))]

pub mod args;
mod config;
pub mod coordinator;
pub mod dispatch;
mod elf;
pub mod env;
mod error;
mod event;
mod exec;
mod fork;
mod guard;
mod identity;
mod interceptor;
mod lifeboat;
mod log;
mod os;
pub mod paths;
mod runtime;
mod system;
#[cfg(test)]
mod testing;
pub mod wrappers;

pub use args::BoundedArgs;
pub use config::Config;
pub use config::PROTECTED_COORD_FD;
pub use config::PROTECTED_FD_END;
pub use config::PROTECTED_FD_START;
pub use config::PROTECTED_LIFEBOAT_FD;
pub use dispatch::ExecCase;
pub use env::ProcessEnv;
pub use env::SystemEnv;
pub use error::Context;
pub use error::Error;
pub use event::Event;
pub use event::EventHook;
pub use event::EventKind;
pub use event::PreExec;
pub use event::Subscriber;
pub use guard::ExclusiveGuard;
pub use guard::ExecGuard;
pub use guard::Role;
pub use identity::IdentityRegistry;
pub use identity::UniquePid;
pub use interceptor::Interceptor;
pub use os::Os;
pub use os::RealOs;
pub use runtime::DefaultRuntime;
pub use runtime::Runtime;
pub use runtime::WorkerState;
pub use runtime::set_worker_state;
pub use runtime::worker_state;

// Runs when the library is loaded, before `main`.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        wrappers::initialize();
    }
    init
};
