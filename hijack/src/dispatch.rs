/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Decides how an exec is handled.

use crate::paths::basename;

/// The framework's own control programs. They must never run under
/// interception.
pub const SELF_TOOLS: &[&[u8]] = &[
    b"hijack_coordinator",
    b"hijack_launch",
    b"hijack_restart",
    b"hijack_restore",
];

/// Relays a command to the coordinator. It is detached from the process tree
/// before it runs so that it is not itself checkpointed.
pub const RELAY_TOOL: &[u8] = b"hijack_command";

/// Programs exec'd without any rewriting.
pub const BYPASS_TOOLS: &[&[u8]] = &[b"hijack_nocheckpoint", RELAY_TOOL, b"ssh", b"rsh"];

/// Shared libraries run as programs (such as `/lib/libc.so.6`). The loader
/// refuses to preload anything into them.
const LIBRARY_PREFIXES: &[&[u8]] = &[b"/lib/lib", b"/lib64/lib"];

/// Short-lived privileged helpers.
const SHORT_LIVED_SUFFIXES: &[&[u8]] = &[b"/utempter"];

/// How far an exec has progressed when it is classified.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    /// Nothing has been done yet.
    Entry,
    /// The execution lock is held and subscribers have seen the exec.
    Prepared,
}

/// Everything classification looks at.
#[derive(Debug, Copy, Clone)]
pub struct Target<'a> {
    /// The program as named by the caller, or as rewritten by a subscriber.
    pub path: &'a [u8],
    pub stage: Stage,
    pub ckpt_in_progress: bool,
    /// Running the program elevates privileges.
    pub privileged: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecCase {
    /// A checkpoint or restart is under way. Call straight through.
    BypassCkptInProgress,
    /// A framework control program. Refused.
    BypassSelfTool,
    /// Detach from the process tree, then exec unmodified.
    SpecialRelaunch,
    /// Exec unmodified.
    BypassTransparent,
    /// Run as a subprocess, forward its output and exit.
    ShortLivedCapture,
    /// Run the program indirectly, through its loader.
    PrivilegedRewrite,
    FullIntercept,
}

impl ExecCase {
    /// Returns true if the exec proceeds without the execution lock.
    pub fn is_unlocked(self) -> bool {
        matches!(
            self,
            Self::BypassCkptInProgress | Self::BypassSelfTool | Self::SpecialRelaunch
        )
    }
}

fn has_prefix(path: &[u8], prefixes: &[&[u8]]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p))
}

fn has_suffix(path: &[u8], suffixes: &[&[u8]]) -> bool {
    suffixes.iter().any(|s| path.ends_with(s))
}

/// Classifies an exec. Conditions are checked in a fixed priority order; the
/// first three only apply on entry, before the execution lock is taken.
pub fn classify(target: &Target) -> ExecCase {
    let name = basename(target.path);

    if target.stage == Stage::Entry {
        if target.ckpt_in_progress {
            return ExecCase::BypassCkptInProgress;
        }
        if SELF_TOOLS.contains(&name) {
            return ExecCase::BypassSelfTool;
        }
        if name == RELAY_TOOL {
            return ExecCase::SpecialRelaunch;
        }
    }

    if BYPASS_TOOLS.contains(&name) {
        return ExecCase::BypassTransparent;
    }

    if has_prefix(target.path, LIBRARY_PREFIXES) || has_suffix(target.path, SHORT_LIVED_SUFFIXES) {
        return ExecCase::ShortLivedCapture;
    }

    if target.privileged {
        return ExecCase::PrivilegedRewrite;
    }

    ExecCase::FullIntercept
}
