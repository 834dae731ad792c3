/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Settings inherited from the launcher through the environment.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use clap::Parser;

use crate::paths::InstallPaths;

/// First descriptor of the range reserved for the interception layer. The
/// whole range survives exec.
pub const PROTECTED_FD_START: RawFd = 820;
/// One past the last reserved descriptor.
pub const PROTECTED_FD_END: RawFd = 830;
/// Connection to the coordinator.
pub const PROTECTED_COORD_FD: RawFd = 821;
/// State handed across exec.
pub const PROTECTED_LIFEBOAT_FD: RawFd = 822;

// The library has no command line of its own. Every field is bound to an
// environment variable set by the launcher; the flags only exist so the
// settings can be exercised in isolation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Parser)]
#[clap(name = "hijack")]
pub struct Config {
    /// Directory for lifeboats and logs.
    #[clap(long, value_name = "DIR", env = "HIJACK_TMPDIR", default_value = "/tmp")]
    pub tmpdir: PathBuf,

    /// Installation root used to find injection libraries by name.
    #[clap(long, value_name = "DIR", env = "HIJACK_INSTALL_DIR")]
    pub install_dir: Option<PathBuf>,

    /// UNIX socket of the coordinator. Without it, processes run standalone.
    #[clap(long, value_name = "PATH", env = "HIJACK_COORD_SOCK")]
    pub coord_sock: Option<PathBuf>,

    /// Log filter, in `EnvFilter` syntax. Logging is off when unset.
    #[clap(long, value_name = "FILTER", env = "HIJACK_LOG")]
    pub log: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmpdir: PathBuf::from("/tmp"),
            install_dir: None,
            coord_sock: None,
            log: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment. Malformed values fall
    /// back to the defaults, since there is nobody to report them to.
    pub fn from_env() -> Self {
        Self::try_parse_from(["hijack"]).unwrap_or_default()
    }

    pub fn install_paths(&self) -> InstallPaths {
        InstallPaths::new(self.install_dir.clone())
    }
}
