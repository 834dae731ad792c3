/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use nix::unistd::AccessFlags;
use nix::unistd::access;

/// Search path used when `PATH` is not set.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Locates the files of an installation.
#[derive(Debug, Clone, Default)]
pub struct InstallPaths {
    install_dir: Option<PathBuf>,
}

impl InstallPaths {
    pub fn new(install_dir: Option<PathBuf>) -> Self {
        Self { install_dir }
    }

    pub fn install_dir(&self) -> Option<&Path> {
        self.install_dir.as_deref()
    }

    /// Resolves a library by its base name inside the installation. Returns
    /// the name unchanged if no candidate exists.
    pub fn resolve(&self, name: &OsStr, is_32bit: bool) -> PathBuf {
        let Some(dir) = &self.install_dir else {
            return PathBuf::from(name);
        };

        let candidates: &[&str] = if is_32bit {
            &["lib/hijack/32", "lib32/hijack", "lib32"]
        } else {
            &["lib/hijack", "lib64/hijack", "lib"]
        };

        candidates
            .iter()
            .map(|sub| dir.join(sub).join(name))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

/// Finds the program `exec*p` would run for `file`. Names containing a slash
/// are used as they are.
pub fn resolve_program(file: &OsStr, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if file.is_empty() {
        return None;
    }

    if file.as_bytes().contains(&b'/') {
        return Some(PathBuf::from(file));
    }

    let path_var = path_var.unwrap_or_else(|| OsStr::new(DEFAULT_PATH));
    std::env::split_paths(path_var)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(file)
            } else {
                dir.join(file)
            }
        })
        .find(|candidate| candidate.is_file() && access(candidate, AccessFlags::X_OK).is_ok())
}

/// Returns true if running `path` elevates privileges.
pub fn is_privileged(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & (libc::S_ISUID | libc::S_ISGID) != 0)
        .unwrap_or(false)
}

/// The last component of a path, as bytes.
pub fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}
