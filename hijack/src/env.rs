/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Environment rewriting for the replacement process image.

use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use libc::c_char;

use crate::args::BoundedArgs;
use crate::args::MAX_EXTRA_ENV;
use crate::elf;
use crate::elf::ElfClass;
use crate::paths::InstallPaths;

pub const COORD_SOCK: &str = "HIJACK_COORD_SOCK";
pub const TMPDIR: &str = "HIJACK_TMPDIR";
pub const INSTALL_DIR: &str = "HIJACK_INSTALL_DIR";
pub const HIJACK_LIBS: &str = "HIJACK_LIBS";
pub const HIJACK_LIBS_M32: &str = "HIJACK_LIBS_M32";
pub const ORIG_LD_PRELOAD: &str = "HIJACK_ORIG_LD_PRELOAD";
pub const ORIG_STACK_LIMIT: &str = "HIJACK_ORIG_STACK_LIMIT";
pub const LOG: &str = "HIJACK_LOG";

pub const LD_PRELOAD: &str = "LD_PRELOAD";
pub const PATH: &str = "PATH";
pub const SCREENDIR: &str = "SCREENDIR";

/// Keys owned by the interception layer. They are stripped from whatever
/// environment the application passes to exec and re-injected from our own.
pub const RESERVED_KEYS: &[&str] = &[
    COORD_SOCK,
    TMPDIR,
    INSTALL_DIR,
    HIJACK_LIBS,
    HIJACK_LIBS_M32,
    ORIG_LD_PRELOAD,
    ORIG_STACK_LIMIT,
    LOG,
];

/// The environment of the running process.
pub trait ProcessEnv: Send + Sync {
    fn var(&self, key: &str) -> Option<OsString>;

    fn set_var(&self, key: &str, value: &OsStr);

    fn remove_var(&self, key: &str);

    /// The NULL-terminated `KEY=value` array exec should inherit.
    fn environ(&self) -> *const *const c_char;

    /// Like [`ProcessEnv::var`], but an empty value counts as unset.
    fn non_empty(&self, key: &str) -> Option<OsString> {
        self.var(key).filter(|v| !v.is_empty())
    }
}

unsafe extern "C" {
    static environ: *const *const c_char;
}

/// The real process environment, accessed through libc so it stays consistent
/// with what the application sees through `getenv`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

fn to_cstring(s: &[u8]) -> Option<CString> {
    CString::new(s).ok()
}

impl ProcessEnv for SystemEnv {
    fn var(&self, key: &str) -> Option<OsString> {
        let key = to_cstring(key.as_bytes())?;
        let value = unsafe { libc::getenv(key.as_ptr()) };
        if value.is_null() {
            None
        } else {
            let value = unsafe { CStr::from_ptr(value) };
            Some(OsString::from_vec(value.to_bytes().to_vec()))
        }
    }

    fn set_var(&self, key: &str, value: &OsStr) {
        if let (Some(key), Some(value)) = (to_cstring(key.as_bytes()), to_cstring(value.as_bytes())) {
            unsafe { libc::setenv(key.as_ptr(), value.as_ptr(), 1) };
        }
    }

    fn remove_var(&self, key: &str) {
        if let Some(key) = to_cstring(key.as_bytes()) {
            unsafe { libc::unsetenv(key.as_ptr()) };
        }
    }

    fn environ(&self) -> *const *const c_char {
        unsafe { environ }
    }
}

/// Splits a `KEY=value` entry. Entries without `=` are all key.
pub fn split_entry(entry: &[u8]) -> (&[u8], &[u8]) {
    match entry.iter().position(|&b| b == b'=') {
        Some(i) => (&entry[..i], &entry[i + 1..]),
        None => (entry, &entry[entry.len()..]),
    }
}

pub fn is_reserved(key: &[u8]) -> bool {
    RESERVED_KEYS.iter().any(|k| k.as_bytes() == key)
}

fn render(key: &str, value: &[u8]) -> CString {
    let mut entry = Vec::with_capacity(key.len() + 1 + value.len());
    entry.extend_from_slice(key.as_bytes());
    entry.push(b'=');
    entry.extend(value.iter().copied().filter(|&b| b != 0));
    // Interior NULs were filtered out above.
    CString::new(entry).unwrap_or_default()
}

/// Computes the libraries to inject into the image at `target`, in load
/// order. The 32-bit list is only used when one is configured and the target
/// is a readable 32-bit ELF file.
pub fn injection_libs<E: ProcessEnv + ?Sized>(
    target: &Path,
    env: &E,
    paths: &InstallPaths,
) -> Vec<OsString> {
    let mut libs = env.var(HIJACK_LIBS).unwrap_or_default();
    let mut is_32bit = false;

    if let Some(m32) = env.var(HIJACK_LIBS_M32) {
        if elf::elf_class(target) == Some(ElfClass::Elf32) {
            libs = m32;
            is_32bit = true;
        }
    }

    libs.as_bytes()
        .split(|&b| b == b':')
        .filter(|lib| !lib.is_empty())
        .map(|lib| {
            let lib = Path::new(OsStr::from_bytes(lib));
            if lib.exists() {
                lib.as_os_str().to_owned()
            } else {
                let name = lib.file_name().unwrap_or(lib.as_os_str());
                paths.resolve(name, is_32bit).into_os_string()
            }
        })
        .collect()
}

/// Drops the segments of a user preload value that are already injected.
fn without_injected(user: &[u8], libs: &[OsString]) -> Vec<u8> {
    let kept: Vec<&[u8]> = user
        .split(|&b| b == b':')
        .filter(|seg| !seg.is_empty() && !libs.iter().any(|lib| lib.as_bytes() == *seg))
        .collect();
    kept.join(&b':')
}

/// Builds the environment block for the image at `target` from the
/// environment the caller passed to exec:
///
///  1. Reserved keys are dropped and the user's `LD_PRELOAD` is set aside.
///  2. Reserved keys are re-injected from this process, except the original
///     preload key which records the user's preload value.
///  3. `LD_PRELOAD` becomes the injection libraries followed by the user's
///     preload value (or this process's, if the caller passed none).
///
/// As a side effect the original preload key of this process is updated so
/// that a failed exec can restore it.
pub fn patch_user_env<E: ProcessEnv + ?Sized>(
    user_env: &BoundedArgs,
    target: &Path,
    env: &E,
    paths: &InstallPaths,
) -> BoundedArgs {
    let mut result = BoundedArgs::with_capacity(user_env.len() + MAX_EXTRA_ENV);
    let mut user_preload: Option<Vec<u8>> = None;

    for entry in user_env.iter() {
        let (key, value) = split_entry(entry.to_bytes());
        if is_reserved(key) {
            tracing::trace!("skipping: {:?}", entry);
            continue;
        }
        if key == LD_PRELOAD.as_bytes() {
            user_preload = Some(value.to_vec());
            continue;
        }
        result.push(entry.to_owned());
    }

    let libs = injection_libs(target, env, paths);

    let orig_preload = user_preload
        .filter(|v| !v.is_empty())
        .or_else(|| env.non_empty(LD_PRELOAD).map(OsString::into_vec))
        .map(|v| without_injected(&v, &libs))
        .filter(|v| !v.is_empty());

    for key in RESERVED_KEYS {
        let value = if *key == ORIG_LD_PRELOAD && orig_preload.is_some() {
            orig_preload.clone()
        } else {
            env.var(key).map(OsString::into_vec)
        };
        if let Some(value) = value {
            let entry = render(key, &value);
            tracing::trace!("injecting: {:?}", entry);
            result.push(entry);
        }
    }

    if let Some(orig) = &orig_preload {
        env.set_var(ORIG_LD_PRELOAD, OsStr::from_bytes(orig));
    }

    let mut preload: Vec<&[u8]> = libs.iter().map(|lib| lib.as_bytes()).collect();
    if let Some(orig) = &orig_preload {
        preload.push(orig);
    }
    if !preload.is_empty() {
        let entry = render(LD_PRELOAD, &preload.join(&b':'));
        tracing::trace!("injecting: {:?}", entry);
        result.push(entry);
    }

    result
}

/// Resets `LD_PRELOAD` to what the application itself asked for, removing
/// the injection libraries from its view of the environment.
pub fn restore_user_preload<E: ProcessEnv + ?Sized>(env: &E) {
    match env.var(ORIG_LD_PRELOAD) {
        Some(orig) => env.set_var(LD_PRELOAD, &orig),
        None => env.remove_var(LD_PRELOAD),
    }
}

/// The preload related variables of the process as they were before an exec
/// attempt modified them.
#[derive(Debug, Clone)]
pub struct PreloadSnapshot {
    preload: Option<OsString>,
    orig_preload: Option<OsString>,
}

impl PreloadSnapshot {
    pub fn take<E: ProcessEnv + ?Sized>(env: &E) -> Self {
        Self {
            preload: env.var(LD_PRELOAD),
            orig_preload: env.var(ORIG_LD_PRELOAD),
        }
    }

    pub fn restore<E: ProcessEnv + ?Sized>(&self, env: &E) {
        for (key, value) in [(LD_PRELOAD, &self.preload), (ORIG_LD_PRELOAD, &self.orig_preload)] {
            match value {
                Some(value) => env.set_var(key, value),
                None => env.remove_var(key),
            }
        }
    }
}
