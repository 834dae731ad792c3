/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Just enough ELF inspection to pick injection libraries and to run
//! privileged programs through their loader.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use goblin::elf::Elf;
use goblin::elf::header::EI_CLASS;
use goblin::elf::header::ELFCLASS32;
use goblin::elf::header::ELFCLASS64;
use goblin::elf::header::ELFMAG;
use goblin::elf::header::SELFMAG;
use syscalls::Errno;

use crate::error::AddContext;
use crate::error::Context;
use crate::error::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

/// Returns the class of the ELF file at `path`, or `None` if it cannot be
/// read or is not an ELF file.
pub fn elf_class(path: &Path) -> Option<ElfClass> {
    let mut ident = [0u8; EI_CLASS + 1];
    File::open(path).ok()?.read_exact(&mut ident).ok()?;

    if ident[..SELFMAG] != ELFMAG[..] {
        return None;
    }

    match ident[EI_CLASS] {
        ELFCLASS32 => Some(ElfClass::Elf32),
        ELFCLASS64 => Some(ElfClass::Elf64),
        _ => None,
    }
}

/// Returns the program interpreter requested by the ELF file at `path`.
/// Statically linked programs have none.
pub fn interpreter(path: &Path) -> Result<Option<PathBuf>, Error> {
    let bytes = std::fs::read(path).context(Context::Privileged)?;
    let elf = Elf::parse(&bytes).map_err(|_| Error::new(Errno::ENOEXEC, Context::Privileged))?;
    Ok(elf.interpreter.map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn classifies_current_exe() {
        let exe = std::env::current_exe().unwrap();
        let expected = if cfg!(target_pointer_width = "64") {
            ElfClass::Elf64
        } else {
            ElfClass::Elf32
        };
        assert_eq!(elf_class(&exe), Some(expected));
    }

    #[test]
    fn classifies_32_bit_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x7fELF\x01\x01\x01\0\0\0\0\0\0\0\0\0").unwrap();
        assert_eq!(elf_class(file.path()), Some(ElfClass::Elf32));
    }

    #[test]
    fn rejects_non_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho hello\n").unwrap();
        assert_eq!(elf_class(file.path()), None);
        assert_eq!(
            interpreter(file.path()).unwrap_err().errno(),
            Errno::ENOEXEC
        );
        assert_eq!(elf_class(Path::new("/does/not/exist")), None);
    }

    #[test]
    fn finds_loader_of_dynamic_exe() {
        let exe = std::env::current_exe().unwrap();
        let interp = interpreter(&exe).unwrap().unwrap();
        assert!(interp.is_absolute());
    }
}
