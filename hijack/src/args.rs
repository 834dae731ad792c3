/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ffi::CStr;
use std::ffi::CString;

use libc::c_char;
use syscalls::Errno;

/// Headroom added to a copied argument vector for subscribers and rewrites.
pub const MAX_EXTRA_ARGS: usize = 32;

/// Headroom added to a copied environment for re-injected entries.
pub const MAX_EXTRA_ENV: usize = 32;

/// Initial size of the buffer used to collect variadic exec arguments.
pub const INITIAL_ARGV_MAX: usize = 128;

/// An owned, NULL-terminated array of C strings with a fixed upper bound on
/// its length. The pointer array never reallocates, so pointers handed out by
/// [`BoundedArgs::as_ptr`] stay valid while entries are added.
#[derive(Debug)]
pub struct BoundedArgs {
    items: Vec<CString>,
    ptrs: Vec<*const c_char>,
    capacity: usize,
}

// The raw pointers only ever point into `items`, which this struct owns.
unsafe impl Send for BoundedArgs {}

impl BoundedArgs {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut result = BoundedArgs {
            items: Vec::with_capacity(capacity),
            ptrs: Vec::with_capacity(capacity + 1),
            capacity,
        };
        result.ptrs.push(core::ptr::null());
        result
    }

    /// Copies a NULL-terminated vector, leaving room for `slack` more
    /// entries. A NULL vector is treated as empty.
    ///
    /// # Safety
    ///
    /// `vector` must be NULL or point to a NULL-terminated array of valid C
    /// strings.
    pub unsafe fn copy_from_raw(vector: *const *const c_char, slack: usize) -> Self {
        let mut count = 0;
        if !vector.is_null() {
            while !unsafe { *vector.add(count) }.is_null() {
                count += 1;
            }
        }

        let mut result = Self::with_capacity(count + slack);
        for i in 0..count {
            result.push(unsafe { CStr::from_ptr(*vector.add(i)) }.to_owned());
        }
        result
    }

    pub fn from_items<I>(items: I, slack: usize) -> Self
    where
        I: IntoIterator<Item = CString>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        let mut result = Self::with_capacity(items.len() + slack);
        result.extend(items);
        result
    }

    /// Appends an entry. Growing past the declared capacity is a contract
    /// violation by the caller and panics.
    pub fn push(&mut self, item: CString) {
        assert!(
            self.items.len() < self.capacity,
            "argument vector capacity of {} exceeded",
            self.capacity
        );
        let l = self.ptrs.len();
        self.ptrs[l - 1] = item.as_ptr();
        self.ptrs.push(core::ptr::null());
        self.items.push(item);
    }

    /// Inserts an entry at `index`, shifting later entries back.
    pub fn insert(&mut self, index: usize, item: CString) {
        assert!(
            self.items.len() < self.capacity,
            "argument vector capacity of {} exceeded",
            self.capacity
        );
        self.ptrs.insert(index, item.as_ptr());
        self.items.insert(index, item);
    }

    pub fn set(&mut self, i: usize, item: CString) {
        self.ptrs[i] = item.as_ptr();
        self.items[i] = item;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, i: usize) -> &CStr {
        self.items[i].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.items.iter().map(|x| x.as_ref())
    }

    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

impl Extend<CString> for BoundedArgs {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = CString>,
    {
        for item in iter {
            self.push(item);
        }
    }
}

/// Collects the arguments of a variadic exec call into a NULL-terminated
/// pointer vector. `first` is the first argument and `next` yields the rest
/// until it returns NULL. The strings themselves are not copied.
pub fn collect_variadic_argv<F>(
    first: *const c_char,
    mut next: F,
) -> Result<Vec<*const c_char>, Errno>
where
    F: FnMut() -> *const c_char,
{
    let mut argv: Vec<*const c_char> = Vec::new();
    argv.try_reserve_exact(INITIAL_ARGV_MAX)
        .map_err(|_| Errno::ENOMEM)?;

    let mut arg = first;
    loop {
        if argv.len() == argv.capacity() {
            argv.try_reserve_exact(argv.capacity())
                .map_err(|_| Errno::ENOMEM)?;
        }
        argv.push(arg);
        if arg.is_null() {
            return Ok(argv);
        }
        arg = next();
    }
}
