/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scripted stand-ins for the operating system, the runtime and the process
//! environment.
//!
//! `MockOs` never forks or execs. A scripted fork returns either branch. A
//! successful exec or an exit unwinds with a [`Replaced`] or [`Exited`]
//! payload, which [`expect_replaced`] and [`expect_exit`] catch.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::OwnedFd;
use std::os::unix::io::RawFd;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use libc::c_char;
use libc::c_int;
use libc::pid_t;
use parking_lot::Mutex;
use syscalls::Errno;

use crate::args::BoundedArgs;
use crate::config::Config;
use crate::env::ProcessEnv;
use crate::error::Context;
use crate::error::Error;
use crate::event::Event;
use crate::event::EventKind;
use crate::event::Subscriber;
use crate::identity::UniquePid;
use crate::interceptor::Interceptor;
use crate::os::Os;
use crate::runtime::Runtime;
use crate::runtime::WorkerState;

/// Serializes tests that touch process-wide state.
pub static UNIT_TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// A raw primitive called on [`MockOs`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Call {
    Fork,
    Exec {
        file: String,
        argv: Vec<String>,
        envp: Vec<String>,
    },
    Exit(i32),
    Close(RawFd),
    Dup2(RawFd, RawFd),
    Open(String),
    ClearCloexec(RawFd),
    Setsid,
    Chdir(String),
    Waitpid(pid_t),
    Capture(String),
    Stdout(Vec<u8>),
}

#[derive(Debug, Copy, Clone)]
pub enum ForkOutcome {
    /// Continue as the child, whose pid is given.
    Child(pid_t),
    /// Continue as the parent of the given child.
    Parent(pid_t),
    Fail(Errno),
}

/// Unwinding payload of a successful exec.
#[derive(Debug)]
pub struct Replaced;

/// Unwinding payload of an exit.
#[derive(Debug)]
pub struct Exited(pub i32);

pub struct MockOs {
    calls: Mutex<Vec<Call>>,
    forks: Mutex<VecDeque<ForkOutcome>>,
    pid: AtomicI32,
    exec_error: Mutex<Option<Errno>>,
    chdir_error: Mutex<Option<Errno>>,
    capture: Mutex<Result<Vec<u8>, Errno>>,
    wait_status: AtomicI32,
}

impl Default for MockOs {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOs {
    pub const HOST_ID: u64 = 0xfeed;
    pub const PID: pid_t = 1000;
    pub const NOW: u64 = 1_700_000_000;
    pub const DEV_NULL_FD: RawFd = 7;

    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            forks: Mutex::new(VecDeque::new()),
            pid: AtomicI32::new(Self::PID),
            exec_error: Mutex::new(None),
            chdir_error: Mutex::new(None),
            capture: Mutex::new(Ok(Vec::new())),
            wait_status: AtomicI32::new(0),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Scripts the outcome of the next fork. Unscripted forks return to the
    /// parent.
    pub fn push_fork(&self, outcome: ForkOutcome) {
        self.forks.lock().push_back(outcome);
    }

    /// Makes every exec fail with `errno` instead of replacing the image.
    pub fn fail_exec(&self, errno: Errno) {
        *self.exec_error.lock() = Some(errno);
    }

    pub fn fail_chdir(&self, errno: Errno) {
        *self.chdir_error.lock() = Some(errno);
    }

    pub fn set_capture(&self, output: Result<Vec<u8>, Errno>) {
        *self.capture.lock() = output;
    }

    pub fn set_wait_status(&self, status: c_int) {
        self.wait_status.store(status, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

unsafe fn strings(mut vector: *const *const c_char) -> Vec<String> {
    let mut result = Vec::new();
    if vector.is_null() {
        return result;
    }
    while !unsafe { *vector }.is_null() {
        result.push(lossy(unsafe { CStr::from_ptr(*vector) }));
        vector = unsafe { vector.add(1) };
    }
    result
}

fn lossy(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

impl Os for MockOs {
    fn fork(&self) -> Result<pid_t, Errno> {
        self.record(Call::Fork);
        let outcome = self
            .forks
            .lock()
            .pop_front()
            .unwrap_or(ForkOutcome::Parent(Self::PID + 1));
        match outcome {
            ForkOutcome::Child(pid) => {
                self.pid.store(pid, Ordering::SeqCst);
                Ok(0)
            }
            ForkOutcome::Parent(pid) => Ok(pid),
            ForkOutcome::Fail(errno) => Err(errno),
        }
    }

    unsafe fn execvpe(
        &self,
        file: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Errno {
        self.record(Call::Exec {
            file: lossy(file),
            argv: unsafe { strings(argv) },
            envp: unsafe { strings(envp) },
        });
        let error = *self.exec_error.lock();
        match error {
            Some(errno) => errno,
            None => std::panic::panic_any(Replaced),
        }
    }

    fn exit(&self, code: i32) -> ! {
        self.record(Call::Exit(code));
        std::panic::panic_any(Exited(code))
    }

    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        self.record(Call::Close(fd));
        Ok(())
    }

    fn dup2(&self, oldfd: RawFd, newfd: RawFd) -> Result<RawFd, Errno> {
        self.record(Call::Dup2(oldfd, newfd));
        Ok(newfd)
    }

    fn open(&self, path: &CStr, _flags: c_int) -> Result<RawFd, Errno> {
        self.record(Call::Open(lossy(path)));
        Ok(Self::DEV_NULL_FD)
    }

    fn clear_cloexec(&self, fd: RawFd) {
        self.record(Call::ClearCloexec(fd));
    }

    fn getpid(&self) -> pid_t {
        self.pid.load(Ordering::SeqCst)
    }

    fn setsid(&self) -> Result<pid_t, Errno> {
        self.record(Call::Setsid);
        Ok(self.getpid())
    }

    fn chdir(&self, path: &CStr) -> Result<(), Errno> {
        self.record(Call::Chdir(lossy(path)));
        match *self.chdir_error.lock() {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn waitpid(&self, pid: pid_t) -> Result<c_int, Errno> {
        self.record(Call::Waitpid(pid));
        Ok(self.wait_status.load(Ordering::SeqCst))
    }

    fn run_captured(&self, command: &CStr) -> Result<Vec<u8>, Errno> {
        self.record(Call::Capture(lossy(command)));
        self.capture.lock().clone()
    }

    fn write_stdout(&self, bytes: &[u8]) -> Result<(), Errno> {
        self.record(Call::Stdout(bytes.to_vec()));
        Ok(())
    }

    fn now(&self) -> u64 {
        Self::NOW
    }

    fn host_id(&self) -> u64 {
        Self::HOST_ID
    }

    fn program_name(&self) -> String {
        String::from("prog")
    }
}

/// Runs `f`, which must end in an exit, and returns the exit code.
pub fn expect_exit<F, T>(f: F) -> i32
where
    F: FnOnce() -> T,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("expected the process to exit"),
        Err(payload) => match payload.downcast::<Exited>() {
            Ok(exited) => exited.0,
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Runs `f`, which must end in a successful exec.
pub fn expect_replaced<F, T>(f: F)
where
    F: FnOnce() -> T,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("expected the process image to be replaced"),
        Err(payload) => {
            if !payload.is::<Replaced>() {
                std::panic::resume_unwind(payload);
            }
        }
    }
}

pub struct MockRuntime {
    state: Mutex<WorkerState>,
    standalone: bool,
    fail_connect: AtomicBool,
    labels: Mutex<Vec<String>>,
    children: Mutex<Vec<UniquePid>>,
    resets: AtomicUsize,
}

impl MockRuntime {
    /// A runtime with a coordinator.
    pub fn new() -> Self {
        Self::with_coordinator(true)
    }

    /// A runtime without a coordinator.
    pub fn standalone() -> Self {
        Self::with_coordinator(false)
    }

    fn with_coordinator(coordinator: bool) -> Self {
        Self {
            state: Mutex::new(WorkerState::Running),
            standalone: !coordinator,
            fail_connect: AtomicBool::new(false),
            labels: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    /// Labels of the connections requested so far.
    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().clone()
    }

    pub fn children(&self) -> Vec<UniquePid> {
        self.children.lock().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Runtime for MockRuntime {
    fn worker_state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn create_connection_before_fork(
        &self,
        label: &str,
        _parent: Option<UniquePid>,
    ) -> Result<Option<OwnedFd>, Error> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::new(Errno::ECONNREFUSED, Context::Connect));
        }
        if self.standalone {
            return Ok(None);
        }
        self.labels.lock().push(label.to_owned());
        let file = std::fs::File::open("/dev/null")
            .map_err(|_| Error::new(Errno::EMFILE, Context::Connect))?;
        Ok(Some(OwnedFd::from(file)))
    }

    fn on_child_forked(&self, child: &UniquePid) {
        self.children.lock().push(*child);
    }

    fn real_pty_name(&self, virt: &CStr) -> Option<CString> {
        let n = virt.to_bytes().strip_prefix(b"/dev/pts/v")?;
        let mut real = b"/dev/pts/".to_vec();
        real.extend_from_slice(n);
        CString::new(real).ok()
    }

    fn reset_threads_on_fork(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-memory process environment.
pub struct MockEnv {
    vars: Mutex<BTreeMap<String, OsString>>,
    // Every block handed out stays alive, so its pointers do too.
    blocks: Mutex<Vec<BoundedArgs>>,
}

impl MockEnv {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        Self {
            vars: Mutex::new(
                vars.iter()
                    .map(|(k, v)| (String::from(*k), OsString::from(*v)))
                    .collect(),
            ),
            blocks: Mutex::new(Vec::new()),
        }
    }
}

impl ProcessEnv for MockEnv {
    fn var(&self, key: &str) -> Option<OsString> {
        self.vars.lock().get(key).cloned()
    }

    fn set_var(&self, key: &str, value: &OsStr) {
        self.vars.lock().insert(key.to_owned(), value.to_owned());
    }

    fn remove_var(&self, key: &str) {
        self.vars.lock().remove(key);
    }

    fn environ(&self) -> *const *const c_char {
        let entries: Vec<CString> = self
            .vars
            .lock()
            .iter()
            .filter_map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                CString::new(entry).ok()
            })
            .collect();
        let block = BoundedArgs::from_items(entries, 0);
        let ptr = block.as_ptr();
        self.blocks.lock().push(block);
        ptr
    }
}

/// Records the events it sees.
pub struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<(&'static str, EventKind)>>>,
    serialization_fd: AtomicI32,
}

impl Recorder {
    pub fn named(name: &'static str, log: Arc<Mutex<Vec<(&'static str, EventKind)>>>) -> Self {
        Self {
            name,
            log,
            serialization_fd: AtomicI32::new(-1),
        }
    }

    /// The descriptor carried by the last `PreExec` event.
    pub fn serialization_fd(&self) -> Option<RawFd> {
        let fd = self.serialization_fd.load(Ordering::SeqCst);
        (fd >= 0).then_some(fd)
    }
}

impl Subscriber for Recorder {
    fn on_event(&self, event: &mut Event) {
        self.log.lock().push((self.name, event.kind()));
        if let Event::PreExec(pre) = event {
            self.serialization_fd
                .store(pre.serialization_fd, Ordering::SeqCst);
        }
    }
}

/// An interceptor over mocks, keeping its files in the system temp
/// directory.
pub fn interceptor(
    os: MockOs,
    runtime: MockRuntime,
    env: MockEnv,
) -> Interceptor<MockOs, MockRuntime, MockEnv> {
    let config = Config {
        tmpdir: std::env::temp_dir(),
        ..Default::default()
    };
    Interceptor::new(os, runtime, env, config)
}
