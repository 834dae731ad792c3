/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-process log files.
//!
//! Every process writes to its own file in the temp directory. The subscriber
//! is installed once, but the file behind it can be swapped, which is what a
//! forked child does to stop writing into its parent's log.

use std::io;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

static LOG_FILE: Mutex<Option<RollingFileAppender>> = parking_lot::const_mutex(None);

fn open(tmpdir: &Path, namespace: &str) -> Option<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(namespace)
        .filename_suffix("log")
        .build(tmpdir)
        .ok()
}

/// The name of the log file of a process, without extension.
pub fn namespace(program: &str, unique_pid: &impl core::fmt::Display) -> String {
    format!("{}.{}", program, unique_pid)
}

/// Installs the global subscriber writing to `<tmpdir>/<namespace>.log`.
/// Does nothing unless a filter is configured.
pub fn init(filter: Option<&str>, tmpdir: &Path, namespace: &str) {
    let Some(filter) = filter else {
        return;
    };

    *LOG_FILE.lock() = open(tmpdir, namespace);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(false)
        .with_writer(LogSink)
        .finish();

    // Another copy of the library (or the application) may have installed
    // one already.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Switches to a new log file in a freshly forked child. The parent's writer
/// may have been locked by a thread that does not exist in the child.
pub fn reopen_after_fork(tmpdir: &Path, namespace: &str) {
    if LOG_FILE.is_locked() {
        unsafe { LOG_FILE.force_unlock() };
    }

    let mut file = LOG_FILE.lock();
    if file.is_some() {
        *file = open(tmpdir, namespace);
    }
}

struct LogSink;

struct LogWriter;

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match LOG_FILE.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match LOG_FILE.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UniquePid;
    use crate::testing::UNIT_TEST_LOCK;

    #[test]
    fn namespace_format() {
        assert_eq!(namespace("make", &UniquePid::new(0xa, 7, 0xb)), "make.a-7-b");
        assert_eq!(namespace("make_(forked)", &"x"), "make_(forked).x");
    }

    #[test]
    fn reopen_switches_files() {
        let _lock = UNIT_TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();

        *LOG_FILE.lock() = open(dir.path(), "parent");
        LogWriter.write_all(b"from parent\n").unwrap();

        core::mem::forget(LOG_FILE.lock());
        reopen_after_fork(dir.path(), "child");
        LogWriter.write_all(b"from child\n").unwrap();
        LogWriter.flush().unwrap();
        *LOG_FILE.lock() = None;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("parent.log")).unwrap(),
            "from parent\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("child.log")).unwrap(),
            "from child\n"
        );
    }

    #[test]
    fn reopen_without_logging_stays_off() {
        let _lock = UNIT_TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        reopen_after_fork(dir.path(), "child");
        assert!(LOG_FILE.lock().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
