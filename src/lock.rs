// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A single-writer directory lock with PID-based dead-holder takeover
//! (§4.8: "Store is single-writer").
//!
//! The store directory's `lock` file holds the decimal PID of the process
//! that created it. A process that finds an existing lock file checks
//! whether that PID is still alive; a lock left behind by a crashed
//! process is silently reclaimed.

use crate::{Error, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

const LOCK_FILE: &str = "lock";

enum Attempt {
    Acquired(DirectoryLock),
    Held { pid: Option<u32> },
}

/// An acquired, held directory lock. Releases the lock file when dropped.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    /// Attempts to acquire the lock for `dir`, retrying up to
    /// `max_retries` times (sleeping `pause` between attempts) and giving
    /// up early if `timeout` elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockHeld`] if another live process still holds the
    /// lock once retries are exhausted, or [`Error::LockTimeout`] if
    /// `timeout` elapses first or the lock file is unreadable.
    pub fn acquire(
        dir: &Path,
        max_retries: u32,
        pause: Duration,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let deadline = timeout.map(|d| Instant::now() + d);

        for attempt in 0..=max_retries {
            match Self::try_once(&path)? {
                Attempt::Acquired(lock) => return Ok(lock),
                Attempt::Held { pid } => {
                    let out_of_time = deadline.is_some_and(|d| Instant::now() >= d);
                    let out_of_retries = attempt == max_retries;

                    if out_of_time {
                        return Err(Error::LockTimeout);
                    }
                    if out_of_retries {
                        return Err(Error::LockHeld { pid });
                    }

                    log::debug!("store directory locked by pid {pid:?}, retrying in {pause:?}");
                    std::thread::sleep(pause);
                }
            }
        }

        Err(Error::LockTimeout)
    }

    fn try_once(path: &Path) -> Result<Attempt> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                file.sync_all()?;
                Ok(Attempt::Acquired(Self { path: path.to_path_buf() }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder_pid = fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());

                if let Some(pid) = holder_pid {
                    if !is_pid_alive(pid) {
                        log::warn!("reclaiming stale store lock left by dead pid {pid}");
                        let _ = fs::remove_file(path);
                        return Self::try_once(path);
                    }
                }

                Ok(Attempt::Held { pid: holder_pid })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn is_pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Without `/proc`, there is no portable, dependency-free way to check
/// liveness; assume the holder is alive so a live process is never evicted.
#[cfg(not(target_os = "linux"))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn acquire_and_release() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = DirectoryLock::acquire(dir.path(), 0, Duration::from_millis(1), None)?;
        assert!(dir.path().join(LOCK_FILE).exists());
        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        Ok(())
    }

    #[test]
    fn second_acquire_fails_while_first_holds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _lock = DirectoryLock::acquire(dir.path(), 0, Duration::from_millis(1), None)?;

        let err = DirectoryLock::acquire(dir.path(), 0, Duration::from_millis(1), None)
            .expect_err("lock should still be held by this process");
        assert!(matches!(err, Error::LockHeld { pid: Some(_) }));

        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_lock_from_dead_pid_is_reclaimed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(LOCK_FILE), "999999999")?;

        let lock = DirectoryLock::acquire(dir.path(), 0, Duration::from_millis(1), None)?;
        drop(lock);

        Ok(())
    }
}
