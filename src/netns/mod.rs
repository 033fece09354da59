//! Network namespace handles and scoped entry.
//!
//! Namespace membership is per OS thread. Plugins run on a current-thread
//! tokio runtime, so every future polled inside a scope runs on the thread
//! that entered it. `NetnsGuard` is `!Send`, which keeps a scoped future
//! from being moved to another worker. Work inside a scope must not use
//! `spawn_blocking` or `tokio::fs`, which run on pool threads.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Namespace of the calling thread
pub const THREAD_NETNS_PATH: &str = "/proc/thread-self/ns/net";

/// An open network namespace
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    /// Open the namespace bound at `path` (e.g. `/var/run/netns/<name>`)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| Error::Namespace {
            path: path.clone(),
            source,
        })?;
        Ok(Self { file, path })
    }

    /// The namespace the calling thread is in right now
    pub fn current() -> Result<Self> {
        Self::open(THREAD_NETNS_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switch the calling thread into this namespace until the guard drops
    pub fn enter(&self) -> Result<NetnsGuard> {
        let origin = NetNs::current()?;
        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|errno| {
            Error::Namespace {
                path: self.path.clone(),
                source: io::Error::from(errno),
            }
        })?;
        debug!(netns = %self.path.display(), "entered network namespace");
        Ok(NetnsGuard {
            origin,
            _pinned: PhantomData,
        })
    }

    /// Run `f` with this namespace current, restoring the caller's
    /// namespace afterwards on every exit path.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.enter()?;
        f().await
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Restores the thread's original namespace on drop.
#[must_use = "the namespace is left as soon as the guard is dropped"]
pub struct NetnsGuard {
    origin: NetNs,
    _pinned: PhantomData<*const ()>,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(errno) = setns(self.origin.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
            error!(
                netns = %self.origin.path.display(),
                error = %errno,
                "failed to restore network namespace"
            );
            // Continuing would program the wrong namespace.
            match RestoreFailure::for_thread(std::thread::panicking()) {
                RestoreFailure::Panic => panic!("failed to restore network namespace: {errno}"),
                RestoreFailure::Abort => {
                    error!("already unwinding, aborting");
                    std::process::abort();
                }
            }
        }
        debug!("restored network namespace");
    }
}

/// How a guard stops the thread when restoring its namespace fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestoreFailure {
    Panic,
    /// A second panic during unwinding would abort without a message
    Abort,
}

impl RestoreFailure {
    fn for_thread(panicking: bool) -> Self {
        if panicking {
            RestoreFailure::Abort
        } else {
            RestoreFailure::Panic
        }
    }
}
