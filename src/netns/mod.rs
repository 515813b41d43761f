//! Network namespace handles.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use thiserror::Error;
use tracing::warn;

/// Path of the calling thread's network namespace
pub const CURRENT_THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Errors raised while opening or switching namespaces
#[derive(Debug, Error)]
pub enum NsError {
    #[error("failed to open network namespace {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to enter network namespace {path}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to close network namespace {path}: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to return to original network namespace: {source}")]
    Restore {
        #[source]
        source: nix::Error,
    },
}

/// A handle to a network namespace, owned by whoever opened it.
pub trait NetNamespace {
    /// Descriptor identifying the namespace, used as a move destination
    fn fd(&self) -> RawFd;

    /// Path the namespace was opened from
    fn path(&self) -> &Path;

    /// Run `f` with the calling thread switched into this namespace.
    ///
    /// The thread is switched back before returning, whether or not `f`
    /// succeeded. Only failures to switch are reported as `Err`.
    fn run_in<T, F>(&self, f: F) -> Result<T, NsError>
    where
        F: FnOnce() -> T;
}

/// A kernel network namespace opened from a path
#[derive(Debug)]
pub struct NetNs {
    fd: RawFd,
    path: PathBuf,
    closed: bool,
}

impl NetNs {
    /// Open the namespace at `path` (e.g. `/var/run/netns/foo`)
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NsError> {
        let path = path.as_ref().to_path_buf();
        let fd = open(path.as_path(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|source| NsError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            fd,
            path,
            closed: false,
        })
    }

    /// Open the namespace the calling thread is currently in
    pub fn current() -> Result<Self, NsError> {
        Self::open(CURRENT_THREAD_NETNS)
    }

    /// Close the handle
    pub fn close(mut self) -> Result<(), NsError> {
        self.closed = true;
        close(self.fd).map_err(|source| NsError::Close {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for NetNs {
    fn drop(&mut self) {
        if !self.closed {
            let _ = close(self.fd);
        }
    }
}

impl NetNamespace for NetNs {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn run_in<T, F>(&self, f: F) -> Result<T, NsError>
    where
        F: FnOnce() -> T,
    {
        let origin = NetNs::current()?;

        setns(self.fd, CloneFlags::CLONE_NEWNET).map_err(|source| NsError::Enter {
            path: self.path.clone(),
            source,
        })?;

        let result = f();

        if let Err(source) = setns(origin.fd, CloneFlags::CLONE_NEWNET) {
            warn!(
                "Thread left in network namespace {}: {}",
                self.path.display(),
                source
            );
            return Err(NsError::Restore { source });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_namespace() {
        let err = NetNs::open("/var/run/netns/ib-sriov-does-not-exist").unwrap_err();
        assert!(matches!(err, NsError::Open { .. }));
        assert!(err.to_string().contains("ib-sriov-does-not-exist"));
    }

    #[test]
    fn test_current_namespace() -> Result<(), Box<dyn std::error::Error>> {
        let ns = NetNs::current()?;
        assert!(ns.fd() >= 0);
        assert_eq!(ns.path(), Path::new(CURRENT_THREAD_NETNS));
        ns.close()?;
        Ok(())
    }

    // setns requires CAP_SYS_ADMIN
    #[test]
    #[ignore]
    fn test_run_in_current_namespace() -> Result<(), Box<dyn std::error::Error>> {
        let ns = NetNs::current()?;
        let value = ns.run_in(|| 42)?;
        assert_eq!(value, 42);
        Ok(())
    }
}
