use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::MacAddr;

/// Errors produced by the wiring engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete plugin configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A CIDR string that does not parse
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// Opening or entering a network namespace failed
    #[error("network namespace {path}: {source}")]
    Namespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A netlink request rejected by the kernel
    #[error("{op}: {source}")]
    Kernel {
        op: String,
        #[source]
        source: io::Error,
    },

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("no usable address found on {0}")]
    NoAddressFound(String),

    /// Another station answers for the probed address
    #[error("pod's interface {interface} with an conflicting ip {address}, {address} is located at {mac}")]
    IpConflict {
        interface: String,
        address: IpAddr,
        mac: MacAddr,
    },

    /// NDP probing finished without any advertisement
    #[error("ip conflicting check for {address} on {interface} fails with more than maximum number of retries ({retries})")]
    RetryExhausted {
        interface: String,
        address: IpAddr,
        retries: u32,
    },

    /// Socket failure during duplicate address detection
    #[error("{op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("sysctl {path}: {source}")]
    Sysctl {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a kernel errno returned for `op`.
    pub fn kernel(op: impl Into<String>, errno: i32) -> Self {
        Error::Kernel {
            op: op.into(),
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// The errno behind a kernel or transport error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Kernel { source, .. }
            | Error::Transport { source, .. }
            | Error::Sysctl { source, .. }
            | Error::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    /// The object being added is already present.
    pub fn is_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// The object being looked up or removed is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::LinkNotFound(_))
            || matches!(
                self.errno(),
                Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ESRCH)
            )
    }
}
