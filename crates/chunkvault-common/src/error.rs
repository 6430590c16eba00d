//! Error types for chunkvault
//!
//! Errors fall in four families that callers treat differently:
//! - capacity errors are surfaced and never retried
//! - device errors are recorded against a device and may be retried on
//!   another member of the distribution
//! - consistency errors must be told apart from a plain "not found"
//! - transport errors on the internal disk channel never reach this type:
//!   they terminate the process

use thiserror::Error;

/// Common result type for chunkvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for chunkvault
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device {device} unavailable ({status})")]
    DeviceUnavailable { device: u8, status: String },

    #[error("no device available for allocation")]
    NoDeviceAvailable,

    // Capacity errors
    #[error("no space left on any device")]
    NoSpaceLeft,

    #[error("file too big: chunk {chunk} is beyond the per-file chunk limit")]
    FileTooBig { chunk: usize },

    // Header errors
    #[error("header file not found")]
    HeaderNotFound,

    #[error("header belongs to recycle generation {found}, requested {requested}")]
    OtherRecyclingCounter { found: u8, requested: u8 },

    #[error("every header copy is unreadable")]
    HeaderReadErrors,

    #[error("no header copy could be written")]
    HeaderWriteFailed,

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    // Consistency errors
    #[error("inconsistent request: {0}")]
    InconsistentRequest(String),

    #[error("device {device}: cannot apply {event} while {from}")]
    InvalidTransition {
        device: u8,
        from: String,
        event: String,
    },

    // Rebuild errors
    #[error("a rebuild is already running on chunk {chunk}")]
    RebuildInProgress { chunk: usize },

    #[error("too many rebuilds running on this file")]
    TooManyRebuilds,

    #[error("no such rebuild reference: {0}")]
    NoSuchRebuild(u32),

    // Lookup errors
    #[error("unknown storage cid {cid} sid {sid}")]
    UnknownStorage { cid: u16, sid: u8 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an inconsistent request error
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentRequest(msg.into())
    }

    /// Capacity errors: surfaced to the client, never retried
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoSpaceLeft | Self::FileTooBig { .. })
    }

    /// Device errors: the caller may retry against another storage
    #[must_use]
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::DeviceUnavailable { .. } | Self::NoDeviceAvailable
        )
    }

    /// Consistency errors: generation-aware logic applies
    #[must_use]
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::OtherRecyclingCounter { .. } | Self::InconsistentRequest(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HeaderNotFound | Self::UnknownStorage { .. })
    }

    /// Whether the failure is located in the file itself
    ///
    /// When true, retrying on another device of this storage cannot help:
    /// the file's own metadata or data is damaged.
    #[must_use]
    pub fn is_fid_faulty(&self) -> bool {
        matches!(
            self,
            Self::HeaderReadErrors | Self::CorruptHeader(_) | Self::HeaderWriteFailed
        )
    }

    /// POSIX error code to put in the reply to the client
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpaceLeft => libc::ENOSPC,
            Self::FileTooBig { .. } => libc::EFBIG,
            Self::HeaderNotFound => libc::ENOENT,
            Self::OtherRecyclingCounter { .. } => libc::ESTALE,
            Self::NoDeviceAvailable => libc::ENODEV,
            Self::RebuildInProgress { .. } | Self::TooManyRebuilds => libc::EBUSY,
            Self::InconsistentRequest(_)
            | Self::InvalidArgument(_)
            | Self::UnknownStorage { .. }
            | Self::NoSuchRebuild(_)
            | Self::InvalidTransition { .. } => libc::EINVAL,
            Self::DeviceUnavailable { .. }
            | Self::HeaderReadErrors
            | Self::HeaderWriteFailed
            | Self::CorruptHeader(_)
            | Self::Configuration(_)
            | Self::Internal(_) => libc::EIO,
        }
    }
}
