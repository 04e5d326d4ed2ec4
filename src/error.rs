//! Runtime errors
//!
//! Every fallible operation returns [`Result`]. Each variant maps to one
//! [`ErrorKind`] and carries a `miette` diagnostic code so the CLI can render
//! failures the same way the rest of the toolchain does.

use miette::Diagnostic;
use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`], stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyRegistered,
    DeviceNotFound,
    InitializationFailed,
    OutOfMemory,
    NoMatchingEntry,
    LoadFailed,
    UnboundKernel,
    ArgumentCountMismatch,
    LaunchFailed,
    SynchronizationFailed,
    CopyFailed,
    InvalidHandle,
    InvalidArgument,
    Unimplemented,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyRegistered => "already registered",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::InitializationFailed => "initialization failed",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::NoMatchingEntry => "no matching loader entry",
            ErrorKind::LoadFailed => "load failed",
            ErrorKind::UnboundKernel => "unbound kernel",
            ErrorKind::ArgumentCountMismatch => "argument count mismatch",
            ErrorKind::LaunchFailed => "launch failed",
            ErrorKind::SynchronizationFailed => "synchronization failed",
            ErrorKind::CopyFailed => "copy failed",
            ErrorKind::InvalidHandle => "invalid handle",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Config => "configuration error",
        };
        f.write_str(name)
    }
}

/// Runtime error
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum Error {
    // === Registry ===
    #[error("{what} `{name}` not found")]
    #[diagnostic(code(streamexec::registry::not_found))]
    NotFound { what: &'static str, name: String },

    #[error("platform `{name}` is already registered")]
    #[diagnostic(code(streamexec::registry::already_registered))]
    AlreadyRegistered { name: String },

    // === Device ===
    #[error("device ordinal {ordinal} out of range: platform `{platform}` has {count} device(s)")]
    #[diagnostic(code(streamexec::device::not_found))]
    DeviceNotFound {
        platform: String,
        ordinal: usize,
        count: usize,
    },

    #[error("executor initialization failed: {reason}")]
    #[diagnostic(code(streamexec::device::init_failed))]
    InitializationFailed { reason: String },

    #[error("out of device memory: requested {requested} bytes, {available} available")]
    #[diagnostic(code(streamexec::memory::out_of_memory))]
    OutOfMemory { requested: u64, available: u64 },

    // === Kernel loading ===
    #[error("no loader entry for kernel `{kernel}` usable on platform `{platform}`")]
    #[diagnostic(
        code(streamexec::loader::no_matching_entry),
        help("add an entry for this platform with a format the backend supports")
    )]
    NoMatchingEntry { kernel: String, platform: String },

    #[error("failed to load kernel `{kernel}`: {reason}")]
    #[diagnostic(code(streamexec::loader::load_failed))]
    LoadFailed { kernel: String, reason: String },

    // === Launch ===
    #[error("kernel handle is not bound to loaded code")]
    #[diagnostic(
        code(streamexec::launch::unbound_kernel),
        help("bind the handle with `Executor::get_kernel` before launching")
    )]
    UnboundKernel,

    #[error("kernel `{kernel}` expects {expected} argument(s), got {found}")]
    #[diagnostic(code(streamexec::launch::argument_count))]
    ArgumentCountMismatch {
        kernel: String,
        expected: usize,
        found: usize,
    },

    #[error("launch of kernel `{kernel}` failed: {reason}")]
    #[diagnostic(code(streamexec::launch::failed))]
    LaunchFailed { kernel: String, reason: String },

    // === Streams and transfers ===
    #[error("synchronization failed: {reason}")]
    #[diagnostic(code(streamexec::stream::sync_failed))]
    SynchronizationFailed { reason: String },

    #[error("memory copy failed: {reason}")]
    #[diagnostic(code(streamexec::memory::copy_failed))]
    CopyFailed { reason: String },

    #[error("invalid handle: {reason}")]
    #[diagnostic(code(streamexec::handle::invalid))]
    InvalidHandle { reason: String },

    #[error("invalid argument: {reason}")]
    #[diagnostic(code(streamexec::invalid_argument))]
    InvalidArgument { reason: String },

    #[error("`{feature}` is not supported by platform `{platform}`")]
    #[diagnostic(code(streamexec::unimplemented))]
    Unimplemented {
        feature: &'static str,
        platform: String,
    },

    #[error("configuration error: {reason}")]
    #[diagnostic(code(streamexec::config))]
    Config { reason: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyRegistered { .. } => ErrorKind::AlreadyRegistered,
            Error::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            Error::InitializationFailed { .. } => ErrorKind::InitializationFailed,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::NoMatchingEntry { .. } => ErrorKind::NoMatchingEntry,
            Error::LoadFailed { .. } => ErrorKind::LoadFailed,
            Error::UnboundKernel => ErrorKind::UnboundKernel,
            Error::ArgumentCountMismatch { .. } => ErrorKind::ArgumentCountMismatch,
            Error::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            Error::SynchronizationFailed { .. } => ErrorKind::SynchronizationFailed,
            Error::CopyFailed { .. } => ErrorKind::CopyFailed,
            Error::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::Unimplemented { .. } => ErrorKind::Unimplemented,
            Error::Config { .. } => ErrorKind::Config,
        }
    }

    pub(crate) fn copy_failed(reason: impl Into<String>) -> Self {
        Error::CopyFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_handle(reason: impl Into<String>) -> Self {
        Error::InvalidHandle {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config {
            reason: err.to_string(),
        }
    }
}
