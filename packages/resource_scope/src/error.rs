use thiserror::Error;

/// Errors returned by scope lifecycle operations.
///
/// Every error is reported synchronously to the caller of the failing operation. None of them
/// are retried internally - where a retry makes sense (e.g. [`StillAcquired`][Self::StillAcquired]
/// or [`BeingAccessed`][Self::BeingAccessed]), it is up to the caller to try again later.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ScopeError {
    /// A confined scope was used from a thread other than its owner thread.
    #[error("attempted access outside owning thread")]
    WrongThread,

    /// The scope has already been closed or is in the middle of being closed.
    #[error("already closed")]
    AlreadyClosed,

    /// A close was attempted while handles obtained via `acquire()` were still outstanding.
    #[error("scope is acquired by {count} handles")]
    StillAcquired {
        /// Number of outstanding handles observed when the close was attempted.
        count: u32,
    },

    /// A close was attempted while another thread was inside an access window of the scope.
    ///
    /// The scope remains alive and fully usable.
    #[error("cannot close while another thread is accessing the scope")]
    BeingAccessed,

    /// The scope has reached the maximum number of simultaneously outstanding handles.
    #[error("scope acquire limit exceeded")]
    AcquireLimitExceeded,

    /// The scope kind does not support explicit closing (implicit and global scopes).
    #[error("scope cannot be closed")]
    CloseUnsupported,

    /// A scope cannot be bound to itself, as it would never be able to close.
    #[error("cannot bind a scope to itself")]
    BindToSelf,

    /// The requested size and alignment do not form a valid memory layout.
    #[error("invalid layout requested: {byte_size} bytes aligned to {byte_alignment}")]
    InvalidLayout {
        /// The requested size in bytes.
        byte_size: usize,

        /// The requested alignment in bytes.
        byte_alignment: usize,
    },

    /// The allocation strategy could not provide the requested memory.
    #[error("out of memory: failed to allocate {byte_size} bytes aligned to {byte_alignment}")]
    OutOfMemory {
        /// The requested size in bytes.
        byte_size: usize,

        /// The requested alignment in bytes.
        byte_alignment: usize,
    },
}

/// Error raised by the per-access validity check of a scope.
///
/// This signals a use-after-close (or wrong-thread) bug in the code touching the memory,
/// so it is meant to propagate straight up rather than be recovered from locally.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ScopedAccessError {
    /// The scope that owns the memory has been closed.
    #[error("memory access through a closed scope")]
    Closed,

    /// The memory belongs to a confined scope owned by a different thread.
    #[error("memory access outside the owning thread of a confined scope")]
    WrongThread,

    /// The access needed to acquire the scope but too many acquisitions are outstanding.
    #[error("memory access exceeded the scope acquire limit")]
    AcquireLimitExceeded,
}

impl From<ScopedAccessError> for ScopeError {
    fn from(value: ScopedAccessError) -> Self {
        match value {
            ScopedAccessError::Closed => Self::AlreadyClosed,
            ScopedAccessError::WrongThread => Self::WrongThread,
            ScopedAccessError::AcquireLimitExceeded => Self::AcquireLimitExceeded,
        }
    }
}

/// Error returned when running the cleanup actions of a [`ResourceList`][crate::ResourceList]
/// that has already been cleaned up.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("resource list has already been closed")]
pub struct ListAlreadyClosed;

/// A specialized `Result` type for scope operations, returning the crate's
/// [`ScopeError`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, ScopeError>;
