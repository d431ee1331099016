#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Temporally bounded access to externally managed memory (native buffers, mapped files,
//! pinned arrays) from code that has no other guarantee about when that memory becomes
//! invalid.
//!
//! A [`ResourceScope`] decides when memory is released. Any number of views of the memory and
//! any number of threads may use it until then, and no access ever observes the memory after
//! release - without taking a lock on every access.
//!
//! # Scope kinds
//!
//! * [`ResourceScope::confined()`] - owned by one thread, which alone may access, register
//!   cleanup actions and close. The per-access check is an ownership check plus a plain flag read.
//! * [`ResourceScope::shared()`] - usable from any thread. Liveness and acquisitions are tracked
//!   in one atomic integer; closing waits out in-flight accesses using a short handshake.
//! * [`ResourceScope::implicit()`] - cannot be closed explicitly; a [`Cleaner`] releases its
//!   resources once nothing references the scope any more.
//! * [`ResourceScope::global()`] - always alive, never releases anything.
//!
//! # Closing is fail-fast
//!
//! Closing a shared scope never blocks waiting for other threads. If handles acquired via
//! [`ResourceScope::acquire()`] are outstanding, the close fails with
//! [`ScopeError::StillAcquired`]. If another thread is inside an access window, the close fails
//! with [`ScopeError::BeingAccessed`]. In both cases the scope remains fully usable and the
//! caller may retry later. This rules out deadlocks where a holder waits on the closer.
//!
//! # Example
//!
//! ```
//! use resource_scope::{ResourceScope, SegmentAllocator};
//!
//! let scope = ResourceScope::shared();
//!
//! let region = scope.allocate(16, 8).unwrap();
//! region.set_u8(0, 42).unwrap();
//! assert_eq!(region.get_u8(0).unwrap(), 42);
//!
//! let handle = scope.acquire().unwrap();
//! assert!(scope.close().is_err());
//! handle.release();
//!
//! // Frees the memory of the region.
//! scope.close().unwrap();
//! assert!(region.get_u8(0).is_err());
//! ```

mod access;
mod allocator;
mod builder;
mod cleaner;
mod cleanup;
mod confined;
mod error;
mod handle;
mod handshake;
mod region;
mod resource_list;
mod scope;
mod shared;

pub use access::*;
pub use allocator::*;
pub use builder::*;
pub use cleaner::*;
pub use cleanup::*;
pub(crate) use confined::*;
pub use error::{ListAlreadyClosed, ScopeError, ScopedAccessError};
pub use handle::*;
pub(crate) use handshake::*;
pub use region::*;
pub use resource_list::*;
pub use scope::ResourceScope;
pub(crate) use scope::ScopeInner;
pub(crate) use shared::*;
