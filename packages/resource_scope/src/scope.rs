use std::any::type_name;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::ThreadId;

use tracing::debug;

use crate::error::Result;
use crate::{
    AccessGuard, Cleaner, ConfinedState, ListAlreadyClosed, ResourceCleanup, ResourceList,
    ScopeBuilder, ScopeError, ScopeHandle, ScopedAccessError, SharedState,
};

/// How many times a closer spins waiting for a thread to leave its access window.
pub(crate) const DEFAULT_CLOSE_SPIN_LIMIT: NonZero<u32> = NonZero::new(1024).unwrap();

static GLOBAL: LazyLock<ResourceScope> =
    LazyLock::new(|| ResourceScope::new(ScopeKind::Global, None));

/// Governs when externally managed memory is released, while letting any number of views
/// and threads use that memory until then.
///
/// A scope starts alive, accumulates cleanup actions (e.g. "free this buffer") and eventually
/// closes, running every action exactly once. After that, every access through the scope fails.
/// There are four kinds of scopes:
///
/// * **Confined** scopes belong to one owner thread. Only the owner may access memory through
///   them, register actions or close them, which makes the per-access check trivially cheap.
/// * **Shared** scopes may be used from any thread. Closing is fail-fast: it is rejected while
///   handles are outstanding or while another thread is inside an access window, instead of
///   waiting for those to finish. The caller decides whether and when to retry.
/// * **Implicit** scopes cannot be closed explicitly. Their actions run via a [`Cleaner`] when
///   the last reference to the scope is dropped.
/// * The **global** scope is never closed and ignores registered actions.
///
/// `ResourceScope` is a cheap reference-counted handle; clones refer to the same scope.
///
/// # Examples
///
/// ```
/// use resource_scope::ResourceScope;
///
/// let scope = ResourceScope::shared();
/// scope.add_close_action(|| println!("releasing")).unwrap();
///
/// let value = scope.access(|| 42).unwrap();
/// assert_eq!(value, 42);
///
/// scope.close().unwrap();
/// assert!(!scope.is_alive());
/// assert!(scope.access(|| 42).is_err());
/// ```
#[derive(Clone)]
pub struct ResourceScope {
    inner: Arc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    kind: ScopeKind,
    resources: ResourceList,

    /// Set once any registered cleanup releases raw memory. Diagnostic only.
    backs_memory: AtomicBool,

    /// Receives the pending actions if the scope is abandoned without being closed.
    cleaner: Option<Cleaner>,
}

#[derive(Debug)]
pub(crate) enum ScopeKind {
    Confined(ConfinedState),
    Shared(SharedState),
    Implicit,
    Global,
}

impl ScopeKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Confined(_) => "confined",
            Self::Shared(_) => "shared",
            Self::Implicit => "implicit",
            Self::Global => "global",
        }
    }
}

impl ResourceScope {
    pub(crate) fn new(kind: ScopeKind, cleaner: Option<Cleaner>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                kind,
                resources: ResourceList::new(),
                backs_memory: AtomicBool::new(false),
                cleaner,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ScopeInner>) -> Self {
        Self { inner }
    }

    /// Creates a scope confined to the current thread, without a cleaner.
    #[must_use]
    pub fn confined() -> Self {
        Self::builder().confined().build()
    }

    /// Creates a scope confined to the thread `owner`, without a cleaner.
    #[must_use]
    pub fn confined_to(owner: ThreadId) -> Self {
        Self::builder().confined_to(owner).build()
    }

    /// Creates a scope that can be used from any thread, without a cleaner.
    #[must_use]
    pub fn shared() -> Self {
        Self::builder().build()
    }

    /// Creates a scope that cannot be closed explicitly. Its actions are run by the common
    /// [`Cleaner`] once the scope is no longer referenced.
    #[must_use]
    pub fn implicit() -> Self {
        Self::implicit_with(Cleaner::common())
    }

    /// Creates a scope that cannot be closed explicitly. Its actions are run by `cleaner`
    /// once the scope is no longer referenced.
    #[must_use]
    pub fn implicit_with(cleaner: Cleaner) -> Self {
        Self::new(ScopeKind::Implicit, Some(cleaner))
    }

    /// The process-wide scope that is always alive.
    ///
    /// Actions registered against the global scope are discarded without ever running, as
    /// there is no point in time at which they could run before the process exits.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Creates a builder for customizing the scope configuration.
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::new()
    }

    /// The owner thread of a confined scope, or `None` for scopes usable from any thread.
    #[must_use]
    pub fn owner_thread(&self) -> Option<ThreadId> {
        match &self.inner.kind {
            ScopeKind::Confined(state) => Some(state.owner()),
            ScopeKind::Shared(_) | ScopeKind::Implicit | ScopeKind::Global => None,
        }
    }

    /// Whether the scope cannot be closed explicitly (implicit and global scopes).
    #[must_use]
    pub fn is_implicit(&self) -> bool {
        matches!(self.inner.kind, ScopeKind::Implicit | ScopeKind::Global)
    }

    /// Whether the scope has not been closed yet. May be called from any thread.
    ///
    /// A shared scope in the middle of a close attempt is reported as alive, as the attempt
    /// may still fail.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match &self.inner.kind {
            ScopeKind::Confined(state) => state.is_alive(),
            ScopeKind::Shared(state) => state.is_alive(),
            ScopeKind::Implicit | ScopeKind::Global => true,
        }
    }

    /// Whether any registered cleanup action releases raw memory.
    #[must_use]
    pub fn backs_memory(&self) -> bool {
        self.inner.backs_memory.load(Ordering::Relaxed)
    }

    /// The fast validity check intended to be called before every memory access.
    ///
    /// This only checks the state at the instant of the call. To keep a shared scope from
    /// closing for the duration of an access, use [`access()`][Self::access] or
    /// [`enter()`][Self::enter].
    ///
    /// # Errors
    ///
    /// Fails if the scope is closed (or closing), or if the scope is confined to another thread.
    #[inline]
    pub fn check_valid_state(&self) -> std::result::Result<(), ScopedAccessError> {
        match &self.inner.kind {
            ScopeKind::Confined(state) => state.check_valid_state(),
            ScopeKind::Shared(state) => state.check_valid_state(),
            ScopeKind::Implicit | ScopeKind::Global => Ok(()),
        }
    }

    /// Checks ownership and liveness, reporting failures as lifecycle errors.
    ///
    /// # Errors
    ///
    /// [`ScopeError::WrongThread`] if the scope is confined to another thread,
    /// [`ScopeError::AlreadyClosed`] if the scope is no longer alive.
    pub fn check_valid_state_slow(&self) -> Result<()> {
        if let ScopeKind::Confined(state) = &self.inner.kind {
            if !state.is_owned_by_current_thread() {
                return Err(ScopeError::WrongThread);
            }
        }

        if !self.is_alive() {
            return Err(ScopeError::AlreadyClosed);
        }

        Ok(())
    }

    /// Acquires a handle that keeps the scope from closing until released.
    ///
    /// Only shared scopes count their handles. For the other kinds, acquiring is just a
    /// validity check.
    ///
    /// # Errors
    ///
    /// [`ScopeError::AlreadyClosed`] if the scope is closed or closing,
    /// [`ScopeError::AcquireLimitExceeded`] if too many handles are outstanding,
    /// [`ScopeError::WrongThread`] if the scope is confined to another thread.
    pub fn acquire(&self) -> Result<ScopeHandle> {
        let counted = match &self.inner.kind {
            ScopeKind::Shared(state) => {
                state.acquire()?;
                true
            }
            ScopeKind::Confined(_) | ScopeKind::Implicit | ScopeKind::Global => {
                self.check_valid_state_slow()?;
                false
            }
        };

        Ok(ScopeHandle::new(Arc::clone(&self.inner), counted))
    }

    /// Closes the scope and runs every registered cleanup action exactly once.
    ///
    /// Closing never waits for other threads. If the scope is in use, the close is rejected and
    /// the scope remains alive and usable; the caller may retry later.
    ///
    /// # Errors
    ///
    /// * [`ScopeError::AlreadyClosed`] if the scope is already closed or being closed.
    /// * [`ScopeError::StillAcquired`] if handles of a shared scope are outstanding.
    /// * [`ScopeError::BeingAccessed`] if another thread is inside an access window.
    /// * [`ScopeError::WrongThread`] if the scope is confined to another thread.
    /// * [`ScopeError::CloseUnsupported`] for implicit and global scopes.
    ///
    /// # Panics
    ///
    /// If a cleanup action panics, the remaining actions still run and the panic is then
    /// resumed. The scope is closed regardless.
    pub fn close(&self) -> Result<()> {
        match &self.inner.kind {
            ScopeKind::Confined(state) => state.close()?,
            ScopeKind::Shared(state) => state.close()?,
            ScopeKind::Implicit | ScopeKind::Global => return Err(ScopeError::CloseUnsupported),
        }

        // We won the close, so we are the only one who can ever run the list.
        let executed = self
            .inner
            .resources
            .cleanup()
            .map_err(|ListAlreadyClosed| ScopeError::AlreadyClosed)?;

        debug!(kind = self.inner.kind.name(), executed, "scope closed");

        Ok(())
    }

    /// Registers an action to run when the scope is closed.
    ///
    /// # Errors
    ///
    /// Fails (without running the action) if the scope cannot be acquired - see
    /// [`acquire()`][Self::acquire].
    pub fn add_close_action(&self, action: impl FnOnce() + Send + 'static) -> Result<()> {
        self.add_cleanup(ResourceCleanup::new(action))
    }

    /// Registers a cleanup to run when the scope is closed.
    ///
    /// # Errors
    ///
    /// Fails (without running the cleanup) if the scope cannot be acquired - see
    /// [`acquire()`][Self::acquire].
    pub fn add_cleanup(&self, cleanup: ResourceCleanup) -> Result<()> {
        self.try_add(cleanup).map_err(|(error, _)| error)
    }

    /// Registers a cleanup to run when the scope is closed or, if registration fails, runs it
    /// immediately.
    ///
    /// This is the way to register the release of a resource that was allocated before
    /// registration: if the scope closed in between, the resource is released right away
    /// instead of leaking.
    ///
    /// # Errors
    ///
    /// Returns the registration error after the cleanup has already run.
    pub fn add_or_cleanup_if_fail(&self, cleanup: ResourceCleanup) -> Result<()> {
        self.try_add(cleanup).map_err(|(error, cleanup)| {
            cleanup.run();
            error
        })
    }

    fn try_add(
        &self,
        cleanup: ResourceCleanup,
    ) -> std::result::Result<(), (ScopeError, ResourceCleanup)> {
        if matches!(self.inner.kind, ScopeKind::Global) {
            return Ok(());
        }

        // Holding the handle prevents the scope from closing while we add.
        let handle = match self.acquire() {
            Ok(handle) => handle,
            Err(error) => return Err((error, cleanup)),
        };

        let has_memory = cleanup.has_memory();

        let result = match &self.inner.kind {
            ScopeKind::Confined(_) => self.inner.resources.add_exclusive(cleanup),
            _ => self.inner.resources.add(cleanup),
        };

        handle.release();

        match result {
            Ok(()) => {
                if has_memory {
                    self.inner.backs_memory.store(true, Ordering::Relaxed);
                }

                Ok(())
            }
            Err(cleanup) => Err((ScopeError::AlreadyClosed, cleanup)),
        }
    }

    /// Ties the lifetime of this scope to `other`: this scope cannot be closed (if it counts
    /// its handles) until `other` has been closed.
    ///
    /// # Errors
    ///
    /// [`ScopeError::BindToSelf`] if `other` is this scope. Otherwise any error from acquiring
    /// this scope or registering with `other`; in the latter case this scope is released again.
    pub fn bind_to(&self, other: &Self) -> Result<()> {
        if self == other {
            return Err(ScopeError::BindToSelf);
        }

        let handle = self.acquire()?;

        if matches!(other.inner.kind, ScopeKind::Global) {
            // The global scope never closes, so neither may this scope.
            mem::forget(handle);
            return Ok(());
        }

        other.add_or_cleanup_if_fail(ResourceCleanup::new(move || handle.release()))
    }

    /// Runs `f` inside an access window of this scope, during which the scope cannot close.
    ///
    /// # Errors
    ///
    /// Fails without calling `f` if the scope is closed or confined to another thread.
    pub fn access<R>(&self, f: impl FnOnce() -> R) -> std::result::Result<R, ScopedAccessError> {
        let _guard = self.enter()?;
        Ok(f())
    }

    /// Opens an access window of this scope on the current thread, lasting until the returned
    /// guard is dropped. While any thread has a window open, the scope cannot close.
    ///
    /// Windows are meant to be short. A close attempt that meets an open window waits briefly
    /// and then fails with [`ScopeError::BeingAccessed`].
    ///
    /// # Errors
    ///
    /// Fails if the scope is closed or confined to another thread.
    pub fn enter(&self) -> std::result::Result<AccessGuard<'_>, ScopedAccessError> {
        match &self.inner.kind {
            ScopeKind::Confined(state) => {
                state.check_valid_state()?;
                Ok(AccessGuard::unguarded(self))
            }
            ScopeKind::Shared(state) => {
                let access = state.enter()?;
                Ok(AccessGuard::shared(self, access))
            }
            ScopeKind::Implicit | ScopeKind::Global => Ok(AccessGuard::unguarded(self)),
        }
    }

    /// Ends an access that was held open via a counted acquisition.
    pub(crate) fn end_acquired_access(&self) {
        self.inner.release_acquisition();
    }
}

impl ScopeInner {
    pub(crate) fn release_acquisition(&self) {
        if let ScopeKind::Shared(state) = &self.kind {
            state.release();
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if self.resources.is_closed() || matches!(self.kind, ScopeKind::Global) {
            return;
        }

        let resources = mem::take(&mut self.resources);

        match &self.cleaner {
            Some(cleaner) => cleaner.clean(resources),
            None => {
                debug!(
                    kind = self.kind.name(),
                    "scope abandoned without close or cleaner; discarding pending cleanup actions"
                );
            }
        }
    }
}

impl PartialEq for ResourceScope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ResourceScope {}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("kind", &self.inner.kind.name())
            .field("is_alive", &self.is_alive())
            .field("owner_thread", &self.owner_thread())
            .field("backs_memory", &self.backs_memory())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ScopeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("kind", &self.kind)
            .field("resources", &self.resources)
            .field("cleaner", &self.cleaner)
            .finish_non_exhaustive()
    }
}
