//! Foreign-owned handle lifecycle.
//!
//! Every foreign-owned return value is wrapped in a [`HostHandle`]: a
//! reference-counted host proxy around the raw pointer, its ownership kind,
//! and a monotonic dropped flag. Release happens exactly once: explicitly
//! through [`HostHandle::release`], or on scope exit when the last host
//! reference goes away (the deterministic stand-in for a GC finalizer).
//! Explicit release is the recommended path.
//!
//! `SharedAtomic` handles may be cloned and released from multiple threads
//! concurrently; the foreign side uses an atomic reference count.
//! `SharedSingleThread` handles are NOT protected against cross-thread use;
//! the foreign count is non-atomic and sharing them across threads is
//! undefined, exactly as with `Rc` itself.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use ferrule_ffi::types::OwnershipKind;

use crate::error::{Error, Result};
use crate::module::LoadedArtifact;

/// Per-context accounting of live foreign-owned handles.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    live: Arc<AtomicUsize>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles created and not yet released.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }
}

/// How a handle reaches back into the foreign side for destruction and
/// reference-count cloning. Kept behind a trait so lifecycle semantics are
/// testable without loading a real artifact, the same way builds hide behind
/// `Toolchain`.
pub(crate) trait ForeignRelease: Send + Sync {
    fn release(&self, ptr: *mut c_void);
    fn clone_ref(&self, ptr: *mut c_void) -> Result<*mut c_void>;
}

/// The production releaser: resolves fixed-shape symbols in the artifact
/// that produced the value.
pub(crate) struct SymbolRelease {
    pub class: String,
    pub drop_symbol: String,
    pub clone_symbol: Option<String>,
    /// Keeps the library mapped for as long as the destructor may run.
    pub artifact: Arc<LoadedArtifact>,
}

impl ForeignRelease for SymbolRelease {
    fn release(&self, ptr: *mut c_void) {
        match unsafe { self.artifact.drop_fn(&self.drop_symbol) } {
            Ok(drop_fn) => unsafe { drop_fn(ptr) },
            Err(err) => {
                warn!(
                    class = %self.class,
                    symbol = %self.drop_symbol,
                    error = %err,
                    "destructor symbol unavailable, leaking foreign value"
                );
            }
        }
    }

    fn clone_ref(&self, ptr: *mut c_void) -> Result<*mut c_void> {
        let Some(symbol) = &self.clone_symbol else {
            return Err(Error::UncloneableHandle {
                class: self.class.clone(),
            });
        };
        let clone_fn = unsafe { self.artifact.clone_fn(symbol) }
            .map_err(|err| Error::Protocol(format!("clone symbol `{symbol}`: {err}")))?;
        Ok(unsafe { clone_fn(ptr) })
    }
}

/// Raw pointer wrapper so the state can cross threads. Thread-safety of the
/// pointee is governed by the ownership kind, not by this wrapper.
struct RawPtr(*mut c_void);

unsafe impl Send for RawPtr {}
unsafe impl Sync for RawPtr {}

struct HandleState {
    ptr: RawPtr,
    kind: OwnershipKind,
    class: String,
    dropped: AtomicBool,
    releaser: Arc<dyn ForeignRelease>,
    live: Arc<AtomicUsize>,
}

impl HandleState {
    /// Exactly-once release: the first caller flips the flag and runs the
    /// foreign destructor; everyone after that is a no-op, never a double
    /// free.
    fn release_once(&self) {
        if self.dropped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.releaser.release(self.ptr.0);
    }

    /// Ownership moved into a foreign callee: flag without running the
    /// destructor.
    fn consume(&self) {
        if !self.dropped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for HandleState {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Host proxy for a foreign-owned value.
///
/// Cloning the proxy (`Clone`) creates another host alias of the same
/// underlying handle: both aliases observe the same dropped flag and the
/// foreign value is released once. [`HostHandle::clone_handle`] is different:
/// it goes through the foreign reference count and mints an independent
/// handle, and exists only for shared kinds.
#[derive(Clone)]
pub struct HostHandle {
    state: Arc<HandleState>,
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("class", &self.state.class)
            .field("kind", &self.state.kind)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

impl HostHandle {
    pub(crate) fn adopt(
        ptr: *mut c_void,
        kind: OwnershipKind,
        class: String,
        releaser: Arc<dyn ForeignRelease>,
        registry: &HandleRegistry,
    ) -> Self {
        let live = registry.counter();
        live.fetch_add(1, Ordering::SeqCst);
        debug!(class = %class, kind = ?kind, "adopted foreign handle");
        Self {
            state: Arc::new(HandleState {
                ptr: RawPtr(ptr),
                kind,
                class,
                dropped: AtomicBool::new(false),
                releaser,
                live,
            }),
        }
    }

    pub fn kind(&self) -> OwnershipKind {
        self.state.kind
    }

    pub fn class(&self) -> &str {
        &self.state.class
    }

    pub fn is_dropped(&self) -> bool {
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// The raw pointer, gated on liveness. Every non-drop operation funnels
    /// through here, so nothing touches a released handle.
    pub(crate) fn raw(&self) -> Result<*mut c_void> {
        if self.is_dropped() {
            return Err(Error::UseAfterDrop {
                class: self.state.class.clone(),
            });
        }
        Ok(self.state.ptr.0)
    }

    /// Explicitly release the foreign value. The first call runs the
    /// destructor; a second call is a guarded no-op.
    pub fn release(&self) {
        self.state.release_once();
    }

    pub(crate) fn mark_consumed(&self) {
        self.state.consume();
    }

    /// Clone through the foreign reference count. Defined for shared kinds
    /// only; unique handles refuse.
    pub fn clone_handle(&self, registry: &HandleRegistry) -> Result<HostHandle> {
        if self.state.kind == OwnershipKind::Unique {
            return Err(Error::UncloneableHandle {
                class: self.state.class.clone(),
            });
        }
        let ptr = self.raw()?;
        let new_ptr = self.state.releaser.clone_ref(ptr)?;
        Ok(HostHandle::adopt(
            new_ptr,
            self.state.kind,
            self.state.class.clone(),
            Arc::clone(&self.state.releaser),
            registry,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake foreign side: counts destructor and clone invocations, hands out
    /// distinct fake pointers, and never dereferences anything.
    #[derive(Default)]
    struct CountingRelease {
        released: AtomicUsize,
        cloned: AtomicUsize,
        refuse_clone: bool,
    }

    impl CountingRelease {
        fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl ForeignRelease for CountingRelease {
        fn release(&self, _ptr: *mut c_void) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn clone_ref(&self, _ptr: *mut c_void) -> Result<*mut c_void> {
            if self.refuse_clone {
                return Err(Error::UncloneableHandle {
                    class: "Fake".into(),
                });
            }
            let n = self.cloned.fetch_add(1, Ordering::SeqCst);
            Ok((0x1000 + n) as *mut c_void)
        }
    }

    fn adopt(
        releaser: &Arc<CountingRelease>,
        kind: OwnershipKind,
        registry: &HandleRegistry,
    ) -> HostHandle {
        HostHandle::adopt(
            0xbeef_usize as *mut c_void,
            kind,
            "Fake".into(),
            Arc::clone(releaser) as Arc<dyn ForeignRelease>,
            registry,
        )
    }

    #[test]
    fn test_release_is_exactly_once() {
        let registry = HandleRegistry::new();
        let releaser = CountingRelease::shared();
        let handle = adopt(&releaser, OwnershipKind::Unique, &registry);
        assert_eq!(registry.live_count(), 1);

        handle.release();
        assert!(handle.is_dropped());
        assert_eq!(registry.live_count(), 0);
        assert_eq!(releaser.released.load(Ordering::SeqCst), 1);

        // Double drop is defused.
        handle.release();
        assert_eq!(releaser.released.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_use_after_drop_is_rejected() {
        let registry = HandleRegistry::new();
        let releaser = CountingRelease::shared();
        let handle = adopt(&releaser, OwnershipKind::SharedAtomic, &registry);
        handle.release();

        let err = handle.raw().unwrap_err();
        assert!(matches!(err, Error::UseAfterDrop { .. }));
        let err = handle.clone_handle(&registry).unwrap_err();
        assert!(matches!(err, Error::UseAfterDrop { .. }));
    }

    #[test]
    fn test_scope_exit_releases_once() {
        let registry = HandleRegistry::new();
        let releaser = CountingRelease::shared();
        {
            let handle = adopt(&releaser, OwnershipKind::Unique, &registry);
            // A host alias shares the same underlying state.
            let _alias = handle.clone();
        }
        assert_eq!(releaser.released.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_consumed_handles_skip_the_destructor() {
        let registry = HandleRegistry::new();
        let releaser = CountingRelease::shared();
        let handle = adopt(&releaser, OwnershipKind::Unique, &registry);
        handle.mark_consumed();
        drop(handle);
        assert_eq!(releaser.released.load(Ordering::SeqCst), 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_unique_handles_refuse_clone() {
        let registry = HandleRegistry::new();
        let releaser = CountingRelease::shared();
        let handle = adopt(&releaser, OwnershipKind::Unique, &registry);
        let err = handle.clone_handle(&registry).unwrap_err();
        assert!(matches!(err, Error::UncloneableHandle { .. }));
    }

    #[test]
    fn test_shared_clone_goes_through_foreign_count() {
        let registry = HandleRegistry::new();
        let releaser = CountingRelease::shared();
        let handle = adopt(&releaser, OwnershipKind::SharedSingleThread, &registry);

        let cloned = handle.clone_handle(&registry).unwrap();
        assert_eq!(releaser.cloned.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 2);

        cloned.release();
        assert_eq!(registry.live_count(), 1);
        assert!(!handle.is_dropped());
    }

    #[test]
    fn test_concurrent_clone_and_release_leave_one_reference() {
        let registry = Arc::new(HandleRegistry::new());
        let releaser = CountingRelease::shared();
        let original = adopt(&releaser, OwnershipKind::SharedAtomic, &registry);

        let threads = 16;
        let mut join = Vec::new();
        for _ in 0..threads {
            let clone = original.clone_handle(&registry).unwrap();
            join.push(std::thread::spawn(move || {
                clone.release();
                clone.release();
            }));
        }
        for handle in join {
            handle.join().expect("release thread");
        }

        assert_eq!(releaser.cloned.load(Ordering::SeqCst), threads);
        assert_eq!(releaser.released.load(Ordering::SeqCst), threads);
        assert_eq!(registry.live_count(), 1);
        assert!(!original.is_dropped());
    }
}
