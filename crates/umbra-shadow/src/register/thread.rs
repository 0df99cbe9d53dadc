//! Thread registration and the thread-local register shadow handle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;

use tracing::debug;

use super::{Gpr, RegisterShadowSet};

/// Identifies the registry a thread-local record belongs to.
pub type RegistryId = u64;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INSTALLED: RefCell<HashMap<RegistryId, ThreadShadow>> = RefCell::new(HashMap::new());
}

/// Shared handle to one thread's register shadow.
///
/// The owning thread reaches it through [`ThreadRegistry::current`]. Other
/// threads may hold a clone to inspect or update it, e.g. when a signal or
/// syscall is observed on the owner's behalf.
#[derive(Clone, Debug)]
pub struct ThreadShadow {
    set: Arc<RegisterShadowSet>,
    owner: ThreadId,
}

impl ThreadShadow {
    pub fn new(is_first: bool, entry_defined: &[Gpr]) -> Self {
        Self {
            set: Arc::new(RegisterShadowSet::new(is_first, entry_defined)),
            owner: std::thread::current().id(),
        }
    }

    /// Thread that registered this record.
    pub const fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn registers(&self) -> &RegisterShadowSet {
        &self.set
    }

    /// Whether two handles refer to the same record.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.set, &other.set)
    }

    pub fn log_registers(&self) {
        debug!(owner = ?self.owner, "register shadow dump");
        self.set.log();
    }
}

impl Deref for ThreadShadow {
    type Target = RegisterShadowSet;

    fn deref(&self) -> &Self::Target {
        &self.set
    }
}

fn lookup(id: RegistryId) -> Option<ThreadShadow> {
    INSTALLED.with(|map| map.borrow().get(&id).cloned())
}

fn install(id: RegistryId, handle: ThreadShadow) -> Option<ThreadShadow> {
    INSTALLED.with(|map| map.borrow_mut().insert(id, handle))
}

fn uninstall(id: RegistryId) -> Option<ThreadShadow> {
    // The table may already be gone if this runs from another TLS destructor.
    INSTALLED
        .try_with(|map| map.borrow_mut().remove(&id))
        .ok()
        .flatten()
}

/// Creates register shadows for threads as they start.
///
/// Each registry keeps its own per-thread records; registering a thread with
/// one registry leaves its records in every other registry untouched.
#[derive(Debug)]
pub struct ThreadRegistry {
    id: RegistryId,
    entry_defined: Vec<Gpr>,
    first_seen: AtomicBool,
}

impl ThreadRegistry {
    pub fn new(entry_defined: Vec<Gpr>) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            entry_defined,
            first_seen: AtomicBool::new(false),
        }
    }

    pub const fn id(&self) -> RegistryId {
        self.id
    }

    /// The calling thread's record in this registry, if it has been initialized.
    pub fn current(&self) -> Option<ThreadShadow> {
        lookup(self.id)
    }

    /// Register the calling thread; the first caller counts as the initial thread.
    pub fn thread_init(&self) -> ThreadShadow {
        let is_first = !self.first_seen.swap(true, Ordering::AcqRel);
        self.init_thread(is_first)
    }

    /// Register the calling thread with an explicit first-thread flag.
    ///
    /// Replaces any record the thread already had.
    pub fn init_thread(&self, is_first: bool) -> ThreadShadow {
        if is_first {
            self.first_seen.store(true, Ordering::Release);
        }
        let handle = ThreadShadow::new(is_first, &self.entry_defined);
        if install(self.id, handle.clone()).is_some() {
            debug!("replacing existing register shadow");
        }
        debug!(is_first, thread = ?handle.owner(), "thread shadow initialized");
        handle
    }

    /// Detach the calling thread's record. Outstanding clones stay valid.
    pub fn thread_exit(&self) -> Option<ThreadShadow> {
        let handle = uninstall(self.id);
        if let Some(handle) = &handle {
            debug!(thread = ?handle.owner(), "thread shadow released");
        }
        handle
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        // Records on other threads are released when those threads exit.
        uninstall(self.id);
    }
}
