use super::*;
use parking_lot::{Condvar, Mutex};
use std::any::{Any, TypeId};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use unicase::UniCase;

// Lifecycle bit flags. LOADED and LOADING are mutually exclusive
pub(crate) mod asset_flags
{
    pub const LOADED: u8           = 1 << 0;
    pub const LOADING: u8          = 1 << 1;
    pub const HAS_METADATA: u8     = 1 << 2;
    pub const SHARES_PATH: u8      = 1 << 3;
    pub const MANUALLY_CREATED: u8 = 1 << 4;
}
use self::asset_flags::*;

pub type AssetListenerFn = dyn Fn(&AssetMetadata, AssetEventKind) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listener
{
    id: ListenerId,
    // Arc so dispatch can run outside the listener table lock
    callback: Arc<AssetListenerFn>,
}

#[derive(Default)]
struct ListenerTable
{
    entries: Vec<Listener>,
    // a load/refresh has installed the payload but its dispatch job has not
    // yet snapshotted the table
    dispatch_pending: bool,
}

// Identity and lifecycle record for one logical asset. Owned exclusively by
// the registry; handles and workers hold weak/borrowed references. The record
// outlives its payload: it may go through any number of load/unload cycles
pub struct AssetMetadata
{
    id: AssetId,
    name: String,
    path: UniCase<String>, // logical, relative to the assets root
    absolute_path: PathBuf,
    extension: UniCase<String>, // no leading dot
    type_tag: TypeId,

    flags: AtomicU8,
    referrers: AtomicUsize,
    locks: AtomicUsize,

    payload: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    listeners: Mutex<ListenerTable>,
    next_listener_id: AtomicU64,

    // loaded-flag wait primitive (sync handles, tests)
    state_lock: Mutex<()>,
    state_changed: Condvar,

    store: Weak<AssetStore>,

    #[cfg(debug_assertions)]
    referrer_records: Mutex<Vec<String>>,
}

impl AssetMetadata
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AssetId,
        name: String,
        path: UniCase<String>,
        absolute_path: PathBuf,
        extension: UniCase<String>,
        type_tag: TypeId,
        initial_flags: u8,
        store: Weak<AssetStore>) -> Arc<Self>
    {
        debug_assert_eq!(initial_flags & (LOADED | LOADING), 0);

        Arc::new(Self
        {
            id,
            name,
            path,
            absolute_path,
            extension,
            type_tag,
            flags: AtomicU8::new(initial_flags),
            referrers: AtomicUsize::new(0),
            locks: AtomicUsize::new(0),
            payload: Mutex::new(None),
            listeners: Mutex::new(ListenerTable::default()),
            next_listener_id: AtomicU64::new(1),
            state_lock: Mutex::new(()),
            state_changed: Condvar::new(),
            store,
            #[cfg(debug_assertions)]
            referrer_records: Mutex::new(Vec::new()),
        })
    }

    #[inline] #[must_use]
    pub fn id(&self) -> AssetId { self.id }

    #[inline] #[must_use]
    pub fn name(&self) -> &str { &self.name }

    #[inline] #[must_use]
    pub fn path(&self) -> &str { self.path.as_ref() }

    #[inline] #[must_use]
    pub fn absolute_path(&self) -> &Path { &self.absolute_path }

    #[inline] #[must_use]
    pub fn extension(&self) -> &UniCase<String> { &self.extension }

    #[inline] #[must_use]
    pub fn type_tag(&self) -> TypeId { self.type_tag }

    #[inline]
    fn flags(&self) -> u8 { self.flags.load(Ordering::Acquire) }

    #[inline] #[must_use]
    pub fn is_loaded(&self) -> bool { self.flags() & LOADED != 0 }

    #[inline] #[must_use]
    pub fn is_loading(&self) -> bool { self.flags() & LOADING != 0 }

    #[inline] #[must_use]
    pub fn has_metadata(&self) -> bool { self.flags() & HAS_METADATA != 0 }

    #[inline] #[must_use]
    pub fn shares_path(&self) -> bool { self.flags() & SHARES_PATH != 0 }

    #[inline] #[must_use]
    pub fn is_manually_created(&self) -> bool { self.flags() & MANUALLY_CREATED != 0 }

    #[inline] #[must_use]
    pub fn referrer_count(&self) -> usize { self.referrers.load(Ordering::Acquire) }

    #[inline] #[must_use]
    pub fn lock_count(&self) -> usize { self.locks.load(Ordering::Acquire) }

    pub(crate) fn mark_shares_path(&self)
    {
        self.flags.fetch_or(SHARES_PATH, Ordering::AcqRel);
    }

    // Register an owner keeping this asset resident. The 0 -> 1 transition of
    // an asset that is neither loading nor loaded kicks off a load
    pub fn add_referrer(self: &Arc<Self>, source: &str)
    {
        let prev = self.referrers.fetch_add(1, Ordering::AcqRel);
        debug_assert_ne!(prev, usize::MAX);
        self.record_referrer(source);

        if prev == 0 && self.flags() & (LOADED | LOADING) == 0
        {
            self.request_load();
        }
    }

    // Drop an owner; the last one out (with no locks held) requests an unload
    pub fn remove_referrer(self: &Arc<Self>, source: &str)
    {
        // never drive the count negative (unbalanced release is a warning, not a crash)
        let mut current = self.referrers.load(Ordering::Acquire);
        loop
        {
            if current == 0
            {
                log::warn!("Unbalanced remove_referrer on {self:?}; ignoring");
                return;
            }
            match self.referrers.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.unrecord_referrer(source);

        if current == 1 && self.lock_count() == 0
        {
            self.request_unload();
        }
    }

    // Pin the payload independent of referrer counting, e.g. for the duration
    // of a synchronous borrow that must survive a concurrent last-ref release
    pub fn lock_asset(&self)
    {
        let prev = self.locks.fetch_add(1, Ordering::AcqRel);
        debug_assert_ne!(prev, usize::MAX);
    }

    pub fn unlock_asset(self: &Arc<Self>)
    {
        let mut current = self.locks.load(Ordering::Acquire);
        loop
        {
            if current == 0
            {
                log::warn!("Unbalanced unlock_asset on {self:?}; ignoring");
                return;
            }
            match self.locks.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 && self.referrer_count() == 0
        {
            self.request_unload();
        }
    }

    // Flip on LOADING unless a load is already in flight or the payload is
    // resident. Returns whether this call claimed the loading episode
    pub(crate) fn begin_loading(&self) -> bool
    {
        let mut flags = self.flags();
        loop
        {
            if flags & (LOADED | LOADING) != 0
            {
                return false;
            }
            match self.flags.compare_exchange(flags, flags | LOADING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => flags = actual,
            }
        }
    }

    pub(crate) fn request_load(self: &Arc<Self>)
    {
        // LOADING is claimed synchronously, before the job is queued, so
        // concurrent referrers cannot double-issue a load
        if !self.begin_loading()
        {
            return;
        }

        match self.store.upgrade()
        {
            Some(store) => store.enqueue_load(self),
            None =>
            {
                log::warn!("{self:?} requested a load with no registry attached; ignoring");
                self.clear_loading();
            }
        }
    }

    pub(crate) fn request_unload(self: &Arc<Self>)
    {
        if self.is_manually_created()
        {
            // no backing file; drop the payload inline
            self.clear_asset();
            return;
        }

        match self.store.upgrade()
        {
            Some(store) => store.enqueue_unload(self),
            None => self.clear_asset(),
        }
    }

    // Observe Loaded/Updated/Unloaded transitions. Subscribing to an already
    // loaded asset queues a one-shot push event instead of calling back
    // inline, so every subscriber sees state through the same total order as
    // worker-driven transitions
    pub fn add_listener(self: &Arc<Self>, callback: impl Fn(&AssetMetadata, AssetEventKind) + Send + Sync + 'static) -> ListenerId
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let deliver_queued =
        {
            let mut table = self.listeners.lock();
            table.entries.push(Listener { id, callback: Arc::new(callback) });
            // if the installing job has not dispatched yet, its snapshot (taken
            // under this lock) includes the new entry; queueing a push as well
            // would deliver the initial event twice
            self.is_loaded() && !table.dispatch_pending
        };

        if deliver_queued
        {
            if let Some(store) = self.store.upgrade()
            {
                store.enqueue_push_event(self, id, AssetEventKind::Loaded);
            }
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId)
    {
        self.listeners.lock().entries.retain(|l| l.id != id);
    }

    pub(crate) fn dispatch_event(&self, event: AssetEventKind)
    {
        let callbacks: Vec<_> =
        {
            let mut table = self.listeners.lock();
            table.dispatch_pending = false;
            table.entries.iter().map(|l| l.callback.clone()).collect()
        };
        for callback in callbacks
        {
            (callback)(self, event);
        }
    }

    pub(crate) fn dispatch_event_to(&self, target: ListenerId, event: AssetEventKind)
    {
        // the listener may have unsubscribed while the push event was queued
        let callback = self.listeners.lock().entries.iter().find(|l| l.id == target).map(|l| l.callback.clone());
        if let Some(callback) = callback
        {
            (callback)(self, event);
        }
    }

    // Install the decoded payload. The previous payload (if any) is released
    // first; flags and waiters update after the slot is written
    pub fn set_asset<A: Asset>(&self, payload: Arc<A>) -> Result<(), AssetLoadError>
    {
        if TypeId::of::<A>() != self.type_tag
        {
            log::warn!("Rejected payload of mismatched type {} for {self:?}", std::any::type_name::<A>());
            return Err(AssetLoadError::MismatchedAssetType);
        }
        self.set_asset_erased(Some(payload));
        Ok(())
    }

    // Release the payload and clear both lifecycle flags
    pub fn clear_asset(&self)
    {
        self.set_asset_erased(None);
    }

    pub(crate) fn set_asset_erased(&self, payload: Option<Arc<dyn Any + Send + Sync>>)
    {
        let installed = payload.is_some();
        {
            let mut slot = self.payload.lock();
            *slot = None; // release any previous payload before wiring in the new one
            *slot = payload;
        }

        // must precede the flag flip: a subscriber that observes LOADED must
        // also observe that the install's dispatch is still owed
        self.listeners.lock().dispatch_pending = installed;

        let _ = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |f|
        {
            match installed
            {
                true => Some((f | LOADED) & !LOADING),
                false => Some(f & !(LOADED | LOADING)),
            }
        });
        self.signal_state_changed();
    }

    pub(crate) fn clear_loading(&self)
    {
        let _ = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| Some(f & !LOADING));
        self.signal_state_changed();
    }

    // Clone out the payload if resident and of the expected type
    #[must_use]
    pub fn payload<A: Asset>(&self) -> Option<Arc<A>>
    {
        if !self.is_loaded()
        {
            return None;
        }
        let slot = self.payload.lock();
        slot.clone()?.downcast::<A>().ok()
    }

    fn signal_state_changed(&self)
    {
        let _held = self.state_lock.lock();
        self.state_changed.notify_all();
    }

    // Park the calling thread until the current loading episode settles;
    // returns is_loaded(). Never parks indefinitely on an asset that is not
    // loading
    pub fn wait_for_load(&self, timeout: Option<Duration>) -> bool
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut held = self.state_lock.lock();
        while self.is_loading()
        {
            match deadline
            {
                None => self.state_changed.wait(&mut held),
                Some(deadline) =>
                {
                    if self.state_changed.wait_until(&mut held, deadline).timed_out()
                    {
                        break;
                    }
                }
            }
        }
        self.is_loaded()
    }

    // Park until the payload is resident or the deadline passes. Unlike
    // wait_for_load this also waits out the not-yet-queued window
    pub fn wait_until_loaded(&self, timeout: Duration) -> bool
    {
        let deadline = Instant::now() + timeout;
        let mut held = self.state_lock.lock();
        while !self.is_loaded()
        {
            if self.state_changed.wait_until(&mut held, deadline).timed_out()
            {
                break;
            }
        }
        self.is_loaded()
    }

    #[cfg(debug_assertions)]
    fn record_referrer(&self, source: &str)
    {
        self.referrer_records.lock().push(source.to_string());
    }
    #[cfg(debug_assertions)]
    fn unrecord_referrer(&self, source: &str)
    {
        let mut records = self.referrer_records.lock();
        if let Some(at) = records.iter().position(|r| r == source)
        {
            records.swap_remove(at);
        }
    }
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn referrer_sources(&self) -> Vec<String>
    {
        self.referrer_records.lock().clone()
    }

    #[cfg(not(debug_assertions))]
    fn record_referrer(&self, _source: &str) { }
    #[cfg(not(debug_assertions))]
    fn unrecord_referrer(&self, _source: &str) { }
}

impl Debug for AssetMetadata
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
    {
        match f.alternate()
        {
            true => f.write_fmt(format_args!("{}:{}", self.name, self.id)),
            false => f.write_fmt(format_args!("{}", self.name)),
        }
    }
}
