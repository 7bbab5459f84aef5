use super::*;
use nab_tarn::utils::ShortTypeName;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

// How a handle drives its asset's residency
pub trait AcquireMode
{
    // register as a referrer on bind, deregister on drop
    const AUTO: bool;
    // park on bind until the current loading episode settles
    const BLOCKING: bool;
}

// Kick off a load on acquisition, return immediately; poll is_loaded()/get()
pub struct AutomaticAsync;
impl AcquireMode for AutomaticAsync
{
    const AUTO: bool = true;
    const BLOCKING: bool = false;
}

// Kick off a load on acquisition and park until it settles
pub struct AutomaticSync;
impl AcquireMode for AutomaticSync
{
    const AUTO: bool = true;
    const BLOCKING: bool = true;
}

// Never loads or unloads implicitly; the consumer calls load()/unload()
pub struct Manual;
impl AcquireMode for Manual
{
    const AUTO: bool = false;
    const BLOCKING: bool = false;
}

// Consumer-facing typed handle to one asset. Holds the metadata weakly and
// re-validates on every access; the payload is only borrowed through get()
pub struct AssetRef<A: Asset, M: AcquireMode = AutomaticAsync>
{
    meta: Weak<AssetMetadata>,
    // keeps the last observed payload alive until this handle sees the unload
    cached: Mutex<Option<Arc<A>>>,
    subscribed: bool, // this handle counts as a referrer
    _mode: PhantomData<M>,
}

impl<A: Asset, M: AcquireMode> AssetRef<A, M>
{
    // A handle bound to nothing; all queries answer negatively
    #[must_use]
    pub fn unset() -> Self
    {
        Self
        {
            meta: Weak::new(),
            cached: Mutex::new(None),
            subscribed: false,
            _mode: PhantomData,
        }
    }

    pub(crate) fn bind(meta: &Arc<AssetMetadata>) -> Self
    {
        if meta.type_tag() != TypeId::of::<A>()
        {
            log::warn!("Rejected binding {meta:?} to a handle of mismatched type {}", A::short_type_name());
            return Self::unset();
        }

        let subscribed = M::AUTO;
        if subscribed
        {
            meta.add_referrer(A::short_type_name());
            // a failed load clears the flags while referrers remain, so the
            // 0 -> 1 transition alone cannot be trusted to have claimed an
            // episode; claiming again here is idempotent
            meta.request_load();
        }
        if M::BLOCKING
        {
            meta.wait_for_load(None);
        }

        Self
        {
            meta: Arc::downgrade(meta),
            cached: Mutex::new(None),
            subscribed,
            _mode: PhantomData,
        }
    }

    #[inline] #[must_use]
    pub fn is_set(&self) -> bool { self.meta.strong_count() > 0 }

    #[must_use]
    pub fn metadata(&self) -> Option<Arc<AssetMetadata>> { self.meta.upgrade() }

    #[must_use]
    pub fn id(&self) -> Option<AssetId>
    {
        self.meta.upgrade().map(|m| m.id())
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool
    {
        self.meta.upgrade().is_some_and(|m| m.is_loaded())
    }

    #[must_use]
    pub fn is_loading(&self) -> bool
    {
        self.meta.upgrade().is_some_and(|m| m.is_loading())
    }

    // Borrow the payload if it is currently resident. Payload reads race with
    // unloads by design; the Loaded flag is re-checked here rather than
    // assuming pointer stability
    #[must_use]
    pub fn get(&self) -> Option<Arc<A>>
    {
        let Some(meta) = self.meta.upgrade() else
        {
            self.cached.lock().take();
            return None;
        };

        match meta.is_loaded()
        {
            true =>
            {
                let payload = meta.payload::<A>();
                *self.cached.lock() = payload.clone();
                payload
            }
            false =>
            {
                self.cached.lock().take();
                None
            }
        }
    }

    // Park until the payload is resident or the deadline passes
    #[must_use]
    pub fn wait_until_loaded(&self, timeout: std::time::Duration) -> bool
    {
        self.meta.upgrade().is_some_and(|m| m.wait_until_loaded(timeout))
    }
}

impl<A: Asset> AssetRef<A, Manual>
{
    pub fn load(&self)
    {
        if let Some(meta) = self.meta.upgrade()
        {
            meta.request_load();
        }
    }

    pub fn unload(&self)
    {
        self.cached.lock().take();
        let Some(meta) = self.meta.upgrade() else { return; };
        if !meta.is_loaded() && !meta.is_loading()
        {
            log::warn!("Unload of already unloaded {meta:?}; ignoring");
            return;
        }
        meta.request_unload();
    }
}

impl<A: Asset, M: AcquireMode> Clone for AssetRef<A, M>
{
    fn clone(&self) -> Self
    {
        let meta = self.meta.upgrade();
        if M::AUTO
        {
            if let Some(meta) = &meta
            {
                meta.add_referrer(A::short_type_name());
                meta.request_load();
            }
        }

        Self
        {
            meta: self.meta.clone(),
            cached: Mutex::new(self.cached.lock().clone()),
            subscribed: M::AUTO && meta.is_some(),
            _mode: PhantomData,
        }
    }
}

impl<A: Asset, M: AcquireMode> Drop for AssetRef<A, M>
{
    fn drop(&mut self)
    {
        if !self.subscribed
        {
            return;
        }
        self.subscribed = false; // idempotent against double-destruction
        if let Some(meta) = self.meta.upgrade()
        {
            meta.remove_referrer(A::short_type_name());
        }
    }
}

// Identity of the underlying metadata, not payload pointers: two handles to
// the same not-yet-loaded asset compare equal
impl<A: Asset, M: AcquireMode> PartialEq for AssetRef<A, M>
{
    fn eq(&self, other: &Self) -> bool { self.meta.ptr_eq(&other.meta) }
}
impl<A: Asset, M: AcquireMode> Eq for AssetRef<A, M> { }

impl<A: Asset, M: AcquireMode> Debug for AssetRef<A, M>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
    {
        match self.meta.upgrade()
        {
            Some(meta) => Debug::fmt(&*meta, f),
            None => f.write_str("(unset)"),
        }
    }
}
