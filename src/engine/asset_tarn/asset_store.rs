use super::*;
use crate::asset_metadata::asset_flags;
use crossbeam::channel::{Receiver, Sender, unbounded};
use job_tarn::JobQueue;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use unicase::UniCase;

#[inline] #[must_use]
fn name_key(name: &str) -> u64 { nab_tarn::hashing::hash_str_nocase(name) }

#[inline] #[must_use]
fn path_key(path: &str) -> u64 { nab_tarn::hashing::hash_str_nocase(path) }

#[must_use]
fn split_extension(path: &str) -> UniCase<String>
{
    match path.rsplit_once('.')
    {
        Some((_, ext)) if !ext.is_empty() && !ext.contains('/') => UniCase::new(ext.to_string()),
        _ => UniCase::new(String::new()),
    }
}

#[must_use]
fn name_from_path(path: &str) -> String
{
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.')
    {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file.to_string(),
    }
}

// Single source of truth for asset records, loader registration and job
// submission. Shared (Arc) between the public registry, worker threads and
// every AssetMetadata record (which hold it weakly)
pub(crate) struct AssetStore
{
    // authoritative, owning
    by_id: Mutex<HashMap<AssetId, Arc<AssetMetadata>>>,
    // multi-valued, non-owning; keyed by case-folded hash
    by_name: Mutex<HashMap<u64, Vec<Weak<AssetMetadata>>>>,
    by_path: Mutex<HashMap<u64, Vec<Weak<AssetMetadata>>>>,
    // external sources (not handles) pinning a path
    path_referrers: Mutex<HashMap<u64, HashSet<String>>>,

    loaders: Mutex<HashMap<UniCase<String>, Arc<dyn AssetLoader>>>,

    job_queue: Arc<JobQueue<AssetJob>>,
    notifications: (Sender<AssetNotification>, Receiver<AssetNotification>),

    assets_root: PathBuf, // should be absolute
}

impl AssetStore
{
    #[must_use]
    pub fn new(assets_root: PathBuf, job_queue: Arc<JobQueue<AssetJob>>) -> Arc<Self>
    {
        Arc::new(Self
        {
            by_id: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
            by_path: Mutex::new(HashMap::new()),
            path_referrers: Mutex::new(HashMap::new()),
            loaders: Mutex::new(HashMap::new()),
            job_queue,
            notifications: unbounded::<AssetNotification>(),
            assets_root,
        })
    }

    #[inline] #[must_use]
    pub fn job_queue(&self) -> &Arc<JobQueue<AssetJob>> { &self.job_queue }

    #[must_use]
    pub fn subscribe_to_notifications(&self) -> Receiver<AssetNotification>
    {
        self.notifications.1.clone()
    }

    // ---- registration & lookup ----

    // Insert a new record, assigning a fresh id. The caller holds the by_path
    // lock; by_path is always locked before by_id/by_name
    fn register_locked(
        self: &Arc<Self>,
        by_path_entry: &mut Vec<Weak<AssetMetadata>>,
        name: String,
        path: String,
        type_tag: TypeId,
        initial_flags: u8) -> Arc<AssetMetadata>
    {
        let id = AssetId::generate();
        let absolute_path = self.assets_root.join(&path);
        let extension = split_extension(&path);
        let key = name_key(&name);
        let meta = AssetMetadata::new(
            id,
            name,
            UniCase::new(path),
            absolute_path,
            extension,
            type_tag,
            initial_flags,
            Arc::downgrade(self));

        self.by_id.lock().insert(id, meta.clone());
        self.by_name.lock().entry(key).or_default().push(Arc::downgrade(&meta));

        by_path_entry.retain(|w| w.strong_count() > 0);
        by_path_entry.push(Arc::downgrade(&meta));
        if by_path_entry.len() > 1
        {
            // several assets decode from this one source file
            for weak in by_path_entry.iter()
            {
                if let Some(shared) = weak.upgrade()
                {
                    shared.mark_shares_path();
                }
            }
        }

        meta
    }

    // Resolve a path to its first registered asset, creating a bare record if
    // the path is unknown. Lookup and insert happen under one lock so
    // concurrent acquires of an unknown path cannot create two records
    pub fn resolve_or_create(self: &Arc<Self>, path: &str, type_tag: TypeId) -> Arc<AssetMetadata>
    {
        let key = path_key(path);
        let mut by_path = self.by_path.lock();
        if let Some(list) = by_path.get(&key)
        {
            for weak in list
            {
                if let Some(meta) = weak.upgrade()
                {
                    return meta;
                }
            }
        }

        let name = name_from_path(path);
        let entry = by_path.entry(key).or_default();
        self.register_locked(entry, name, path.to_string(), type_tag, 0)
    }

    pub fn register_desc(self: &Arc<Self>, desc: AssetMetadataDesc, initial_flags: u8) -> Arc<AssetMetadata>
    {
        let key = path_key(&desc.path);
        let mut by_path = self.by_path.lock();
        let entry = by_path.entry(key).or_default();

        // re-enumerating a file returns the existing records
        for weak in entry.iter()
        {
            if let Some(meta) = weak.upgrade()
            {
                if UniCase::new(meta.name()) == UniCase::new(desc.name.as_str())
                {
                    return meta;
                }
            }
        }

        self.register_locked(entry, desc.name, desc.path, desc.type_tag, initial_flags)
    }

    #[must_use]
    pub fn asset_by_id(&self, id: AssetId) -> Option<Arc<AssetMetadata>>
    {
        self.by_id.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn assets_by_name(&self, name: &str) -> Vec<Arc<AssetMetadata>>
    {
        self.by_name.lock().get(&name_key(name)).map_or(Vec::new(), |list|
        {
            list.iter()
                .filter_map(Weak::upgrade)
                .filter(|m| UniCase::new(m.name()) == UniCase::new(name)) // hash buckets can collide
                .collect()
        })
    }

    #[must_use]
    pub fn assets_by_path(&self, path: &str) -> Vec<Arc<AssetMetadata>>
    {
        self.by_path.lock().get(&path_key(path)).map_or(Vec::new(), |list|
        {
            list.iter()
                .filter_map(Weak::upgrade)
                .filter(|m| UniCase::new(m.path()) == UniCase::new(path))
                .collect()
        })
    }

    // ---- loaders ----

    pub fn add_file_loader(&self, extensions: &[&str], loader: Arc<dyn AssetLoader>)
    {
        let mut loaders = self.loaders.lock();
        for extension in extensions
        {
            let extension = extension.trim_start_matches('.');
            // later registrations win
            loaders.insert(UniCase::new(extension.to_string()), loader.clone());
        }
    }

    #[must_use]
    pub fn loader_for(&self, extension: &UniCase<String>) -> Option<Arc<dyn AssetLoader>>
    {
        self.loaders.lock().get(extension).cloned()
    }

    // Enumerate and register the sub-assets of a source file. Probing an
    // extension nobody registered is routine: silently empty, not an error
    pub fn load_file(self: &Arc<Self>, path: &str) -> Vec<Arc<AssetMetadata>>
    {
        let extension = split_extension(path);
        let Some(loader) = self.loader_for(&extension) else { return Vec::new(); };

        let absolute_path = self.assets_root.join(path);
        match loader.load_meta(&absolute_path)
        {
            Ok(descs) => descs.into_iter()
                .map(|desc| self.register_desc(desc, asset_flags::HAS_METADATA))
                .collect(),
            Err(err) =>
            {
                log::warn!("Failed to enumerate assets in {path:?}: {err}");
                Vec::new()
            }
        }
    }

    // ---- path referrers (external sources, not handles) ----

    pub fn add_path_referrer(&self, path: &str, source: &str)
    {
        self.path_referrers.lock().entry(path_key(path)).or_default().insert(source.to_string());
    }

    pub fn remove_path_referrer(self: &Arc<Self>, path: &str, source: &str)
    {
        let key = path_key(path);
        let mut referrers = self.path_referrers.lock();
        let Some(set) = referrers.get_mut(&key) else
        {
            log::warn!("remove_path_referrer: nothing pins {path:?}; ignoring");
            return;
        };
        if !set.remove(source)
        {
            log::warn!("remove_path_referrer: {source:?} does not pin {path:?}; ignoring");
            return;
        }
        let now_unpinned = set.is_empty();
        if now_unpinned
        {
            referrers.remove(&key);
        }
        drop(referrers);

        if now_unpinned
        {
            // the pin may have been the only thing keeping these resident
            for asset in self.assets_by_path(path)
            {
                if asset.referrer_count() == 0 && asset.lock_count() == 0
                    && (asset.is_loaded() || asset.is_loading())
                {
                    self.enqueue_unload(&asset);
                }
            }
        }
    }

    #[must_use]
    pub fn path_referrer_count(&self, path: &str) -> usize
    {
        self.path_referrers.lock().get(&path_key(path)).map_or(0, HashSet::len)
    }

    // ---- job submission ----

    fn submit(&self, job: AssetJob) -> Result<(), AssetJob>
    {
        if !self.job_queue.is_running()
        {
            log::warn!("Asset job dropped; the registry is shutting down");
            return Err(job);
        }
        self.job_queue.push(job);
        Ok(())
    }

    // One Load job covers every registered asset decoded from the same source
    // file, so sub-assets complete together. The caller has already claimed
    // the loading episode on `meta`
    pub fn enqueue_load(self: &Arc<Self>, meta: &Arc<AssetMetadata>)
    {
        let Some(loader) = self.loader_for(meta.extension()) else
        {
            log::warn!("No loader registered for extension {:?}; {meta:?} will not load", meta.extension());
            meta.clear_loading();
            return;
        };

        let mut affected = AffectedAssets::new();
        affected.push(meta.clone());
        for other in self.assets_by_path(meta.path())
        {
            if other.id() != meta.id() && other.begin_loading()
            {
                affected.push(other);
            }
        }

        let job = AssetJob::Load(LoadJob
        {
            absolute_path: meta.absolute_path().to_path_buf(),
            affected,
            loader,
        });
        if let Err(AssetJob::Load(job)) = self.submit(job)
        {
            for asset in &job.affected
            {
                asset.clear_loading();
            }
        }
    }

    pub fn enqueue_unload(self: &Arc<Self>, meta: &Arc<AssetMetadata>)
    {
        let loader = self.loader_for(meta.extension());
        let mut affected = AffectedAssets::new();
        affected.push(meta.clone());

        let job = AssetJob::Unload(UnloadJob
        {
            absolute_path: meta.absolute_path().to_path_buf(),
            affected,
            loader,
        });
        if self.submit(job).is_err()
        {
            // teardown path: release deterministically anyway
            meta.clear_asset();
        }
    }

    pub fn enqueue_push_event(self: &Arc<Self>, meta: &Arc<AssetMetadata>, target: ListenerId, event: AssetEventKind)
    {
        let job = AssetJob::PushEvent(PushEventJob
        {
            asset: meta.clone(),
            target,
            event,
        });
        let _ = self.submit(job); // a dropped push event at shutdown is benign
    }

    // Re-run the load for everything decoded from `path` without an
    // externally observable unload, and announce it on the notification
    // channel
    pub fn refresh_path(self: &Arc<Self>, path: &str)
    {
        let assets = self.assets_by_path(path);
        if assets.is_empty()
        {
            log::warn!("refresh_path: no assets registered for {path:?}; ignoring");
            return;
        }
        let extension = split_extension(path);
        let Some(loader) = self.loader_for(&extension) else
        {
            log::warn!("refresh_path: no loader registered for {path:?}; ignoring");
            return;
        };

        let affected: AffectedAssets = assets.into_iter().collect();
        let refreshed: Vec<AssetId> = affected.iter().map(|a| a.id()).collect();
        let job = AssetJob::Refresh(LoadJob
        {
            absolute_path: self.assets_root.join(path),
            affected,
            loader,
        });
        if self.submit(job).is_ok()
        {
            for id in refreshed
            {
                let _ = self.notifications.0.send(AssetNotification::Refreshed(id));
            }
        }
    }

    // ---- teardown ----

    pub fn report_leaks(&self)
    {
        let by_id = self.by_id.lock();
        let leaked: Vec<_> = by_id.values()
            .filter(|m| m.referrer_count() > 0 || m.lock_count() > 0)
            .collect();
        if !leaked.is_empty()
        {
            log::error!("! Leak detected: {} asset(s) still referenced at teardown:", leaked.len());
            for meta in leaked
            {
                log::error!("    {:#?} (referrers: {}, locks: {})", meta, meta.referrer_count(), meta.lock_count());
            }
        }
    }

    pub fn clear(&self)
    {
        self.by_path.lock().clear();
        self.by_name.lock().clear();
        self.by_id.lock().clear();
        self.path_referrers.lock().clear();
        self.loaders.lock().clear();
    }
}
