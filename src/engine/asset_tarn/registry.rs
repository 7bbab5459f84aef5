use super::*;
use crate::asset_metadata::asset_flags;
use crossbeam::channel::Receiver;
use job_tarn::{JobQueue, WorkerPool, default_worker_count};
use std::any::TypeId;
use std::path::PathBuf;
use std::sync::Arc;

pub struct AssetRegistryConfig
{
    pub assets_root: PathBuf, // should be absolute
    pub worker_count: usize, // 0 picks one per two hardware threads
    pub queue_capacity: usize, // initial only; the queue grows under load
}
impl AssetRegistryConfig
{
    #[must_use]
    pub fn new(assets_root: impl Into<PathBuf>) -> Self
    {
        Self
        {
            assets_root: assets_root.into(),
            worker_count: 0,
            queue_capacity: 64,
        }
    }
}

// Owns the asset catalog and the worker pool that services it. One of these
// per app; all other asset types hang off it via handles
pub struct AssetRegistry
{
    store: Arc<AssetStore>,
    workers: WorkerPool<AssetJob>,
}

impl AssetRegistry
{
    #[must_use]
    pub fn new(config: AssetRegistryConfig) -> Self
    {
        let worker_count = match config.worker_count
        {
            0 => default_worker_count(),
            n => n,
        };
        let queue = JobQueue::new(config.queue_capacity.max(2));
        let store = AssetStore::new(config.assets_root, queue.clone());
        let workers = WorkerPool::new(queue,
            worker_count,
            {
                let store = store.clone();
                move |job| execute_job(&store, job)
            });

        Self { store, workers }
    }

    // Resolve `path` to a typed handle, registering a bare record if the path
    // is unknown. Whether this triggers a load (and whether it blocks until
    // the load settles) is up to the acquisition mode
    #[must_use]
    pub fn acquire<A: Asset, M: AcquireMode>(&self, path: &str) -> AssetRef<A, M>
    {
        let meta = self.store.resolve_or_create(path, TypeId::of::<A>());
        AssetRef::bind(&meta)
    }

    // Register an asset that has no backing file; the payload is installed
    // immediately and released inline when the last referrer leaves
    #[must_use]
    pub fn create_asset<A: Asset>(&self, name: &str, payload: Arc<A>) -> AssetRef<A, Manual>
    {
        let meta = self.store.register_desc(
            AssetMetadataDesc
            {
                name: name.to_string(),
                path: format!("(manual)/{name}"),
                type_tag: TypeId::of::<A>(),
            },
            asset_flags::MANUALLY_CREATED | asset_flags::HAS_METADATA);
        let _ = meta.set_asset(payload); // type tag matches by construction
        AssetRef::bind(&meta)
    }

    pub fn register_asset(&self, desc: AssetMetadataDesc) -> Arc<AssetMetadata>
    {
        self.store.register_desc(desc, asset_flags::HAS_METADATA)
    }

    // Enumerate and register the sub-assets of one source file (no payloads
    // are decoded). Unknown extensions yield an empty list
    pub fn load_file(&self, path: &str) -> Vec<Arc<AssetMetadata>>
    {
        self.store.load_file(path)
    }

    pub fn add_file_loader(&self, extensions: &[&str], loader: Arc<dyn AssetLoader>)
    {
        self.store.add_file_loader(extensions, loader);
    }

    #[must_use]
    pub fn get_asset_by_id(&self, id: AssetId) -> Option<Arc<AssetMetadata>>
    {
        self.store.asset_by_id(id)
    }

    #[must_use]
    pub fn get_asset_by_name(&self, name: &str) -> Option<Arc<AssetMetadata>>
    {
        self.store.assets_by_name(name).into_iter().next()
    }

    #[must_use]
    pub fn get_assets_by_name(&self, name: &str) -> Vec<Arc<AssetMetadata>>
    {
        self.store.assets_by_name(name)
    }

    #[must_use]
    pub fn get_asset_by_path(&self, path: &str) -> Option<Arc<AssetMetadata>>
    {
        self.store.assets_by_path(path).into_iter().next()
    }

    #[must_use]
    pub fn get_assets_by_path(&self, path: &str) -> Vec<Arc<AssetMetadata>>
    {
        self.store.assets_by_path(path)
    }

    pub fn add_path_referrer(&self, path: &str, source: &str)
    {
        self.store.add_path_referrer(path, source);
    }

    pub fn remove_path_referrer(&self, path: &str, source: &str)
    {
        self.store.remove_path_referrer(path, source);
    }

    #[must_use]
    pub fn path_referrer_count(&self, path: &str) -> usize
    {
        self.store.path_referrer_count(path)
    }

    // Re-run the load for everything decoded from `path` in place (resident
    // payloads swap without an observable unload)
    pub fn refresh_path(&self, path: &str)
    {
        self.store.refresh_path(path);
    }

    #[must_use]
    pub fn subscribe_to_notifications(&self) -> Receiver<AssetNotification>
    {
        self.store.subscribe_to_notifications()
    }

    #[inline] #[must_use]
    pub fn worker_count(&self) -> usize { self.workers.worker_count() }

    // Wait for every queued asset job to finish, including jobs queued by
    // running jobs
    pub fn wait_idle(&self)
    {
        self.workers.wait_idle();
    }

    pub fn shutdown(&mut self)
    {
        if self.workers.queue().is_running()
        {
            self.workers.wait_idle();
        }
        self.workers.shutdown();
        self.store.report_leaks();
        self.store.clear();
    }
}
impl Drop for AssetRegistry
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use nab_tarn::debugging::init_test_logging;
    use std::error::Error;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Blob
    {
        contents: String,
    }
    impl Asset for Blob { }

    struct Pixels;
    impl Asset for Pixels { }

    #[derive(Default)]
    struct BlobLoader
    {
        load_calls: AtomicUsize,
        fail_next: AtomicBool,
        delay: Duration,
        // holds the load job open after payloads are installed
        post_install_delay: Duration,
    }
    impl BlobLoader
    {
        fn slow(delay: Duration) -> Self
        {
            Self { delay, ..Default::default() }
        }
    }
    impl AssetLoader for BlobLoader
    {
        fn load_meta(&self, _path: &Path) -> Result<Vec<AssetMetadataDesc>, Box<dyn Error>>
        {
            Ok(Vec::new())
        }

        fn load_assets(&self, _path: &Path, _task: LoadTask, assets: &[Arc<AssetMetadata>]) -> Result<(), Box<dyn Error>>
        {
            if self.delay > Duration::ZERO
            {
                std::thread::sleep(self.delay);
            }
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst)
            {
                return Err(Box::new(AssetLoadError::Decode));
            }

            for asset in assets
            {
                asset.set_asset(Arc::new(Blob { contents: format!("blob:{}", asset.name()) }))?;
            }
            if self.post_install_delay > Duration::ZERO
            {
                std::thread::sleep(self.post_install_delay);
            }
            Ok(())
        }
    }

    fn test_registry() -> (AssetRegistry, Arc<BlobLoader>)
    {
        init_test_logging();
        let registry = AssetRegistry::new(AssetRegistryConfig
        {
            assets_root: std::env::temp_dir(),
            worker_count: 2,
            queue_capacity: 8,
        });
        let loader = Arc::new(BlobLoader::default());
        registry.add_file_loader(&["blob"], loader.clone());
        (registry, loader)
    }

    const SETTLE: Duration = Duration::from_secs(5);

    mod dedup
    {
        use super::*;

        #[test]
        fn loader_runs_once_for_concurrent_acquires()
        {
            init_test_logging();
            let registry = AssetRegistry::new(AssetRegistryConfig
            {
                assets_root: std::env::temp_dir(),
                worker_count: 4,
                queue_capacity: 8,
            });
            let loader = Arc::new(BlobLoader::slow(Duration::from_millis(20)));
            registry.add_file_loader(&["blob"], loader.clone());

            std::thread::scope(|scope|
            {
                for _ in 0..8
                {
                    scope.spawn(||
                    {
                        let handle = registry.acquire::<Blob, AutomaticAsync>("shared.blob");
                        assert!(handle.wait_until_loaded(SETTLE));
                        assert!(handle.get().is_some());
                    });
                }
            });

            registry.wait_idle();
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn same_path_resolves_to_one_record()
        {
            let (registry, _loader) = test_registry();

            let a = registry.acquire::<Blob, AutomaticAsync>("thing.blob");
            let b = registry.acquire::<Blob, AutomaticAsync>("THING.BLOB"); // case-insensitive
            assert_eq!(a, b);
            assert_eq!(a.id(), b.id());
            registry.wait_idle();
        }
    }

    mod refcounts
    {
        use super::*;

        #[test]
        fn add_then_remove_is_symmetric()
        {
            let (registry, _loader) = test_registry();

            let handle = registry.acquire::<Blob, AutomaticAsync>("counted.blob");
            let meta = handle.metadata().unwrap();
            assert_eq!(meta.referrer_count(), 1);

            let clone = handle.clone();
            assert_eq!(meta.referrer_count(), 2);
            drop(clone);
            assert_eq!(meta.referrer_count(), 1);

            assert!(handle.wait_until_loaded(SETTLE));
            drop(handle);
            registry.wait_idle();
            assert_eq!(meta.referrer_count(), 0);
            assert!(!meta.is_loaded());
        }

        #[test]
        fn unbalanced_release_is_a_no_op()
        {
            let (registry, _loader) = test_registry();

            let meta = registry.acquire::<Blob, AutomaticAsync>("once.blob").metadata().unwrap();
            registry.wait_idle();
            // the handle was dropped above; one extra release must not go negative
            meta.remove_referrer("test");
            assert_eq!(meta.referrer_count(), 0);
            registry.wait_idle();
        }
    }

    mod locks
    {
        use super::*;

        #[test]
        fn lock_outranks_last_referrer_leaving()
        {
            let (registry, _loader) = test_registry();

            let handle = registry.acquire::<Blob, AutomaticAsync>("pinned.blob");
            assert!(handle.wait_until_loaded(SETTLE));
            let meta = handle.metadata().unwrap();

            meta.lock_asset();
            drop(handle);
            registry.wait_idle();
            assert!(meta.is_loaded(), "locked asset must survive losing its referrers");

            meta.unlock_asset();
            registry.wait_idle();
            assert!(!meta.is_loaded());
        }
    }

    mod listeners
    {
        use super::*;

        #[test]
        fn late_subscriber_sees_exactly_one_loaded()
        {
            let (registry, _loader) = test_registry();

            let handle = registry.acquire::<Blob, AutomaticAsync>("late.blob");
            assert!(handle.wait_until_loaded(SETTLE));
            registry.wait_idle();

            let loaded_events = Arc::new(AtomicUsize::new(0));
            let meta = handle.metadata().unwrap();
            meta.add_listener(
            {
                let loaded_events = loaded_events.clone();
                move |_, event|
                {
                    if event == AssetEventKind::Loaded
                    {
                        loaded_events.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

            registry.wait_idle();
            assert_eq!(loaded_events.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn subscriber_during_load_dispatch_sees_one_loaded()
        {
            init_test_logging();
            let registry = AssetRegistry::new(AssetRegistryConfig
            {
                assets_root: std::env::temp_dir(),
                worker_count: 2,
                queue_capacity: 8,
            });
            let loader = Arc::new(BlobLoader
            {
                post_install_delay: Duration::from_millis(200),
                ..Default::default()
            });
            registry.add_file_loader(&["blob"], loader.clone());

            let handle = registry.acquire::<Blob, AutomaticAsync>("raced.blob");
            let meta = handle.metadata().unwrap();

            // subscribe in the window between the install and the job's dispatch
            let deadline = std::time::Instant::now() + SETTLE;
            while !meta.is_loaded()
            {
                assert!(std::time::Instant::now() < deadline);
                std::thread::sleep(Duration::from_millis(1));
            }

            let loaded_events = Arc::new(AtomicUsize::new(0));
            meta.add_listener(
            {
                let loaded_events = loaded_events.clone();
                move |_, event|
                {
                    if event == AssetEventKind::Loaded
                    {
                        loaded_events.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

            registry.wait_idle();
            assert_eq!(loaded_events.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn unload_dispatches_unloaded()
        {
            let (registry, _loader) = test_registry();

            let handle = registry.acquire::<Blob, AutomaticAsync>("fleeting.blob");
            assert!(handle.wait_until_loaded(SETTLE));
            registry.wait_idle();

            let unloaded = Arc::new(AtomicBool::new(false));
            let meta = handle.metadata().unwrap();
            meta.add_listener(
            {
                let unloaded = unloaded.clone();
                move |_, event|
                {
                    if event == AssetEventKind::Unloaded
                    {
                        unloaded.store(true, Ordering::SeqCst);
                    }
                }
            });
            registry.wait_idle();

            drop(handle);
            registry.wait_idle();
            assert!(unloaded.load(Ordering::SeqCst));
        }

        #[test]
        fn removed_listener_is_not_called()
        {
            let (registry, _loader) = test_registry();

            // Manual mode: nothing is loaded (and no push event is queued) yet
            let handle = registry.acquire::<Blob, Manual>("quiet.blob");

            let called = Arc::new(AtomicBool::new(false));
            let meta = handle.metadata().unwrap();
            let id =
            {
                let called = called.clone();
                meta.add_listener(move |_, _| { called.store(true, Ordering::SeqCst); })
            };
            meta.remove_listener(id);

            handle.load();
            assert!(handle.wait_until_loaded(SETTLE));
            registry.wait_idle();
            assert!(!called.load(Ordering::SeqCst));

            handle.unload();
            registry.wait_idle();
        }
    }

    mod acquisition
    {
        use super::*;

        #[test]
        fn sync_acquire_blocks_until_loaded()
        {
            init_test_logging();
            let registry = AssetRegistry::new(AssetRegistryConfig
            {
                assets_root: std::env::temp_dir(),
                worker_count: 2,
                queue_capacity: 8,
            });
            let loader = Arc::new(BlobLoader::slow(Duration::from_millis(50)));
            registry.add_file_loader(&["blob"], loader.clone());

            let async_handle = registry.acquire::<Blob, AutomaticAsync>("mesh.blob");
            assert!(async_handle.is_loading() || async_handle.is_loaded());

            let sync_handle = registry.acquire::<Blob, AutomaticSync>("mesh.blob");
            assert!(sync_handle.is_loaded(), "sync acquisition must not return before the load settles");
            assert!(async_handle.is_loaded());
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 1);

            registry.wait_idle();
        }

        #[test]
        fn sync_acquire_settles_under_contention()
        {
            let (registry, _loader) = test_registry();

            for i in 0..32
            {
                let path = format!("contended{i}.blob");
                std::thread::scope(|scope|
                {
                    scope.spawn(||
                    {
                        let handle = registry.acquire::<Blob, AutomaticAsync>(&path);
                        assert!(handle.wait_until_loaded(SETTLE));
                    });

                    let sync = registry.acquire::<Blob, AutomaticSync>(&path);
                    assert!(sync.is_loaded(), "sync acquisition returned before the load settled");
                });
                registry.wait_idle();
            }
        }

        #[test]
        fn manual_mode_loads_and_unloads_only_on_request()
        {
            let (registry, loader) = test_registry();

            let handle = registry.acquire::<Blob, Manual>("deliberate.blob");
            registry.wait_idle();
            assert!(!handle.is_loaded());
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 0);

            handle.load();
            assert!(handle.wait_until_loaded(SETTLE));
            assert_eq!(handle.get().unwrap().contents, "blob:deliberate");

            handle.unload();
            registry.wait_idle();
            assert!(!handle.is_loaded());
            assert!(handle.get().is_none());
        }

        #[test]
        fn mismatched_type_leaves_the_handle_unset()
        {
            let (registry, _loader) = test_registry();

            let typed = registry.acquire::<Blob, AutomaticAsync>("typed.blob");
            let wrong = registry.acquire::<Pixels, AutomaticAsync>("typed.blob");
            assert!(!wrong.is_set());
            assert!(wrong.get().is_none());

            assert!(typed.wait_until_loaded(SETTLE));
            registry.wait_idle();
        }

        #[test]
        fn manually_created_assets_release_inline()
        {
            let (registry, _loader) = test_registry();

            let handle = registry.create_asset("generated", Arc::new(Blob { contents: "made up".to_string() }));
            assert!(handle.is_loaded());
            assert_eq!(handle.get().unwrap().contents, "made up");

            handle.unload();
            assert!(!handle.is_loaded(), "manual assets clear without a queued job");
            registry.wait_idle();
        }
    }

    mod failures
    {
        use super::*;

        #[test]
        fn loader_failure_reverts_and_allows_retry()
        {
            let (registry, loader) = test_registry();
            loader.fail_next.store(true, Ordering::SeqCst);

            let handle = registry.acquire::<Blob, AutomaticAsync>("flaky.blob");
            let meta = handle.metadata().unwrap();
            registry.wait_idle();
            assert!(!meta.is_loaded());
            assert!(!meta.is_loading());
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 1);

            // a fresh first referrer retries the load
            drop(handle);
            registry.wait_idle();
            let handle = registry.acquire::<Blob, AutomaticAsync>("flaky.blob");
            assert!(handle.wait_until_loaded(SETTLE));
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 2);
            registry.wait_idle();
        }

        #[test]
        fn failed_load_retries_while_referrers_remain()
        {
            let (registry, loader) = test_registry();
            loader.fail_next.store(true, Ordering::SeqCst);

            let survivor = registry.acquire::<Blob, AutomaticAsync>("stubborn.blob");
            registry.wait_idle();
            assert!(!survivor.is_loaded());
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 1);

            // the count is already past 1; acquisition must still claim a new episode
            let retry = registry.acquire::<Blob, AutomaticAsync>("stubborn.blob");
            assert!(retry.wait_until_loaded(SETTLE));
            assert!(survivor.is_loaded());
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 2);
            registry.wait_idle();
        }

        #[test]
        fn unknown_extension_probe_is_silently_empty()
        {
            let (registry, _loader) = test_registry();
            assert!(registry.load_file("mystery.xyz").is_empty());
        }

        #[test]
        fn acquiring_an_unloadable_extension_never_wedges()
        {
            let (registry, _loader) = test_registry();

            // no loader for .xyz; sync acquisition must still return
            let handle = registry.acquire::<Blob, AutomaticSync>("mystery.xyz");
            assert!(!handle.is_loaded());
            assert!(!handle.is_loading());
            registry.wait_idle();
        }
    }

    mod path_sharing
    {
        use super::*;

        #[test]
        fn path_mates_load_together()
        {
            let (registry, loader) = test_registry();

            let a = registry.register_asset(AssetMetadataDesc
            {
                name: "a".to_string(),
                path: "pack.blob".to_string(),
                type_tag: std::any::TypeId::of::<Blob>(),
            });
            let b = registry.register_asset(AssetMetadataDesc
            {
                name: "b".to_string(),
                path: "pack.blob".to_string(),
                type_tag: std::any::TypeId::of::<Blob>(),
            });
            assert!(a.shares_path());
            assert!(b.shares_path());

            a.add_referrer("test");
            registry.wait_idle();
            assert!(a.is_loaded());
            assert!(b.is_loaded(), "sub-assets of one source file complete together");
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 1);

            a.remove_referrer("test");
            registry.wait_idle();
        }

        #[test]
        fn path_pin_blocks_unload_until_released()
        {
            let (registry, _loader) = test_registry();

            registry.add_path_referrer("held.blob", "editor");
            assert_eq!(registry.path_referrer_count("held.blob"), 1);

            let handle = registry.acquire::<Blob, AutomaticAsync>("held.blob");
            assert!(handle.wait_until_loaded(SETTLE));
            let meta = handle.metadata().unwrap();

            drop(handle);
            registry.wait_idle();
            assert!(meta.is_loaded(), "pinned path must survive losing its handle referrers");

            registry.remove_path_referrer("held.blob", "editor");
            registry.wait_idle();
            assert!(!meta.is_loaded());
            assert_eq!(registry.path_referrer_count("held.blob"), 0);
        }
    }

    mod refresh
    {
        use super::*;

        #[test]
        fn refresh_swaps_in_place_and_notifies()
        {
            let (registry, loader) = test_registry();

            let handle = registry.acquire::<Blob, AutomaticAsync>("live.blob");
            assert!(handle.wait_until_loaded(SETTLE));
            registry.wait_idle();

            let updated = Arc::new(AtomicUsize::new(0));
            let unloaded = Arc::new(AtomicBool::new(false));
            let meta = handle.metadata().unwrap();
            meta.add_listener(
            {
                let updated = updated.clone();
                let unloaded = unloaded.clone();
                move |_, event|
                {
                    match event
                    {
                        AssetEventKind::Updated => { updated.fetch_add(1, Ordering::SeqCst); }
                        AssetEventKind::Unloaded => { unloaded.store(true, Ordering::SeqCst); }
                        AssetEventKind::Loaded => {}
                    }
                }
            });
            registry.wait_idle();

            let notifications = registry.subscribe_to_notifications();
            registry.refresh_path("live.blob");
            registry.wait_idle();

            assert_eq!(notifications.recv_timeout(SETTLE).unwrap(), AssetNotification::Refreshed(meta.id()));
            assert_eq!(updated.load(Ordering::SeqCst), 1);
            assert!(!unloaded.load(Ordering::SeqCst), "refresh must not look like an unload");
            assert!(handle.is_loaded());
            assert!(handle.get().is_some());
            assert_eq!(loader.load_calls.load(Ordering::SeqCst), 2);
        }
    }

    mod teardown
    {
        use super::*;

        #[test]
        fn handles_degrade_gracefully_after_shutdown()
        {
            let (registry, _loader) = test_registry();

            let handle = registry.acquire::<Blob, AutomaticAsync>("orphan.blob");
            assert!(handle.wait_until_loaded(SETTLE));

            drop(registry); // leak is logged, not fatal
            assert!(!handle.is_set());
            assert!(handle.get().is_none());
            drop(handle); // releasing into a dead registry is a no-op
        }
    }
}
