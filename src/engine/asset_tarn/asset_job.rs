use super::*;
use smallvec::SmallVec;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

// Most source files decode to a single asset
pub(crate) type AffectedAssets = SmallVec<[Arc<AssetMetadata>; 1]>;

pub(crate) struct LoadJob
{
    pub absolute_path: PathBuf,
    pub affected: AffectedAssets, // every registered asset sharing the source file
    pub loader: Arc<dyn AssetLoader>,
}

pub(crate) struct UnloadJob
{
    pub absolute_path: PathBuf,
    pub affected: AffectedAssets,
    pub loader: Option<Arc<dyn AssetLoader>>,
}

pub(crate) struct PushEventJob
{
    pub asset: Arc<AssetMetadata>,
    pub target: ListenerId,
    pub event: AssetEventKind,
}

// A unit of work executed by the worker pool. Listener push events share this
// queue so late subscribers observe transitions in the same total order as
// worker-driven state changes
pub(crate) enum AssetJob
{
    Load(LoadJob),
    Unload(UnloadJob),
    Refresh(LoadJob),
    PushEvent(PushEventJob),
}

pub(crate) fn execute_job(store: &Arc<AssetStore>, job: AssetJob)
{
    match job
    {
        AssetJob::Load(job) => execute_load(job, LoadTask::LoadAsset),
        AssetJob::Refresh(job) => execute_load(job, LoadTask::RefreshAsset),
        AssetJob::Unload(job) => execute_unload(store, job),
        AssetJob::PushEvent(job) => job.asset.dispatch_event_to(job.target, job.event),
    }
}

fn execute_load(job: LoadJob, task: LoadTask)
{
    let result = catch_unwind(AssertUnwindSafe(||
        job.loader.load_assets(&job.absolute_path, task, &job.affected)));

    let failure = match result
    {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(_) => Some("loader panicked".to_string()),
    };

    match failure
    {
        None =>
        {
            let event = match task
            {
                LoadTask::RefreshAsset => AssetEventKind::Updated,
                _ => AssetEventKind::Loaded,
            };
            for asset in &job.affected
            {
                match asset.is_loaded()
                {
                    true => asset.dispatch_event(event),
                    // the loader declined this sub-asset; leave it recoverable
                    false => asset.clear_loading(),
                }
            }
        }
        Some(err) =>
        {
            log::error!("Failed to load {:?}: {err}", job.absolute_path);
            // revert every affected record so a future referrer can retry
            for asset in &job.affected
            {
                asset.clear_asset();
            }
        }
    }
}

fn execute_unload(store: &Arc<AssetStore>, job: UnloadJob)
{
    for asset in &job.affected
    {
        // may have been re-acquired while this job sat in the queue
        if asset.referrer_count() > 0 || asset.lock_count() > 0
        {
            continue;
        }
        // external sources pinning the path keep its assets resident
        if store.path_referrer_count(asset.path()) > 0
        {
            continue;
        }

        let was_loaded = asset.is_loaded();
        match &job.loader
        {
            Some(loader) =>
            {
                let single = [asset.clone()];
                let result = catch_unwind(AssertUnwindSafe(||
                    loader.unload_assets(&job.absolute_path, &single)));
                match result
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) =>
                    {
                        log::warn!("Loader failed to unload {asset:?} ({err}); releasing anyway");
                        asset.clear_asset();
                    }
                    Err(_) =>
                    {
                        log::warn!("Loader panicked unloading {asset:?}; releasing anyway");
                        asset.clear_asset();
                    }
                }
            }
            None => asset.clear_asset(),
        }

        if was_loaded && !asset.is_loaded()
        {
            asset.dispatch_event(AssetEventKind::Unloaded);
        }
    }
}
