use super::*;
use std::any::TypeId;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

// Which pass of a loader is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTask
{
    LoadMeta,
    LoadAsset,
    RefreshAsset,
    UnloadAsset,
}

// Shell description produced by the metadata pass; the registry turns these
// into registered AssetMetadata records
#[derive(Debug, Clone)]
pub struct AssetMetadataDesc
{
    pub name: String,
    pub path: String, // logical, relative to the assets root
    pub type_tag: TypeId,
}

// One loader serves one or more file extensions. Loaders decode content and
// hand payloads to the AssetMetadata records they are given; they must not
// reach back into the registry synchronously (the delivering worker would
// deadlock)
pub trait AssetLoader: Send + Sync
{
    // Enumerate the sub-assets of a source file without decoding any payloads
    fn load_meta(&self, path: &Path) -> Result<Vec<AssetMetadataDesc>, Box<dyn Error>>;

    // Decode payloads for every affected asset and install them via set_asset.
    // task is LoadAsset or RefreshAsset
    fn load_assets(&self, path: &Path, task: LoadTask, assets: &[Arc<AssetMetadata>]) -> Result<(), Box<dyn Error>>;

    // Release payloads; the default clears whatever is installed
    fn unload_assets(&self, path: &Path, assets: &[Arc<AssetMetadata>]) -> Result<(), Box<dyn Error>>
    {
        let _ = path;
        for asset in assets
        {
            asset.clear_asset();
        }
        Ok(())
    }
}
