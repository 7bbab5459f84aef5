mod asset;
pub use asset::*;

mod asset_loader;
pub use asset_loader::*;

mod asset_metadata;
pub use asset_metadata::*;

mod asset_ref;
pub use asset_ref::*;

mod asset_job;
pub(crate) use asset_job::*;

mod asset_store;
pub(crate) use asset_store::*;

mod registry;
pub use registry::*;
