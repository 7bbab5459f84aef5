use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

// A decoded, in-memory content payload (mesh, texture, shader program, ...)
pub trait Asset: std::any::Any + Send + Sync { }

// Stable identity of one logical asset, assigned at registration
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(Uuid);
impl AssetId
{
    #[must_use]
    pub(crate) fn generate() -> Self { Self(Uuid::new_v4()) }

    #[inline] #[must_use]
    pub fn as_uuid(&self) -> Uuid { self.0 }
}
impl Debug for AssetId
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Display::fmt(&self.0, f) }
}
impl Display for AssetId
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Display::fmt(&self.0, f) }
}

// State transition observed by asset listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetEventKind
{
    Loaded,
    Updated,
    Unloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetLoadError
{
    Shutdown, // the registry is tearing down, no new loads are accepted
    MismatchedAssetType, // payload or handle type does not match the asset's type tag
    NoLoader, // no loader registered for this extension
    Decode, // the loader failed to produce a payload
}
impl Display for AssetLoadError
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Debug::fmt(self, f) }
}
impl Error for AssetLoadError { }

// Emitted on the registry's notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetNotification
{
    Refreshed(AssetId),
}
