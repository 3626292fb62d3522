//! Portal UI asset delivery: embedded into the binary for deployment, read
//! off disk for local UI development.

mod disk;
mod embed;

pub use disk::DiskFrontend;
pub use embed::EmbedFrontend;

use async_trait::async_trait;
use std::borrow::Cow;

/// Source of the portal's static UI assets.
#[async_trait]
pub trait UiAssetProvider: Send + Sync {
    /// Returns the asset's bytes and MIME type, or
    /// [`crate::Error::AssetNotFound`].
    async fn get_asset(&self, path: &str) -> crate::Result<(Cow<'static, [u8]>, String)>;
}
