use crate::frontends::UiAssetProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use rust_embed::RustEmbed;
use std::borrow::Cow;

#[derive(RustEmbed)]
#[folder = "ui/"]
struct Asset;

/// Serves UI files embedded into the binary at build time.
#[derive(Debug, Default)]
pub struct EmbedFrontend;

impl EmbedFrontend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UiAssetProvider for EmbedFrontend {
    async fn get_asset(&self, path: &str) -> Result<(Cow<'static, [u8]>, String)> {
        let asset = Asset::get(path).ok_or_else(|| Error::AssetNotFound(path.to_string()))?;
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        Ok((asset.data, mime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_embedded_index() {
        let frontend = EmbedFrontend::new();
        let (data, mime) = frontend.get_asset("index.html").await.unwrap();
        assert!(!data.is_empty());
        assert_eq!(mime, "text/html");
    }

    #[tokio::test]
    async fn unknown_asset_is_an_error() {
        let frontend = EmbedFrontend::new();
        assert!(matches!(
            frontend.get_asset("nope.js").await,
            Err(Error::AssetNotFound(_))
        ));
    }
}
