use crate::frontends::UiAssetProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

/// Serves UI files straight off disk. Debug convenience: edit the UI
/// without rebuilding the binary.
#[derive(Debug)]
pub struct DiskFrontend {
    root: PathBuf,
}

impl DiskFrontend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl UiAssetProvider for DiskFrontend {
    async fn get_asset(&self, path: &str) -> Result<(Cow<'static, [u8]>, String)> {
        // Only plain relative paths; no escaping the UI root.
        let relative = Path::new(path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::AssetNotFound(path.to_string()));
        }
        let full = self.root.join(relative);
        let data = tokio::fs::read(&full)
            .await
            .map_err(|_| Error::AssetNotFound(path.to_string()))?;
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        Ok((Cow::Owned(data), mime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_path_traversal() {
        let frontend = DiskFrontend::new("ui");
        assert!(matches!(
            frontend.get_asset("../Cargo.toml").await,
            Err(Error::AssetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn serves_files_from_the_ui_root() {
        let frontend = DiskFrontend::new(concat!(env!("CARGO_MANIFEST_DIR"), "/ui"));
        let (data, mime) = frontend.get_asset("index.html").await.unwrap();
        assert!(!data.is_empty());
        assert_eq!(mime, "text/html");
    }
}
