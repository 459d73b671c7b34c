//! Node actions.

use async_trait::async_trait;
use keel_cache::StorageProvider;
use keel_core::Result;
use std::fmt;
use std::path::{Path, PathBuf};

/// Everything an action can see while it runs.
pub struct BuildContext<'a> {
    pub node: &'a str,
    /// Folder the node's products are written under and stored relative to.
    pub root: &'a Path,
    pub scope: Option<&'a str>,
    /// Products of every node this one depends on, transitively.
    pub dependency_products: &'a [PathBuf],
    pub storage: &'a dyn StorageProvider,
    /// Whether this process runs on a build machine.
    pub build_machine: bool,
}

/// What a node does when it runs.
#[async_trait]
pub trait BuildAction: Send + Sync + fmt::Debug {
    /// Short name of the node kind.
    fn kind(&self) -> &'static str;

    /// Do the work and return the produced files.
    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<PathBuf>>;

    /// Stand-in for `build` used by fake runs.
    async fn fake_build(&self, ctx: &BuildContext<'_>) -> Result<Vec<PathBuf>> {
        Ok(vec![write_success_record(ctx).await?])
    }

    /// Called after products were copied in from shared storage.
    async fn post_load(&self, _ctx: &BuildContext<'_>, _products: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    /// Human readable list of what `build` will do.
    fn agenda_for(&self) -> Vec<String> {
        Vec::new()
    }
}

pub fn success_record_path(root: &Path, node: &str) -> PathBuf {
    root.join("Saved")
        .join("Logs")
        .join(format!("{}_Success.log", node))
}

/// Write the marker file every node produces on success.
pub async fn write_success_record(ctx: &BuildContext<'_>) -> Result<PathBuf> {
    let path = success_record_path(ctx.root, ctx.node);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, "Success").await?;
    Ok(path)
}

/// An action that only records success.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

#[async_trait]
impl BuildAction for NoopAction {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<PathBuf>> {
        Ok(vec![write_success_record(ctx).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_cache::{StorageConfig, TempStorage};

    #[tokio::test]
    async fn test_noop_writes_success_record() {
        let root = tempfile::tempdir().unwrap();
        let storage = TempStorage::new(StorageConfig::new(root.path(), None));
        let ctx = BuildContext {
            node: "Compile",
            root: root.path(),
            scope: None,
            dependency_products: &[],
            storage: &storage,
            build_machine: false,
        };

        let products = NoopAction.build(&ctx).await.unwrap();
        assert_eq!(
            products,
            vec![root.path().join("Saved/Logs/Compile_Success.log")]
        );
        assert_eq!(std::fs::read_to_string(&products[0]).unwrap(), "Success");
        assert!(NoopAction.agenda_for().is_empty());
    }
}
