//! Built-in node kinds.

use async_trait::async_trait;
use keel_core::{Error, Result};
use keel_scheduler::action::write_success_record;
use keel_scheduler::{BuildAction, BuildContext};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Runs shell commands and hands back the files they declare.
#[derive(Debug, Clone, Default)]
pub struct ShellAction {
    pub commands: Vec<String>,
    /// Declared outputs, relative to the workspace.
    pub products: Vec<PathBuf>,
    /// Outputs removed after a retrieve that did not bring them back.
    pub stale_outputs: Vec<PathBuf>,
    /// Working directory, relative to the node root.
    pub workspace: Option<PathBuf>,
}

impl ShellAction {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_products<I, P>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.products = products.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stale_outputs<I, P>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.stale_outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    fn workspace(&self, root: &Path) -> PathBuf {
        match &self.workspace {
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        }
    }

    async fn run_command(&self, ctx: &BuildContext<'_>, cmd: &str, workspace: &Path) -> Result<()> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(workspace)
            .env("KEEL_NODE", ctx.node)
            .env("KEEL_ROOT", ctx.root)
            .output()
            .await
            .map_err(|e| Error::BuildFailed {
                node: ctx.node.to_string(),
                message: format!("Command execution failed: {}", e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::BuildFailed {
                node: ctx.node.to_string(),
                message: format!(
                    "Command failed with exit code {:?}: {}",
                    output.status.code(),
                    stderr.trim_end()
                ),
            })
        }
    }
}

#[async_trait]
impl BuildAction for ShellAction {
    fn kind(&self) -> &'static str {
        "shell"
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<PathBuf>> {
        let workspace = self.workspace(ctx.root);
        tokio::fs::create_dir_all(&workspace).await?;

        for (index, cmd) in self.commands.iter().enumerate() {
            info!(node = %ctx.node, index, command = %cmd, "Running command");
            if let Err(e) = self.run_command(ctx, cmd, &workspace).await {
                error!(node = %ctx.node, index, error = %e, "Command failed");
                return Err(e);
            }
        }

        let mut products = Vec::with_capacity(self.products.len() + 1);
        for product in &self.products {
            let path = workspace.join(product);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(Error::BuildFailed {
                    node: ctx.node.to_string(),
                    message: format!("declared product {} was not produced", path.display()),
                });
            }
            products.push(path);
        }
        products.push(write_success_record(ctx).await?);
        Ok(products)
    }

    async fn post_load(&self, ctx: &BuildContext<'_>, products: &[PathBuf]) -> Result<()> {
        let workspace = self.workspace(ctx.root);
        for stale in &self.stale_outputs {
            let path = workspace.join(stale);
            if products.contains(&path) {
                continue;
            }
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                info!(node = %ctx.node, path = %path.display(), "Removing stale output");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove stale output");
                }
            }
        }
        Ok(())
    }

    fn agenda_for(&self) -> Vec<String> {
        self.commands.clone()
    }
}

/// A manual gate. Running it records that it was approved.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerAction;

#[async_trait]
impl BuildAction for TriggerAction {
    fn kind(&self) -> &'static str {
        "trigger"
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<PathBuf>> {
        info!(node = %ctx.node, "Trigger approved");
        Ok(vec![write_success_record(ctx).await?])
    }
}

/// Deletes expired shared blocks of the node's scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanSharedStorageAction;

#[async_trait]
impl BuildAction for CleanSharedStorageAction {
    fn kind(&self) -> &'static str {
        "clean_shared_storage"
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<PathBuf>> {
        if ctx.build_machine {
            ctx.storage.clean_shared(ctx.scope).await;
        } else {
            info!(node = %ctx.node, "Not a build machine, leaving shared storage alone");
        }
        Ok(vec![write_success_record(ctx).await?])
    }
}
