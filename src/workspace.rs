//! Per-request staging directories.
//!
//! Every request gets its own `run-<uuid>` directory under the workspace root,
//! so fixed source names like `Main.java` never collide between requests.

use crate::profile::RuntimeProfile;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DIR_PREFIX: &str = "run-";

/// A staged request. Removed by [`WorkspaceManager::release`], or on drop if
/// an unexpected path skipped the release.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    root: PathBuf,
    staged_file: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staged_file(&self) -> &Path {
        &self.staged_file
    }

    /// File name of the staged source, relative to the workspace root.
    pub fn file_name(&self) -> &str {
        self.staged_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            warn!(workspace = %self.id, "Workspace dropped without release, removing");
            remove_tree_blocking(&self.root);
            self.released = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create the request's directory and write its source into it.
    ///
    /// On failure nothing is left behind.
    pub async fn stage(
        &self,
        id: Uuid,
        profile: &RuntimeProfile,
        source: &str,
    ) -> io::Result<Workspace> {
        fs::create_dir_all(&self.base).await?;

        let root = self.base.join(format!("{}{}", DIR_PREFIX, id));
        // create_dir (not _all): an existing directory means an id collision.
        fs::create_dir(&root).await?;

        let mut workspace = Workspace {
            id,
            staged_file: root.join(profile.source_name),
            root,
            released: false,
        };

        if let Err(e) = write_source(&workspace, source).await {
            self.release(&mut workspace).await;
            return Err(e);
        }

        debug!(workspace = %id, path = ?workspace.staged_file, "Workspace staged");
        Ok(workspace)
    }

    /// Remove the workspace. Safe to call more than once; a directory that is
    /// already gone counts as removed.
    pub async fn release(&self, workspace: &mut Workspace) {
        if workspace.released {
            return;
        }
        match fs::remove_dir_all(&workspace.root).await {
            Ok(()) => debug!(workspace = %workspace.id, "Workspace removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %workspace.id, error = %e, "Failed to remove workspace"),
        }
        workspace.released = true;
    }

    /// Remove workspaces left behind by a previous process. Returns how many
    /// were removed.
    pub async fn reap_stale(&self) -> io::Result<usize> {
        let mut entries = match fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_ours = name
                .to_str()
                .map(|n| n.starts_with(DIR_PREFIX))
                .unwrap_or(false);
            if !is_ours {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to remove stale workspace"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed stale workspaces");
        }
        Ok(removed)
    }
}

async fn write_source(workspace: &Workspace, source: &str) -> io::Result<()> {
    // Containers may run as an unprivileged user.
    fs::set_permissions(&workspace.root, std::fs::Permissions::from_mode(0o755)).await?;
    fs::write(&workspace.staged_file, source).await?;
    fs::set_permissions(&workspace.staged_file, std::fs::Permissions::from_mode(0o644)).await?;
    Ok(())
}

fn remove_tree_blocking(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove workspace"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile;

    #[tokio::test]
    async fn stage_writes_source_into_unique_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let java = profile::resolve("java").unwrap();

        let mut a = manager.stage(Uuid::new_v4(), java, "class Main {}").await.unwrap();
        let mut b = manager.stage(Uuid::new_v4(), java, "class Main {}").await.unwrap();

        assert_ne!(a.root(), b.root());
        assert_eq!(a.file_name(), "Main.java");
        assert_eq!(std::fs::read_to_string(a.staged_file()).unwrap(), "class Main {}");

        manager.release(&mut a).await;
        manager.release(&mut b).await;
        assert!(!a.root().exists());
        assert!(!b.root().exists());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_tolerates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let py = profile::resolve("py").unwrap();

        let mut ws = manager.stage(Uuid::new_v4(), py, "print(1)").await.unwrap();
        std::fs::remove_dir_all(ws.root()).unwrap();
        manager.release(&mut ws).await;
        manager.release(&mut ws).await;
        assert!(ws.is_released());
    }

    #[tokio::test]
    async fn duplicate_id_fails_to_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let py = profile::resolve("py").unwrap();
        let id = Uuid::new_v4();

        let mut first = manager.stage(id, py, "").await.unwrap();
        assert!(manager.stage(id, py, "").await.is_err());
        manager.release(&mut first).await;
    }

    #[tokio::test]
    async fn dropped_workspace_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let py = profile::resolve("py").unwrap();

        let ws = manager.stage(Uuid::new_v4(), py, "").await.unwrap();
        let root = ws.root().to_path_buf();
        drop(ws);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn reap_stale_only_touches_run_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("run-old")).unwrap();
        std::fs::create_dir(tmp.path().join("keep-me")).unwrap();

        let manager = WorkspaceManager::new(tmp.path());
        assert_eq!(manager.reap_stale().await.unwrap(), 1);
        assert!(tmp.path().join("keep-me").exists());
        assert!(!tmp.path().join("run-old").exists());
    }
}
