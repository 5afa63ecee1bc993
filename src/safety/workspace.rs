/// Run-scoped workspace directories
///
/// Every request gets its own directory under a shared root. Names combine a
/// process-wide sequence number with a random token, so concurrent requests
/// never address the same path and no lock is needed.
use crate::config::types::{CodeboxError, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Prefix of server run directories; `sweep_stale` only touches its own prefix.
pub const RUN_DIR_PREFIX: &str = "run-";
/// Prefix of script session directories
pub const SESSION_DIR_PREFIX: &str = "session-";

static WORKSPACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Ephemeral directory owned by exactly one request.
///
/// Dropping the workspace removes it. Removal errors are logged and swallowed
/// so cleanup never masks the request's own result.
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    fn create(root: &Path, prefix: &str) -> Result<Self> {
        let seq = WORKSPACE_SEQ.fetch_add(1, Ordering::Relaxed);
        let token = Uuid::new_v4().simple().to_string();
        let run_id = format!("{}-{}", seq, &token[..12]);
        let path = root.join(format!("{prefix}{run_id}"));

        // create_dir (not create_dir_all) fails if the name already exists.
        fs::create_dir(&path).map_err(|e| {
            CodeboxError::Workspace(format!(
                "Failed to create workspace directory {}: {}",
                path.display(),
                e
            ))
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).map_err(|e| {
            let _ = fs::remove_dir(&path);
            CodeboxError::Workspace(format!(
                "Failed to restrict workspace {}: {}",
                path.display(),
                e
            ))
        })?;

        log::debug!("Acquired workspace {}", path.display());
        Ok(Self {
            run_id,
            path,
            released: false,
        })
    }

    /// Identifier of the owning run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory every stage runs in
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file at the top level of the workspace
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.contains('/') || name == ".." || name.is_empty() {
            return Err(CodeboxError::Workspace(format!(
                "Refusing to write outside the workspace: {name}"
            )));
        }
        let target = self.path.join(name);
        fs::write(&target, content).map_err(|e| {
            CodeboxError::Workspace(format!(
                "Failed to write {}: {}",
                target.display(),
                e
            ))
        })?;
        Ok(target)
    }

    /// Whether a top-level entry exists
    pub fn contains(&self, name: &str) -> bool {
        self.path.join(name).exists()
    }

    /// Remove the workspace now instead of at drop
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("Released workspace {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!(
                    "Failed to remove workspace {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Creates workspaces under a single root. Managers sharing a root keep
/// separate pools by directory prefix.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    prefix: &'static str,
}

impl WorkspaceManager {
    /// Manager for server run directories, creating the root if it doesn't
    /// exist
    pub fn new(root: PathBuf) -> Result<Self> {
        Self::with_prefix(root, RUN_DIR_PREFIX)
    }

    /// Manager whose directories are named `<prefix><seq>-<token>`
    pub fn with_prefix(root: PathBuf, prefix: &'static str) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|e| {
            CodeboxError::Workspace(format!(
                "Failed to create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self { root, prefix })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Create a fresh, uniquely named workspace
    pub fn acquire(&self) -> Result<Workspace> {
        Workspace::create(&self.root, self.prefix)
    }

    /// Number of this manager's directories currently under the root
    pub fn live_count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| self.owns(&entry.path()))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Remove this manager's directories older than `max_age`, left behind by a crashed
    /// process. Returns how many were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        let entries = fs::read_dir(&self.root).map_err(|e| {
            CodeboxError::Workspace(format!(
                "Failed to read workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !self.owns(&path) {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            // Future timestamps count as fresh.
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };

            if age >= max_age {
                match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        log::info!("Removed stale workspace {}", path.display());
                        removed += 1;
                    }
                    Err(e) => log::warn!("Failed to remove stale workspace {}: {}", path.display(), e),
                }
            }
        }

        Ok(removed)
    }

    fn owns(&self, path: &Path) -> bool {
        path.is_dir()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(self.prefix))
                .unwrap_or(false)
    }
}
