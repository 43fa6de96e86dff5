//! Application catalog discovery and version resolution
//!
//! The catalog is a directory tree `applications/<app>/<version>/`. A version
//! directory qualifies when it holds a `helmrelease/` manifest directory or a
//! `metadata.yaml` file (either one is enough).
//!
//! Versions are ordered by plain string comparison, not semantic version:
//! `6.9.10` sorts before `6.9.3`. "Latest" is the last entry in that order.
//!
//! There is no caching; every query re-reads the filesystem. Construct one
//! [`Catalog`] per suite run and pass it to whatever needs it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Directory name that holds the catalog
pub const APPLICATIONS_DIR: &str = "applications";
/// Subdirectory of a version holding the templated manifests
pub const MANIFEST_SUBDIR: &str = "helmrelease";
/// Per-version metadata file
pub const METADATA_FILE: &str = "metadata.yaml";

/// An application and its qualifying versions, ascending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersions {
    /// Application name, e.g. `podinfo`
    pub name: String,
    /// Version directory names in ascending string order
    pub versions: Vec<String>,
}

impl AppVersions {
    /// Newest version by string order
    pub fn latest(&self) -> Option<&str> {
        self.versions.last().map(String::as_str)
    }

    /// Whether an upgrade scenario (previous -> latest) can run
    pub fn is_upgradable(&self) -> bool {
        self.versions.len() >= 2
    }
}

/// Whether `path` is a version directory: `helmrelease/` dir or `metadata.yaml` file
pub fn is_version_dir(path: &Path) -> bool {
    path.join(MANIFEST_SUBDIR).is_dir() || path.join(METADATA_FILE).is_file()
}

/// Catalog rooted at an `applications/` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    base: PathBuf,
}

impl Catalog {
    /// Catalog rooted at `base` (the `applications/` directory itself)
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Find `applications/` in `start`, its parent or its grandparent.
    pub fn discover(start: &Path) -> Result<Self> {
        for candidate in [start.to_path_buf(), start.join(".."), start.join("..").join("..")] {
            let apps = candidate.join(APPLICATIONS_DIR);
            if apps.is_dir() {
                let base = std::fs::canonicalize(&apps)?;
                debug!(catalog = %base.display(), "discovered catalog");
                return Ok(Self::new(base));
            }
        }
        Err(Error::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "no {} directory found from {}",
                    APPLICATIONS_DIR,
                    start.display()
                ),
            ),
        })
    }

    /// Discover from the current working directory
    pub fn discover_from_cwd() -> Result<Self> {
        Self::discover(&std::env::current_dir()?)
    }

    /// The `applications/` directory
    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// All apps with at least one qualifying version, sorted by name.
    pub fn apps(&self) -> Result<Vec<AppVersions>> {
        let mut apps = Vec::new();

        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let versions: Vec<String> = self
                .version_dirs(&entry.path())
                .into_iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            if versions.is_empty() {
                debug!(app = %name, "skipping app without version directories");
                continue;
            }
            apps.push(AppVersions { name, versions });
        }

        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    /// Call `f` for every app in order, stopping at the first error
    pub fn each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&AppVersions) -> Result<()>,
    {
        for app in self.apps()? {
            f(&app)?;
        }
        Ok(())
    }

    /// Path to `applications/<app>/<version>`; an empty version means latest.
    pub fn path_to_app(&self, app: &str, version: &str) -> Result<PathBuf> {
        let app_dir = self.base.join(app);

        if !version.is_empty() {
            let path = app_dir.join(version);
            if !path.is_dir() {
                return Err(Error::VersionNotFound {
                    app: app.to_string(),
                    version: version.to_string(),
                });
            }
            return Ok(path);
        }

        self.version_dirs(&app_dir)
            .pop()
            .ok_or_else(|| Error::AppNotFound {
                app: app.to_string(),
                path: app_dir.display().to_string(),
            })
    }

    /// Path to the second-to-latest version, for upgrade scenarios
    pub fn prev_version_path(&self, app: &str) -> Result<PathBuf> {
        let mut dirs = self.version_dirs(&self.base.join(app));
        if dirs.len() < 2 {
            return Err(Error::InsufficientVersions {
                app: app.to_string(),
                found: dirs.len(),
            });
        }
        Ok(dirs.swap_remove(dirs.len() - 2))
    }

    // A missing or unreadable app directory yields no versions.
    fn version_dirs(&self, app_dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(app_dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && is_version_dir(p))
            .collect();
        dirs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        dirs
    }
}
