//! Staged-file listing and device-side destination routing
//!
//! The staging directory is owned by the surrounding application; this
//! module only reads it. Listing order is byte-wise name order so pipelines
//! push files deterministically.

use crate::error::{BridgeError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Device-side directory for image overlays
pub const REMOTE_IMAGERY_DIR: &str = "/sdcard/sideload/imagery";
/// Device-side directory for credential bundles
pub const REMOTE_CERTS_DIR: &str = "/sdcard/sideload/certs";
/// Device-side directory for zipped content packages
pub const REMOTE_PACKAGES_DIR: &str = "/sdcard/sideload/packages";
/// Device-side directory for everything else (preference and config files)
pub const REMOTE_PREFS_DIR: &str = "/sdcard/sideload/prefs";

/// Pick the device-side destination path for a staged file
///
/// Pure function of the filename. The device-side client scans exactly
/// these four directories on import, so the mapping must not drift:
/// image-like extensions land in imagery, credential-like in certs,
/// zip archives in packages, and everything else in prefs.
pub fn destination_for(file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let dir = match ext.as_deref() {
        Some("jpg" | "jpeg" | "png" | "tif" | "tiff" | "bmp" | "sid") => REMOTE_IMAGERY_DIR,
        Some("p12" | "jks" | "pem" | "crt") => REMOTE_CERTS_DIR,
        Some("zip") => REMOTE_PACKAGES_DIR,
        _ => REMOTE_PREFS_DIR,
    };
    format!("{}/{}", dir, file_name)
}

/// One file available for transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Bare filename, used for routing and ledger bookkeeping
    pub name: String,
    /// Absolute path on the host
    pub path: PathBuf,
}

impl StagedFile {
    /// Device-side destination for this file
    pub fn destination(&self) -> String {
        destination_for(&self.name)
    }
}

/// Read-only view of the staging directory
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List staged files in name order
    ///
    /// Regular files only; hidden files (editor droppings, `.DS_Store`)
    /// and subdirectories are skipped. Re-read per pipeline invocation so
    /// files staged after a run began are picked up by later pipelines.
    pub async fn list(&self) -> Result<Vec<StagedFile>> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            BridgeError::Staging(format!("cannot read {}: {}", self.dir.display(), e))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    warn!("skipping staged file with non-UTF-8 name: {:?}", name);
                    continue;
                }
            };
            if name.starts_with('.') {
                continue;
            }
            files.push(StagedFile {
                name,
                path: entry.path(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_destination_routing() {
        assert_eq!(
            destination_for("overlay.jpg"),
            "/sdcard/sideload/imagery/overlay.jpg"
        );
        assert_eq!(
            destination_for("map.TIFF"),
            "/sdcard/sideload/imagery/map.TIFF"
        );
        assert_eq!(
            destination_for("client.p12"),
            "/sdcard/sideload/certs/client.p12"
        );
        assert_eq!(
            destination_for("trust.PEM"),
            "/sdcard/sideload/certs/trust.PEM"
        );
        assert_eq!(
            destination_for("bundle.zip"),
            "/sdcard/sideload/packages/bundle.zip"
        );
        assert_eq!(
            destination_for("defaults.pref"),
            "/sdcard/sideload/prefs/defaults.pref"
        );
        // No extension falls through to prefs
        assert_eq!(destination_for("README"), "/sdcard/sideload/prefs/README");
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.p12"), b"x").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("c.zip"), b"x").unwrap();
        std::fs::write(dir.path().join(".swp"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let staging = StagingArea::new(dir.path());
        let files = staging.list().await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();

        assert_eq!(names, vec!["a.jpg", "b.p12", "c.zip"]);
        assert!(files.iter().all(|f| f.path.starts_with(dir.path())));
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_staging_error() {
        let staging = StagingArea::new("/nonexistent/sideload-staging");
        let err = staging.list().await.unwrap_err();
        assert!(matches!(err, BridgeError::Staging(_)));
    }
}
