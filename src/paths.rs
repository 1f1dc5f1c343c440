use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The on-disk library layout, rooted at the documents directory.
///
/// App payloads live under `App/`, keyed by the record uuid; credential
/// files live in a separate `certificates/` subtree.
#[derive(Debug, Clone)]
pub struct Directories {
    root: PathBuf,
}

impl Directories {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unsigned_app(&self, uuid: Uuid) -> PathBuf {
        self.root.join("App").join("Unsigned").join(uuid.to_string())
    }

    pub fn signed_app(&self, uuid: Uuid) -> PathBuf {
        self.root.join("App").join("Signed").join(uuid.to_string())
    }

    pub fn archives(&self) -> PathBuf {
        self.root.join("App").join("Archives")
    }

    pub fn tweaks(&self) -> PathBuf {
        self.root.join("App").join("Tweaks")
    }

    pub fn certificate(&self, uuid: Uuid) -> PathBuf {
        self.root.join("certificates").join(uuid.to_string())
    }

    /// Creates the directory for the path and returns it.
    pub fn ensure(&self, path: PathBuf) -> Result<PathBuf> {
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_is_stable() {
        let dirs = Directories::new("/docs");
        let uuid = Uuid::nil();

        assert_eq!(
            dirs.unsigned_app(uuid),
            PathBuf::from("/docs/App/Unsigned/00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(
            dirs.signed_app(uuid),
            PathBuf::from("/docs/App/Signed/00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(dirs.archives(), PathBuf::from("/docs/App/Archives"));
        assert_eq!(dirs.tweaks(), PathBuf::from("/docs/App/Tweaks"));
        assert_eq!(
            dirs.certificate(uuid),
            PathBuf::from("/docs/certificates/00000000-0000-0000-0000-000000000000")
        );
    }

    #[test]
    fn ensure_creates_on_demand() {
        let tmp = TempDir::new().unwrap();
        let dirs = Directories::new(tmp.path());
        let uuid = Uuid::new_v4();

        let created = dirs.ensure(dirs.unsigned_app(uuid)).unwrap();
        assert!(created.is_dir());
    }
}
