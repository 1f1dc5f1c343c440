use crate::error::{KpackError, Result};
use crate::plist_ext::PlistFile;
use std::fs;
use std::path::{Path, PathBuf};

/// An on-disk `.app` directory and its Info.plist.
pub struct AppBundle {
    pub path: PathBuf,
    pub plist: PlistFile,
    executable: PathBuf,
}

impl AppBundle {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let plist = PlistFile::open_with_app_path(&path.join("Info.plist"), &path)?;

        let exec_name = plist
            .get_string("CFBundleExecutable")
            .ok_or_else(|| KpackError::InvalidAppBundle("No CFBundleExecutable".to_string()))?;
        let executable = path.join(exec_name);
        if !executable.is_file() {
            return Err(KpackError::InvalidAppBundle(format!(
                "Declared executable missing: {exec_name}"
            )));
        }

        Ok(Self {
            path,
            plist,
            executable,
        })
    }

    /// Path of the main executable as declared by `CFBundleExecutable`.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn identifier(&self) -> Option<&str> {
        self.plist.get_string("CFBundleIdentifier")
    }

    pub fn display_name(&self) -> Option<&str> {
        self.plist
            .get_string("CFBundleDisplayName")
            .or_else(|| self.plist.get_string("CFBundleName"))
    }

    pub fn version(&self) -> Option<&str> {
        self.plist
            .get_string("CFBundleShortVersionString")
            .or_else(|| self.plist.get_string("CFBundleVersion"))
    }

    /// Last entry of the primary icon's file list, the convention for the
    /// highest-resolution variant.
    pub fn primary_icon_name(&self) -> Option<String> {
        let icons = self.plist.get("CFBundleIcons")?.as_dictionary()?;
        let primary = icons.get("CFBundlePrimaryIcon")?.as_dictionary()?;
        let files = primary.get("CFBundleIconFiles")?.as_array()?;
        files.last()?.as_string().map(String::from)
    }

    /// Removes the named entries relative to the app root. Returns true when
    /// at least one existed and was deleted.
    pub fn remove<P: AsRef<Path>>(&self, names: &[P]) -> bool {
        let mut existed = false;

        for name in names {
            let name = name.as_ref();
            let path = if name.starts_with(&self.path) {
                name.to_path_buf()
            } else {
                self.path.join(name)
            };

            if !path.exists() {
                continue;
            }

            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };

            if result.is_ok() {
                existed = true;
            }
        }

        existed
    }

    pub fn remove_watch_placeholder(&mut self) {
        let names = ["Watch", "WatchKit", "com.apple.WatchPlaceholder"];
        if self.remove(&names.map(Path::new)) {
            log::info!("removed watch placeholder");
        }
    }

    pub fn remove_url_schemes(&mut self) {
        if self.plist.remove("CFBundleURLTypes") {
            let _ = self.plist.save();
            log::info!("removed URL schemes");
        }
    }

    pub fn remove_provisioning(&mut self) {
        if self.remove(&[Path::new("embedded.mobileprovision")]) {
            log::info!("removed embedded provisioning profile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::Value;
    use tempfile::TempDir;

    fn make_app(tmp: &TempDir) -> PathBuf {
        let app = tmp.path().join("Sample.app");
        fs::create_dir_all(&app).unwrap();

        let mut icons_primary = plist::Dictionary::new();
        icons_primary.insert(
            "CFBundleIconFiles".to_string(),
            Value::Array(vec![
                Value::String("AppIcon40x40".into()),
                Value::String("AppIcon60x60".into()),
            ]),
        );
        let mut icons = plist::Dictionary::new();
        icons.insert(
            "CFBundlePrimaryIcon".to_string(),
            Value::Dictionary(icons_primary),
        );

        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleExecutable".to_string(), Value::String("Sample".into()));
        dict.insert(
            "CFBundleIdentifier".to_string(),
            Value::String("com.example.sample".into()),
        );
        dict.insert("CFBundleName".to_string(), Value::String("Sample".into()));
        dict.insert("CFBundleVersion".to_string(), Value::String("3.1".into()));
        dict.insert(
            "CFBundleURLTypes".to_string(),
            Value::Array(vec![Value::Dictionary(plist::Dictionary::new())]),
        );
        dict.insert("CFBundleIcons".to_string(), Value::Dictionary(icons));
        plist::to_file_xml(app.join("Info.plist"), &dict).unwrap();

        fs::write(app.join("Sample"), b"binary").unwrap();
        fs::write(app.join("embedded.mobileprovision"), b"profile").unwrap();
        app
    }

    #[test]
    fn reads_declared_metadata() {
        let tmp = TempDir::new().unwrap();
        let app = AppBundle::new(make_app(&tmp)).unwrap();

        assert_eq!(app.identifier(), Some("com.example.sample"));
        assert_eq!(app.display_name(), Some("Sample"));
        assert_eq!(app.version(), Some("3.1"));
        assert!(app.executable().ends_with("Sample.app/Sample"));
        assert_eq!(app.primary_icon_name().as_deref(), Some("AppIcon60x60"));
    }

    #[test]
    fn rejects_missing_executable() {
        let tmp = TempDir::new().unwrap();
        let app_dir = make_app(&tmp);
        fs::remove_file(app_dir.join("Sample")).unwrap();

        assert!(matches!(
            AppBundle::new(&app_dir),
            Err(KpackError::InvalidAppBundle(_))
        ));
    }

    #[test]
    fn removal_helpers() {
        let tmp = TempDir::new().unwrap();
        let mut app = AppBundle::new(make_app(&tmp)).unwrap();

        app.remove_provisioning();
        assert!(!app.path.join("embedded.mobileprovision").exists());

        app.remove_url_schemes();
        let reloaded = PlistFile::open(app.path.join("Info.plist")).unwrap();
        assert!(!reloaded.contains("CFBundleURLTypes"));

        assert!(!app.remove(&[Path::new("does-not-exist")]));
    }
}
