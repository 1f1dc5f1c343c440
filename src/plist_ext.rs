use crate::error::Result;
use plist::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct PlistFile {
    pub path: PathBuf,
    pub data: plist::Dictionary,
    app_path: Option<PathBuf>,
}

impl PlistFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = plist::from_file::<_, plist::Dictionary>(&path)?;
        Ok(Self {
            path,
            data,
            app_path: None,
        })
    }

    /// Opens an Info.plist together with its app directory so that edits can
    /// cascade into localized strings and nested extensions.
    pub fn open_with_app_path<P: AsRef<Path>>(path: P, app_path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = plist::from_file::<_, plist::Dictionary>(&path)?;
        Ok(Self {
            path,
            data,
            app_path: Some(app_path.as_ref().to_path_buf()),
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_string())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.data
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.data.insert(key.to_string(), Value::Boolean(value));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn save(&self) -> Result<()> {
        plist::to_file_xml(&self.path, &self.data)?;
        Ok(())
    }

    pub fn remove_supported_devices(&mut self) -> bool {
        let removed = self.remove("UISupportedDevices");
        if removed {
            let _ = self.save();
            log::info!("removed UISupportedDevices");
        }
        removed
    }

    pub fn enable_documents(&mut self) -> bool {
        let mut changed = false;

        if self.get("UISupportsDocumentBrowser") != Some(&Value::Boolean(true)) {
            self.set_bool("UISupportsDocumentBrowser", true);
            changed = true;
        }
        if self.get("UIFileSharingEnabled") != Some(&Value::Boolean(true)) {
            self.set_bool("UIFileSharingEnabled", true);
            changed = true;
        }

        if changed {
            let _ = self.save();
            log::info!("enabled documents support");
        }
        changed
    }

    pub fn change_name(&mut self, name: &str) -> bool {
        let current_name = self.get_string("CFBundleName").map(str::to_string);
        let current_display = self.get_string("CFBundleDisplayName").map(str::to_string);

        if current_name.as_deref() == Some(name) && current_display.as_deref() == Some(name) {
            return false;
        }

        self.set_string("CFBundleName", name);
        self.set_string("CFBundleDisplayName", name);
        let _ = self.save();
        log::info!("changed name to {name:?}");

        // Localized overrides would otherwise win over Info.plist
        if let Some(app_path) = self.app_path.clone() {
            let mut changed_count = 0;
            for strings_path in localized_strings_files(&app_path) {
                if let Ok(mut localized) = PlistFile::open(&strings_path) {
                    localized.set_string("CFBundleName", name);
                    localized.set_string("CFBundleDisplayName", name);
                    if localized.save().is_ok() {
                        changed_count += 1;
                    }
                }
            }
            if changed_count > 0 {
                log::info!("changed {changed_count} localized name(s)");
            }
        }
        true
    }

    pub fn change_version(&mut self, version: &str) -> bool {
        let current_ver = self.get_string("CFBundleVersion").map(str::to_string);
        let current_short = self
            .get_string("CFBundleShortVersionString")
            .map(str::to_string);

        if current_ver.as_deref() == Some(version) && current_short.as_deref() == Some(version) {
            return false;
        }

        self.set_string("CFBundleVersion", version);
        self.set_string("CFBundleShortVersionString", version);
        let _ = self.save();
        log::info!("changed version to {version:?}");
        true
    }

    /// Rewrites the bundle identifier, rebasing nested `.appex` identifiers
    /// that are rooted on the original one.
    pub fn change_bundle_id(&mut self, bundle_id: &str) -> bool {
        let orig = match self.get_string("CFBundleIdentifier") {
            Some(id) => id.to_string(),
            None => return false,
        };

        if orig == bundle_id {
            return false;
        }

        self.set_string("CFBundleIdentifier", bundle_id);
        let _ = self.save();
        log::info!("changed bundle id to {bundle_id:?}");

        if let Some(app_path) = self.app_path.clone() {
            let mut changed_count = 0;
            for appex in nested_appex_bundles(&app_path) {
                if let Ok(mut nested) = PlistFile::open(appex.join("Info.plist")) {
                    if let Some(current) =
                        nested.get_string("CFBundleIdentifier").map(str::to_string)
                    {
                        let new_id = current.replace(&orig, bundle_id);
                        nested.set_string("CFBundleIdentifier", &new_id);
                        if nested.save().is_ok() {
                            changed_count += 1;
                        }
                    }
                }
            }
            if changed_count > 0 {
                log::info!("changed {changed_count} nested bundle id(s)");
            }
        }
        true
    }

    pub fn change_minimum_version(&mut self, minimum: &str) -> bool {
        if self.get_string("MinimumOSVersion") == Some(minimum) {
            return false;
        }

        self.set_string("MinimumOSVersion", minimum);
        let _ = self.save();
        log::info!("changed minimum version to {minimum:?}");
        true
    }

    /// Overlays every key of the other plist onto this one.
    pub fn merge_plist<P: AsRef<Path>>(&mut self, path: P) -> Result<bool> {
        let other = PlistFile::open(path)?;
        let changed = !other.data.is_empty();

        for (key, value) in &other.data {
            self.data.insert(key.clone(), value.clone());
        }

        if changed {
            self.save()?;
            log::info!("merged plist ({} keys)", other.data.len());
        }

        Ok(changed)
    }
}

fn localized_strings_files(app_path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(app_path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "lproj").unwrap_or(false) {
                let strings = path.join("InfoPlist.strings");
                if strings.is_file() {
                    out.push(strings);
                }
            }
        }
    }
    out
}

fn nested_appex_bundles(app_path: &Path) -> Vec<PathBuf> {
    WalkDir::new(app_path)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_dir() && e.path().extension().map(|x| x == "appex").unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}
