use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything a caller can ask a signing pass to do. Passed by value into
/// the pipelines; the only mutation they perform is appending discovered
/// tweak paths to `injection_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningOptions {
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub app_identifier: Option<String>,
    pub entitlements_file: Option<PathBuf>,
    pub minimum_os_version: Option<String>,

    pub ppq_string: Option<String>,
    pub ppq_protection: bool,

    /// Identifier remapping applied to every bundle id that matches a key.
    pub identifiers: HashMap<String, String>,
    pub display_names: HashMap<String, String>,

    pub injection_files: Vec<PathBuf>,
    pub remove_files: Vec<String>,

    pub remove_supported_devices: bool,
    pub enable_file_sharing: bool,
    pub remove_url_scheme: bool,
    pub remove_provisioning: bool,
    pub remove_watch_placeholder: bool,

    pub do_adhoc_signing: bool,
    pub only_modify: bool,
    pub replace_substrate_with_ellekit: bool,

    /// Persisted zip backend name, see `ZipBackend::from_setting`.
    pub extraction_library: String,
}

impl Default for SigningOptions {
    fn default() -> Self {
        Self {
            app_name: None,
            app_version: None,
            app_identifier: None,
            entitlements_file: None,
            minimum_os_version: None,
            ppq_string: None,
            ppq_protection: false,
            identifiers: HashMap::new(),
            display_names: HashMap::new(),
            injection_files: Vec::new(),
            remove_files: Vec::new(),
            remove_supported_devices: true,
            enable_file_sharing: false,
            remove_url_scheme: false,
            remove_provisioning: false,
            remove_watch_placeholder: false,
            do_adhoc_signing: false,
            only_modify: false,
            replace_substrate_with_ellekit: true,
            extraction_library: "Zip".to_string(),
        }
    }
}

impl SigningOptions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_shipping_behavior() {
        let options = SigningOptions::default();
        assert!(options.remove_supported_devices);
        assert!(options.replace_substrate_with_ellekit);
        assert!(!options.only_modify);
        assert_eq!(options.extraction_library, "Zip");
    }

    #[test]
    fn json_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("options.json");

        let mut options = SigningOptions {
            app_name: Some("Renamed".into()),
            only_modify: true,
            ..Default::default()
        };
        options
            .identifiers
            .insert("com.example.app".into(), "com.other.app".into());
        options.injection_files.push(PathBuf::from("/tmp/tweak.dylib"));
        options.save(&path).unwrap();

        let loaded = SigningOptions::load(&path).unwrap();
        assert_eq!(loaded.app_name.as_deref(), Some("Renamed"));
        assert!(loaded.only_modify);
        assert_eq!(
            loaded.identifiers.get("com.example.app").map(String::as_str),
            Some("com.other.app")
        );
        assert_eq!(loaded.injection_files.len(), 1);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let partial: SigningOptions = serde_json::from_str(r#"{"app_name":"X"}"#).unwrap();
        assert_eq!(partial.app_name.as_deref(), Some("X"));
        assert!(partial.remove_supported_devices);
        assert_eq!(partial.extraction_library, "Zip");
    }
}
