use crate::error::{KpackError, Result};
use crate::macho;
use apple_codesign::cryptography::parse_pfx_data;
use apple_codesign::{SettingsScope, SigningSettings, UnifiedSigner};
use std::fs;
use std::path::Path;

/// Certificate revocation state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Valid,
    Revoked,
    Unknown,
}

/// The external signing primitives the patcher and the pipelines call into.
///
/// Load-command operations report success as a plain bool; the sealing call
/// is the only fallible-with-detail operation because its failure aborts a
/// workflow.
pub trait SigningBackend: Send + Sync {
    /// Seals the app bundle. `p12`/`provision` are both absent for an ad-hoc
    /// pass and both present otherwise.
    fn sign(
        &self,
        bundle: &Path,
        p12: Option<&Path>,
        provision: Option<&Path>,
        password: &str,
    ) -> Result<()>;

    fn inject_dylib(&self, executable: &Path, load_path: &str) -> bool;

    fn change_dylib_path(&self, executable: &Path, old: &str, new: &str) -> bool;

    fn list_dylibs(&self, executable: &Path) -> Vec<String>;

    fn check_password(&self, p12: &Path, password: &str) -> bool;

    fn check_revocation(&self, provision: &Path, p12: &Path, password: &str) -> RevocationStatus;
}

/// Default backend: goblin-based load-command patching plus apple-codesign
/// sealing.
#[derive(Debug, Default)]
pub struct ZsignBackend;

impl SigningBackend for ZsignBackend {
    fn sign(
        &self,
        bundle: &Path,
        p12: Option<&Path>,
        provision: Option<&Path>,
        password: &str,
    ) -> Result<()> {
        let mut settings = SigningSettings::default();

        let identity = match p12 {
            Some(p12_path) => {
                let p12_data = fs::read(p12_path)?;
                let (cert, key) = parse_pfx_data(&p12_data, password)
                    .map_err(|_| KpackError::InvalidPassword)?;
                Some((cert, key))
            }
            None => None,
        };
        if let Some((cert, key)) = &identity {
            settings.set_signing_key(key, cert.clone());
        }

        // A staged entitlements file overrides the provision-derived set
        let sidecar = bundle.join("kpack.entitlements");
        let entitlements = if sidecar.is_file() {
            let xml = fs::read_to_string(&sidecar)?;
            fs::remove_file(&sidecar)?;
            Some(xml)
        } else {
            match provision {
                Some(provision_path) => entitlements_xml(provision_path)?,
                None => None,
            }
        };
        if let Some(xml) = entitlements {
            settings
                .set_entitlements_xml(SettingsScope::Main, &xml)
                .map_err(|e| KpackError::Sign(format!("Failed to set entitlements: {e}")))?;
        }

        if let Some(provision_path) = provision {
            fs::copy(provision_path, bundle.join("embedded.mobileprovision"))?;
        }

        let signer = UnifiedSigner::new(settings);
        signer
            .sign_path_in_place(bundle)
            .map_err(|e| KpackError::Sign(format!("Failed to sign: {e}")))?;

        log::info!("sealed {}", bundle.display());
        Ok(())
    }

    fn inject_dylib(&self, executable: &Path, load_path: &str) -> bool {
        match macho::add_weak_dylib(executable, load_path) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("dylib injection failed for {}: {e}", executable.display());
                false
            }
        }
    }

    fn change_dylib_path(&self, executable: &Path, old: &str, new: &str) -> bool {
        match macho::change_dylib_path(executable, old, new) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("dylib path rewrite failed for {}: {e}", executable.display());
                false
            }
        }
    }

    fn list_dylibs(&self, executable: &Path) -> Vec<String> {
        macho::list_dylibs(executable).unwrap_or_default()
    }

    fn check_password(&self, p12: &Path, password: &str) -> bool {
        match fs::read(p12) {
            Ok(data) => parse_pfx_data(&data, password).is_ok(),
            Err(_) => false,
        }
    }

    fn check_revocation(&self, _provision: &Path, _p12: &Path, _password: &str) -> RevocationStatus {
        // OCSP needs a network round-trip; nothing here talks to the network.
        RevocationStatus::Unknown
    }
}

/// Pulls the `Entitlements` dictionary out of a provisioning profile.
///
/// Profiles are CMS blobs wrapping a plist; the plist is located by scanning
/// for the `<plist`/`</plist>` markers rather than parsing the CMS envelope.
fn entitlements_xml(provision: &Path) -> Result<Option<String>> {
    let data = fs::read(provision)?;

    let start = match data.windows(6).position(|w| w == b"<plist") {
        Some(p) => p,
        None => return Ok(None),
    };
    let end = match data.windows(8).rposition(|w| w == b"</plist>") {
        Some(p) => p + 8,
        None => return Ok(None),
    };

    let profile: plist::Value = plist::from_bytes(&data[start..end])?;
    let entitlements = profile
        .as_dictionary()
        .and_then(|d| d.get("Entitlements"))
        .cloned();

    match entitlements {
        Some(value) => {
            let mut xml = Vec::new();
            plist::to_writer_xml(&mut xml, &value)?;
            Ok(Some(String::from_utf8_lossy(&xml).into_owned()))
        }
        None => Ok(None),
    }
}
