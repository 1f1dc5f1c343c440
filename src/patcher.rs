use crate::archive::copy_dir_all;
use crate::bundle::AppBundle;
use crate::deb;
use crate::error::Result;
use crate::signer::SigningBackend;
use crate::tweaks::{self, ArtifactKind};
use std::fs;
use std::path::{Path, PathBuf};

const SUBSTRATE_LEGACY_PATH: &str = "/Library/Frameworks/CydiaSubstrate.framework/CydiaSubstrate";
const SUBSTRATE_RPATH: &str = "@rpath/CydiaSubstrate.framework/CydiaSubstrate";
const SUBSTRATE_FRAMEWORK: &str = "CydiaSubstrate.framework";

/// Copies injectables into the app and mutates load commands through the
/// signing backend.
pub struct BinaryPatcher<'a> {
    backend: &'a dyn SigningBackend,
    /// Bundled ElleKit package. When absent, the Substrate shim is skipped
    /// with a log line rather than failing the pass.
    pub ellekit_deb: Option<PathBuf>,
}

impl<'a> BinaryPatcher<'a> {
    pub fn new(backend: &'a dyn SigningBackend, ellekit_deb: Option<PathBuf>) -> Self {
        Self {
            backend,
            ellekit_deb,
        }
    }

    /// Runs one injection pass over `inputs`. `scratch` receives extracted
    /// deb payloads and must outlive the call.
    pub fn apply(
        &self,
        app_dir: &Path,
        inputs: &[PathBuf],
        replace_substrate: bool,
        scratch: &Path,
    ) -> Result<()> {
        let frameworks_dir = app_dir.join("Frameworks");
        let queue = self.settle_substrate(&frameworks_dir, inputs, replace_substrate)?;
        if queue.is_empty() {
            return Ok(());
        }

        let main_executable = match AppBundle::new(app_dir) {
            Ok(bundle) => Some(bundle.executable().to_path_buf()),
            Err(e) => {
                log::warn!("cannot resolve main executable: {e}");
                None
            }
        };

        for input in &queue {
            self.dispatch(app_dir, &frameworks_dir, main_executable.as_deref(), input, scratch)?;
        }
        Ok(())
    }

    /// The Substrate/ElleKit decision, run once before any input is
    /// processed. Returns the input queue, possibly with ElleKit prepended.
    fn settle_substrate(
        &self,
        frameworks_dir: &Path,
        inputs: &[PathBuf],
        replace_substrate: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut queue = inputs.to_vec();
        let substrate = frameworks_dir.join(SUBSTRATE_FRAMEWORK);

        let needs_ellekit = if substrate.exists() {
            if replace_substrate {
                fs::remove_dir_all(&substrate)?;
                log::info!("removed existing CydiaSubstrate.framework");
                true
            } else {
                false
            }
        } else {
            !queue.is_empty()
        };

        if needs_ellekit {
            match &self.ellekit_deb {
                Some(path) if path.exists() => {
                    fs::create_dir_all(frameworks_dir)?;
                    queue.insert(0, path.clone());
                }
                _ => log::warn!("ElleKit package not available, skipping Substrate shim"),
            }
        }

        Ok(queue)
    }

    fn dispatch(
        &self,
        app_dir: &Path,
        frameworks_dir: &Path,
        main_executable: Option<&Path>,
        input: &Path,
        scratch: &Path,
    ) -> Result<()> {
        let ext = input
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        match ext.as_str() {
            "dylib" => self.inject_dylib(frameworks_dir, main_executable, input),
            "framework" => self.inject_framework(frameworks_dir, main_executable, input),
            "bundle" => {
                let dest = app_dir.join(file_name(input));
                if !dest.exists() {
                    copy_dir_all(input, &dest)?;
                    log::info!("copied {}", file_name(input));
                }
                Ok(())
            }
            "deb" => self.inject_deb(app_dir, frameworks_dir, main_executable, input, scratch),
            _ => {
                log::warn!("skipping unsupported injectable: {}", input.display());
                Ok(())
            }
        }
    }

    fn inject_dylib(
        &self,
        frameworks_dir: &Path,
        main_executable: Option<&Path>,
        source: &Path,
    ) -> Result<()> {
        let executable = match main_executable {
            Some(exe) => exe,
            None => {
                log::warn!("no main executable, skipping {}", source.display());
                return Ok(());
            }
        };

        let name = file_name(source);
        let dest = frameworks_dir.join(&name);
        if !dest.exists() {
            fs::create_dir_all(frameworks_dir)?;
            fs::copy(source, &dest)?;
        }

        self.backend
            .change_dylib_path(&dest, SUBSTRATE_LEGACY_PATH, SUBSTRATE_RPATH);
        self.backend
            .inject_dylib(executable, &format!("@executable_path/Frameworks/{name}"));
        log::info!("injected {name}");
        Ok(())
    }

    fn inject_framework(
        &self,
        frameworks_dir: &Path,
        main_executable: Option<&Path>,
        source: &Path,
    ) -> Result<()> {
        let executable = match main_executable {
            Some(exe) => exe,
            None => {
                log::warn!("no main executable, skipping {}", source.display());
                return Ok(());
            }
        };

        let name = file_name(source);
        let dest = frameworks_dir.join(&name);
        if !dest.exists() {
            copy_dir_all(source, &dest)?;
        }

        if name == SUBSTRATE_FRAMEWORK {
            // Substrate itself is only linked, never rewritten
            self.backend.inject_dylib(executable, SUBSTRATE_RPATH);
        } else {
            let framework_exe = name.trim_end_matches(".framework").to_string();
            self.backend.change_dylib_path(
                &dest.join(&framework_exe),
                SUBSTRATE_LEGACY_PATH,
                SUBSTRATE_RPATH,
            );
            self.backend.inject_dylib(
                executable,
                &format!("@executable_path/Frameworks/{name}/{framework_exe}"),
            );
        }
        log::info!("injected {name}");
        Ok(())
    }

    /// Extracts the package into the scratch directory and feeds every
    /// classified artifact back through the dispatcher.
    fn inject_deb(
        &self,
        app_dir: &Path,
        frameworks_dir: &Path,
        main_executable: Option<&Path>,
        source: &Path,
        scratch: &Path,
    ) -> Result<()> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "payload".to_string());
        let payload_root = scratch.join(format!("deb_{stem}"));
        fs::create_dir_all(&payload_root)?;

        deb::extract_deb(source, &payload_root, &mut |_| {})?;

        for artifact in tweaks::resolve_payload(&payload_root)? {
            match artifact.kind {
                ArtifactKind::Dylib => {
                    self.inject_dylib(frameworks_dir, main_executable, &artifact.source)?
                }
                ArtifactKind::Framework => {
                    self.inject_framework(frameworks_dir, main_executable, &artifact.source)?
                }
                ArtifactKind::Bundle => {
                    let dest = app_dir.join(file_name(&artifact.source));
                    if !dest.exists() {
                        copy_dir_all(&artifact.source, &dest)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::signer::RevocationStatus;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingBackend {
        injected: Mutex<Vec<(PathBuf, String)>>,
        rewritten: Mutex<Vec<(PathBuf, String, String)>>,
    }

    impl SigningBackend for RecordingBackend {
        fn sign(
            &self,
            _bundle: &Path,
            _p12: Option<&Path>,
            _provision: Option<&Path>,
            _password: &str,
        ) -> Result<()> {
            Ok(())
        }

        fn inject_dylib(&self, executable: &Path, load_path: &str) -> bool {
            self.injected
                .lock()
                .unwrap()
                .push((executable.to_path_buf(), load_path.to_string()));
            true
        }

        fn change_dylib_path(&self, executable: &Path, old: &str, new: &str) -> bool {
            self.rewritten.lock().unwrap().push((
                executable.to_path_buf(),
                old.to_string(),
                new.to_string(),
            ));
            true
        }

        fn list_dylibs(&self, _executable: &Path) -> Vec<String> {
            Vec::new()
        }

        fn check_password(&self, _p12: &Path, _password: &str) -> bool {
            true
        }

        fn check_revocation(
            &self,
            _provision: &Path,
            _p12: &Path,
            _password: &str,
        ) -> RevocationStatus {
            RevocationStatus::Unknown
        }
    }

    fn make_app(tmp: &TempDir) -> PathBuf {
        let app = tmp.path().join("Sample.app");
        fs::create_dir_all(&app).unwrap();
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleExecutable".to_string(),
            plist::Value::String("Sample".into()),
        );
        plist::to_file_xml(app.join("Info.plist"), &dict).unwrap();
        fs::write(app.join("Sample"), b"binary").unwrap();
        app
    }

    /// Synthetic ElleKit package shipping CydiaSubstrate.framework.
    fn make_ellekit_deb(dir: &Path) -> PathBuf {
        let mut tar = tar::Builder::new(Vec::new());
        let contents = b"ellekit shim";
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        tar.append_data(
            &mut header,
            "Library/Frameworks/CydiaSubstrate.framework/CydiaSubstrate",
            &contents[..],
        )
        .unwrap();
        let tar_bytes = tar.into_inner().unwrap();

        let mut gz =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        let gz_bytes = gz.finish().unwrap();

        let deb_path = dir.join("ellekit.deb");
        let mut builder = ar::Builder::new(fs::File::create(&deb_path).unwrap());
        let version = b"2.0\n";
        builder
            .append(
                &ar::Header::new(b"debian-binary".to_vec(), version.len() as u64),
                &version[..],
            )
            .unwrap();
        builder
            .append(
                &ar::Header::new(b"data.tar.gz".to_vec(), gz_bytes.len() as u64),
                &gz_bytes[..],
            )
            .unwrap();
        drop(builder);
        deb_path
    }

    #[test]
    fn no_framework_and_no_inputs_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let app = make_app(&tmp);
        let ellekit = make_ellekit_deb(tmp.path());
        let backend = RecordingBackend::default();

        let patcher = BinaryPatcher::new(&backend, Some(ellekit));
        patcher
            .apply(&app, &[], false, &tmp.path().join("scratch"))
            .unwrap();

        assert!(backend.injected.lock().unwrap().is_empty());
        assert!(!app.join("Frameworks").exists());
    }

    #[test]
    fn dylib_input_pulls_in_ellekit_once() {
        let tmp = TempDir::new().unwrap();
        let app = make_app(&tmp);
        let ellekit = make_ellekit_deb(tmp.path());
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let tweak = tmp.path().join("tweak.dylib");
        fs::write(&tweak, b"tweak").unwrap();

        let backend = RecordingBackend::default();
        let patcher = BinaryPatcher::new(&backend, Some(ellekit));
        patcher.apply(&app, &[tweak], false, &scratch).unwrap();

        assert!(app
            .join("Frameworks/CydiaSubstrate.framework/CydiaSubstrate")
            .is_file());
        assert!(app.join("Frameworks/tweak.dylib").is_file());

        let injected = backend.injected.lock().unwrap();
        let substrate_loads = injected
            .iter()
            .filter(|(_, p)| p == SUBSTRATE_RPATH)
            .count();
        assert_eq!(substrate_loads, 1);
        assert!(injected
            .iter()
            .any(|(_, p)| p == "@executable_path/Frameworks/tweak.dylib"));

        let rewritten = backend.rewritten.lock().unwrap();
        assert!(rewritten.iter().any(|(path, old, new)| {
            path.ends_with("Frameworks/tweak.dylib")
                && old == SUBSTRATE_LEGACY_PATH
                && new == SUBSTRATE_RPATH
        }));
    }

    #[test]
    fn replace_option_substitutes_existing_substrate() {
        let tmp = TempDir::new().unwrap();
        let app = make_app(&tmp);
        let ellekit = make_ellekit_deb(tmp.path());
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let old_framework = app.join("Frameworks").join(SUBSTRATE_FRAMEWORK);
        fs::create_dir_all(&old_framework).unwrap();
        fs::write(old_framework.join("stale-marker"), b"old").unwrap();

        let backend = RecordingBackend::default();
        let patcher = BinaryPatcher::new(&backend, Some(ellekit));
        patcher.apply(&app, &[], true, &scratch).unwrap();

        assert!(!old_framework.join("stale-marker").exists());
        assert!(old_framework.join("CydiaSubstrate").is_file());
        assert!(backend
            .injected
            .lock()
            .unwrap()
            .iter()
            .any(|(_, p)| p == SUBSTRATE_RPATH));
    }

    #[test]
    fn framework_present_without_replace_leaves_it_alone() {
        let tmp = TempDir::new().unwrap();
        let app = make_app(&tmp);
        let ellekit = make_ellekit_deb(tmp.path());

        let existing = app.join("Frameworks").join(SUBSTRATE_FRAMEWORK);
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("CydiaSubstrate"), b"current").unwrap();

        let backend = RecordingBackend::default();
        let patcher = BinaryPatcher::new(&backend, Some(ellekit));
        patcher
            .apply(&app, &[], false, &tmp.path().join("scratch"))
            .unwrap();

        assert_eq!(
            fs::read(existing.join("CydiaSubstrate")).unwrap(),
            b"current"
        );
        assert!(backend.injected.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_ellekit_logs_and_continues() {
        let tmp = TempDir::new().unwrap();
        let app = make_app(&tmp);
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let tweak = tmp.path().join("tweak.dylib");
        fs::write(&tweak, b"tweak").unwrap();

        let backend = RecordingBackend::default();
        let patcher = BinaryPatcher::new(&backend, None);
        patcher.apply(&app, &[tweak], false, &scratch).unwrap();

        // Tweak still injected, Substrate shim simply absent
        assert!(app.join("Frameworks/tweak.dylib").is_file());
        assert!(!app.join("Frameworks").join(SUBSTRATE_FRAMEWORK).exists());
    }

    #[test]
    fn unknown_extensions_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let app = make_app(&tmp);
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let stray = tmp.path().join("README.txt");
        fs::write(&stray, b"text").unwrap();

        let backend = RecordingBackend::default();
        let patcher = BinaryPatcher::new(&backend, None);
        patcher.apply(&app, &[stray], false, &scratch).unwrap();

        assert!(!app.join("README.txt").exists());
    }
}
