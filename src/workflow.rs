use crate::archive::{self, copy_dir_all, remove_if_exists, ZipBackend};
use crate::bundle::AppBundle;
use crate::error::{KpackError, Result};
use crate::options::SigningOptions;
use crate::patcher::BinaryPatcher;
use crate::paths::Directories;
use crate::signer::SigningBackend;
use crate::store::{self, AppRecord, CertificateRecord, CredentialStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

/// Runs `job` on a background thread and fires `on_complete` exactly once
/// with its result.
pub fn spawn<T, F, C>(job: F, on_complete: C) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    C: FnOnce(Result<T>) + Send + 'static,
{
    std::thread::spawn(move || on_complete(job()))
}

/// Allocates a unique scratch directory, runs the steps, then removes the
/// scratch unconditionally. The step error, if any, is surfaced after the
/// cleanup.
fn run_in_scratch<T>(scratch_root: &Path, steps: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let scratch = scratch_root.join(format!("kpack_{}", Uuid::new_v4().simple()));
    fs::create_dir_all(&scratch)?;

    let result = steps(&scratch);

    if let Err(e) = fs::remove_dir_all(&scratch) {
        log::warn!("failed to remove scratch {}: {e}", scratch.display());
    }
    result
}

/// Brings an external IPA/TIPA into the library.
///
/// Steps: copy the archive into scratch, extract it, move the `Payload`
/// tree into `App/Unsigned/<uuid>`, register the app's metadata, clean.
pub struct ImportWorkflow {
    source: PathBuf,
    dirs: Directories,
    store: Arc<dyn CredentialStore>,
    zip_backend: ZipBackend,
    scratch_root: PathBuf,
}

impl ImportWorkflow {
    pub fn new(
        source: PathBuf,
        dirs: Directories,
        store: Arc<dyn CredentialStore>,
        zip_backend: ZipBackend,
    ) -> Self {
        Self {
            source,
            dirs,
            store,
            zip_backend,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Overrides where scratch directories are allocated.
    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn run(&self, on_progress: &mut dyn FnMut(f64)) -> Result<AppRecord> {
        if !self.source.is_file() {
            return Err(KpackError::FileNotFound(self.source.clone()));
        }

        run_in_scratch(&self.scratch_root, |scratch| {
            // copy
            let file_name = self
                .source
                .file_name()
                .ok_or_else(|| KpackError::InvalidInput("invalid source path".to_string()))?;
            let local = scratch.join(file_name);
            remove_if_exists(&local)?;
            fs::copy(&self.source, &local)?;

            if log::log_enabled!(log::Level::Debug) {
                use sha2::{Digest, Sha256};
                let digest = Sha256::digest(fs::read(&local)?);
                log::debug!("archive sha256 {}", hex::encode(digest));
            }

            // extract
            let extracted = scratch.join("extracted");
            archive::extract_zip(&local, &extracted, self.zip_backend, on_progress)?;
            let payload = extracted.join("Payload");
            if !payload.is_dir() {
                return Err(KpackError::PayloadNotFound);
            }

            // move
            let uuid = Uuid::new_v4();
            let target_root = self.dirs.ensure(self.dirs.unsigned_app(uuid))?;
            let target = target_root.join("Payload");
            if fs::rename(&payload, &target).is_err() {
                // scratch may be on another filesystem
                copy_dir_all(&payload, &target)?;
            }

            // register; an unregistered payload must not stay in the library
            let record = match self.register(uuid, &target) {
                Ok(record) => record,
                Err(e) => {
                    let _ = fs::remove_dir_all(&target_root);
                    return Err(e);
                }
            };
            log::info!("imported {}", record.name.as_deref().unwrap_or("app"));
            Ok(record)
        })
    }

    fn register(&self, uuid: Uuid, payload: &Path) -> Result<AppRecord> {
        let app_dir = archive::find_app_in_payload(payload)?;
        let bundle = AppBundle::new(&app_dir)?;
        let record = AppRecord {
            uuid,
            identifier: bundle.identifier().map(String::from),
            name: bundle.display_name().map(String::from),
            version: bundle.version().map(String::from),
            icon: bundle.primary_icon_name(),
        };
        self.store.add_imported_app(record.clone())?;
        Ok(record)
    }

    pub fn spawn(self, on_complete: impl FnOnce(Result<AppRecord>) + Send + 'static) -> JoinHandle<()> {
        spawn(move || self.run(&mut |_| {}), on_complete)
    }
}

/// Credential files handed to a signing pass.
#[derive(Debug, Clone)]
pub struct SigningIdentity {
    pub p12: PathBuf,
    pub provision: PathBuf,
    pub password: String,
}

/// Modifies and seals an imported app.
///
/// Steps: copy the app into scratch, apply the option-driven edits and the
/// injection pass, seal unless `only_modify`, land the result in
/// `App/Signed/<uuid>`, register, clean.
pub struct SignWorkflow {
    app_dir: PathBuf,
    options: SigningOptions,
    identity: Option<SigningIdentity>,
    dirs: Directories,
    store: Arc<dyn CredentialStore>,
    backend: Arc<dyn SigningBackend>,
    ellekit_deb: Option<PathBuf>,
    scratch_root: PathBuf,
}

impl SignWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_dir: PathBuf,
        options: SigningOptions,
        identity: Option<SigningIdentity>,
        dirs: Directories,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn SigningBackend>,
        ellekit_deb: Option<PathBuf>,
    ) -> Self {
        Self {
            app_dir,
            options,
            identity,
            dirs,
            store,
            backend,
            ellekit_deb,
            scratch_root: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn run(&self) -> Result<AppRecord> {
        if !self.app_dir.is_dir() {
            return Err(KpackError::FileNotFound(self.app_dir.clone()));
        }

        run_in_scratch(&self.scratch_root, |scratch| {
            // copy
            let app_name = self
                .app_dir
                .file_name()
                .ok_or_else(|| KpackError::InvalidInput("invalid app path".to_string()))?;
            let work_app = scratch.join(app_name);
            copy_dir_all(&self.app_dir, &work_app)?;

            // modify
            self.apply_options(&work_app)?;

            let patcher = BinaryPatcher::new(&*self.backend, self.ellekit_deb.clone());
            patcher.apply(
                &work_app,
                &self.options.injection_files,
                self.options.replace_substrate_with_ellekit,
                scratch,
            )?;

            if !self.options.only_modify {
                let (p12, provision, password) = match (&self.identity, self.options.do_adhoc_signing) {
                    (Some(identity), false) => (
                        Some(identity.p12.as_path()),
                        Some(identity.provision.as_path()),
                        identity.password.as_str(),
                    ),
                    _ => (None, None, ""),
                };
                self.backend.sign(&work_app, p12, provision, password)?;
            }

            // land the result and register
            let uuid = Uuid::new_v4();
            let dest_root = self.dirs.ensure(self.dirs.signed_app(uuid))?;
            let dest = dest_root.join(app_name);
            copy_dir_all(&work_app, &dest)?;

            let bundle = AppBundle::new(&dest)?;
            let record = AppRecord {
                uuid,
                identifier: bundle.identifier().map(String::from),
                name: bundle.display_name().map(String::from),
                version: bundle.version().map(String::from),
                icon: bundle.primary_icon_name(),
            };
            self.store.add_signed_app(record.clone())?;
            Ok(record)
        })
    }

    fn apply_options(&self, work_app: &Path) -> Result<()> {
        let mut bundle = AppBundle::new(work_app)?;
        let options = &self.options;

        let original_id = bundle.identifier().map(String::from);

        if let Some(name) = &options.app_name {
            bundle.plist.change_name(name);
        }
        if let Some(version) = &options.app_version {
            bundle.plist.change_version(version);
        }
        if let Some(identifier) = &options.app_identifier {
            bundle.plist.change_bundle_id(identifier);
        }
        if let Some(minimum) = &options.minimum_os_version {
            bundle.plist.change_minimum_version(minimum);
        }

        // Remapping tables are keyed by the original identifier
        if let Some(id) = &original_id {
            if let Some(new_name) = options.display_names.get(id) {
                bundle.plist.change_name(new_name);
            }
            if let Some(new_id) = options.identifiers.get(id) {
                bundle.plist.change_bundle_id(new_id);
            }
        }

        // PPQ mitigation: decorate the identifier so Apple's provisioning
        // checks never see the stock one
        if options.ppq_protection {
            if let Some(current) = bundle.identifier().map(String::from) {
                let suffix = options
                    .ppq_string
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..6].to_string());
                bundle.plist.change_bundle_id(&format!("{current}.{suffix}"));
            }
        }

        if options.remove_supported_devices {
            bundle.plist.remove_supported_devices();
        }
        if options.enable_file_sharing {
            bundle.plist.enable_documents();
        }
        if options.remove_url_scheme {
            bundle.remove_url_schemes();
        }
        if options.remove_provisioning {
            bundle.remove_provisioning();
        }
        if options.remove_watch_placeholder {
            bundle.remove_watch_placeholder();
        }
        if !options.remove_files.is_empty() {
            let names: Vec<&Path> = options.remove_files.iter().map(Path::new).collect();
            bundle.remove(&names);
        }

        // Staged for the backend, which consumes and removes it
        if let Some(entitlements) = &options.entitlements_file {
            fs::copy(entitlements, work_app.join("kpack.entitlements"))?;
        }

        Ok(())
    }

    pub fn spawn(self, on_complete: impl FnOnce(Result<AppRecord>) + Send + 'static) -> JoinHandle<()> {
        spawn(move || self.run(), on_complete)
    }
}

/// Imports a signing identity, either from discrete files or a `.ksign`
/// container. Validation happens before anything is registered.
pub struct CertificateImportWorkflow {
    store: Arc<dyn CredentialStore>,
    backend: Arc<dyn SigningBackend>,
}

impl CertificateImportWorkflow {
    pub fn new(store: Arc<dyn CredentialStore>, backend: Arc<dyn SigningBackend>) -> Self {
        Self { store, backend }
    }

    pub fn import_files(
        &self,
        p12: &Path,
        provision: &Path,
        password: Option<&str>,
        nickname: &str,
    ) -> Result<CertificateRecord> {
        if !self.backend.check_password(p12, password.unwrap_or("")) {
            return Err(KpackError::InvalidPassword);
        }

        let p12_bytes = fs::read(p12)?;
        let provision_bytes = fs::read(provision)?;

        let record = store::new_certificate_record(nickname, password, &p12_bytes, &provision_bytes);
        self.store.add_certificate(record.clone())?;
        log::info!("imported certificate {nickname:?}");
        Ok(record)
    }

    pub fn import_ksign(&self, container: &Path) -> Result<CertificateRecord> {
        let data = fs::read(container)?;
        let payload = crate::crypto::KsignPayload::from_container(&data)?;

        let p12_bytes = payload.p12_bytes()?;
        let provision_bytes = payload.provision_bytes()?;
        let password = payload.password.as_deref().unwrap_or("");

        // validate before registering anything
        let staged = tempfile::NamedTempFile::new()?;
        fs::write(staged.path(), &p12_bytes)?;
        if !self.backend.check_password(staged.path(), password) {
            return Err(KpackError::InvalidPassword);
        }

        let mut record = store::new_certificate_record(
            &payload.name,
            payload.password.as_deref(),
            &p12_bytes,
            &provision_bytes,
        );
        record.date = payload.date;
        self.store.add_certificate(record.clone())?;
        log::info!("imported certificate {:?} from container", payload.name);
        Ok(record)
    }

    pub fn spawn_files(
        self,
        p12: PathBuf,
        provision: PathBuf,
        password: Option<String>,
        nickname: String,
        on_complete: impl FnOnce(Result<CertificateRecord>) + Send + 'static,
    ) -> JoinHandle<()> {
        spawn(
            move || self.import_files(&p12, &provision, password.as_deref(), &nickname),
            on_complete,
        )
    }
}
