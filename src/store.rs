use crate::crypto::{self, KsignPayload};
use crate::error::{KpackError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Library entry for an imported, not-yet-signed app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub uuid: Uuid,
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub icon: Option<String>,
}

/// Stored signing identity. The p12 and provisioning blobs are kept
/// encrypted at rest; plaintext only ever exists transiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub uuid: Uuid,
    pub nickname: String,
    pub password: Option<String>,
    pub date: Option<f64>,
    pub p12_blob: Vec<u8>,
    pub provision_blob: Vec<u8>,
}

/// Persistence seam for imported apps and signing identities.
pub trait CredentialStore: Send + Sync {
    fn add_imported_app(&self, record: AppRecord) -> Result<()>;
    fn imported_apps(&self) -> Vec<AppRecord>;
    fn add_signed_app(&self, record: AppRecord) -> Result<()>;
    fn signed_apps(&self) -> Vec<AppRecord>;
    fn add_certificate(&self, record: CertificateRecord) -> Result<()>;
    fn certificate(&self, uuid: Uuid) -> Option<CertificateRecord>;
    fn certificates(&self) -> Vec<CertificateRecord>;
    fn update_certificate(&self, record: CertificateRecord) -> Result<()>;
}

/// In-process store backing the CLI and the tests.
#[derive(Default)]
pub struct MemoryStore {
    apps: Mutex<HashMap<Uuid, AppRecord>>,
    signed: Mutex<HashMap<Uuid, AppRecord>>,
    certificates: Mutex<HashMap<Uuid, CertificateRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn add_imported_app(&self, record: AppRecord) -> Result<()> {
        self.apps.lock().unwrap().insert(record.uuid, record);
        Ok(())
    }

    fn imported_apps(&self) -> Vec<AppRecord> {
        self.apps.lock().unwrap().values().cloned().collect()
    }

    fn add_signed_app(&self, record: AppRecord) -> Result<()> {
        self.signed.lock().unwrap().insert(record.uuid, record);
        Ok(())
    }

    fn signed_apps(&self) -> Vec<AppRecord> {
        self.signed.lock().unwrap().values().cloned().collect()
    }

    fn add_certificate(&self, record: CertificateRecord) -> Result<()> {
        self.certificates
            .lock()
            .unwrap()
            .insert(record.uuid, record);
        Ok(())
    }

    fn certificate(&self, uuid: Uuid) -> Option<CertificateRecord> {
        self.certificates.lock().unwrap().get(&uuid).cloned()
    }

    fn certificates(&self) -> Vec<CertificateRecord> {
        self.certificates.lock().unwrap().values().cloned().collect()
    }

    fn update_certificate(&self, record: CertificateRecord) -> Result<()> {
        self.certificates
            .lock()
            .unwrap()
            .insert(record.uuid, record);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    imported: HashMap<Uuid, AppRecord>,
    signed: HashMap<Uuid, AppRecord>,
    certificates: HashMap<Uuid, CertificateRecord>,
}

/// JSON-file store. Loads the whole library on open and rewrites the file
/// after every mutation, so records survive across processes.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.is_file() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(data)?)?;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn add_imported_app(&self, record: AppRecord) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.imported.insert(record.uuid, record);
        self.persist(&data)
    }

    fn imported_apps(&self) -> Vec<AppRecord> {
        self.data.lock().unwrap().imported.values().cloned().collect()
    }

    fn add_signed_app(&self, record: AppRecord) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.signed.insert(record.uuid, record);
        self.persist(&data)
    }

    fn signed_apps(&self) -> Vec<AppRecord> {
        self.data.lock().unwrap().signed.values().cloned().collect()
    }

    fn add_certificate(&self, record: CertificateRecord) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.certificates.insert(record.uuid, record);
        self.persist(&data)
    }

    fn certificate(&self, uuid: Uuid) -> Option<CertificateRecord> {
        self.data.lock().unwrap().certificates.get(&uuid).cloned()
    }

    fn certificates(&self) -> Vec<CertificateRecord> {
        self.data
            .lock()
            .unwrap()
            .certificates
            .values()
            .cloned()
            .collect()
    }

    fn update_certificate(&self, record: CertificateRecord) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.certificates.insert(record.uuid, record);
        self.persist(&data)
    }
}

/// Seals a new certificate record, encrypting the blobs on the way in.
pub fn new_certificate_record(
    nickname: &str,
    password: Option<&str>,
    p12: &[u8],
    provision: &[u8],
) -> CertificateRecord {
    CertificateRecord {
        uuid: Uuid::new_v4(),
        nickname: nickname.to_string(),
        password: password.map(String::from),
        date: None,
        p12_blob: crypto::safe_encrypt(p12),
        provision_blob: crypto::safe_encrypt(provision),
    }
}

/// Startup pass re-encrypting any blob stored before encryption existed.
/// The length heuristic is the only signal available, so blobs below the
/// minimum sealed length are treated as plaintext and sealed now.
pub fn migrate_certificates(store: &dyn CredentialStore) -> Result<usize> {
    let mut migrated = 0;

    for mut record in store.certificates() {
        let mut changed = false;
        if !crypto::is_encrypted(&record.p12_blob) {
            record.p12_blob = crypto::safe_encrypt(&record.p12_blob);
            changed = true;
        }
        if !crypto::is_encrypted(&record.provision_blob) {
            record.provision_blob = crypto::safe_encrypt(&record.provision_blob);
            changed = true;
        }
        if changed {
            store.update_certificate(record)?;
            migrated += 1;
        }
    }

    if migrated > 0 {
        log::info!("migrated {migrated} certificate record(s) to encrypted storage");
    }
    Ok(migrated)
}

/// Builds a portable `.ksign` container for the given identity.
pub fn export_certificate(store: &dyn CredentialStore, uuid: Uuid) -> Result<Vec<u8>> {
    let record = store
        .certificate(uuid)
        .ok_or(KpackError::FileNotFound(uuid.to_string().into()))?;

    let payload = KsignPayload {
        name: record.nickname.clone(),
        p12_data: base64::encode(crypto::safe_decrypt(&record.p12_blob)),
        provision_data: base64::encode(crypto::safe_decrypt(&record.provision_blob)),
        password: record.password.clone(),
        date: record.date,
    };
    payload.to_container()
}
