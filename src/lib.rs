pub mod archive;
pub mod bundle;
pub mod crypto;
pub mod deb;
pub mod error;
pub mod macho;
pub mod options;
pub mod patcher;
pub mod paths;
pub mod plist_ext;
pub mod signer;
pub mod store;
pub mod tweaks;
pub mod workflow;

pub use archive::{extract_zip, find_app_in_payload, package_directory_as_ipa, ZipBackend};
pub use bundle::AppBundle;
pub use deb::extract_deb;
pub use error::{KpackError, Result};
pub use options::SigningOptions;
pub use patcher::BinaryPatcher;
pub use paths::Directories;
pub use plist_ext::PlistFile;
pub use signer::{RevocationStatus, SigningBackend, ZsignBackend};
pub use store::{
    export_certificate, migrate_certificates, AppRecord, CertificateRecord, CredentialStore,
    FileStore, MemoryStore,
};
pub use tweaks::{resolve_payload, ArtifactKind, TweakArtifact};
pub use workflow::{CertificateImportWorkflow, ImportWorkflow, SignWorkflow, SigningIdentity};
