use crate::error::{KpackError, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// Interchangeable ZIP extraction strategies. Both honor the same contract;
/// `ZipFoundation` walks a pre-built entry list and holds up better on some
/// very large archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipBackend {
    Zip,
    ZipFoundation,
}

impl ZipBackend {
    /// Maps the persisted setting string. Unknown values fall back to `Zip`.
    pub fn from_setting(setting: &str) -> Self {
        match setting {
            "ZIPFoundation" => ZipBackend::ZipFoundation,
            _ => ZipBackend::Zip,
        }
    }

    pub fn as_setting(&self) -> &'static str {
        match self {
            ZipBackend::Zip => "Zip",
            ZipBackend::ZipFoundation => "ZIPFoundation",
        }
    }
}

/// Wraps a progress callback and clamps it monotonic into [0, 1].
pub(crate) struct ProgressReporter<'a> {
    callback: &'a mut dyn FnMut(f64),
    last: f64,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(callback: &'a mut dyn FnMut(f64)) -> Self {
        Self { callback, last: 0.0 }
    }

    pub(crate) fn report(&mut self, fraction: f64) {
        let clamped = fraction.clamp(0.0, 1.0);
        if clamped >= self.last {
            self.last = clamped;
            (self.callback)(clamped);
        }
    }
}

/// Extracts a ZIP-family archive (ipa/tipa included) into `destination`.
///
/// Both backends create directories as needed, preserve relative paths,
/// overwrite existing files, and report entry-proportional progress ending at
/// 1.0. Password-protected archives are not supported. On error the
/// destination is unusable and the caller removes it.
pub fn extract_zip(
    source: &Path,
    destination: &Path,
    backend: ZipBackend,
    on_progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let mut progress = ProgressReporter::new(on_progress);
    match backend {
        ZipBackend::Zip => extract_streaming(source, destination, &mut progress),
        ZipBackend::ZipFoundation => extract_listed(source, destination, &mut progress),
    }
}

/// Streams entries in archive order, copying each straight to disk.
fn extract_streaming(
    source: &Path,
    destination: &Path,
    progress: &mut ProgressReporter,
) -> Result<()> {
    let file = File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let total = archive.len().max(1);

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let unix_mode = entry.unix_mode();
        write_entry(&mut entry, &name, unix_mode, destination)?;
        progress.report((i + 1) as f64 / total as f64);
    }

    progress.report(1.0);
    Ok(())
}

/// Materializes the entry list first, then extracts by name. Mirrors the
/// other backend's contract exactly; only the traversal differs.
fn extract_listed(
    source: &Path,
    destination: &Path,
    progress: &mut ProgressReporter,
) -> Result<()> {
    let file = File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let total = names.len().max(1);

    for (index, name) in names.iter().enumerate() {
        progress.report(index as f64 / total as f64);
        let mut entry = archive.by_name(name)?;
        let unix_mode = entry.unix_mode();
        write_entry(&mut entry, name, unix_mode, destination)?;
    }

    progress.report(1.0);
    Ok(())
}

fn write_entry(
    entry: &mut impl Read,
    name: &str,
    unix_mode: Option<u32>,
    destination: &Path,
) -> Result<()> {
    let outpath = destination.join(name);

    if name.ends_with('/') {
        fs::create_dir_all(&outpath)?;
        return Ok(());
    }

    if let Some(parent) = outpath.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut outfile = File::create(&outpath)?;
    std::io::copy(entry, &mut outfile)?;

    // Preserve Unix permissions
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = unix_mode {
            fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
        }
    }
    #[cfg(not(unix))]
    let _ = unix_mode;

    Ok(())
}

/// Packages an `.app` directory as an `.ipa` at `destination`.
///
/// The app is copied (never moved) into a fresh `Payload/` staging tree, the
/// staging tree is zipped, and the `.zip` is renamed to `.ipa`. Stale staging
/// directories are removed before starting and after finishing, on both
/// success and failure paths.
pub fn package_directory_as_ipa(
    app_dir: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(f64),
) -> Result<()> {
    if app_dir.extension().map(|e| e != "app").unwrap_or(true) {
        return Err(KpackError::InvalidAppBundle(
            "not an .app directory".to_string(),
        ));
    }

    let staging = std::env::temp_dir().join(format!(
        "kpack_stage_{}",
        uuid::Uuid::new_v4().simple()
    ));
    remove_if_exists(&staging)?;

    let result = package_into_staging(app_dir, destination, &staging, on_progress);

    // staging cleanup runs on both paths
    let _ = fs::remove_dir_all(&staging);

    result
}

fn package_into_staging(
    app_dir: &Path,
    destination: &Path,
    staging: &Path,
    on_progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let mut progress = ProgressReporter::new(on_progress);

    let app_name = app_dir
        .file_name()
        .ok_or_else(|| KpackError::InvalidInput("invalid app path".to_string()))?;

    let payload = staging.join("Payload");
    fs::create_dir_all(&payload)?;
    copy_dir_all(app_dir, &payload.join(app_name))?;

    let zip_path = destination.with_extension("zip");
    remove_if_exists(&zip_path)?;
    remove_if_exists(destination)?;

    create_payload_zip(staging, &zip_path, &mut progress)?;

    fs::rename(&zip_path, destination)?;
    progress.report(1.0);
    Ok(())
}

/// Zips the `Payload` tree under `staging` into `output`.
fn create_payload_zip(
    staging: &Path,
    output: &Path,
    progress: &mut ProgressReporter,
) -> Result<()> {
    let file = File::create(output)?;
    let mut zip = zip::ZipWriter::new(file);

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(6));

    let payload = staging.join("Payload");
    let total = WalkDir::new(&payload).into_iter().count().max(1);

    for (index, entry) in WalkDir::new(&payload).into_iter().enumerate() {
        let entry = entry?;
        let path = entry.path();
        let name = path.strip_prefix(staging).expect("path is within staging");

        // Skip hidden files (fixes installd errors)
        if name
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            continue;
        }

        if path.is_file() {
            let name_str = name.to_string_lossy().replace('\\', "/");
            zip.start_file(&name_str, options)?;
            let mut f = File::open(path)?;
            let mut buffer = Vec::new();
            f.read_to_end(&mut buffer)?;
            zip.write_all(&buffer)?;
        } else if path.is_dir() && path != payload {
            let name_str = format!("{}/", name.to_string_lossy().replace('\\', "/"));
            zip.add_directory(&name_str, options)?;
        }

        progress.report(0.9 * (index + 1) as f64 / total as f64);
    }

    zip.finish()?;
    Ok(())
}

pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_symlink() {
            let target = fs::read_link(&src_path)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(target, &dst_path)?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(target, &dst_path)?;
        } else if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// Finds the single `.app` directory under a `Payload` folder.
pub fn find_app_in_payload(payload: &Path) -> Result<PathBuf> {
    for entry in fs::read_dir(payload)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.extension().map(|e| e == "app").unwrap_or(false) {
            return Ok(path);
        }
    }
    Err(KpackError::InvalidAppBundle(
        "no .app folder found in Payload".to_string(),
    ))
}
