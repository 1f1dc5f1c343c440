use crate::archive::ProgressReporter;
use crate::error::{KpackError, Result};
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

/// Extracts the `data.tar*` payload of a Debian package into `destination`.
///
/// A `.deb` is an ar archive whose members include `debian-binary`,
/// `control.tar.*` and `data.tar.*`. Only the first `data.tar*` member is
/// processed; extras are skipped with a warning. Compression is detected by
/// suffix, the member is decompressed fully into memory, and the resulting
/// tar stream is written out with relative paths preserved. Symbolic links
/// and other special tar entries are skipped silently.
pub fn extract_deb(
    source: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let mut progress = ProgressReporter::new(on_progress);

    let deb_name = source
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let file = BufReader::new(File::open(source)?);
    let mut archive = ar::Archive::new(file);

    progress.report(0.1);

    let mut data_tar: Option<(String, Vec<u8>)> = None;

    loop {
        match archive.next_entry() {
            Some(Ok(mut entry)) => {
                let name = std::str::from_utf8(entry.header().identifier())
                    .unwrap_or("")
                    .trim_end_matches('/')
                    .trim()
                    .to_string();

                if name.starts_with("data.tar") {
                    if data_tar.is_some() {
                        log::warn!("{deb_name}: multiple data.tar members, skipping {name}");
                        continue;
                    }
                    let mut content = Vec::new();
                    entry.read_to_end(&mut content)?;
                    data_tar = Some((name, content));
                }
            }
            Some(Err(_)) => continue, // Skip problematic entries
            None => break,            // No more entries
        }
    }

    let (member_name, compressed) = data_tar.ok_or_else(|| {
        KpackError::InvalidInput(format!("no data.tar found in {deb_name}"))
    })?;

    progress.report(0.3);

    let decompressed = decompress_member(&member_name, &compressed)?;

    progress.report(0.5);

    unpack_tar(&decompressed, destination, &mut progress)?;

    progress.report(1.0);
    log::info!("extracted {deb_name}");
    Ok(())
}

/// Decompresses a `data.tar*` member by suffix. Bare `data.tar` passes
/// through unchanged.
fn decompress_member(name: &str, compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();

    if name.ends_with(".xz") {
        let mut decoder = xz2::read::XzDecoder::new(compressed);
        decoder.read_to_end(&mut decompressed)?;
    } else if name.ends_with(".gz") {
        let mut decoder = flate2::read::GzDecoder::new(compressed);
        decoder.read_to_end(&mut decompressed)?;
    } else if name.ends_with(".lzma") {
        // LZMA uses a different stream format than XZ
        let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
            .map_err(|e| KpackError::InvalidInput(format!("LZMA decoder error: {e}")))?;
        let mut decoder = xz2::read::XzDecoder::new_stream(compressed, stream);
        decoder.read_to_end(&mut decompressed)?;
    } else if name.ends_with(".bz2") {
        let mut decoder = bzip2::read::BzDecoder::new(compressed);
        decoder.read_to_end(&mut decompressed)?;
    } else if name == "data.tar" {
        decompressed.extend_from_slice(compressed);
    } else {
        return Err(KpackError::InvalidInput(format!(
            "unsupported data.tar compression: {name}"
        )));
    }

    Ok(decompressed)
}

/// Writes regular files and directories from an in-memory tar stream.
fn unpack_tar(data: &[u8], destination: &Path, progress: &mut ProgressReporter) -> Result<()> {
    let total = tar::Archive::new(Cursor::new(data)).entries()?.count().max(1);

    let mut archive = tar::Archive::new(Cursor::new(data));
    for (index, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let outpath = destination.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&outpath)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = outpath.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut outfile = File::create(&outpath)?;
                std::io::copy(&mut entry, &mut outfile)?;
            }
            // symlinks and special entries are intentionally dropped
            _ => {}
        }

        progress.report(0.5 + 0.5 * (index + 1) as f64 / total as f64);
    }

    Ok(())
}
