use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// What kind of injectable a payload entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Dylib,
    Framework,
    Bundle,
}

/// An injectable discovered inside a decompressed deb payload.
#[derive(Debug, Clone)]
pub struct TweakArtifact {
    pub source: PathBuf,
    pub kind: ArtifactKind,
    /// True when found by the payload walk rather than handed in directly.
    pub nested: bool,
}

/// Rootfs and rootless jailbreak layouts.
const PREFIXES: [&str; 2] = ["", "var/jb/"];

const DYLIB_DIR: &str = "Library/MobileSubstrate/DynamicLibraries";
const FRAMEWORK_DIR: &str = "Library/Frameworks";
const APP_SUPPORT_DIR: &str = "Library/Application Support";

/// Walks a decompressed deb payload tree and classifies every artifact a
/// signing pass should inject.
///
/// Search table (checked under both prefixes):
/// - `Library/MobileSubstrate/DynamicLibraries/`: `.dylib` files, flat scan
/// - `Library/Frameworks/`: `.framework` directories, flat scan
/// - `Library/Application Support/`: `.bundle` directories, recursive
///
/// Symbolic links are never collected and never followed; the recursive
/// bundle search does not descend into a `.bundle` once classified. Missing
/// directories are skipped silently.
pub fn resolve_payload(root: &Path) -> Result<Vec<TweakArtifact>> {
    let mut artifacts = Vec::new();

    for prefix in PREFIXES {
        let dylib_dir = root.join(prefix).join(DYLIB_DIR);
        if dylib_dir.is_dir() {
            collect_flat(&dylib_dir, "dylib", false, ArtifactKind::Dylib, &mut artifacts)?;
        }

        let framework_dir = root.join(prefix).join(FRAMEWORK_DIR);
        if framework_dir.is_dir() {
            collect_flat(
                &framework_dir,
                "framework",
                true,
                ArtifactKind::Framework,
                &mut artifacts,
            )?;
        }

        let support_dir = root.join(prefix).join(APP_SUPPORT_DIR);
        if support_dir.is_dir() {
            collect_bundles(&support_dir, &mut artifacts)?;
        }
    }

    log::debug!(
        "resolved {} artifact(s) under {}",
        artifacts.len(),
        root.display()
    );
    Ok(artifacts)
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().map(|e| e == ext).unwrap_or(false)
}

/// Non-recursive scan collecting entries with the given extension.
fn collect_flat(
    dir: &Path,
    ext: &str,
    want_dir: bool,
    kind: ArtifactKind,
    out: &mut Vec<TweakArtifact>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_symlink(&path) || !has_extension(&path, ext) {
            continue;
        }
        if path.is_dir() != want_dir {
            continue;
        }
        out.push(TweakArtifact {
            source: path,
            kind,
            nested: true,
        });
    }
    Ok(())
}

/// Depth-first `.bundle` search. Recurses into plain directories only, so
/// symlink cycles cannot occur and bundle internals are never re-classified.
fn collect_bundles(dir: &Path, out: &mut Vec<TweakArtifact>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_symlink(&path) || !path.is_dir() {
            continue;
        }
        if has_extension(&path, "bundle") {
            out.push(TweakArtifact {
                source: path,
                kind: ArtifactKind::Bundle,
                nested: true,
            });
        } else {
            collect_bundles(&path, out)?;
        }
    }
    Ok(())
}
