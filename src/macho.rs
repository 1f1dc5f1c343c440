use crate::error::{KpackError, Result};
use apple_codesign::{MachFile, MachOBinary, UniversalBinaryBuilder};
use goblin::mach::cputype::CPU_TYPE_ARM64;
use goblin::mach::load_command::{
    CommandVariant, LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB, LC_RPATH,
};
use std::fs;
use std::path::Path;

const DYLIB_COMMANDS: &[u32] = &[
    LC_LOAD_DYLIB,
    LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
    LC_LAZY_LOAD_DYLIB,
    LC_LOAD_UPWARD_DYLIB,
];

/// Adds an `LC_LOAD_WEAK_DYLIB` for `load_path` to every slice of the binary
/// at `path`. Slices that already carry the load command are left alone.
pub fn add_weak_dylib<P: AsRef<Path>>(path: P, load_path: &str) -> Result<()> {
    let path = path.as_ref();
    let mut slices = parse_leaked(path)?;
    for slice in &mut slices {
        slice.add_weak_dylib_command(load_path)?;
    }
    write_mach_file(&slices, path)
}

/// Rewrites every dylib load command naming `old` to name `new` instead, in
/// every slice. Slices without a match are untouched.
pub fn change_dylib_path<P: AsRef<Path>>(path: P, old: &str, new: &str) -> Result<()> {
    let path = path.as_ref();
    let mut slices = parse_leaked(path)?;
    for slice in &mut slices {
        slice.rewrite_dylib_path(old, new)?;
    }
    write_mach_file(&slices, path)
}

/// Adds an `LC_RPATH` for `rpath` to every slice, skipping slices that
/// already have it.
pub fn add_rpath<P: AsRef<Path>>(path: P, rpath: &str) -> Result<()> {
    let path = path.as_ref();
    let mut slices = parse_leaked(path)?;
    for slice in &mut slices {
        slice.add_rpath_command(rpath)?;
    }
    write_mach_file(&slices, path)
}

/// Lists the dylib load paths of the binary at `path` (first slice of a
/// universal binary), in load-command order, duplicates preserved.
pub fn list_dylibs<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let data = fs::read(path.as_ref())?;
    let mach_file = MachFile::parse(&data)
        .map_err(|e| KpackError::MachO(format!("Failed to parse Mach-O: {e}")))?;

    let slice = mach_file
        .iter_macho()
        .next()
        .ok_or_else(|| KpackError::MachO("No Mach-O slices found".to_string()))?;
    Ok(slice.dylib_paths())
}

fn parse_leaked(path: &Path) -> Result<Vec<MachOBinary<'static>>> {
    let data = fs::read(path)?;
    // The slice editors replace `data` wholesale, so the backing buffer
    // lives for the duration of the edit anyway.
    let data = Box::leak(data.into_boxed_slice());
    let mach_file = MachFile::parse(data)
        .map_err(|e| KpackError::MachO(format!("Failed to parse Mach-O: {e}")))?;
    Ok(mach_file.into_iter().collect())
}

fn write_mach_file(slices: &[MachOBinary], path: &Path) -> Result<()> {
    let mut builder = UniversalBinaryBuilder::default();
    for slice in slices {
        builder
            .add_binary(slice.data)
            .map_err(|e| KpackError::MachO(format!("Failed to stage Mach-O slice: {e}")))?;
    }
    let mut file = fs::File::create(path)?;
    builder
        .write(&mut file)
        .map_err(|e| KpackError::MachO(format!("Failed to write Mach-O: {e}")))?;
    Ok(())
}

trait LoadCommandEdit {
    fn add_weak_dylib_command(&mut self, load_path: &str) -> Result<()>;
    fn rewrite_dylib_path(&mut self, old: &str, new: &str) -> Result<()>;
    fn add_rpath_command(&mut self, rpath: &str) -> Result<()>;
    fn dylib_paths(&self) -> Vec<String>;
}

impl LoadCommandEdit for MachOBinary<'_> {
    fn add_weak_dylib_command(&mut self, load_path: &str) -> Result<()> {
        if self.dylib_paths().iter().any(|p| p == load_path) {
            log::debug!("dylib already present: {load_path}");
            return Ok(());
        }

        // dylib_command: cmd(4) cmdsize(4) name_off(4) timestamp(4)
        // current_version(4) compat_version(4), then the name
        let command_size = 24 + padded_cstr_len(load_path);

        let mut command = Vec::with_capacity(command_size);
        command.extend_from_slice(&LC_LOAD_WEAK_DYLIB.to_le_bytes());
        command.extend_from_slice(&(command_size as u32).to_le_bytes());
        command.extend_from_slice(&24u32.to_le_bytes());
        command.extend_from_slice(&2u32.to_le_bytes());
        command.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        command.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        append_cstr(&mut command, load_path);

        self.append_load_command(&command)
    }

    fn rewrite_dylib_path(&mut self, old: &str, new: &str) -> Result<()> {
        let matches: Vec<(usize, usize)> = self
            .macho
            .load_commands
            .iter()
            .filter(|lc| DYLIB_COMMANDS.contains(&lc.command.cmd()))
            .filter_map(|lc| {
                let name_off = read_u32(self.data, lc.offset + 8)? as usize;
                let found = cstr_at(self.data, lc.offset + name_off)?;
                if found == old {
                    let cmdsize = read_u32(self.data, lc.offset + 4)? as usize;
                    Some((lc.offset, cmdsize))
                } else {
                    None
                }
            })
            .collect();

        if matches.is_empty() {
            return Ok(());
        }

        let mut data = self.data.to_vec();
        for (cmd_offset, cmdsize) in matches {
            let name_offset = cmd_offset + 24;
            let available = cmdsize - 24;
            if padded_cstr_len(new) > available {
                return Err(KpackError::MachO(format!(
                    "Not enough space to rewrite dylib path to {new}"
                )));
            }
            for byte in &mut data[name_offset..name_offset + available] {
                *byte = 0;
            }
            data[name_offset..name_offset + new.len()].copy_from_slice(new.as_bytes());
        }

        self.data = Box::leak(data.into_boxed_slice());
        Ok(())
    }

    fn add_rpath_command(&mut self, rpath: &str) -> Result<()> {
        let exists = self.macho.load_commands.iter().any(|lc| {
            lc.command.cmd() == LC_RPATH
                && read_u32(self.data, lc.offset + 8)
                    .and_then(|off| cstr_at(self.data, lc.offset + off as usize))
                    .is_some_and(|existing| existing == rpath)
        });
        if exists {
            return Ok(());
        }

        // rpath_command: cmd(4) cmdsize(4) path_off(4), then the path
        let command_size = 12 + padded_cstr_len(rpath);

        let mut command = Vec::with_capacity(command_size);
        command.extend_from_slice(&LC_RPATH.to_le_bytes());
        command.extend_from_slice(&(command_size as u32).to_le_bytes());
        command.extend_from_slice(&12u32.to_le_bytes());
        append_cstr(&mut command, rpath);

        self.append_load_command(&command)
    }

    fn dylib_paths(&self) -> Vec<String> {
        self.macho
            .load_commands
            .iter()
            .filter(|lc| DYLIB_COMMANDS.contains(&lc.command.cmd()))
            .filter_map(|lc| {
                let name_off = read_u32(self.data, lc.offset + 8)? as usize;
                cstr_at(self.data, lc.offset + name_off)
            })
            .collect()
    }
}

trait AppendLoadCommand {
    fn append_load_command(&mut self, command: &[u8]) -> Result<()>;
}

impl AppendLoadCommand for MachOBinary<'_> {
    /// Splices a fully-formed load command into the gap between the existing
    /// load commands and the first segment's file data, bumping `ncmds` and
    /// `sizeofcmds`. Fails when the gap is too small.
    fn append_load_command(&mut self, command: &[u8]) -> Result<()> {
        let header_size = if self.macho.header.cputype == CPU_TYPE_ARM64 {
            32
        } else {
            28
        };

        let ncmds = read_u32(self.data, 16)
            .ok_or_else(|| KpackError::MachO("Truncated Mach-O header".to_string()))?;
        let sizeofcmds = read_u32(self.data, 20)
            .ok_or_else(|| KpackError::MachO("Truncated Mach-O header".to_string()))?;

        let commands_end = header_size + sizeofcmds as usize;
        let data_start = first_segment_offset(&self.macho).unwrap_or(self.data.len());
        let available = data_start.saturating_sub(commands_end);

        if command.len() > available {
            return Err(KpackError::MachO(format!(
                "Not enough space for new load command (need {}, have {})",
                command.len(),
                available
            )));
        }

        let mut data = self.data.to_vec();
        data[commands_end..commands_end + command.len()].copy_from_slice(command);
        data[16..20].copy_from_slice(&(ncmds + 1).to_le_bytes());
        data[20..24].copy_from_slice(&(sizeofcmds + command.len() as u32).to_le_bytes());

        self.data = Box::leak(data.into_boxed_slice());
        Ok(())
    }
}

/// Lowest non-zero file offset among segments with file content. That is
/// where load commands stop being allowed to grow.
fn first_segment_offset(macho: &goblin::mach::MachO) -> Option<usize> {
    macho
        .load_commands
        .iter()
        .filter_map(|lc| match &lc.command {
            CommandVariant::Segment64(seg) if seg.filesize > 0 && seg.fileoff > 0 => {
                Some(seg.fileoff as usize)
            }
            CommandVariant::Segment32(seg) if seg.filesize > 0 && seg.fileoff > 0 => {
                Some(seg.fileoff as usize)
            }
            _ => None,
        })
        .min()
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn cstr_at(data: &[u8], offset: usize) -> Option<String> {
    if offset >= data.len() {
        return None;
    }
    let end = data[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(data.len());
    std::str::from_utf8(&data[offset..end]).ok().map(String::from)
}

/// Nul-terminated, padded to the 8-byte load-command alignment.
fn padded_cstr_len(s: &str) -> usize {
    let raw = s.len() + 1;
    raw + (8 - raw % 8) % 8
}

fn append_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    let padded = padded_cstr_len(s);
    out.resize(out.len() + padded - (s.len() + 1) + 1, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::mach::Mach;
    use tempfile::TempDir;

    const MH_MAGIC_64: u32 = 0xfeed_facf;
    const MH_EXECUTE: u32 = 2;
    const LC_SEGMENT_64: u32 = 0x19;

    fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
        let size = 24 + padded_cstr_len(name);
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&cmd.to_le_bytes());
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(&24u32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        out.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        append_cstr(&mut out, name);
        out
    }

    fn segment_command(name: &str, fileoff: u64, filesize: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(72);
        out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        out.extend_from_slice(&72u32.to_le_bytes());
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&segname);
        out.extend_from_slice(&0u64.to_le_bytes()); // vmaddr
        out.extend_from_slice(&0x4000u64.to_le_bytes()); // vmsize
        out.extend_from_slice(&fileoff.to_le_bytes());
        out.extend_from_slice(&filesize.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // maxprot
        out.extend_from_slice(&1u32.to_le_bytes()); // initprot
        out.extend_from_slice(&0u32.to_le_bytes()); // nsects
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out
    }

    /// Minimal arm64 executable image: header, a linkedit segment whose file
    /// data sits `spare` bytes past the load commands, and the given dylib
    /// load commands.
    fn build_macho(dylibs: &[&str], spare: usize) -> Vec<u8> {
        let mut commands = Vec::new();
        for name in dylibs {
            commands.extend_from_slice(&dylib_command(LC_LOAD_DYLIB, name));
        }

        let sizeofcmds = commands.len() + 72;
        let fileoff = (32 + sizeofcmds + spare) as u64;
        let filesize = 16u64;

        let mut image = Vec::new();
        image.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        image.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
        image.extend_from_slice(&MH_EXECUTE.to_le_bytes());
        image.extend_from_slice(&((dylibs.len() + 1) as u32).to_le_bytes());
        image.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // flags
        image.extend_from_slice(&0u32.to_le_bytes()); // reserved

        image.extend_from_slice(&segment_command("__LINKEDIT", fileoff, filesize));
        image.extend_from_slice(&commands);
        image.resize(fileoff as usize, 0);
        image.extend_from_slice(&[0xaa; 16]);
        image
    }

    fn write_macho(dir: &TempDir, dylibs: &[&str], spare: usize) -> std::path::PathBuf {
        let path = dir.path().join("binary");
        fs::write(&path, build_macho(dylibs, spare)).unwrap();
        path
    }

    /// Reads dylib names back via goblin, accepting thin or fat output.
    fn dylibs_on_disk(path: &Path) -> Vec<String> {
        let data = fs::read(path).unwrap();
        match Mach::parse(&data).unwrap() {
            Mach::Binary(macho) => macho.libs.iter().map(|l| l.to_string()).collect(),
            Mach::Fat(fat) => {
                let arch = fat.iter_arches().next().unwrap().unwrap();
                let slice = &data[arch.offset as usize..(arch.offset + arch.size) as usize];
                goblin::mach::MachO::parse(slice, 0)
                    .unwrap()
                    .libs
                    .iter()
                    .map(|l| l.to_string())
                    .collect()
            }
        }
    }

    #[test]
    fn parses_synthetic_image() {
        let data = build_macho(&["/usr/lib/libSystem.B.dylib"], 256);
        match Mach::parse(&data).unwrap() {
            Mach::Binary(macho) => {
                assert!(macho.libs.contains(&"/usr/lib/libSystem.B.dylib"));
            }
            Mach::Fat(_) => panic!("expected thin binary"),
        }
    }

    #[test]
    fn injects_weak_dylib() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &["/usr/lib/libSystem.B.dylib"], 256);

        add_weak_dylib(&path, "@executable_path/Frameworks/tweak.dylib").unwrap();

        let libs = dylibs_on_disk(&path);
        assert!(libs.iter().any(|l| l == "@executable_path/Frameworks/tweak.dylib"));
        assert!(libs.iter().any(|l| l == "/usr/lib/libSystem.B.dylib"));
    }

    #[test]
    fn inject_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &[], 256);

        add_weak_dylib(&path, "@rpath/Lib.dylib").unwrap();
        add_weak_dylib(&path, "@rpath/Lib.dylib").unwrap();

        let count = dylibs_on_disk(&path)
            .iter()
            .filter(|l| *l == "@rpath/Lib.dylib")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn inject_fails_without_headroom() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &[], 0);

        let err = add_weak_dylib(&path, "@rpath/Lib.dylib").unwrap_err();
        assert!(matches!(err, KpackError::MachO(_)));
    }

    #[test]
    fn rewrites_dylib_path() {
        let tmp = TempDir::new().unwrap();
        let substrate = "/Library/Frameworks/CydiaSubstrate.framework/CydiaSubstrate";
        let path = write_macho(&tmp, &[substrate], 256);

        change_dylib_path(&path, substrate, "@rpath/CydiaSubstrate.framework/CydiaSubstrate")
            .unwrap();

        let libs = dylibs_on_disk(&path);
        assert!(libs
            .iter()
            .any(|l| l == "@rpath/CydiaSubstrate.framework/CydiaSubstrate"));
        assert!(!libs.iter().any(|l| l == substrate));
    }

    #[test]
    fn rewrite_without_match_is_noop() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &["/usr/lib/libSystem.B.dylib"], 256);
        let before = fs::read(&path).unwrap();

        change_dylib_path(&path, "/nope.dylib", "/other.dylib").unwrap();
        let libs = dylibs_on_disk(&path);
        assert!(libs.iter().any(|l| l == "/usr/lib/libSystem.B.dylib"));
        let _ = before; // content may be rewritten by the universal writer
    }

    #[test]
    fn rewrite_rejects_longer_path() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &["/a.dylib"], 256);

        let long = format!("/{}.dylib", "x".repeat(64));
        assert!(matches!(
            change_dylib_path(&path, "/a.dylib", &long),
            Err(KpackError::MachO(_))
        ));
    }

    #[test]
    fn lists_dylibs_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &["/first.dylib", "/second.dylib"], 256);

        assert_eq!(
            list_dylibs(&path).unwrap(),
            vec!["/first.dylib".to_string(), "/second.dylib".to_string()]
        );
    }

    #[test]
    fn adds_rpath_once() {
        let tmp = TempDir::new().unwrap();
        let path = write_macho(&tmp, &[], 256);

        add_rpath(&path, "@executable_path/Frameworks").unwrap();
        let after_first = fs::read(&path).unwrap().len();
        add_rpath(&path, "@executable_path/Frameworks").unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), after_first);
    }
}
