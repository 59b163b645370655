//! Tar archive helpers.
//!
//! Two jobs: packing a build-context directory into an in-memory archive
//! for engine builds, and pulling single entries (the `networks` file)
//! out of task archives uploaded by the coordinator.

use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::{Error, Result};

/// File mode for regular entries in packed contexts.
const FILE_MODE: u32 = 0o644;

/// File mode for directory entries in packed contexts.
const DIR_MODE: u32 = 0o755;

/// Pack `context` into an uncompressed tar archive held in memory.
///
/// Entries use paths relative to `context` and fixed modes (0644 files,
/// 0755 directories), so image builds do not depend on host permissions.
pub fn pack_dir(context: &Path) -> Result<Vec<u8>> {
    if !context.is_dir() {
        return Err(Error::NotADirectory(context.to_path_buf()));
    }
    let mut builder = tar::Builder::new(Vec::new());
    append_dir_entries(&mut builder, context, context)?;
    builder
        .into_inner()
        .map_err(|e| Error::Archive(format!("finalize failed: {}", e)))
}

fn append_dir_entries(
    builder: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    dir: &Path,
) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::Archive(format!("{}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::Archive(format!("{}: {}", dir.display(), e)))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|e| Error::Archive(format!("{}: {}", path.display(), e)))?;
        let metadata = entry
            .metadata()
            .map_err(|e| Error::Archive(format!("{}: {}", path.display(), e)))?;
        if metadata.is_dir() {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(DIR_MODE);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(|e| Error::Archive(format!("{}: {}", rel.display(), e)))?;
            append_dir_entries(builder, root, &path)?;
        } else if metadata.is_file() {
            let data = std::fs::read(&path)
                .map_err(|e| Error::Archive(format!("{}: {}", path.display(), e)))?;
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(FILE_MODE);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, rel, Cursor::new(data))
                .map_err(|e| Error::Archive(format!("{}: {}", rel.display(), e)))?;
        }
        // Symlinks and special files are skipped; build contexts are
        // plain trees by contract.
    }
    Ok(())
}

/// Extract the contents of a regular-file entry named `name` at the
/// archive root, or `None` when no such file exists.
///
/// Directory entries with the name do not count. Entry paths are
/// normalized, so `networks` and `./networks` both match.
pub fn read_entry(archive: &[u8], name: &str) -> Result<Option<Vec<u8>>> {
    let mut ar = tar::Archive::new(Cursor::new(archive));
    let entries = ar
        .entries()
        .map_err(|e| Error::Archive(format!("read failed: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Archive(format!("entry failed: {}", e)))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::Archive(format!("entry path failed: {}", e)))?;
        let matches = path
            .strip_prefix(".")
            .unwrap_or(&path)
            .as_os_str()
            == name;
        if matches {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::Archive(format!("entry read failed: {}", e)))?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents) in entries {
            let mut header = tar::Header::new_ustar();
            match contents {
                Some(data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(0o644);
                    header.set_size(data.len() as u64);
                    header.set_cksum();
                    builder.append_data(&mut header, name, Cursor::new(data)).unwrap();
                }
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_read_entry_at_root() {
        let archive = build_archive(&[
            ("Dockerfile", Some(b"FROM scratch")),
            ("networks", Some(b"net_a net_b")),
        ]);
        let networks = read_entry(&archive, "networks").unwrap().unwrap();
        assert_eq!(networks, b"net_a net_b");
        assert!(read_entry(&archive, "absent").unwrap().is_none());
    }

    #[test]
    fn test_read_entry_ignores_directories() {
        let archive = build_archive(&[("networks", None)]);
        assert!(read_entry(&archive, "networks").unwrap().is_none());
    }

    #[test]
    fn test_read_entry_normalizes_dot_prefix() {
        let archive = build_archive(&[("./networks", Some(b"net_a"))]);
        assert_eq!(
            read_entry(&archive, "networks").unwrap().unwrap(),
            b"net_a"
        );
    }

    #[test]
    fn test_pack_dir_roundtrip() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), b"FROM scratch").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/data.txt"), b"payload").unwrap();

        let packed = pack_dir(dir.path()).unwrap();
        assert_eq!(
            read_entry(&packed, "Dockerfile").unwrap().unwrap(),
            b"FROM scratch"
        );
        assert_eq!(
            read_entry(&packed, "sub/data.txt").unwrap().unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_pack_dir_rejects_non_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            pack_dir(&file),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_pack_dir_uses_fixed_modes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let packed = pack_dir(dir.path()).unwrap();

        let mut ar = tar::Archive::new(Cursor::new(packed));
        let entry = ar.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap(), 0o644);
    }
}
