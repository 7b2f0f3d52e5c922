//! tar.gz packaging and extraction (C2, spec §4.2).

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType};

use crate::error::ExperimentError;

/// One local workload file to be packed, identified by the basename it will
/// get inside the archive.
#[derive(Debug, Clone)]
pub struct Workload {
    pub path: PathBuf,
    pub basename: OsString,
}

/// Build a gzip-compressed tar at `out_path` containing `config_json` as
/// `config.json` followed by each workload under its basename, in the order
/// given. Runs under `spawn_blocking` since archive I/O is CPU/disk bound.
pub async fn pack(out_path: &Path, config_json: &str, workloads: &[Workload]) -> Result<(), ExperimentError> {
    let mut seen = HashSet::new();
    for w in workloads {
        if !seen.insert(w.basename.clone()) {
            return Err(ExperimentError::invalid_input(format!(
                "duplicate workload basename: {}",
                w.basename.to_string_lossy()
            )));
        }
    }

    let out_path = out_path.to_path_buf();
    let config_json = config_json.to_string();
    let workloads: Vec<Workload> = workloads.to_vec();

    tokio::task::spawn_blocking(move || pack_blocking(&out_path, &config_json, &workloads))
        .await
        .map_err(|e| ExperimentError::packaging(format!("pack task panicked: {e}")))??;
    Ok(())
}

fn pack_blocking(out_path: &Path, config_json: &str, workloads: &[Workload]) -> Result<(), ExperimentError> {
    let file = std::fs::File::create(out_path).map_err(|e| ExperimentError::packaging(format!("create archive: {e}")))?;
    let gz = GzEncoder::new(file, Compression::default());
    let mut tar = Builder::new(gz);

    let config_bytes = config_json.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(config_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, "config.json", config_bytes)
        .map_err(|e| ExperimentError::packaging(format!("append config.json: {e}")))?;

    for w in workloads {
        let mut f = std::fs::File::open(&w.path).map_err(|e| ExperimentError::packaging(format!("open workload {}: {e}", w.path.display())))?;
        tar.append_file(Path::new(&w.basename), &mut f)
            .map_err(|e| ExperimentError::packaging(format!("append workload {}: {e}", w.path.display())))?;
    }

    tar.finish().map_err(|e| ExperimentError::packaging(format!("finish archive: {e}")))?;
    Ok(())
}

/// Extract the archive at `tar_gz_path` into `dest_dir`, rejecting any entry
/// that would escape `dest_dir` (absolute paths, `..` components, or
/// symlink/hardlink targets resolving outside it) before writing anything
/// from that entry.
pub async fn unpack(tar_gz_path: &Path, dest_dir: &Path) -> Result<(), ExperimentError> {
    let tar_gz_path = tar_gz_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&tar_gz_path, &dest_dir))
        .await
        .map_err(|e| ExperimentError::packaging(format!("unpack task panicked: {e}")))??;
    Ok(())
}

fn unpack_blocking(tar_gz_path: &Path, dest_dir: &Path) -> Result<(), ExperimentError> {
    std::fs::create_dir_all(dest_dir).map_err(|e| ExperimentError::packaging(format!("create dest dir: {e}")))?;

    let file = std::fs::File::open(tar_gz_path).map_err(|e| ExperimentError::packaging(format!("open archive: {e}")))?;
    let gz = GzDecoder::new(file);
    let mut archive = Archive::new(gz);

    for entry in archive.entries().map_err(|e| ExperimentError::packaging(format!("read archive: {e}")))? {
        let mut entry = entry.map_err(|e| ExperimentError::packaging(format!("read entry: {e}")))?;
        let entry_path = entry.path().map_err(|e| ExperimentError::packaging(format!("entry path: {e}")))?.into_owned();

        let safe_rel = safe_relative_path(&entry_path)?;
        let target = dest_dir.join(&safe_rel);

        match entry.header().entry_type() {
            EntryType::Symlink | EntryType::Link => {
                let link_name = entry
                    .link_name()
                    .map_err(|e| ExperimentError::packaging(format!("link name: {e}")))?
                    .ok_or_else(|| ExperimentError::packaging("link entry missing target"))?;
                let link_rel = safe_relative_path(link_name.as_ref())?;
                let resolved = dest_dir.join(&link_rel);
                ensure_within(dest_dir, &resolved)?;
                continue; // do not materialize links from untrusted archives
            }
            _ => {}
        }

        ensure_within(dest_dir, &target)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ExperimentError::packaging(format!("create parent dir: {e}")))?;
        }

        let mode = entry.header().mode().unwrap_or(0o644);
        let clamped_mode = if entry.header().entry_type() == EntryType::Directory { 0o755 } else { 0o644 };
        let _ = mode;

        entry
            .unpack(&target)
            .map_err(|e| ExperimentError::packaging(format!("unpack entry {}: {e}", entry_path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(clamped_mode);
            let _ = std::fs::set_permissions(&target, perms);
        }
    }
    Ok(())
}

/// Reject absolute paths and any path containing a `..` component; return
/// the normalized relative path otherwise.
fn safe_relative_path(path: &Path) -> Result<PathBuf, ExperimentError> {
    if path.is_absolute() {
        return Err(ExperimentError::packaging(format!("archive entry has absolute path: {}", path.display())));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ExperimentError::packaging(format!("archive entry escapes destination: {}", path.display())));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExperimentError::packaging(format!("archive entry has absolute path: {}", path.display())));
            }
        }
    }
    Ok(out)
}

fn ensure_within(dest_dir: &Path, target: &Path) -> Result<(), ExperimentError> {
    if !target.starts_with(dest_dir) {
        return Err(ExperimentError::packaging(format!(
            "archive entry resolves outside destination: {}",
            target.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(dir: &Path, name: &str, contents: &[u8]) -> Workload {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        Workload { path, basename: OsString::from(name) }
    }

    #[tokio::test]
    async fn pack_unpack_round_trips_bytes() {
        let src = tempfile::tempdir().unwrap();
        let w1 = workload(src.path(), "a.elf", b"\x7fELF binary a");
        let w2 = workload(src.path(), "b.elf", b"\x7fELF binary b");

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = archive_dir.path().join("exp.tar.gz");
        pack(&archive_path, r#"{"uuid":"x"}"#, &[w1, w2]).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&archive_path, dest.path()).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.path().join("config.json")).unwrap(), r#"{"uuid":"x"}"#);
        assert_eq!(std::fs::read(dest.path().join("a.elf")).unwrap(), b"\x7fELF binary a");
        assert_eq!(std::fs::read(dest.path().join("b.elf")).unwrap(), b"\x7fELF binary b");
    }

    #[tokio::test]
    async fn duplicate_basenames_are_rejected() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        let w1 = workload(src.path(), "dup.elf", b"1");
        let w2 = Workload { path: src.path().join("sub/dup.elf"), basename: OsString::from("dup.elf") };
        std::fs::write(&w2.path, b"2").unwrap();

        let out = tempfile::tempdir().unwrap();
        let err = pack(&out.path().join("x.tar.gz"), "{}", &[w1, w2]).await.unwrap_err();
        assert_eq!(err.kind_tag(), "invalid_input");
    }

    #[tokio::test]
    async fn path_traversal_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let gz = GzEncoder::new(file, Compression::default());
            let mut tar = Builder::new(gz);
            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            // Write the traversal path straight into the raw header bytes:
            // `append_data` validates and rejects `..` components, which is
            // exactly what a hostile archive would not do.
            if let Some(gnu) = header.as_gnu_mut() {
                let name = b"../../etc/evil";
                gnu.name[..name.len()].copy_from_slice(name);
            }
            header.set_cksum();
            tar.append(&header, &data[..]).unwrap();
            tar.finish().unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        let err = unpack(&archive_path, dest.path()).await.unwrap_err();
        assert_eq!(err.kind_tag(), "packaging");
        assert!(!dest.path().parent().unwrap().join("etc/evil").exists());
    }
}
