//! Best-effort DWARF source-file snapshot (C7, spec §4.7). Never fatal: any
//! parse failure is logged and yields an empty set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use tracing::warn;

/// Walk the DWARF of `elf_path` and collect the set of fully-resolved source
/// file paths that are both named in the debug info and present on the
/// local filesystem. Returns an empty set on any failure.
pub fn snapshot_source_files(elf_path: &Path) -> BTreeSet<PathBuf> {
    match try_snapshot(elf_path) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(path = %elf_path.display(), error = %e, "ELF source snapshot failed, continuing without it");
            BTreeSet::new()
        }
    }
}

fn try_snapshot(elf_path: &Path) -> Result<BTreeSet<PathBuf>, Box<dyn std::error::Error>> {
    let data = std::fs::read(elf_path)?;
    let object_file = object::File::parse(&*data)?;

    let endian = if object_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section = |id: gimli::SectionId| -> Result<Vec<u8>, gimli::Error> {
        Ok(object_file
            .section_by_name(id.name())
            .and_then(|s| s.uncompressed_data().ok())
            .map(|data| data.into_owned())
            .unwrap_or_default())
    };

    let dwarf_cow = gimli::Dwarf::load(&load_section)?;
    let dwarf = dwarf_cow.borrow(|section| EndianSlice::new(section, endian));

    let mut out = BTreeSet::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(incomplete) = unit.line_program.clone() else { continue };
        let program_header = incomplete.header().clone();

        let comp_dir = unit
            .comp_dir
            .and_then(|s| dwarf.attr_string(&unit, gimli::AttributeValue::String(s)).ok())
            .and_then(|s| s.to_string().ok().map(|s| s.to_string()));

        for file_entry in program_header.file_names() {
            let Ok(name_slice) = dwarf.attr_string(&unit, file_entry.path_name()) else { continue };
            let Ok(name) = name_slice.to_string() else { continue };

            let dir = program_header
                .directory(file_entry.directory_index())
                .and_then(|dir_attr| dwarf.attr_string(&unit, dir_attr).ok())
                .and_then(|s| s.to_string().ok().map(|s| s.to_string()));

            let mut path = PathBuf::new();
            if let Some(dir) = dir.or_else(|| comp_dir.clone()) {
                path.push(dir);
            }
            path.push(name);

            if path.exists() {
                out.insert(path);
            }
        }
    }
    Ok(out)
}
