//! Base relocation emission: scan every object's relocations for absolute
//! address sites (`ADDR32`/`ADDR64` against non-absolute targets), bucket
//! them by page, and serialize the `.reloc` block stream.

use indexmap::IndexMap;

use crate::coff::reloc::x64;
use crate::coff::MachineType;
use crate::pe::baserel::{kind, make_entry, write_block};

use super::objects::{Obj, PatchedLoc, patched_loc};
use super::pool::{divide_work, SlotBuffer, ThreadPool};
use super::session::{DiagKind, Session};

#[derive(Default)]
struct Page {
    entries_addr32: Vec<u64>,
    entries_addr64: Vec<u64>,
}

/// Builds the serialized `.reloc` contents. Empty when no fixup sites exist.
pub fn build_base_relocs(
    pool: &ThreadPool,
    session: &Session,
    objs: &[Obj],
    machine: MachineType,
    is_large_addr_aware: bool,
) -> Vec<u8> {
    let page_size = machine.page_size();
    let ranges = divide_work(objs.len(), pool.worker_count());

    let worker_pages = SlotBuffer::with_capacity(ranges.len());
    pool.for_parallel(ranges.len(), |_, range_idx| {
        let mut pages: IndexMap<u64, Page> = IndexMap::new();
        for obj in &objs[ranges[range_idx].clone()] {
            emit_obj_base_relocs(session, obj, page_size, is_large_addr_aware, &mut pages);
        }
        worker_pages.push((range_idx, pages));
    });

    // merge worker maps in range order (ranges are ascending object index,
    // so the result is input-ordered and deterministic)
    let mut worker_pages = worker_pages.into_vec();
    worker_pages.sort_unstable_by_key(|(range_idx, _)| *range_idx);
    let mut pages: IndexMap<u64, Page> = IndexMap::new();
    for (_, worker_map) in worker_pages {
        for (page_voff, page) in worker_map {
            let merged = pages.entry(page_voff).or_default();
            merged.entries_addr32.extend(page.entries_addr32);
            merged.entries_addr64.extend(page.entries_addr64);
        }
    }

    pages.sort_unstable_keys();

    let mut out = Vec::new();
    let mut seen: Vec<u64> = Vec::new();
    for (&page_voff, page) in pages.iter() {
        seen.clear();
        let mut entries: Vec<u16> = Vec::new();
        for &site in &page.entries_addr32 {
            if seen.contains(&site) {
                continue;
            }
            seen.push(site);
            entries.push(make_entry(kind::HIGHLOW, (site - page_voff) as u16));
        }
        for &site in &page.entries_addr64 {
            if seen.contains(&site) {
                continue;
            }
            seen.push(site);
            entries.push(make_entry(kind::DIR64, (site - page_voff) as u16));
        }
        write_block(&mut out, page_voff as u32, &entries);
    }
    out
}

fn emit_obj_base_relocs(
    session: &Session,
    obj: &Obj,
    page_size: u64,
    is_large_addr_aware: bool,
    pages: &mut IndexMap<u64, Page>,
) {
    for sect_idx in 0..obj.object.section_count() {
        if obj.is_removed(sect_idx) || obj.object.is_debug_section(sect_idx) {
            continue;
        }
        let section_voff = obj.object.sections[sect_idx].virtual_address as u64;
        for reloc in &obj.object.relocs[sect_idx] {
            let (is_addr32, is_addr64) = match obj.object.machine {
                MachineType::Amd64 => (reloc.kind == x64::ADDR32, reloc.kind == x64::ADDR64),
                _ => continue,
            };
            if !is_addr32 && !is_addr64 {
                continue;
            }

            // absolute targets need no fixup when the image moves
            if matches!(
                patched_loc(obj, reloc.symbol_index),
                Some(PatchedLoc::Abs { .. })
            ) {
                continue;
            }

            let reloc_voff = section_voff + reloc.apply_off as u64;
            let page_voff = reloc_voff & !(page_size - 1);
            let page = pages.entry(page_voff).or_default();

            if is_addr32 {
                if is_large_addr_aware {
                    let symbol_name = obj
                        .object
                        .symbol(reloc.symbol_index)
                        .map(|symbol| symbol.name.clone())
                        .unwrap_or_default();
                    session.error_obj(
                        DiagKind::LargeAddressAwareRequired,
                        &obj.path,
                        format!(
                            "found out of range ADDR32 relocation for '{symbol_name}', link with /LARGEADDRESSAWARE:NO"
                        ),
                    );
                } else {
                    page.entries_addr32.push(reloc_voff);
                }
            } else {
                page.entries_addr64.push(reloc_voff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;
    use crate::coff::SectionFlags;
    use crate::linker::synth::ObjWriter;
    use crate::pe::section_flags;

    /// One ADDR64 site at VOFF 0x2010: a single DIR64 block for page 0x2000
    /// with the entry at offset 0x10 and a 12-byte block (header + entry +
    /// pad).
    #[test]
    fn single_addr64_site() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let data_sect = writer.push_section(".data", section_flags::DATA, vec![0u8; 0x20]);
        let text_sect = writer.push_section(
            ".text$mn",
            section_flags::TEXT | SectionFlags::from_align(16),
            vec![0x90; 4],
        );
        let target = writer.push_external(text_sect, "target", 0, true);
        writer.push_reloc(data_sect, 0x10, target, x64::ADDR64);

        let mut obj = Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "a.obj".into(),
            None,
        );
        // pretend layout placed .data at 0x2000 and patched the target
        obj.object.sections[0].virtual_address = 0x2000;
        obj.patch.set(target, 2, 0);
        obj.patch.mark_patched(target);

        let session = Session::new();
        let pool = ThreadPool::new(1);
        let objs = [obj];
        let data = build_base_relocs(&pool, &session, &objs, MachineType::Amd64, false);

        assert_eq!(data.len(), 12);
        assert_eq!(&data[0..4], &0x2000u32.to_le_bytes());
        assert_eq!(&data[4..8], &12u32.to_le_bytes());
        let entry = u16::from_le_bytes(data[8..10].try_into().unwrap());
        assert_eq!(entry, make_entry(kind::DIR64, 0x10));
        assert!(!session.has_errors());
    }

    #[test]
    fn absolute_targets_and_duplicates_are_skipped() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let data_sect = writer.push_section(".data", section_flags::DATA, vec![0u8; 0x20]);
        let abs = writer.push_absolute("abs_const", 7);
        let target = writer.push_undefined("target");
        writer.push_reloc(data_sect, 0x8, abs, x64::ADDR64);
        writer.push_reloc(data_sect, 0x10, target, x64::ADDR64);
        writer.push_reloc(data_sect, 0x10, target, x64::ADDR64);

        let obj = Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "b.obj".into(),
            None,
        );
        obj.patch.mark_patched(abs);
        obj.patch.set(target, 1, 0);
        obj.patch.mark_patched(target);

        let session = Session::new();
        let pool = ThreadPool::new(1);
        let objs = [obj];
        let data = build_base_relocs(&pool, &session, &objs, MachineType::Amd64, false);
        // one page block with exactly one surviving entry
        assert_eq!(&data[4..8], &12u32.to_le_bytes());
        let entry = u16::from_le_bytes(data[8..10].try_into().unwrap());
        assert_eq!(entry, make_entry(kind::DIR64, 0x10));
    }

    #[test]
    fn addr32_under_large_address_aware_is_diagnosed() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let data_sect = writer.push_section(".data", section_flags::DATA, vec![0u8; 8]);
        let target = writer.push_undefined("needs_fixup");
        writer.push_reloc(data_sect, 0, target, x64::ADDR32);

        let obj = Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "c.obj".into(),
            None,
        );
        obj.patch.set(target, 1, 0);
        obj.patch.mark_patched(target);

        let session = Session::new();
        let pool = ThreadPool::new(1);
        let objs = [obj];
        let data = build_base_relocs(&pool, &session, &objs, MachineType::Amd64, true);
        assert!(data.is_empty());
        assert!(session.has_diag(DiagKind::LargeAddressAwareRequired));

        // without LAA the site emits a HIGHLOW entry
        let session = Session::new();
        let data = build_base_relocs(&pool, &session, &objs, MachineType::Amd64, false);
        let entry = u16::from_le_bytes(data[8..10].try_into().unwrap());
        assert_eq!(entry, make_entry(kind::HIGHLOW, 0));
    }
}
