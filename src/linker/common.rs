//! The common-block allocator: packs every symbol with a Common
//! interpretation into `.bss`, largest first, each aligned to
//! `min(32, next_pow2(size))`, and appends one aggregate contribution
//! covering the packed bytes.

use crate::coff::symbol::SymbolInterp;

use super::layout::{align_up, ContribChunk, ContribData, Layout, SectionContrib};
use super::objects::Obj;
use super::pool::{divide_work, SlotBuffer, ThreadPool};
use super::symtab::{SymbolScope, SymbolTable};

pub struct CommonBlockResult {
    /// Index of the image section the block landed in (`.bss`).
    pub sect_idx: usize,
    /// `(obj, symbol_idx, assigned offset)` per common leader.
    pub entries: Vec<(u32, u32, u64)>,
}

/// Collects, sorts and packs the common symbols into `layout`'s `.bss`.
/// The section must be finalized before the call; the appended aggregate
/// contribution is accounted on the next finalization pass.
pub fn build_common_block(
    pool: &ThreadPool,
    symtab: &SymbolTable,
    objs: &[Obj],
    layout: &mut Layout,
    bss_sect_idx: usize,
) -> CommonBlockResult {
    // two-phase gather: count per worker range, then fill the dense array
    let symbols = symtab.iter_scope(SymbolScope::Defined);
    let ranges = divide_work(symbols.len(), pool.worker_count());
    let per_worker = SlotBuffer::with_capacity(ranges.len());
    pool.for_parallel(ranges.len(), |_, range_idx| {
        let mut found: Vec<(u32, u32, u32)> = Vec::new();
        for symbol in &symbols[ranges[range_idx].clone()] {
            let (obj_idx, symbol_idx) = symbol.defined();
            let obj = &objs[obj_idx as usize];
            let Some(parsed) = obj.object.symbol(symbol_idx) else {
                continue;
            };
            if parsed.interp() == SymbolInterp::Common {
                found.push((obj_idx, symbol_idx, parsed.value));
            }
        }
        per_worker.push((range_idx, found));
    });
    let mut per_worker = per_worker.into_vec();
    per_worker.sort_unstable_by_key(|(range_idx, _)| *range_idx);
    let mut contribs: Vec<(u32, u32, u32)> = per_worker
        .into_iter()
        .flat_map(|(_, found)| found)
        .collect();

    // descending size, ties by input order, for tight packing; weak symbols
    // rebound onto a common leader alias the same record, so drop duplicates
    contribs.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| (a.0, a.1).cmp(&(b.0, b.1))));
    contribs.dedup();

    let base = layout.sections[bss_sect_idx].vsize;
    let mut cursor = base;
    let mut entries = Vec::with_capacity(contribs.len());
    for (obj_idx, symbol_idx, size) in contribs {
        // link.exe caps common alignment at 32 bytes
        let align = u64::from(size.max(1).next_power_of_two().min(32));
        cursor = align_up(cursor, align);
        entries.push((obj_idx, symbol_idx, cursor));
        cursor += size as u64;
    }

    if cursor > base {
        layout.sections[bss_sect_idx].chunks.push(ContribChunk {
            sort_key: "~".into(), // packs after every named group
            contribs: vec![SectionContrib {
                obj_idx: u32::MAX,
                obj_sect_idx: u32::MAX,
                align: 1,
                hotpatch: false,
                data: ContribData::Zero { size: cursor - base },
                off: base,
            }],
            order: vec![0],
        });
    }

    CommonBlockResult {
        sect_idx: bss_sect_idx,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;
    use crate::coff::MachineType;
    use crate::linker::config::Config;
    use crate::linker::objects::input_obj_symbols;
    use crate::linker::select::Selector;
    use crate::linker::session::Session;
    use crate::linker::synth::ObjWriter;

    #[test]
    fn commons_pack_descending_with_capped_alignment() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        writer.push_common("small", 4);
        writer.push_common("large", 100);
        writer.push_common("medium", 24);
        let objs = vec![Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "commons.obj".into(),
            None,
        )];

        let symtab = SymbolTable::new();
        let session = Session::new();
        let pool = ThreadPool::new(2);
        let selector = Selector {
            objs: &objs,
            session: &session,
        };
        input_obj_symbols(&pool, &symtab, &objs, 0..1, &selector);

        let config = Config::default();
        let mut layout = crate::linker::layout::gather(&pool, &session, &config, &objs, &symtab);
        let bss_idx = layout.find_section(".bss", crate::pe::section_flags::BSS).unwrap();
        layout.finalize_section(bss_idx, &config);

        let common = build_common_block(&pool, &symtab, &objs, &mut layout, bss_idx);
        assert_eq!(common.entries.len(), 3);

        // largest first at the (empty) section base
        let by_name = |name: &str| {
            let symbol = symtab.search(SymbolScope::Defined, name).unwrap();
            let (obj, idx) = symbol.defined();
            common
                .entries
                .iter()
                .find(|(o, i, _)| (*o, *i) == (obj, idx))
                .unwrap()
                .2
        };
        let large = by_name("large");
        let medium = by_name("medium");
        let small = by_name("small");
        assert_eq!(large, 0);
        // 100 rounds to the 32-byte cap, next slot is 128
        assert_eq!(medium, 128);
        assert_eq!(medium % 32, 0);
        assert_eq!(small, medium + 24);

        // the aggregate contribution covers the packed bytes
        layout.finalize_section(bss_idx, &config);
        assert_eq!(layout.sections[bss_idx].vsize, small + 4);
    }
}
