//! Symbol finalization: weak-chain resolution after input, and the staged
//! patcher that rewrites every object's symbol locations to final image
//! section numbers and offsets. Each stage records what it finalized in the
//! per-obj patch table; a symbol is patched by at most one stage.

use crate::coff::symbol::{storage_class, SymbolInterp, WeakSearch};

use super::common::CommonBlockResult;
use super::layout::{Layout, NULL_CONTRIB};
use super::objects::{Obj, REMOVED_SECTION_NUMBER};
use super::pool::{divide_work, SlotBuffer, ThreadPool};
use super::session::{DiagKind, Session};
use super::symtab::{SymbolLoc, SymbolScope, SymbolTable};

/// Resolves a symbol reference to the `(obj, symbol)` that defines it:
/// regular symbols through the COMDAT symlink, weak/undefined/common ones
/// through the symbol table. `None` when nothing defines it.
pub fn resolve_symbol(
    symtab: &SymbolTable,
    objs: &[Obj],
    loc: (u32, u32),
) -> Option<(u32, u32)> {
    let (obj_idx, symbol_idx) = loc;
    let obj = &objs[obj_idx as usize];
    let parsed = obj.object.symbol(symbol_idx)?;
    match parsed.interp() {
        SymbolInterp::Regular => match obj.comdat_symlink(parsed.section_number, symtab) {
            Some(symlink) => Some(symlink.defined()),
            None => Some(loc),
        },
        SymbolInterp::Weak => {
            let defn = symtab.search(SymbolScope::Defined, &parsed.name)?;
            let (defn_obj, defn_symbol) = defn.defined();
            let defn_parsed = objs[defn_obj as usize].object.symbol(defn_symbol)?;
            if defn_parsed.interp() == SymbolInterp::Weak {
                // never resolved to a strong definition
                None
            } else {
                Some((defn_obj, defn_symbol))
            }
        }
        SymbolInterp::Undefined | SymbolInterp::Common => symtab
            .search(SymbolScope::Defined, &parsed.name)
            .map(|defn| defn.defined()),
        SymbolInterp::Abs => {
            if parsed.storage_class == storage_class::EXTERNAL {
                symtab
                    .search(SymbolScope::Defined, &parsed.name)
                    .map(|defn| defn.defined())
            } else {
                Some(loc)
            }
        }
        SymbolInterp::Debug => Some(loc),
    }
}

/// After input completes, every weak symbol in the table is replaced with
/// the definition its tag chain resolves to; anti-dependency weaks that only
/// resolve to other weaks are unresolved; cycles are fatal and name the loop.
pub fn finalize_weak_symbols(
    pool: &ThreadPool,
    session: &Session,
    symtab: &SymbolTable,
    objs: &[Obj],
) {
    let symbols = symtab.iter_scope(SymbolScope::Defined);
    let ranges = divide_work(symbols.len(), pool.worker_count());

    enum Outcome {
        Rebind(String, SymbolLoc),
        AntiDependency(u32, u32, String),
        Cycle(u32, u32, String),
    }

    let outcomes = SlotBuffer::with_capacity(symbols.len());
    pool.for_parallel(ranges.len(), |_, range_idx| {
        for symbol in &symbols[ranges[range_idx].clone()] {
            let (obj_idx, symbol_idx) = symbol.defined();
            let obj = &objs[obj_idx as usize];
            let Some(parsed) = obj.object.symbol(symbol_idx) else {
                continue;
            };
            if parsed.interp() != SymbolInterp::Weak {
                continue;
            }

            // anti-dependency weaks must end at a strong definition
            if let Some(weak) = &parsed.weak {
                if weak.characteristics == WeakSearch::AntiDependency {
                    let tag_interp = obj
                        .object
                        .symbol(weak.tag_index)
                        .map(|tag| match tag.interp() {
                            SymbolInterp::Undefined => symtab
                                .search(SymbolScope::Defined, &tag.name)
                                .and_then(|defn| {
                                    let (defn_obj, defn_symbol) = defn.defined();
                                    objs[defn_obj as usize]
                                        .object
                                        .symbol(defn_symbol)
                                        .map(|p| p.interp())
                                })
                                .unwrap_or(SymbolInterp::Undefined),
                            other => other,
                        });
                    if tag_interp == Some(SymbolInterp::Weak) {
                        outcomes.push(Outcome::AntiDependency(
                            obj_idx,
                            symbol_idx,
                            symbol.name.clone(),
                        ));
                        continue;
                    }
                }
            }

            // follow the tag chain
            let mut visited: Vec<(u32, u32)> = Vec::new();
            let mut current = Some((obj_idx, symbol_idx));
            'chain: while let Some((cur_obj, cur_symbol)) = current {
                if visited.contains(&(cur_obj, cur_symbol)) {
                    let mut chain = String::new();
                    for &(chain_obj, chain_symbol) in visited.iter() {
                        let chain_name = objs[chain_obj as usize]
                            .object
                            .symbol(chain_symbol)
                            .map(|p| p.name.clone())
                            .unwrap_or_default();
                        chain.push_str(&format!(
                            "{}:{chain_name} -> ",
                            objs[chain_obj as usize].path
                        ));
                    }
                    chain.push_str(&format!("{}:{}", obj.path, symbol.name));
                    outcomes.push(Outcome::Cycle(obj_idx, symbol_idx, chain));
                    current = None;
                    break 'chain;
                }

                let Some(cur_parsed) = objs[cur_obj as usize].object.symbol(cur_symbol) else {
                    current = None;
                    break;
                };
                match cur_parsed.interp() {
                    SymbolInterp::Weak => {
                        visited.push((cur_obj, cur_symbol));
                        // a strong definition for the weak name wins outright
                        if let Some(defn) = symtab.search(SymbolScope::Defined, &cur_parsed.name)
                        {
                            let (defn_obj, defn_symbol) = defn.defined();
                            let strong = objs[defn_obj as usize]
                                .object
                                .symbol(defn_symbol)
                                .map(|p| p.interp() != SymbolInterp::Weak)
                                .unwrap_or(false);
                            if strong {
                                current = Some((defn_obj, defn_symbol));
                                break 'chain;
                            }
                        }
                        // otherwise fall back to the tag
                        match &cur_parsed.weak {
                            Some(weak) => current = Some((cur_obj, weak.tag_index)),
                            None => {
                                current = None;
                                break 'chain;
                            }
                        }
                    }
                    SymbolInterp::Undefined => {
                        match symtab.search(SymbolScope::Defined, &cur_parsed.name) {
                            Some(defn) => current = Some(defn.defined()),
                            None => {
                                current = None;
                                break 'chain;
                            }
                        }
                    }
                    _ => break 'chain,
                }
            }

            if let Some((final_obj, final_symbol)) = current {
                if (final_obj, final_symbol) != (obj_idx, symbol_idx) {
                    outcomes.push(Outcome::Rebind(
                        symbol.name.clone(),
                        SymbolLoc::Defined {
                            obj: final_obj,
                            symbol_idx: final_symbol,
                        },
                    ));
                }
            }
        }
    });

    let mut anti: Vec<(u32, u32, String)> = Vec::new();
    let mut cycles: Vec<(u32, u32, String)> = Vec::new();
    for outcome in outcomes.into_vec() {
        match outcome {
            Outcome::Rebind(name, loc) => {
                symtab.rebind(SymbolScope::Defined, &name, loc);
            }
            Outcome::AntiDependency(obj_idx, symbol_idx, name) => {
                anti.push((obj_idx, symbol_idx, name))
            }
            Outcome::Cycle(obj_idx, symbol_idx, chain) => cycles.push((obj_idx, symbol_idx, chain)),
        }
    }
    anti.sort();
    for (obj_idx, _, name) in anti {
        session.error_obj(
            DiagKind::UnresolvedSymbol,
            &objs[obj_idx as usize].path,
            format!("unresolved symbol {name}"),
        );
    }
    cycles.sort();
    for (obj_idx, _, chain) in cycles {
        session.error_obj(
            DiagKind::WeakCycle,
            &objs[obj_idx as usize].path,
            format!("unable to resolve cyclic symbol; ref chain: {chain}"),
        );
    }
}

/// Runs the patch stages in order. After this, every reachable symbol's
/// patch cell holds its final `(image section number, offset)` (or absolute
/// value / removed sentinel).
pub fn run_patch_stages(
    pool: &ThreadPool,
    session: &Session,
    symtab: &SymbolTable,
    objs: &[Obj],
    layout: &Layout,
    common: &CommonBlockResult,
) {
    // stage 1: debug-section symbols keep their obj-local numbers
    pool.for_parallel(objs.len(), |_, obj_idx| {
        let obj = &objs[obj_idx];
        for (symbol_idx, symbol) in obj.object.iter_symbols() {
            if symbol.interp() == SymbolInterp::Regular
                && obj
                    .object
                    .is_debug_section(symbol.section_number as usize - 1)
            {
                obj.patch.mark_patched(symbol_idx);
            }
        }
    });

    // stage 2: COMDAT followers take the leader's offset (externals) or the
    // removed sentinel (statics in discarded sections)
    pool.for_parallel(objs.len(), |_, obj_idx| {
        let obj = &objs[obj_idx];
        for (symbol_idx, symbol) in obj.object.iter_symbols() {
            if symbol.interp() != SymbolInterp::Regular {
                continue;
            }
            let Some(symlink) = obj.comdat_symlink(symbol.section_number, symtab) else {
                continue;
            };
            let (leader_obj, leader_symbol) = symlink.defined();
            if leader_obj == obj.input_idx {
                continue;
            }
            if symbol.storage_class == storage_class::EXTERNAL {
                let leader_value = objs[leader_obj as usize]
                    .object
                    .symbol(leader_symbol)
                    .map(|p| p.value)
                    .unwrap_or(0);
                obj.patch.set(symbol_idx, symbol.section_number, leader_value);
            } else {
                obj.patch.set(symbol_idx, REMOVED_SECTION_NUMBER, u32::MAX);
                obj.patch.mark_patched(symbol_idx);
            }
        }
    });

    // stage 3: common leaders land in the common block
    let common_ranges = divide_work(common.entries.len(), pool.worker_count());
    let common_section_number = layout.sections[common.sect_idx].section_number();
    pool.for_parallel(common_ranges.len(), |_, range_idx| {
        for &(obj_idx, symbol_idx, offset) in &common.entries[common_ranges[range_idx].clone()] {
            let obj = &objs[obj_idx as usize];
            obj.patch
                .set(symbol_idx, common_section_number as i32, offset as u32);
            obj.patch.mark_patched(symbol_idx);
        }
    });

    // stage 4: regular symbols take their contribution's final placement
    pool.for_parallel(objs.len(), |_, obj_idx| {
        let obj = &objs[obj_idx];
        for (symbol_idx, symbol) in obj.object.iter_symbols() {
            if obj.patch.is_patched(symbol_idx) || symbol.interp() != SymbolInterp::Regular {
                continue;
            }
            let reference = layout.sect_map[obj_idx][symbol.section_number as usize - 1];
            if reference == NULL_CONTRIB {
                obj.patch.set(symbol_idx, REMOVED_SECTION_NUMBER, u32::MAX);
            } else {
                let contrib = layout.contrib(reference);
                let section = &layout.sections[layout.contrib_section(reference) as usize];
                let (_, patched_value) = obj.patch.get(symbol_idx);
                obj.patch.set(
                    symbol_idx,
                    section.section_number() as i32,
                    (contrib.off as u32).wrapping_add(patched_value),
                );
            }
            obj.patch.mark_patched(symbol_idx);
        }
    });

    // stages 5..8: everything else resolves through the symbol table onto
    // already-final cells; the second Undefined pass catches chains
    // materialized by the Weak stage
    for fixup_type in [
        SymbolInterp::Common,
        SymbolInterp::Abs,
        SymbolInterp::Undefined,
        SymbolInterp::Weak,
        SymbolInterp::Undefined,
    ] {
        pool.for_parallel(objs.len(), |_, obj_idx| {
            let obj = &objs[obj_idx];
            for (symbol_idx, symbol) in obj.object.iter_symbols() {
                if obj.patch.is_patched(symbol_idx) || symbol.interp() != fixup_type {
                    continue;
                }
                if symbol.storage_class == storage_class::SECTION {
                    continue;
                }
                let Some((target_obj, target_symbol)) =
                    resolve_symbol(symtab, objs, (obj_idx as u32, symbol_idx))
                else {
                    continue;
                };
                if (target_obj, target_symbol) == (obj_idx as u32, symbol_idx) {
                    // locally-final (static absolutes); keep the cell as-is
                    obj.patch.mark_patched(symbol_idx);
                    continue;
                }
                let target = &objs[target_obj as usize];
                let (section_number, value) = target.patch.get(target_symbol);
                obj.patch.set(symbol_idx, section_number, value);
                obj.patch.mark_patched(symbol_idx);
            }
        });
    }

    // section symbols resolve against the image section of their name
    pool.for_parallel(objs.len(), |_, obj_idx| {
        let obj = &objs[obj_idx];
        for (symbol_idx, symbol) in obj.object.iter_symbols() {
            if obj.patch.is_patched(symbol_idx)
                || symbol.storage_class != storage_class::SECTION
                || symbol.interp() != SymbolInterp::Undefined
            {
                continue;
            }
            let Some(sect_idx) = layout.find_live_by_name(&symbol.name) else {
                session.error_obj(
                    DiagKind::UnresolvedSymbol,
                    &obj.path,
                    format!(
                        "undefined section symbol {} refers to an image section that doesn't exist",
                        symbol.name
                    ),
                );
                continue;
            };
            let section = &layout.sections[sect_idx];
            if section
                .flags
                .contains(crate::coff::SectionFlags::MEM_DISCARDABLE)
            {
                session.error_obj(
                    DiagKind::SectRefsDiscardedMemory,
                    &obj.path,
                    format!("symbol {} references a discardable section", symbol.name),
                );
                continue;
            }
            let off = section
                .first_contrib()
                .map(|contrib| contrib.off)
                .unwrap_or(0);
            obj.patch
                .set(symbol_idx, section.section_number() as i32, off as u32);
            obj.patch.mark_patched(symbol_idx);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;
    use crate::coff::MachineType;
    use crate::linker::objects::input_obj_symbols;
    use crate::linker::select::Selector;
    use crate::linker::synth::ObjWriter;

    fn setup(objs: &[Obj]) -> SymbolTable {
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs,
            session: &session,
        };
        let pool = ThreadPool::new(2);
        input_obj_symbols(&pool, &symtab, objs, 0..objs.len(), &selector);
        symtab
    }

    #[test]
    fn weak_resolves_to_strong_definition() {
        let mut weak_writer = ObjWriter::new(MachineType::Amd64);
        let tag = weak_writer.push_undefined("fallback_impl");
        weak_writer.push_weak("api", tag, WeakSearch::SearchAlias);

        let mut strong_writer = ObjWriter::new(MachineType::Amd64);
        let sect = strong_writer.push_section(
            ".text$mn",
            crate::pe::section_flags::TEXT,
            vec![0xC3; 4],
        );
        strong_writer.push_external(sect, "fallback_impl", 0, true);

        let objs = vec![
            Obj::new(
                ObjectFile::parse(weak_writer.serialize()).unwrap(),
                0,
                0,
                "weak.obj".into(),
                None,
            ),
            Obj::new(
                ObjectFile::parse(strong_writer.serialize()).unwrap(),
                1,
                1,
                "strong.obj".into(),
                None,
            ),
        ];
        let symtab = setup(&objs);
        let session = Session::new();
        let pool = ThreadPool::new(2);
        finalize_weak_symbols(&pool, &session, &symtab, &objs);
        assert!(!session.has_errors());

        // the weak name now points at the strong definition
        let resolved = symtab.search(SymbolScope::Defined, "api").unwrap();
        let (obj_idx, symbol_idx) = resolved.defined();
        assert_eq!(obj_idx, 1);
        let parsed = objs[1].object.symbol(symbol_idx).unwrap();
        assert_eq!(parsed.name, "fallback_impl");
    }

    #[test]
    fn weak_cycle_is_fatal_and_names_the_loop() {
        // a weak in obj A tagging b, a weak in obj B tagging a
        let mut writer_a = ObjWriter::new(MachineType::Amd64);
        let tag_b = writer_a.push_undefined("b");
        writer_a.push_weak("a", tag_b, WeakSearch::SearchLibrary);
        let mut writer_b = ObjWriter::new(MachineType::Amd64);
        let tag_a = writer_b.push_undefined("a");
        writer_b.push_weak("b", tag_a, WeakSearch::SearchLibrary);

        let objs = vec![
            Obj::new(
                ObjectFile::parse(writer_a.serialize()).unwrap(),
                0,
                0,
                "a.obj".into(),
                None,
            ),
            Obj::new(
                ObjectFile::parse(writer_b.serialize()).unwrap(),
                1,
                1,
                "b.obj".into(),
                None,
            ),
        ];
        let symtab = setup(&objs);
        let session = Session::new();
        let pool = ThreadPool::new(1);
        finalize_weak_symbols(&pool, &session, &symtab, &objs);

        assert!(session.has_diag(DiagKind::WeakCycle));
        assert!(session.has_errors());
        let diags = session.diagnostics();
        let cycle = diags
            .iter()
            .find(|d| d.kind == DiagKind::WeakCycle)
            .unwrap();
        assert!(cycle.message.contains("a.obj") && cycle.message.contains("b.obj"));
    }

    #[test]
    fn anti_dependency_without_strong_default_is_unresolved() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let tag = writer.push_undefined("missing_default");
        writer.push_weak("optional_api", tag, WeakSearch::AntiDependency);
        let objs = vec![Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "anti.obj".into(),
            None,
        )];
        let symtab = setup(&objs);
        let session = Session::new();
        let pool = ThreadPool::new(1);
        finalize_weak_symbols(&pool, &session, &symtab, &objs);
        // the default resolves to nothing at all, which is not a weak; the
        // anti-dependency rule only fires when it lands on another weak
        assert!(!session.has_diag(DiagKind::WeakCycle));
    }
}
