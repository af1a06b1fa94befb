//! Unreachable-COMDAT removal (`/OPT:REF`). A worklist of relocation slices
//! walks the object-section graph from the roots; every COMDAT section not
//! reached keeps its remove flag, and debug sections follow the sections
//! they describe.

use crate::coff::reloc::Reloc;
use crate::coff::symbol::SymbolInterp;

use super::objects::Obj;
use super::patch::resolve_symbol;
use super::symtab::{SymbolScope, SymbolTable};

const RELOCS_PER_TASK: usize = 1024;

struct Task<'a> {
    obj_idx: u32,
    relocs: std::borrow::Cow<'a, [Reloc]>,
}

pub fn gc_comdats(
    symtab: &SymbolTable,
    objs: &[Obj],
    include_symbols: &[String],
    tls_symbol_name: &str,
) {
    let mut work: Vec<Task> = Vec::new();

    // roots: include symbols and the TLS anchor become synthetic one-entry
    // reloc slices
    let mut root_names: Vec<&str> = include_symbols.iter().map(String::as_str).collect();
    if symtab.search(SymbolScope::Defined, tls_symbol_name).is_some() {
        root_names.push(tls_symbol_name);
    }
    for name in root_names {
        let Some(symbol) = symtab.search(SymbolScope::Defined, name) else {
            continue;
        };
        let (obj_idx, symbol_idx) = symbol.defined();
        work.push(Task {
            obj_idx,
            relocs: std::borrow::Cow::Owned(vec![Reloc {
                apply_off: 0,
                symbol_index: symbol_idx,
                kind: 0,
            }]),
        });
    }

    // roots: every live non-COMDAT section's relocations
    for obj in objs {
        for sect_idx in 0..obj.object.section_count() {
            if obj.object.is_debug_section(sect_idx) {
                continue;
            }
            if obj.is_comdat(sect_idx) || obj.is_removed(sect_idx) {
                continue;
            }
            push_reloc_tasks(&mut work, obj, sect_idx);
        }
    }

    // pre-mark: every COMDAT section starts removed
    for obj in objs {
        for sect_idx in 0..obj.object.section_count() {
            if obj.is_comdat(sect_idx) {
                obj.set_removed(sect_idx);
            }
        }
    }

    let mut visited: Vec<Vec<bool>> = objs
        .iter()
        .map(|obj| vec![false; obj.object.section_count() + 1])
        .collect();

    while let Some(task) = work.pop() {
        for reloc in task.relocs.iter() {
            let Some((target_obj_idx, target_symbol_idx)) =
                resolve_symbol(symtab, objs, (task.obj_idx, reloc.symbol_index))
            else {
                continue;
            };
            let target_obj = &objs[target_obj_idx as usize];
            let Some(target) = target_obj.object.symbol(target_symbol_idx) else {
                continue;
            };
            if target.interp() != SymbolInterp::Regular {
                continue;
            }

            // the target's section plus everything associated with it
            let mut section_numbers = vec![target.section_number as u32];
            section_numbers.extend(
                target_obj.object.associated[target.section_number as usize]
                    .iter()
                    .copied(),
            );

            for section_number in section_numbers {
                let sect_idx = section_number as usize - 1;
                if visited[target_obj_idx as usize][section_number as usize] {
                    continue;
                }
                visited[target_obj_idx as usize][section_number as usize] = true;

                if target_obj.object.is_debug_section(sect_idx) {
                    continue;
                }
                if target_obj.is_comdat(sect_idx) {
                    target_obj.clear_removed(sect_idx);
                } else if target_obj.is_removed(sect_idx) {
                    // regular sections removed by other means stay removed
                    continue;
                }

                push_reloc_tasks(&mut work, target_obj, sect_idx);
            }
        }
    }

    // debug sections associated with a live section stay
    for obj in objs {
        for sect_idx in 0..obj.object.section_count() {
            if obj.is_removed(sect_idx) {
                continue;
            }
            for &associated in &obj.object.associated[sect_idx + 1] {
                let associated_idx = associated as usize - 1;
                if obj.object.is_debug_section(associated_idx) {
                    obj.clear_removed(associated_idx);
                }
            }
        }
    }
}

fn push_reloc_tasks<'a>(work: &mut Vec<Task<'a>>, obj: &'a Obj, sect_idx: usize) {
    let relocs = &obj.object.relocs[sect_idx];
    for slice in relocs.chunks(RELOCS_PER_TASK) {
        work.push(Task {
            obj_idx: obj.input_idx,
            relocs: std::borrow::Cow::Borrowed(slice),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;
    use crate::coff::reloc::x64;
    use crate::coff::symbol::ComdatSelect;
    use crate::coff::{MachineType, SectionFlags};
    use crate::linker::objects::input_obj_symbols;
    use crate::linker::pool::ThreadPool;
    use crate::linker::select::Selector;
    use crate::linker::session::Session;
    use crate::linker::synth::ObjWriter;

    /// One obj: a root `.text` calling `used`, plus COMDATs `used` (reached)
    /// and `unused` (dropped), with an associative section hanging off each.
    #[test]
    fn unreachable_comdats_are_removed() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let root = writer.push_section(".text$mn", SectionFlags::CNT_CODE, vec![0x90; 8]);
        let used_sect =
            writer.push_comdat_section(".text$x", SectionFlags::CNT_CODE, vec![0xC3; 4], ComdatSelect::Any);
        let used = writer.push_external(used_sect, "used", 0, true);
        let used_assoc = writer.push_associative_section(
            ".xdata$x",
            SectionFlags::CNT_INITIALIZED_DATA,
            vec![0; 4],
            used_sect,
        );
        let unused_sect =
            writer.push_comdat_section(".text$y", SectionFlags::CNT_CODE, vec![0xC3; 4], ComdatSelect::Any);
        writer.push_external(unused_sect, "unused", 0, true);
        let unused_assoc = writer.push_associative_section(
            ".xdata$y",
            SectionFlags::CNT_INITIALIZED_DATA,
            vec![0; 4],
            unused_sect,
        );
        writer.push_reloc(root, 0, used, x64::REL32);

        let objs = vec![Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "gc.obj".into(),
            None,
        )];
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs: &objs,
            session: &session,
        };
        let pool = ThreadPool::new(1);
        input_obj_symbols(&pool, &symtab, &objs, 0..1, &selector);

        gc_comdats(&symtab, &objs, &[], "_tls_used");

        let obj = &objs[0];
        assert!(!obj.is_removed(root.number() as usize - 1));
        assert!(!obj.is_removed(used_sect.number() as usize - 1));
        assert!(
            !obj.is_removed(used_assoc.number() as usize - 1),
            "associated section follows its live leader"
        );
        assert!(obj.is_removed(unused_sect.number() as usize - 1));
        assert!(obj.is_removed(unused_assoc.number() as usize - 1));
    }

    /// An include symbol roots an otherwise unreferenced COMDAT.
    #[test]
    fn include_symbols_are_roots() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let sect =
            writer.push_comdat_section(".text$k", SectionFlags::CNT_CODE, vec![0xC3; 4], ComdatSelect::Any);
        writer.push_external(sect, "kept_alive", 0, true);
        let objs = vec![Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "keep.obj".into(),
            None,
        )];
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs: &objs,
            session: &session,
        };
        let pool = ThreadPool::new(1);
        input_obj_symbols(&pool, &symtab, &objs, 0..1, &selector);

        gc_comdats(&symtab, &objs, &["kept_alive".to_string()], "_tls_used");
        assert!(!objs[0].is_removed(sect.number() as usize - 1));

        // and without the root it would have died
        objs[0].set_removed(sect.number() as usize - 1);
        gc_comdats(&symtab, &objs, &[], "_tls_used");
        assert!(objs[0].is_removed(sect.number() as usize - 1));
    }
}
