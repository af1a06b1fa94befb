//! The replacement policy: given two symbols claiming one name, decide the
//! leader. The loser's section (and its associated sections) is removed from
//! the image when the loser was a regular definition.

use crate::coff::object::ParsedSymbol;
use crate::coff::symbol::{ComdatSelect, SymbolInterp};

use super::objects::Obj;
use super::session::{DiagKind, Session};
use super::symtab::{ReplacePolicy, Symbol, SymbolLoc, SymbolScope};

pub struct Selector<'a> {
    pub objs: &'a [Obj],
    pub session: &'a Session,
}

/// COMDAT-ish properties of one side of a fight. Common symbols behave like
/// a `Largest` COMDAT of their size.
struct SideProps {
    is_comdat: bool,
    select: ComdatSelect,
    length: u32,
    check_sum: u32,
}

impl<'a> Selector<'a> {
    fn parsed(&self, symbol: &Symbol) -> (&'a Obj, &'a ParsedSymbol) {
        let (obj_idx, symbol_idx) = symbol.defined();
        let obj = &self.objs[obj_idx as usize];
        let parsed = obj
            .object
            .symbol(symbol_idx)
            .expect("defined symbol points at an aux record");
        (obj, parsed)
    }

    fn error_multiply_defined(&self, dst: &Symbol, src: &Symbol) {
        let (dst_obj, _) = self.parsed(dst);
        let (src_obj, _) = self.parsed(src);
        self.session.error_obj(
            DiagKind::MultiplyDefinedSymbol,
            &dst_obj.path,
            format!(
                "symbol \"{}\" is multiply defined in {}",
                dst.name, src_obj.path
            ),
        );
    }

    fn side_props(&self, obj: &Obj, parsed: &ParsedSymbol, interp: SymbolInterp) -> SideProps {
        match interp {
            SymbolInterp::Regular => match obj.object.comdat_props(parsed.section_number) {
                Some(info) => SideProps {
                    is_comdat: true,
                    select: info.selection,
                    length: info.length,
                    check_sum: info.check_sum,
                },
                None => SideProps {
                    is_comdat: false,
                    select: ComdatSelect::Any,
                    length: 0,
                    check_sum: 0,
                },
            },
            SymbolInterp::Common => SideProps {
                is_comdat: true,
                select: ComdatSelect::Largest,
                length: parsed.value,
                check_sum: 0,
            },
            _ => SideProps {
                is_comdat: false,
                select: ComdatSelect::Any,
                length: 0,
                check_sum: 0,
            },
        }
    }

    fn section_bytes(&self, obj: &'a Obj, parsed: &ParsedSymbol) -> &'a [u8] {
        if parsed.section_number < 1 {
            return &[];
        }
        obj.object
            .section_data(parsed.section_number as usize - 1)
            .unwrap_or(&[])
    }

    fn can_replace_defined(&self, dst: &Symbol, src: &Symbol) -> bool {
        use SymbolInterp::*;

        let (dst_obj, dst_parsed) = self.parsed(dst);
        let (src_obj, src_parsed) = self.parsed(src);
        let dst_interp = dst_parsed.interp();
        let src_interp = src_parsed.interp();

        let dst_is_before = dst_obj.input_idx < src_obj.input_idx;

        match (dst_interp, src_interp) {
            (Regular, Abs) | (Abs, Regular) | (Abs, Abs) => {
                self.error_multiply_defined(dst, src);
                false
            }
            (Abs, Common) => {
                if dst_is_before {
                    true
                } else {
                    self.error_multiply_defined(dst, src);
                    false
                }
            }
            (Common, Abs) => {
                if dst_is_before {
                    self.error_multiply_defined(dst, src);
                }
                false
            }
            (Weak, Weak) => !dst_is_before,
            (Weak, Regular | Abs | Common) => true,
            (Regular | Abs | Common, Weak) => false,
            (Regular | Common, Regular | Common) => {
                let dst_props = self.side_props(dst_obj, dst_parsed, dst_interp);
                let src_props = self.side_props(src_obj, src_parsed, src_interp);

                // regular non-comdat beats a communal of the same name
                if dst_interp == Regular && !dst_props.is_comdat && src_interp == Common {
                    return false;
                }
                if dst_interp == Common && src_interp == Regular && !src_props.is_comdat {
                    return true;
                }

                if !(dst_props.is_comdat && src_props.is_comdat) {
                    self.error_multiply_defined(dst, src);
                    return false;
                }

                // Any against Largest is fought as Largest
                let mut dst_select = dst_props.select;
                let mut src_select = src_props.select;
                if src_select == ComdatSelect::Any && dst_select == ComdatSelect::Largest {
                    src_select = ComdatSelect::Largest;
                }
                if src_select == ComdatSelect::Largest && dst_select == ComdatSelect::Any {
                    dst_select = ComdatSelect::Largest;
                }

                if src_select != dst_select {
                    self.session.error_obj(
                        DiagKind::UnresolvedComdat,
                        &src_obj.path,
                        format!(
                            "{}: COMDAT selection conflict, current selection {}, leader selection {} from {}",
                            src.name,
                            src_select.name(),
                            dst_select.name(),
                            dst_obj.path
                        ),
                    );
                    return false;
                }

                match src_select {
                    ComdatSelect::Any => {
                        if src_props.length == dst_props.length {
                            !dst_is_before
                        } else {
                            // both are valid; pick the smaller for a smaller image
                            src_props.length < dst_props.length
                        }
                    }
                    ComdatSelect::NoDuplicates => {
                        self.error_multiply_defined(dst, src);
                        false
                    }
                    ComdatSelect::SameSize => {
                        if src_props.length == dst_props.length {
                            !dst_is_before
                        } else {
                            self.error_multiply_defined(dst, src);
                            false
                        }
                    }
                    ComdatSelect::ExactMatch => {
                        let checksums_match = dst_props.check_sum == 0
                            || src_props.check_sum == 0
                            || dst_props.check_sum == src_props.check_sum;
                        let is_exact_match = checksums_match
                            && self.section_bytes(dst_obj, dst_parsed)
                                == self.section_bytes(src_obj, src_parsed);
                        if is_exact_match {
                            !dst_is_before
                        } else {
                            self.error_multiply_defined(dst, src);
                            false
                        }
                    }
                    ComdatSelect::Largest => {
                        if src_props.length == dst_props.length {
                            !dst_is_before
                        } else {
                            dst_props.length < src_props.length
                        }
                    }
                    ComdatSelect::Associative => false,
                }
            }
            _ => {
                self.session.error(
                    DiagKind::InvalidPath,
                    format!(
                        "unable to find a suitable replacement logic for symbol \"{}\"",
                        dst.name
                    ),
                );
                false
            }
        }
    }
}

impl ReplacePolicy for Selector<'_> {
    fn can_replace(&self, scope: SymbolScope, dst: &Symbol, src: &Symbol) -> bool {
        match scope {
            SymbolScope::Defined => self.can_replace_defined(dst, src),
            // link.exe keeps the member from the lib discovered first
            SymbolScope::Lib => match (dst.loc, src.loc) {
                (SymbolLoc::Lib { lib: dst_lib, .. }, SymbolLoc::Lib { lib: src_lib, .. }) => {
                    src_lib < dst_lib
                }
                _ => false,
            },
        }
    }

    fn on_replace(&self, scope: SymbolScope, loser: &Symbol, winner: &Symbol) {
        if scope != SymbolScope::Defined {
            return;
        }
        let (loser_obj, loser_parsed) = self.parsed(loser);
        if loser_parsed.interp() == SymbolInterp::Regular {
            loser_obj.remove_section_with_associates(loser_parsed.section_number as u32);
        }

        if cfg!(debug_assertions) {
            let (winner_obj, winner_parsed) = self.parsed(winner);
            if winner_parsed.interp() == SymbolInterp::Regular {
                debug_assert!(
                    !winner_obj.is_removed(winner_parsed.section_number as usize - 1),
                    "leader section of {} is removed",
                    winner.name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::symbol::WeakSearch;
    use crate::coff::{MachineType, SectionFlags};
    use crate::linker::objects::input_obj_symbols;
    use crate::linker::pool::ThreadPool;
    use crate::linker::symtab::SymbolTable;
    use crate::linker::synth::ObjWriter;

    fn obj_with_comdat(name: &str, size: usize, select: ComdatSelect, input_idx: u32) -> Obj {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let sect = writer.push_comdat_section(
            ".text$mn",
            SectionFlags::CNT_CODE,
            vec![0x90; size],
            select,
        );
        writer.push_external(sect, name, 0, true);
        let object = crate::coff::object::ObjectFile::parse(writer.serialize()).unwrap();
        Obj::new(
            object,
            input_idx,
            input_idx as u64,
            format!("obj{input_idx}.obj"),
            None,
        )
    }

    fn run_selection(objs: &[Obj]) -> SymbolTable {
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs,
            session: &session,
        };
        let pool = ThreadPool::new(1);
        input_obj_symbols(&pool, &symtab, objs, 0..objs.len(), &selector);
        symtab
    }

    #[test]
    fn comdat_any_tie_keeps_earlier() {
        let objs = vec![
            obj_with_comdat("?foo@@YAXXZ", 8, ComdatSelect::Any, 0),
            obj_with_comdat("?foo@@YAXXZ", 8, ComdatSelect::Any, 1),
        ];
        let symtab = run_selection(&objs);
        let winner = symtab.search(SymbolScope::Defined, "?foo@@YAXXZ").unwrap();
        assert_eq!(winner.defined().0, 0);
        // loser's section was flagged for removal
        assert!(objs[1].is_removed(0));
        assert!(!objs[0].is_removed(0));
    }

    #[test]
    fn comdat_largest_picks_bigger() {
        let objs = vec![
            obj_with_comdat("?bar@@YAXXZ", 8, ComdatSelect::Largest, 0),
            obj_with_comdat("?bar@@YAXXZ", 16, ComdatSelect::Largest, 1),
        ];
        let symtab = run_selection(&objs);
        let winner = symtab.search(SymbolScope::Defined, "?bar@@YAXXZ").unwrap();
        assert_eq!(winner.defined().0, 1);
        assert!(objs[0].is_removed(0));
    }

    #[test]
    fn comdat_any_prefers_smaller_size() {
        let objs = vec![
            obj_with_comdat("f", 16, ComdatSelect::Any, 0),
            obj_with_comdat("f", 8, ComdatSelect::Any, 1),
        ];
        let symtab = run_selection(&objs);
        assert_eq!(
            symtab.search(SymbolScope::Defined, "f").unwrap().defined().0,
            1
        );
    }

    #[test]
    fn no_duplicates_is_fatal() {
        let objs = vec![
            obj_with_comdat("g", 8, ComdatSelect::NoDuplicates, 0),
            obj_with_comdat("g", 8, ComdatSelect::NoDuplicates, 1),
        ];
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs: &objs,
            session: &session,
        };
        let pool = ThreadPool::new(1);
        input_obj_symbols(&pool, &symtab, &objs, 0..objs.len(), &selector);
        assert!(session.has_diag(DiagKind::MultiplyDefinedSymbol));
    }

    #[test]
    fn selection_mode_conflict_warns_and_keeps_existing() {
        let objs = vec![
            obj_with_comdat("h", 8, ComdatSelect::SameSize, 0),
            obj_with_comdat("h", 16, ComdatSelect::ExactMatch, 1),
        ];
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs: &objs,
            session: &session,
        };
        let pool = ThreadPool::new(1);
        input_obj_symbols(&pool, &symtab, &objs, 0..objs.len(), &selector);
        assert!(session.has_diag(DiagKind::UnresolvedComdat));
        assert!(!session.has_errors());
        assert_eq!(
            symtab.search(SymbolScope::Defined, "h").unwrap().defined().0,
            0
        );
    }

    #[test]
    fn strong_definition_beats_weak() {
        // obj 0 carries a weak "w", obj 1 a strong one
        let mut weak_writer = ObjWriter::new(MachineType::Amd64);
        let tag = weak_writer.push_undefined("w_fallback");
        weak_writer.push_weak("w", tag, WeakSearch::SearchLibrary);
        let weak_obj = Obj::new(
            crate::coff::object::ObjectFile::parse(weak_writer.serialize()).unwrap(),
            0,
            0,
            "weak.obj".into(),
            None,
        );

        let mut strong_writer = ObjWriter::new(MachineType::Amd64);
        let sect =
            strong_writer.push_section(".text$mn", SectionFlags::CNT_CODE, vec![0xC3; 4]);
        strong_writer.push_external(sect, "w", 0, true);
        let strong_obj = Obj::new(
            crate::coff::object::ObjectFile::parse(strong_writer.serialize()).unwrap(),
            1,
            1,
            "strong.obj".into(),
            None,
        );

        let objs = vec![weak_obj, strong_obj];
        let symtab = run_selection(&objs);
        let winner = symtab.search(SymbolScope::Defined, "w").unwrap();
        assert_eq!(winner.defined().0, 1);
    }

    #[test]
    fn two_strong_regulars_are_multiply_defined() {
        let make = |input_idx: u32| {
            let mut writer = ObjWriter::new(MachineType::Amd64);
            let sect = writer.push_section(".text$mn", SectionFlags::CNT_CODE, vec![0xC3; 4]);
            writer.push_external(sect, "dup_strong", 0, true);
            Obj::new(
                crate::coff::object::ObjectFile::parse(writer.serialize()).unwrap(),
                input_idx,
                input_idx as u64,
                format!("obj{input_idx}.obj"),
                None,
            )
        };
        let objs = vec![make(0), make(1)];
        let symtab = SymbolTable::new();
        let session = Session::new();
        let selector = Selector {
            objs: &objs,
            session: &session,
        };
        let pool = ThreadPool::new(1);
        input_obj_symbols(&pool, &symtab, &objs, 0..objs.len(), &selector);
        assert!(session.has_diag(DiagKind::MultiplyDefinedSymbol));
        assert!(session.has_errors());
    }
}
