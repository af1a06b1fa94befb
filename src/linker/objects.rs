//! The linker-side object wrapper and per-object mutable state.
//!
//! A parsed object is immutable after ingest except for two things the
//! pipeline is allowed to change: the per-section `LnkRemove` bit (flipped
//! from worker threads by the selector and the GC, hence atomics) and the
//! patched symbol locations, kept in a side table the downstream phases
//! consult instead of rewriting the COFF records.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::coff::object::{ObjectFile, ParsedSymbol};
use crate::coff::symbol::{storage_class, SymbolInterp};
use crate::coff::SectionFlags;

use super::pool::{SlotBuffer, ThreadPool};
use super::symtab::{ReplacePolicy, Symbol, SymbolLoc, SymbolScope, SymbolTable};

/// Sentinel for symbols whose section was discarded from the image.
pub const REMOVED_SECTION_NUMBER: i32 = -3;

pub struct Obj {
    pub object: ObjectFile,
    /// Dense index into the link context's object list; ties between
    /// competing definitions break toward the smaller index.
    pub input_idx: u32,
    /// Pre-ingest ordering key: command-line position, or
    /// `(lib, member offset)` for archive members.
    pub input_ord: u64,
    pub path: String,
    pub lib: Option<u32>,
    removed: Vec<AtomicBool>,
    pub patch: SymbolPatches,
}

impl Obj {
    pub fn new(
        object: ObjectFile,
        input_idx: u32,
        input_ord: u64,
        path: String,
        lib: Option<u32>,
    ) -> Self {
        let removed = object
            .sections
            .iter()
            .map(|header| {
                AtomicBool::new(header.characteristics.contains(SectionFlags::LNK_REMOVE))
            })
            .collect();
        let patch = SymbolPatches::new(&object);
        Self {
            object,
            input_idx,
            input_ord,
            path,
            lib,
            removed,
            patch,
        }
    }

    pub fn is_removed(&self, sect_idx: usize) -> bool {
        self.removed[sect_idx].load(Ordering::Relaxed)
    }

    pub fn set_removed(&self, sect_idx: usize) {
        self.removed[sect_idx].store(true, Ordering::Relaxed);
    }

    pub fn clear_removed(&self, sect_idx: usize) {
        self.removed[sect_idx].store(false, Ordering::Relaxed);
    }

    pub fn is_comdat(&self, sect_idx: usize) -> bool {
        self.object.sections[sect_idx]
            .characteristics
            .contains(SectionFlags::LNK_COMDAT)
    }

    /// Marks a section and, transitively, every section associated with it
    /// as removed from the image.
    pub fn remove_section_with_associates(&self, section_number: u32) {
        let mut work = vec![section_number];
        let mut visited = vec![false; self.object.section_count() + 1];
        while let Some(number) = work.pop() {
            let number = number as usize;
            if number == 0 || number > self.object.section_count() || visited[number] {
                continue;
            }
            visited[number] = true;
            self.set_removed(number - 1);
            work.extend(self.object.associated[number].iter().copied());
        }
    }

    /// For a COMDAT section defeated by a definition in another object,
    /// returns the winning symbol (the "symlink" the layout and patcher
    /// redirect through).
    pub fn comdat_symlink<'a>(
        &self,
        section_number: i32,
        symtab: &'a SymbolTable,
    ) -> Option<&'a Symbol> {
        let info = self.object.comdat_props(section_number)?;
        let leader_idx = info.leader_symbol?;
        let leader = self.object.symbol(leader_idx)?;
        let winner = symtab.search(SymbolScope::Defined, &leader.name)?;
        match winner.loc {
            SymbolLoc::Defined { obj, .. } if obj != self.input_idx => Some(winner),
            _ => None,
        }
    }
}

/// The patched `(section_number, value)` of every symbol record, plus a
/// "patched by some stage" bit. Cells are atomics because later stages read
/// other objects' already-finalized cells while their own object is being
/// written; each cell has a single writer per phase.
pub struct SymbolPatches {
    cells: Vec<AtomicU64>,
    flags: Vec<AtomicU8>,
}

impl SymbolPatches {
    const PATCHED: u8 = 1;

    pub fn new(object: &ObjectFile) -> Self {
        let cells = object
            .symbols
            .iter()
            .map(|slot| {
                let packed = match slot {
                    Some(symbol) => Self::pack(symbol.section_number, symbol.value),
                    None => 0,
                };
                AtomicU64::new(packed)
            })
            .collect();
        let flags = (0..object.symbols.len()).map(|_| AtomicU8::new(0)).collect();
        Self { cells, flags }
    }

    fn pack(section_number: i32, value: u32) -> u64 {
        ((section_number as u32 as u64) << 32) | value as u64
    }

    pub fn get(&self, symbol_idx: u32) -> (i32, u32) {
        let packed = self.cells[symbol_idx as usize].load(Ordering::Relaxed);
        ((packed >> 32) as u32 as i32, packed as u32)
    }

    pub fn set(&self, symbol_idx: u32, section_number: i32, value: u32) {
        self.cells[symbol_idx as usize].store(Self::pack(section_number, value), Ordering::Relaxed);
    }

    pub fn mark_patched(&self, symbol_idx: u32) {
        self.flags[symbol_idx as usize].store(Self::PATCHED, Ordering::Relaxed);
    }

    pub fn is_patched(&self, symbol_idx: u32) -> bool {
        self.flags[symbol_idx as usize].load(Ordering::Relaxed) & Self::PATCHED != 0
    }
}

/// A symbol's location after patching, decoded from the side table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchedLoc {
    /// One-based final image section number and section-relative offset.
    Image { section_number: u32, off: u32 },
    Abs { value: u32 },
    Removed,
}

/// Reads a symbol's final location; `None` when no stage patched it (an
/// unresolved reference surviving under `/FORCE`, or a debug symbol).
pub fn patched_loc(obj: &Obj, symbol_idx: u32) -> Option<PatchedLoc> {
    if !obj.patch.is_patched(symbol_idx) {
        return None;
    }
    let (section_number, value) = obj.patch.get(symbol_idx);
    Some(match section_number {
        REMOVED_SECTION_NUMBER => PatchedLoc::Removed,
        crate::coff::symbol::section_number::ABSOLUTE => PatchedLoc::Abs { value },
        n if n > 0 => PatchedLoc::Image {
            section_number: n as u32,
            off: value,
        },
        _ => PatchedLoc::Removed,
    })
}

/// Queued lookups discovered while inputting an object's symbols.
#[derive(Default)]
pub struct SymbolInputResult {
    /// `(obj, symbol_idx)` of undefined references.
    pub undef: Vec<(u32, u32)>,
    /// `(obj, symbol_idx)` of weak externals.
    pub weak: Vec<(u32, u32)>,
}

/// Should this symbol record participate in the global symbol graph?
fn is_input_symbol(symbol: &ParsedSymbol) -> bool {
    matches!(
        symbol.storage_class,
        storage_class::EXTERNAL | storage_class::WEAK_EXTERNAL
    )
}

/// Pushes the external symbols of `objs[new_objs]` into the symbol table in
/// parallel and returns the undefined/weak references to queue for lookup,
/// sorted for determinism.
pub fn input_obj_symbols(
    pool: &ThreadPool,
    symtab: &SymbolTable,
    objs: &[Obj],
    new_objs: std::ops::Range<usize>,
    policy: &(dyn ReplacePolicy + Sync),
) -> SymbolInputResult {
    let results = SlotBuffer::with_capacity(new_objs.len());
    pool.for_parallel(new_objs.len(), |_, item_idx| {
        let obj = &objs[new_objs.start + item_idx];
        let mut undef = Vec::new();
        let mut weak = Vec::new();

        for (symbol_idx, symbol) in obj.object.iter_symbols() {
            if !is_input_symbol(symbol) {
                continue;
            }
            let loc = SymbolLoc::Defined {
                obj: obj.input_idx,
                symbol_idx,
            };
            match symbol.interp() {
                SymbolInterp::Regular | SymbolInterp::Common | SymbolInterp::Abs => {
                    symtab.insert_or_replace(SymbolScope::Defined, &symbol.name, loc, policy);
                }
                SymbolInterp::Weak => {
                    symtab.insert_or_replace(SymbolScope::Defined, &symbol.name, loc, policy);
                    weak.push((obj.input_idx, symbol_idx));
                }
                SymbolInterp::Undefined => {
                    if symbol.storage_class != storage_class::SECTION {
                        undef.push((obj.input_idx, symbol_idx));
                    }
                }
                SymbolInterp::Debug => {}
            }
        }
        results.push((obj.input_idx, undef, weak));
    });

    let mut per_obj = results.into_vec();
    per_obj.sort_unstable_by_key(|(obj_idx, _, _)| *obj_idx);

    let mut merged = SymbolInputResult::default();
    for (_, undef, weak) in per_obj {
        merged.undef.extend(undef);
        merged.weak.extend(weak);
    }
    merged
}

