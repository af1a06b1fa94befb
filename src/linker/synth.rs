//! In-memory COFF object writer, used for everything the linker feeds to
//! itself: the null obj, include/alternate-name objects, the linker-defined
//! symbols, import thunk objects, the export table, resources and debug
//! directories. Also usable from tests to synthesize inputs.

use crate::coff::reloc::Reloc;
use crate::coff::symbol::{
    storage_class, AuxSectionDefinition, AuxWeakExternal, ComdatSelect, SymbolRecord, WeakSearch,
    SYM_DTYPE_FUNCTION,
};
use crate::coff::{FileHeader, MachineType, SectionFlags, SectionHeader};
use crate::io::{WriteData, Writer};

/// The defined-scope placeholder import thunks point at until the real
/// import objects are synthesized.
pub const IMPORT_STUB_SYMBOL: &str = "*import-stub*";

/// Handle to a section pushed into an [`ObjWriter`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectionId(u32);

impl SectionId {
    /// One-based section number.
    pub fn number(self) -> u32 {
        self.0
    }
}

enum WriterAux {
    None,
    SectionDef {
        length: u32,
        check_sum: u32,
        number: u32,
        selection: u8,
    },
    Weak {
        tag_index: u32,
        search: WeakSearch,
    },
}

struct WriterSymbol {
    name: String,
    value: u32,
    section_number: i32,
    type_: u16,
    storage_class: u8,
    aux: WriterAux,
}

struct WriterSection {
    name: String,
    flags: SectionFlags,
    data: Vec<u8>,
    /// For uninitialized sections: claimed size with no raw data.
    bss_size: u32,
    relocs: Vec<Reloc>,
}

pub struct ObjWriter {
    machine: MachineType,
    time_stamp: u32,
    sections: Vec<WriterSection>,
    symbols: Vec<WriterSymbol>,
    /// Serialized symbol-table index of the next pushed symbol.
    next_symbol_idx: u32,
}

impl ObjWriter {
    pub fn new(machine: MachineType) -> Self {
        Self {
            machine,
            time_stamp: 0,
            sections: Vec::new(),
            symbols: Vec::new(),
            next_symbol_idx: 0,
        }
    }

    pub fn set_time_stamp(&mut self, time_stamp: u32) {
        self.time_stamp = time_stamp;
    }

    pub fn push_section(
        &mut self,
        name: &str,
        flags: SectionFlags,
        data: Vec<u8>,
    ) -> SectionId {
        self.sections.push(WriterSection {
            name: name.to_owned(),
            flags,
            data,
            bss_size: 0,
            relocs: Vec::new(),
        });
        SectionId(self.sections.len() as u32)
    }

    pub fn push_bss_section(&mut self, name: &str, flags: SectionFlags, size: u32) -> SectionId {
        self.sections.push(WriterSection {
            name: name.to_owned(),
            flags: flags | SectionFlags::CNT_UNINITIALIZED_DATA,
            data: Vec::new(),
            bss_size: size,
            relocs: Vec::new(),
        });
        SectionId(self.sections.len() as u32)
    }

    /// Pushes a COMDAT section along with its section symbol and selection
    /// auxiliary record.
    pub fn push_comdat_section(
        &mut self,
        name: &str,
        flags: SectionFlags,
        data: Vec<u8>,
        select: ComdatSelect,
    ) -> SectionId {
        let length = data.len() as u32;
        let sect = self.push_section(name, flags | SectionFlags::LNK_COMDAT, data);
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value: 0,
            section_number: sect.number() as i32,
            type_: 0,
            storage_class: storage_class::STATIC,
            aux: WriterAux::SectionDef {
                length,
                check_sum: 0,
                number: 0,
                selection: select.to_u8(),
            },
        });
        sect
    }

    /// Pushes a COMDAT section whose liveness follows `leader`.
    pub fn push_associative_section(
        &mut self,
        name: &str,
        flags: SectionFlags,
        data: Vec<u8>,
        leader: SectionId,
    ) -> SectionId {
        let length = data.len() as u32;
        let sect = self.push_section(name, flags | SectionFlags::LNK_COMDAT, data);
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value: 0,
            section_number: sect.number() as i32,
            type_: 0,
            storage_class: storage_class::STATIC,
            aux: WriterAux::SectionDef {
                length,
                check_sum: 0,
                number: leader.number(),
                selection: ComdatSelect::Associative.to_u8(),
            },
        });
        sect
    }

    pub fn push_reloc(&mut self, sect: SectionId, apply_off: u32, symbol_idx: u32, kind: u16) {
        self.sections[sect.0 as usize - 1].relocs.push(Reloc {
            apply_off,
            symbol_index: symbol_idx,
            kind,
        });
    }

    fn push_symbol(&mut self, symbol: WriterSymbol) -> u32 {
        let idx = self.next_symbol_idx;
        self.next_symbol_idx += 1 + u32::from(!matches!(symbol.aux, WriterAux::None));
        self.symbols.push(symbol);
        idx
    }

    pub fn push_external(&mut self, sect: SectionId, name: &str, value: u32, is_func: bool) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value,
            section_number: sect.number() as i32,
            type_: if is_func { SYM_DTYPE_FUNCTION } else { 0 },
            storage_class: storage_class::EXTERNAL,
            aux: WriterAux::None,
        })
    }

    pub fn push_static(&mut self, sect: SectionId, name: &str, value: u32) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value,
            section_number: sect.number() as i32,
            type_: 0,
            storage_class: storage_class::STATIC,
            aux: WriterAux::None,
        })
    }

    pub fn push_undefined(&mut self, name: &str) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value: 0,
            section_number: 0,
            type_: 0,
            storage_class: storage_class::EXTERNAL,
            aux: WriterAux::None,
        })
    }

    /// An undefined record that stays out of the global symbol graph: weak
    /// tags that must not pull archive members or report as unresolved.
    pub fn push_undefined_static(&mut self, name: &str) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value: 0,
            section_number: 0,
            type_: 0,
            storage_class: storage_class::STATIC,
            aux: WriterAux::None,
        })
    }

    pub fn push_common(&mut self, name: &str, size: u32) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value: size,
            section_number: 0,
            type_: 0,
            storage_class: storage_class::EXTERNAL,
            aux: WriterAux::None,
        })
    }

    pub fn push_absolute(&mut self, name: &str, value: u32) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value,
            section_number: crate::coff::symbol::section_number::ABSOLUTE,
            type_: 0,
            storage_class: storage_class::EXTERNAL,
            aux: WriterAux::None,
        })
    }

    pub fn push_weak(&mut self, name: &str, tag_index: u32, search: WeakSearch) -> u32 {
        self.push_symbol(WriterSymbol {
            name: name.to_owned(),
            value: 0,
            section_number: 0,
            type_: 0,
            storage_class: storage_class::WEAK_EXTERNAL,
            aux: WriterAux::Weak { tag_index, search },
        })
    }

    pub fn serialize(self) -> Vec<u8> {
        let section_count = self.sections.len();
        let headers_size = FileHeader::SIZE + section_count * SectionHeader::SIZE;

        // lay out raw data and reloc arrays after the headers
        let mut cursor = headers_size;
        let mut section_headers = Vec::with_capacity(section_count);
        for section in &self.sections {
            let mut header = SectionHeader {
                virtual_size: 0,
                characteristics: section.flags,
                ..Default::default()
            };
            if section.bss_size != 0 {
                header.size_of_raw_data = section.bss_size;
            } else {
                header.size_of_raw_data = section.data.len() as u32;
                if !section.data.is_empty() {
                    header.pointer_to_raw_data = cursor as u32;
                    cursor += section.data.len();
                }
            }
            if !section.relocs.is_empty() {
                header.pointer_to_relocations = cursor as u32;
                header.number_of_relocations = section.relocs.len() as u16;
                cursor += section.relocs.len() * Reloc::SIZE;
            }
            section_headers.push(header);
        }
        let symbol_table_off = cursor;

        let mut string_table: Vec<u8> = Vec::new();
        let mut intern = |name: &str| -> [u8; 8] {
            let mut field = [0u8; 8];
            if name.len() <= 8 {
                field[..name.len()].copy_from_slice(name.as_bytes());
            } else {
                let offset = 4 + string_table.len() as u32;
                string_table.extend_from_slice(name.as_bytes());
                string_table.push(0);
                field[4..8].copy_from_slice(&offset.to_le_bytes());
            }
            field
        };

        // symbol records
        let mut symbol_bytes: Vec<u8> = Vec::new();
        let mut symbol_count = 0u32;
        for symbol in &self.symbols {
            let aux_count = u8::from(!matches!(symbol.aux, WriterAux::None));
            let record = SymbolRecord {
                name: intern(&symbol.name),
                value: symbol.value,
                section_number: symbol.section_number,
                type_: symbol.type_,
                storage_class: symbol.storage_class,
                number_of_aux_symbols: aux_count,
            };
            record.write(&mut symbol_bytes, false).unwrap();
            symbol_count += 1;
            match &symbol.aux {
                WriterAux::None => {}
                WriterAux::SectionDef {
                    length,
                    check_sum,
                    number,
                    selection,
                } => {
                    AuxSectionDefinition {
                        length: *length,
                        number_of_relocations: 0,
                        number_of_linenumbers: 0,
                        check_sum: *check_sum,
                        number: *number,
                        selection: *selection,
                    }
                    .write(&mut symbol_bytes, false)
                    .unwrap();
                    symbol_count += 1;
                }
                WriterAux::Weak { tag_index, search } => {
                    AuxWeakExternal {
                        tag_index: *tag_index,
                        characteristics: *search,
                    }
                    .write(&mut symbol_bytes, false)
                    .unwrap();
                    symbol_count += 1;
                }
            }
        }

        drop(intern);

        // section names go through the same string table
        for (section, header) in self.sections.iter().zip(section_headers.iter_mut()) {
            if section.name.len() <= 8 {
                header.set_name_short(&section.name);
            } else {
                let offset = 4 + string_table
                    .windows(section.name.len() + 1)
                    .position(|w| {
                        &w[..section.name.len()] == section.name.as_bytes()
                            && w[section.name.len()] == 0
                    })
                    .unwrap_or_else(|| {
                        let offset = string_table.len();
                        string_table.extend_from_slice(section.name.as_bytes());
                        string_table.push(0);
                        offset
                    });
                header.set_name_short(&format!("/{offset}"));
            }
        }

        let mut out = Vec::with_capacity(symbol_table_off + symbol_bytes.len());
        (&FileHeader {
            machine: self.machine,
            number_of_sections: section_count as u16,
            time_date_stamp: self.time_stamp,
            pointer_to_symbol_table: symbol_table_off as u32,
            number_of_symbols: symbol_count,
            size_of_optional_header: 0,
            characteristics: 0,
        })
            .write_to(&mut out)
            .unwrap();
        for header in &section_headers {
            out.write(header).unwrap();
        }
        for section in &self.sections {
            if section.bss_size == 0 {
                out.extend_from_slice(&section.data);
            }
            for reloc in &section.relocs {
                out.write(reloc).unwrap();
            }
        }
        debug_assert_eq!(out.len(), symbol_table_off);
        out.extend_from_slice(&symbol_bytes);
        out.write((4 + string_table.len()) as u32).unwrap();
        out.extend_from_slice(&string_table);
        out
    }
}

/// Patches little-endian u32 fields inside a serialized object's section
/// data. The writers use this to store section-internal addends after
/// serialization.
pub fn patch_section_data(obj_data: &mut [u8], section_number: u32, patches: &[(u32, u32)]) {
    use crate::io::Reader;
    let mut read_ptr = &obj_data[..];
    let header: FileHeader = read_ptr.read().unwrap();
    debug_assert!(section_number >= 1 && section_number <= header.number_of_sections as u32);
    let mut section_header = SectionHeader::default();
    for _ in 0..section_number {
        section_header = read_ptr.read().unwrap();
    }
    let data_off = section_header.pointer_to_raw_data as usize;
    for &(field_off, value) in patches {
        let at = data_off + field_off as usize;
        obj_data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// The null object every link starts with: it donates a weak placeholder the
/// import machinery points thunk symbols at until the real import objects
/// are synthesized; a later regular definition replaces the weak one.
pub fn make_null_obj() -> Vec<u8> {
    let mut writer = ObjWriter::new(MachineType::Unknown);
    let tag = writer.push_undefined_static("*import-stub-tag*");
    writer.push_weak(IMPORT_STUB_SYMBOL, tag, WeakSearch::NoLibrary);
    writer.serialize()
}

/// `/INCLUDE` symbols become undefined references in a synthetic object so
/// archive members get pulled for them; the reloc-bearing zero section also
/// roots them for the garbage collector.
pub fn make_include_obj(symbols: &[String]) -> Vec<u8> {
    let mut writer = ObjWriter::new(MachineType::Unknown);
    let sect = writer.push_section(".lnkinc", SectionFlags::empty(), Vec::new());
    for name in symbols {
        let symbol = writer.push_undefined(name);
        writer.push_reloc(sect, 0, symbol, 0);
    }
    writer.serialize()
}

/// `/ALTERNATENAME:from=to` pairs become anti-dependency weak externals.
pub fn make_alt_names_obj(pairs: &[(String, String)]) -> Vec<u8> {
    let mut writer = ObjWriter::new(MachineType::Unknown);
    for (from, to) in pairs {
        let tag = writer.push_undefined(to);
        writer.push_weak(from, tag, WeakSearch::AntiDependency);
    }
    writer.serialize()
}

/// Linker-defined symbols. `__ImageBase` is absolute zero here; the
/// relocation patcher substitutes the real image base, which does not fit
/// the 32-bit symbol value.
pub fn make_linker_obj() -> Vec<u8> {
    let mut writer = ObjWriter::new(MachineType::Unknown);
    writer.push_absolute("__ImageBase", 0);
    writer.serialize()
}

pub const DEBUG_DIRECTORY_SECTION: &str = ".dbgdir";
pub const DEBUG_GUID_PDB_SYMBOL: &str = "__dbg_guid_pdb";
pub const DEBUG_GUID_RDI_SYMBOL: &str = "__dbg_guid_rdi";

const DEBUG_TYPE_CODEVIEW: u32 = 2;

/// One PE debug directory entry plus its signature blob. `sig` is `RSDS`
/// for PDB records and `RADI` for RDI records; the GUID slot is exported so
/// the finalizer can fold the image hash into it.
pub fn make_debug_directory_obj(
    machine: MachineType,
    sig: &[u8; 4],
    guid: [u8; 16],
    age: u32,
    time_stamp: u32,
    artifact_path: &str,
    guid_symbol: &str,
) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(sig);
    blob.extend_from_slice(&guid);
    blob.write(age).unwrap();
    blob.extend_from_slice(artifact_path.as_bytes());
    blob.push(0);
    let blob_size = blob.len() as u32;

    let mut writer = ObjWriter::new(machine);
    writer.set_time_stamp(time_stamp);

    let mut entry = Vec::new();
    entry.write(0u32).unwrap(); // characteristics
    entry.write(time_stamp).unwrap();
    entry.write(0u16).unwrap(); // major version
    entry.write(0u16).unwrap(); // minor version
    entry.write(DEBUG_TYPE_CODEVIEW).unwrap();
    entry.write(blob_size).unwrap();
    entry.write(0u32).unwrap(); // voff, relocated below
    entry.write(0u32).unwrap(); // foff, patched by the finalizer

    let dir = writer.push_section(
        DEBUG_DIRECTORY_SECTION,
        crate::pe::section_flags::RDATA,
        entry,
    );
    let data = writer.push_section(".dbgdata", crate::pe::section_flags::RDATA, blob);
    let blob_symbol = writer.push_static(data, "$dbgblob", 0);
    writer.push_reloc(dir, 20, blob_symbol, crate::coff::reloc::x64::ADDR32NB);
    // GUID sits right after the 4-byte signature
    writer.push_external(data, guid_symbol, 4, false);
    writer.serialize()
}
