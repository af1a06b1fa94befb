//! Parsed view over a COFF object file (small and big-obj variants).

use log::warn;

use crate::containers::Table;
use crate::error::{Result, SolderError};
use crate::io::{read_at, ReadData, Reader};

use super::reloc::Reloc;
use super::symbol::{
    interp_symbol, storage_class, AuxSectionDefinition, AuxWeakExternal, ComdatSelect,
    SymbolInterp, SymbolRecord,
};
use super::{BigObjHeader, MachineType, SectionFlags, SectionHeader};

/// A symbol record with its name resolved and its auxiliary records decoded.
/// Occupies one slot in [`ObjectFile::symbols`]; auxiliary slots are `None`.
#[derive(Clone, Debug)]
pub struct ParsedSymbol {
    pub name: String,
    pub value: u32,
    pub section_number: i32,
    pub type_: u16,
    pub storage_class: u8,
    pub aux_count: u8,
    /// Present iff `storage_class` is `WEAK_EXTERNAL`.
    pub weak: Option<AuxWeakExternal>,
}

impl ParsedSymbol {
    pub fn interp(&self) -> SymbolInterp {
        interp_symbol(self.section_number, self.value, self.storage_class)
    }

    pub fn is_function(&self) -> bool {
        self.type_ & 0xF0 == super::symbol::SYM_DTYPE_FUNCTION
    }
}

/// COMDAT properties of one object section.
#[derive(Clone, Debug)]
pub struct ComdatInfo {
    pub selection: ComdatSelect,
    pub length: u32,
    pub check_sum: u32,
    /// Symbol-table index of the external symbol that leads this COMDAT;
    /// the name collisions in the symbol table are fought under this name.
    pub leader_symbol: Option<u32>,
}

#[derive(Debug)]
pub struct ObjectFile {
    pub data: Vec<u8>,
    pub machine: MachineType,
    pub is_big_obj: bool,
    pub time_date_stamp: u32,
    pub sections: Vec<SectionHeader>,
    /// Resolved section names, parallel to `sections`.
    pub section_names: Vec<String>,
    /// One slot per symbol-table record; auxiliary records are `None`.
    pub symbols: Vec<Option<ParsedSymbol>>,
    /// Relocations per section, parallel to `sections`.
    pub relocs: Vec<Vec<Reloc>>,
    /// COMDAT properties per section, parallel to `sections`.
    pub comdat: Vec<Option<ComdatInfo>>,
    /// `associated[n]` lists the one-based section numbers that follow
    /// section number `n` (COMDAT `ASSOCIATIVE`). Index 0 is unused.
    pub associated: Vec<Vec<u32>>,
}

impl ObjectFile {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let is_big_obj = BigObjHeader::sniff(&data);

        let (machine, time_date_stamp, section_count, symbol_table_off, symbol_count, header_size) =
            if is_big_obj {
                let header = BigObjHeader::read(&mut data.as_slice())?;
                if header.version < BigObjHeader::MIN_VERSION {
                    return Err(SolderError::invalid_object_format(
                        "unsupported big obj version",
                    ));
                }
                (
                    header.machine,
                    header.time_date_stamp,
                    header.number_of_sections as usize,
                    header.pointer_to_symbol_table as usize,
                    header.number_of_symbols as usize,
                    BigObjHeader::SIZE,
                )
            } else {
                let header = super::FileHeader::read(&mut data.as_slice())?;
                if header.size_of_optional_header != 0 {
                    return Err(SolderError::invalid_object_format(
                        "object carries an optional header",
                    ));
                }
                (
                    header.machine,
                    header.time_date_stamp,
                    header.number_of_sections as usize,
                    header.pointer_to_symbol_table as usize,
                    header.number_of_symbols as usize,
                    super::FileHeader::SIZE,
                )
            };

        // section table
        let sections = {
            let mut read_ptr = read_at(&data, header_size, section_count * SectionHeader::SIZE)?;
            Table::<SectionHeader>::new_linear(&mut read_ptr, section_count)?.0
        };

        // string table follows the symbol table; first 4 bytes are its size
        let symbol_record_size = SymbolRecord::size(is_big_obj);
        let string_table_off = symbol_table_off + symbol_count * symbol_record_size;
        let string_table: &[u8] = if string_table_off + 4 <= data.len() {
            &data[string_table_off..]
        } else {
            &[]
        };

        let section_names: Vec<String> = sections
            .iter()
            .map(|header| header.name_str(string_table))
            .collect();

        // symbol table with auxiliary records decoded in place
        let mut symbols: Vec<Option<ParsedSymbol>> = Vec::with_capacity(symbol_count);
        let mut comdat: Vec<Option<ComdatInfo>> = vec![None; section_count];
        let mut associated: Vec<Vec<u32>> = vec![Vec::new(); section_count + 1];
        {
            let mut read_ptr = read_at(&data, symbol_table_off, symbol_count * symbol_record_size)?;
            let mut symbol_idx = 0usize;
            while symbol_idx < symbol_count {
                let record = SymbolRecord::read(&mut read_ptr, is_big_obj)?;
                let aux_count = record
                    .number_of_aux_symbols
                    .min((symbol_count - symbol_idx - 1) as u8);
                let name = record.name_str(string_table);

                let mut weak = None;
                let mut aux_left = aux_count as usize;
                if record.storage_class == storage_class::WEAK_EXTERNAL && aux_left > 0 {
                    weak = Some(AuxWeakExternal::read(&mut read_ptr, is_big_obj)?);
                    aux_left -= 1;
                } else if record.storage_class == storage_class::STATIC
                    && aux_left > 0
                    && record.section_number > 0
                    && (record.section_number as usize) <= section_count
                    && name == section_names[record.section_number as usize - 1]
                {
                    // section-definition aux on the section symbol
                    let defn = AuxSectionDefinition::read(&mut read_ptr, is_big_obj)?;
                    aux_left -= 1;

                    let sect_idx = record.section_number as usize - 1;
                    let flags = sections[sect_idx].characteristics;
                    if flags.contains(SectionFlags::LNK_COMDAT) {
                        match ComdatSelect::from_u8(defn.selection) {
                            Some(ComdatSelect::Associative) => {
                                let target = defn.number as usize;
                                if target >= 1 && target <= section_count {
                                    associated[target].push(record.section_number as u32);
                                } else {
                                    warn!(
                                        "associative section {} names bad section number {}",
                                        record.section_number, defn.number
                                    );
                                }
                            }
                            Some(selection) => {
                                comdat[sect_idx] = Some(ComdatInfo {
                                    selection,
                                    length: defn.length,
                                    check_sum: defn.check_sum,
                                    leader_symbol: None,
                                });
                            }
                            None => {
                                warn!(
                                    "section {} has unknown COMDAT selection {}",
                                    record.section_number, defn.selection
                                );
                            }
                        }
                    }
                }
                for _ in 0..aux_left {
                    read_ptr.read_slice(symbol_record_size)?;
                }

                symbols.push(Some(ParsedSymbol {
                    name,
                    value: record.value,
                    section_number: record.section_number,
                    type_: record.type_,
                    storage_class: record.storage_class,
                    aux_count,
                    weak,
                }));
                for _ in 0..aux_count {
                    symbols.push(None);
                }
                symbol_idx += 1 + aux_count as usize;
            }
        }

        // COMDAT leaders: first external symbol defined inside the section
        for (symbol_idx, symbol) in symbols.iter().enumerate() {
            let Some(symbol) = symbol else { continue };
            if symbol.storage_class != storage_class::EXTERNAL {
                continue;
            }
            if symbol.interp() != SymbolInterp::Regular {
                continue;
            }
            let sect_idx = symbol.section_number as usize - 1;
            if let Some(info) = comdat.get_mut(sect_idx).and_then(|c| c.as_mut()) {
                if info.leader_symbol.is_none() {
                    info.leader_symbol = Some(symbol_idx as u32);
                }
            }
        }

        // relocations
        let mut relocs = Vec::with_capacity(section_count);
        for header in &sections {
            relocs.push(Self::parse_relocs(&data, header)?);
        }

        Ok(Self {
            data,
            machine,
            is_big_obj,
            time_date_stamp,
            sections,
            section_names,
            symbols,
            relocs,
            comdat,
            associated,
        })
    }

    fn parse_relocs(data: &[u8], header: &SectionHeader) -> Result<Vec<Reloc>> {
        let mut count = header.number_of_relocations as usize;
        let mut off = header.pointer_to_relocations as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        // extended count lives in the first record's apply_off
        if count == 0xFFFF
            && header
                .characteristics
                .contains(SectionFlags::LNK_NRELOC_OVFL)
        {
            let first = Reloc::read(&mut read_at(data, off, Reloc::SIZE)?)?;
            count = first.apply_off as usize - 1;
            off += Reloc::SIZE;
        }
        let mut read_ptr = read_at(data, off, count * Reloc::SIZE)?;
        Ok(Table::<Reloc>::new_linear(&mut read_ptr, count)?.0)
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Iterates main symbol records with their table indices.
    pub fn iter_symbols(&self) -> impl Iterator<Item = (u32, &ParsedSymbol)> {
        self.symbols
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|symbol| (idx as u32, symbol)))
    }

    pub fn symbol(&self, symbol_idx: u32) -> Option<&ParsedSymbol> {
        self.symbols.get(symbol_idx as usize)?.as_ref()
    }

    /// Raw bytes of a section, or `None` for uninitialized data.
    pub fn section_data(&self, sect_idx: usize) -> Option<&[u8]> {
        let header = &self.sections[sect_idx];
        if header
            .characteristics
            .contains(SectionFlags::CNT_UNINITIALIZED_DATA)
            || header.pointer_to_raw_data == 0
        {
            return None;
        }
        let start = header.pointer_to_raw_data as usize;
        let end = start + header.size_of_raw_data as usize;
        self.data.get(start..end)
    }

    /// Debug sections never contribute to the image layout.
    pub fn is_debug_section(&self, sect_idx: usize) -> bool {
        self.section_names[sect_idx].starts_with(".debug")
    }

    /// Contents of the `.drectve` section, if any.
    pub fn directive_data(&self) -> Option<&[u8]> {
        let sect_idx = self
            .section_names
            .iter()
            .position(|name| name == ".drectve")?;
        if !self.sections[sect_idx]
            .characteristics
            .contains(SectionFlags::LNK_INFO)
        {
            return None;
        }
        self.section_data(sect_idx)
    }

    /// COMDAT properties of a one-based section number.
    pub fn comdat_props(&self, section_number: i32) -> Option<&ComdatInfo> {
        if section_number < 1 {
            return None;
        }
        self.comdat.get(section_number as usize - 1)?.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::synth::ObjWriter;

    #[test]
    fn parse_writer_output() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let text = writer.push_section(".text$mn", SectionFlags::CNT_CODE, vec![0x90; 16]);
        let target = writer.push_undefined("callee");
        writer.push_reloc(text, 4, target, crate::coff::reloc::x64::REL32);
        writer.push_external(text, "caller", 0, true);
        let data = writer.serialize();

        let object = ObjectFile::parse(data).unwrap();
        assert_eq!(object.machine, MachineType::Amd64);
        assert_eq!(object.section_count(), 1);
        assert_eq!(object.section_names[0], ".text$mn");
        assert_eq!(object.relocs[0].len(), 1);
        assert_eq!(object.relocs[0][0].apply_off, 4);

        let caller = object
            .iter_symbols()
            .find(|(_, symbol)| symbol.name == "caller")
            .unwrap()
            .1;
        assert_eq!(caller.interp(), SymbolInterp::Regular);
        let callee = object
            .iter_symbols()
            .find(|(_, symbol)| symbol.name == "callee")
            .unwrap()
            .1;
        assert_eq!(callee.interp(), SymbolInterp::Undefined);
    }

    #[test]
    fn parse_comdat_sections() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let text = writer.push_comdat_section(
            ".text$mn",
            SectionFlags::CNT_CODE,
            vec![0xC3; 8],
            ComdatSelect::Any,
        );
        writer.push_external(text, "inline_fn", 0, true);
        let assoc =
            writer.push_associative_section(".xdata", SectionFlags::CNT_INITIALIZED_DATA, vec![0; 4], text);
        let data = writer.serialize();

        let object = ObjectFile::parse(data).unwrap();
        let info = object.comdat_props(1).unwrap();
        assert_eq!(info.selection, ComdatSelect::Any);
        assert_eq!(info.length, 8);
        let leader = object.symbol(info.leader_symbol.unwrap()).unwrap();
        assert_eq!(leader.name, "inline_fn");
        // the associative section follows the COMDAT leader section
        assert_eq!(object.associated[1], vec![assoc.number()]);
        assert!(object.comdat_props(assoc.number() as i32).is_none());
    }

    #[test]
    fn weak_external_aux() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let strong = writer.push_undefined("strong_impl");
        writer.push_weak("weak_fn", strong, crate::coff::symbol::WeakSearch::SearchAlias);
        let data = writer.serialize();

        let object = ObjectFile::parse(data).unwrap();
        let weak = object
            .iter_symbols()
            .find(|(_, symbol)| symbol.name == "weak_fn")
            .unwrap()
            .1;
        assert_eq!(weak.interp(), SymbolInterp::Weak);
        let aux = weak.weak.as_ref().unwrap();
        assert_eq!(aux.tag_index, strong);
        assert_eq!(
            aux.characteristics,
            crate::coff::symbol::WeakSearch::SearchAlias
        );
    }
}
