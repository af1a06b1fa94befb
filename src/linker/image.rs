//! The image finalizer: DOS stub, PE signature, COFF file header, optional
//! header, data directory array and section table; then the post-fill pass
//! that patches data directory entries, the checksum and the image GUID.

use log::warn;

use crate::coff::{MachineType, SectionFlags, SectionHeader};
use crate::io::Writer;
use crate::pe::dos::{ImageDosHeader, DOS_PROGRAM};
use crate::pe::optional_header::{ImageDataDirectory, OptionalHeader, OptionalHeaderMagic};
use crate::pe::{
    has_plus_header, DataDirectoryName, FileCharacteristics, PE_SIGNATURE,
};

use super::config::Config;
use super::imports::{null_thunk_symbol, NULL_DELAY_IMPORT_DESCRIPTOR, NULL_IMPORT_DESCRIPTOR};
use super::layout::{align_up, Layout};
use super::objects::{patched_loc, Obj, PatchedLoc};
use super::session::{DiagKind, Session};
use super::symtab::{SymbolScope, SymbolTable};
use super::synth::{DEBUG_DIRECTORY_SECTION, DEBUG_GUID_PDB_SYMBOL, DEBUG_GUID_RDI_SYMBOL};

pub const TLS_SYMBOL_NAME: &str = "_tls_used";
pub const LOAD_CONFIG_SYMBOL_NAME: &str = "_load_config_used";

pub struct HeaderInfo {
    pub e_lfanew: usize,
    pub optional_header_off: usize,
    pub data_directories_off: usize,
    pub check_sum_off: usize,
    pub size: usize,
}

/// Unaligned size of the image headers for `sect_count` sections.
pub fn image_header_size(config: &Config, sect_count: usize) -> u64 {
    let optional = if has_plus_header(config.machine) {
        OptionalHeader::SIZE_PE32_PLUS
    } else {
        OptionalHeader::SIZE_PE32
    };
    (ImageDosHeader::SIZE
        + DOS_PROGRAM.len()
        + PE_SIGNATURE.len()
        + crate::coff::FileHeader::SIZE
        + optional
        + crate::pe::DATA_DIRECTORY_COUNT * ImageDataDirectory::SIZE
        + sect_count * SectionHeader::SIZE) as u64
}

/// Final `(voff, foff)` of a defined symbol, through its patch cell.
pub fn symbol_addr(
    symtab: &SymbolTable,
    objs: &[Obj],
    layout: &Layout,
    name: &str,
) -> Option<(u64, u64)> {
    let symbol = symtab.search(SymbolScope::Defined, name)?;
    let (obj_idx, symbol_idx) = symbol.defined();
    match patched_loc(&objs[obj_idx as usize], symbol_idx)? {
        PatchedLoc::Image {
            section_number,
            off,
        } => {
            let (voff, foff) = layout.section_addr(section_number)?;
            Some((voff + off as u64, foff + off as u64))
        }
        _ => None,
    }
}

/// Serializes every header into the front of `image`.
pub fn write_headers(
    image: &mut [u8],
    session: &Session,
    config: &Config,
    layout: &Layout,
    objs: &[Obj],
    symtab: &SymbolTable,
) -> HeaderInfo {
    let live = layout.live_sections();
    let is_plus = has_plus_header(config.machine);

    // size classification over the live sections
    let mut code_base = 0u64;
    let mut sizeof_code = 0u64;
    let mut sizeof_inited = 0u64;
    let mut sizeof_uninited = 0u64;
    for section in &live {
        if code_base == 0 && section.flags.contains(SectionFlags::CNT_CODE) {
            code_base = section.voff;
        }
        if section.flags.contains(SectionFlags::CNT_UNINITIALIZED_DATA) {
            sizeof_uninited += section.vsize;
        }
        if section.flags.contains(SectionFlags::CNT_CODE) {
            sizeof_code += section.fsize;
        }
        if section
            .flags
            .intersects(SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::CNT_CODE)
        {
            sizeof_inited += section.fsize;
        }
    }

    let header_size = image_header_size(config, live.len());
    let entry_point_va = config
        .entry_point_name
        .as_deref()
        .and_then(|name| symbol_addr(symtab, objs, layout, name))
        .map(|(voff, _)| voff)
        .unwrap_or(0);

    let mut dll_characteristics = config.dll_characteristics;
    if config.guard_cf {
        dll_characteristics |= crate::pe::DllCharacteristics::GUARD_CF;
    }

    let mut file_characteristics = config.file_characteristics;
    if config.is_large_address_aware() {
        file_characteristics |= FileCharacteristics::LARGE_ADDRESS_AWARE;
    }
    if config.machine.word_size() == 4 {
        file_characteristics |= FileCharacteristics::FOR_32BIT_MACHINE;
    }
    if config.fixed {
        file_characteristics |= FileCharacteristics::RELOCS_STRIPPED;
    }

    let subsystem_ver = config.subsystem_ver.unwrap_or((6, 0));
    let optional_header = OptionalHeader {
        magic: if is_plus {
            OptionalHeaderMagic::Pe32Plus
        } else {
            OptionalHeaderMagic::Pe32
        },
        major_linker_version: config.link_ver.0,
        minor_linker_version: config.link_ver.1,
        size_of_code: align_up(sizeof_code, config.file_align as u64) as u32,
        size_of_initialized_data: align_up(sizeof_inited, config.file_align as u64) as u32,
        size_of_uninitialized_data: align_up(sizeof_uninited, config.file_align as u64) as u32,
        address_of_entry_point: entry_point_va as u32,
        base_of_code: code_base as u32,
        base_of_data: 0,
        image_base: config.base_addr(),
        section_alignment: config.sect_align,
        file_alignment: config.file_align,
        major_operating_system_version: config.os_ver.0,
        minor_operating_system_version: config.os_ver.1,
        major_image_version: config.image_ver.0,
        minor_image_version: config.image_ver.1,
        major_subsystem_version: subsystem_ver.0,
        minor_subsystem_version: subsystem_ver.1,
        win32_version_value: 0, // MSVC writes zero
        size_of_image: align_up(layout.image_virtual_size(), config.sect_align as u64) as u32,
        size_of_headers: align_up(header_size, config.file_align as u64) as u32,
        check_sum: 0,
        subsystem: config.subsystem,
        dll_characteristics,
        size_of_stack_reserve: config.stack_reserve,
        size_of_stack_commit: config.stack_commit,
        size_of_heap_reserve: config.heap_reserve,
        size_of_heap_commit: config.heap_commit,
        loader_flags: 0,
        number_of_rva_and_sizes: crate::pe::DATA_DIRECTORY_COUNT as u32,
        data_directories: Default::default(),
    };

    let mut out: Vec<u8> = Vec::with_capacity(header_size as usize);
    out.write(&ImageDosHeader::for_stub()).unwrap();
    out.extend_from_slice(&DOS_PROGRAM);
    let e_lfanew = out.len();
    out.extend_from_slice(&PE_SIGNATURE);

    let optional_size = optional_header.size();
    out.write(&crate::coff::FileHeader {
        machine: config.machine,
        number_of_sections: live.len() as u16,
        time_date_stamp: config.time_stamp,
        pointer_to_symbol_table: 0,
        number_of_symbols: 0,
        size_of_optional_header: optional_size as u16,
        characteristics: file_characteristics.bits(),
    })
    .unwrap();

    let optional_header_off = out.len();
    out.write(&optional_header).unwrap();

    for section in &live {
        if section.name.len() > 8 {
            session.error(
                DiagKind::LongSectionName,
                format!(
                    "not enough space in the section header to store \"{}\"",
                    section.name
                ),
            );
            warn!("section name {} truncated to 8 bytes", section.name);
        }
        let mut row = SectionHeader {
            virtual_size: section.vsize as u32,
            virtual_address: section.voff as u32,
            size_of_raw_data: section.fsize as u32,
            pointer_to_raw_data: if section.is_uninitialized() {
                0
            } else {
                section.foff as u32
            },
            characteristics: section.flags,
            ..Default::default()
        };
        row.set_name_short(&section.name);
        out.write(&row).unwrap();
    }

    debug_assert_eq!(out.len(), header_size as usize);
    image[..out.len()].copy_from_slice(&out);

    let base_optional = optional_header_off;
    HeaderInfo {
        e_lfanew,
        optional_header_off: base_optional,
        data_directories_off: base_optional
            + if is_plus {
                OptionalHeader::SIZE_PE32_PLUS
            } else {
                OptionalHeader::SIZE_PE32
            },
        check_sum_off: base_optional + OptionalHeader::CHECK_SUM_OFFSET,
        size: out.len(),
    }
}

fn set_data_directory(
    image: &mut [u8],
    header: &HeaderInfo,
    name: DataDirectoryName,
    voff: u64,
    size: u64,
) {
    let at = header.data_directories_off + name as usize * ImageDataDirectory::SIZE;
    image[at..at + 4].copy_from_slice(&(voff as u32).to_le_bytes());
    image[at + 4..at + 8].copy_from_slice(&(size as u32).to_le_bytes());
}

fn read_u32(image: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(image[at..at + 4].try_into().unwrap())
}

/// First-contribution VOFF and the span of a live section's contributions.
fn section_window(layout: &Layout, name: &str) -> Option<(u64, u64)> {
    let sect_idx = layout.find_live_by_name(name)?;
    let section = &layout.sections[sect_idx];
    let first = section.first_contrib()?;
    Some((section.voff + first.off, section.contrib_span()))
}

/// Patches the data directory entries after the image is filled and
/// relocated.
pub fn patch_data_directories(
    image: &mut [u8],
    header: &HeaderInfo,
    config: &Config,
    layout: &Layout,
    objs: &[Obj],
    symtab: &SymbolTable,
) {
    // load config: directory covers the structure, whose first field is its
    // own size
    if let Some((voff, foff)) = symbol_addr(symtab, objs, layout, LOAD_CONFIG_SYMBOL_NAME) {
        if foff as usize + 4 <= image.len() {
            let size = read_u32(image, foff as usize);
            set_data_directory(
                image,
                header,
                DataDirectoryName::LoadConfigTable,
                voff,
                size as u64,
            );
        }
    }

    // exceptions: sort the x64 RUNTIME_FUNCTION entries by begin address
    if let Some((voff, size)) = section_window(layout, ".pdata") {
        if config.machine == MachineType::Amd64 {
            if let Some(sect_idx) = layout.find_live_by_name(".pdata") {
                let section = &layout.sections[sect_idx];
                let first_off = section.first_contrib().map(|c| c.off).unwrap_or(0);
                let start = (section.foff + first_off) as usize;
                let end = start + size as usize;
                sort_pdata(&mut image[start..end]);
            }
        }
        set_data_directory(image, header, DataDirectoryName::ExceptionTable, voff, size);
    }

    if let Some((voff, size)) = section_window(layout, ".edata") {
        set_data_directory(image, header, DataDirectoryName::ExportTable, voff, size);
    }

    if let Some((voff, size)) = section_window(layout, ".reloc") {
        set_data_directory(
            image,
            header,
            DataDirectoryName::BaseRelocationTable,
            voff,
            size,
        );
    }

    // import directory: from the first descriptor up to the null descriptor;
    // import address table: from the first IAT slot to the null thunk
    if let Some((idata_voff, _)) = section_window(layout, ".idata") {
        let null_desc = symbol_addr(symtab, objs, layout, NULL_IMPORT_DESCRIPTOR);
        let null_thunk = symbol_addr(
            symtab,
            objs,
            layout,
            &null_thunk_symbol(config.image_file_name(), false),
        );
        if let Some((null_desc_voff, _)) = null_desc {
            set_data_directory(
                image,
                header,
                DataDirectoryName::ImportTable,
                idata_voff,
                null_desc_voff - idata_voff,
            );
        }
        if let Some((null_thunk_voff, _)) = null_thunk {
            // the first descriptor records where the address table begins
            if let Some(sect_idx) = layout.find_live_by_name(".idata") {
                let section = &layout.sections[sect_idx];
                if let Some(first) = section.first_contrib() {
                    let first_desc_foff = (section.foff + first.off) as usize;
                    let iat_voff = read_u32(image, first_desc_foff + 16) as u64;
                    if iat_voff != 0 {
                        let size = null_thunk_voff + config.machine.word_size() - iat_voff;
                        set_data_directory(image, header, DataDirectoryName::Iat, iat_voff, size);
                    }
                }
            }
        }
    }

    if let Some((voff, size)) = section_window(layout, ".didat") {
        if symtab
            .search(SymbolScope::Defined, NULL_DELAY_IMPORT_DESCRIPTOR)
            .is_some()
        {
            set_data_directory(
                image,
                header,
                DataDirectoryName::DelayImportDescriptor,
                voff,
                size,
            );
        }
    }

    // TLS: the directory points at `_tls_used`; the template's alignment is
    // folded into the header's characteristics field
    if let Some((voff, foff)) = symbol_addr(symtab, objs, layout, TLS_SYMBOL_NAME) {
        let is_tls64 = config.machine.word_size() == 8;
        let tls_header_size: u64 = if is_tls64 { 40 } else { 24 };
        if let Some(sect_idx) = layout.find_live_by_name(".tls") {
            let mut tls_align = 0u32;
            for contrib in layout.sections[sect_idx].iter_contribs() {
                tls_align = tls_align.max(contrib.align);
            }
            if tls_align > 0 {
                let characteristics_off =
                    foff as usize + if is_tls64 { 36 } else { 20 };
                let current = read_u32(image, characteristics_off);
                let flags = SectionFlags::from_align(tls_align).bits();
                image[characteristics_off..characteristics_off + 4]
                    .copy_from_slice(&(current | flags).to_le_bytes());
            }
        }
        set_data_directory(
            image,
            header,
            DataDirectoryName::TlsTable,
            voff,
            tls_header_size,
        );
    }

    // debug directories: patch each entry's file offset from its voff
    if let Some((voff, size)) = section_window(layout, DEBUG_DIRECTORY_SECTION) {
        set_data_directory(image, header, DataDirectoryName::Debug, voff, size);
        if let Some(sect_idx) = layout.find_live_by_name(DEBUG_DIRECTORY_SECTION) {
            let section = &layout.sections[sect_idx];
            let first_off = section.first_contrib().map(|c| c.off).unwrap_or(0);
            let begin = (section.foff + first_off) as usize;
            let end = begin + size as usize;
            const ENTRY_SIZE: usize = 28;
            let mut cursor = begin;
            while cursor + ENTRY_SIZE <= end {
                let entry_voff = read_u32(image, cursor + 20) as u64;
                for live in layout.live_sections() {
                    if entry_voff >= live.voff && entry_voff < live.voff + live.vsize {
                        let entry_foff = live.foff + (entry_voff - live.voff);
                        image[cursor + 24..cursor + 28]
                            .copy_from_slice(&(entry_foff as u32).to_le_bytes());
                    }
                }
                cursor += ENTRY_SIZE;
            }
        }
    }

    if let Some((voff, size)) = section_window(layout, ".rsrc") {
        set_data_directory(image, header, DataDirectoryName::ResourceTable, voff, size);
    }
}

/// x64 `.pdata` is an array of 12-byte RUNTIME_FUNCTION records the loader
/// binary-searches; sort by begin address.
fn sort_pdata(pdata: &mut [u8]) {
    let count = pdata.len() / 12;
    let mut entries: Vec<[u8; 12]> = (0..count)
        .map(|entry_idx| pdata[entry_idx * 12..entry_idx * 12 + 12].try_into().unwrap())
        .collect();
    entries.sort_by_key(|entry| u32::from_le_bytes(entry[0..4].try_into().unwrap()));
    for (entry_idx, entry) in entries.iter().enumerate() {
        pdata[entry_idx * 12..entry_idx * 12 + 12].copy_from_slice(entry);
    }
}

/// `/RELEASE` checksum and the blake3 image GUID folded into the debug
/// directory blobs.
pub fn finalize_checksum_and_guid(
    image: &mut [u8],
    header: &HeaderInfo,
    config: &Config,
    layout: &Layout,
    objs: &[Obj],
    symtab: &SymbolTable,
) {
    let guid_targets: Vec<u64> = [DEBUG_GUID_PDB_SYMBOL, DEBUG_GUID_RDI_SYMBOL]
        .iter()
        .filter_map(|name| symbol_addr(symtab, objs, layout, name).map(|(_, foff)| foff))
        .collect();
    if !guid_targets.is_empty() {
        let hash = blake3::hash(image);
        let guid: [u8; 16] = hash.as_bytes()[..16].try_into().unwrap();
        for foff in guid_targets {
            let at = foff as usize;
            image[at..at + 16].copy_from_slice(&guid);
        }
    }

    if config.write_checksum {
        let check_sum = crate::pe::checksum::compute(image, header.check_sum_off);
        image[header.check_sum_off..header.check_sum_off + 4]
            .copy_from_slice(&check_sum.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdata_sorts_by_begin_address() {
        let mut pdata = Vec::new();
        for begin in [0x3000u32, 0x1000, 0x2000] {
            pdata.extend_from_slice(&begin.to_le_bytes());
            pdata.extend_from_slice(&(begin + 0x10).to_le_bytes());
            pdata.extend_from_slice(&0xAAAA_AAAAu32.to_le_bytes());
        }
        sort_pdata(&mut pdata);
        let begins: Vec<u32> = (0..3)
            .map(|i| u32::from_le_bytes(pdata[i * 12..i * 12 + 4].try_into().unwrap()))
            .collect();
        assert_eq!(begins, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn header_size_accounts_for_sections() {
        let config = Config {
            machine: MachineType::Amd64,
            ..Default::default()
        };
        let base = image_header_size(&config, 0);
        assert_eq!(
            image_header_size(&config, 3),
            base + 3 * SectionHeader::SIZE as u64
        );
        // dos (64) + stub (64) + sig (4) + file header (20) + optional (112)
        // + 16 directories (128)
        assert_eq!(base, 64 + 64 + 4 + 20 + 112 + 128);
    }
}
