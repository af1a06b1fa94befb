//! `.res` files in, one `.rsrc` object out. The three-level resource
//! directory (type, name, language) is serialized into `.rsrc$01`; the data
//! blobs land in `.rsrc$02` and are referenced through address relocations.

use std::collections::BTreeMap;

use crate::coff::reloc::x64;
use crate::coff::{MachineType, SectionFlags};
use crate::error::{Result, SolderError};
use crate::io::{Reader, Writer};
use crate::pe::section_flags;

use super::synth::{patch_section_data, ObjWriter};

pub const RT_MANIFEST: u16 = 24;

/// A resource identifier: numbered, or a UTF-16 name. Named entries sort
/// before numbered ones inside a directory, per the PE format.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResId {
    Name(Vec<u16>),
    Num(u16),
}

#[derive(Clone, Debug)]
pub struct ResEntry {
    pub type_: ResId,
    pub name: ResId,
    pub language: u16,
    pub data: Vec<u8>,
}

/// A `.res` file begins with an empty 32-byte null entry.
pub fn is_res(data: &[u8]) -> bool {
    data.len() >= 8 && data[0..4] == [0, 0, 0, 0] && data[4..8] == [32, 0, 0, 0]
}

fn read_res_id(read_ptr: &mut &[u8]) -> Result<ResId> {
    let first: u16 = read_ptr.read()?;
    if first == 0xFFFF {
        return Ok(ResId::Num(read_ptr.read()?));
    }
    let mut chars = Vec::new();
    let mut ch = first;
    while ch != 0 {
        chars.push(ch);
        ch = read_ptr.read()?;
    }
    Ok(ResId::Name(chars))
}

pub fn parse_res(data: &[u8]) -> Result<Vec<ResEntry>> {
    if !is_res(data) {
        return Err(SolderError::invalid_image_format("not a RES file"));
    }
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor + 8 <= data.len() {
        let mut read_ptr = &data[cursor..];
        let data_size: u32 = read_ptr.read()?;
        let header_size: u32 = read_ptr.read()?;
        if header_size < 16 {
            return Err(SolderError::invalid_image_format("bad RES header size"));
        }

        if data_size != 0 {
            let type_ = read_res_id(&mut read_ptr)?;
            let name = read_res_id(&mut read_ptr)?;
            // ids are 4-aligned relative to the entry start
            let consumed = data.len() - cursor - read_ptr.len();
            if consumed % 4 != 0 {
                read_ptr.read_slice(4 - consumed % 4)?;
            }
            let _data_version: u32 = read_ptr.read()?;
            let _memory_flags: u16 = read_ptr.read()?;
            let language: u16 = read_ptr.read()?;
            let _version: u32 = read_ptr.read()?;
            let _characteristics: u32 = read_ptr.read()?;

            let body = crate::io::read_at(data, cursor + header_size as usize, data_size as usize)?;
            entries.push(ResEntry {
                type_,
                name,
                language,
                data: body.to_vec(),
            });
        }

        let mut advance = (header_size + data_size) as usize;
        advance += advance.wrapping_neg() & 3;
        cursor += advance;
    }
    Ok(entries)
}

type ResTree = BTreeMap<ResId, BTreeMap<ResId, BTreeMap<u16, usize>>>;

const DIR_HEADER_SIZE: usize = 16;
const DIR_ENTRY_SIZE: usize = 8;
const DATA_ENTRY_SIZE: usize = 16;
const SUBDIR_FLAG: u32 = 0x8000_0000;

/// Serializes the resource tree into one object: `.rsrc$01` holds the
/// directory tables, data entries and name strings; `.rsrc$02` the blobs.
pub fn make_rsrc_obj(machine: MachineType, time_stamp: u32, entries: &[ResEntry]) -> Vec<u8> {
    let mut tree: ResTree = BTreeMap::new();
    for (entry_idx, entry) in entries.iter().enumerate() {
        tree.entry(entry.type_.clone())
            .or_default()
            .entry(entry.name.clone())
            .or_default()
            .insert(entry.language, entry_idx);
    }

    // region layout inside .rsrc$01: directories, data entries, names
    let type_count = tree.len();
    let name_dir_count: usize = tree.values().map(BTreeMap::len).sum();
    let leaf_count: usize = tree
        .values()
        .flat_map(BTreeMap::values)
        .map(BTreeMap::len)
        .sum();

    let dirs_size = (1 + type_count + name_dir_count) * DIR_HEADER_SIZE
        + (type_count + name_dir_count + leaf_count) * DIR_ENTRY_SIZE;
    let data_entries_off = dirs_size;
    let names_off = data_entries_off + leaf_count * DATA_ENTRY_SIZE;

    // intern name strings: u16 length followed by the characters
    let mut names_blob: Vec<u8> = Vec::new();
    let mut name_off = |chars: &[u16], blob: &mut Vec<u8>| -> u32 {
        let off = (names_off + blob.len()) as u32;
        blob.write(chars.len() as u16).unwrap();
        for &ch in chars {
            blob.write(ch).unwrap();
        }
        off
    };

    let mut dirs: Vec<u8> = Vec::with_capacity(dirs_size);
    let mut data_entries: Vec<u8> = Vec::with_capacity(leaf_count * DATA_ENTRY_SIZE);
    let mut blobs: Vec<u8> = Vec::new();
    let mut reloc_sites: Vec<(u32, u32)> = Vec::new(); // ($01 field off, $02 blob off)

    // directory offsets are computed before emission: root, then type
    // directories, then name directories, in tree order
    let mut dir_offsets: Vec<usize> = Vec::new();
    {
        let mut cursor = DIR_HEADER_SIZE + type_count * DIR_ENTRY_SIZE;
        for names in tree.values() {
            dir_offsets.push(cursor);
            cursor += DIR_HEADER_SIZE + names.len() * DIR_ENTRY_SIZE;
        }
        for names in tree.values() {
            for langs in names.values() {
                dir_offsets.push(cursor);
                cursor += DIR_HEADER_SIZE + langs.len() * DIR_ENTRY_SIZE;
            }
        }
        debug_assert_eq!(cursor, dirs_size);
    }

    let write_dir_header = |out: &mut Vec<u8>, named: usize, numbered: usize| {
        out.write(0u32).unwrap(); // characteristics
        out.write(0u32).unwrap(); // time stamp: MSVC writes zero
        out.write(0u32).unwrap(); // version
        out.write(named as u16).unwrap();
        out.write(numbered as u16).unwrap();
    };
    let id_field = |id: &ResId, names_blob: &mut Vec<u8>, name_off: &mut dyn FnMut(&[u16], &mut Vec<u8>) -> u32| match id {
        ResId::Name(chars) => SUBDIR_FLAG | name_off(chars, names_blob),
        ResId::Num(id) => *id as u32,
    };

    let named_count = |ids: &mut dyn Iterator<Item = &ResId>| -> (usize, usize) {
        let mut named = 0;
        let mut numbered = 0;
        for id in ids {
            match id {
                ResId::Name(_) => named += 1,
                ResId::Num(_) => numbered += 1,
            }
        }
        (named, numbered)
    };

    // root directory
    let (named, numbered) = named_count(&mut tree.keys());
    write_dir_header(&mut dirs, named, numbered);
    let mut type_dir_iter = dir_offsets.iter();
    for type_id in tree.keys() {
        let field = id_field(type_id, &mut names_blob, &mut name_off);
        dirs.write(field).unwrap();
        dirs.write(SUBDIR_FLAG | *type_dir_iter.next().unwrap() as u32)
            .unwrap();
    }

    // type directories
    let mut name_dir_iter = dir_offsets[type_count..].iter();
    for names in tree.values() {
        let (named, numbered) = named_count(&mut names.keys());
        write_dir_header(&mut dirs, named, numbered);
        for name_id in names.keys() {
            let field = id_field(name_id, &mut names_blob, &mut name_off);
            dirs.write(field).unwrap();
            dirs.write(SUBDIR_FLAG | *name_dir_iter.next().unwrap() as u32)
                .unwrap();
        }
    }

    // name directories point at data entries
    let mut leaf_idx = 0usize;
    for names in tree.values() {
        for langs in names.values() {
            write_dir_header(&mut dirs, 0, langs.len());
            for (&language, &entry_idx) in langs {
                dirs.write(language as u32).unwrap();
                let entry_off = data_entries_off + leaf_idx * DATA_ENTRY_SIZE;
                dirs.write(entry_off as u32).unwrap();

                // the data entry's rva field is relocated into .rsrc$02
                blobs.resize((blobs.len() + 7) & !7, 0);
                reloc_sites.push((entry_off as u32, blobs.len() as u32));
                let body = &entries[entry_idx].data;
                data_entries.write(0u32).unwrap(); // data rva, relocated
                data_entries.write(body.len() as u32).unwrap();
                data_entries.write(0u32).unwrap(); // codepage
                data_entries.write(0u32).unwrap(); // reserved
                blobs.extend_from_slice(body);

                leaf_idx += 1;
            }
        }
    }

    let mut table = dirs;
    table.extend_from_slice(&data_entries);
    table.extend_from_slice(&names_blob);

    let mut writer = ObjWriter::new(machine);
    writer.set_time_stamp(time_stamp);
    let dir_sect = writer.push_section(
        ".rsrc$01",
        section_flags::RSRC | SectionFlags::from_align(4),
        table,
    );
    let data_sect = writer.push_section(
        ".rsrc$02",
        section_flags::RSRC | SectionFlags::from_align(8),
        blobs,
    );
    let blob_root = writer.push_static(data_sect, "$resdata", 0);
    let mut addends = Vec::with_capacity(reloc_sites.len());
    for (field_off, blob_off) in reloc_sites {
        writer.push_reloc(dir_sect, field_off, blob_root, x64::ADDR32NB);
        addends.push((field_off, blob_off));
    }

    let mut data = writer.serialize();
    patch_section_data(&mut data, dir_sect.number(), &addends);
    data
}

/// Builds the synthetic manifest resource entry (`RT_MANIFEST`).
pub fn manifest_entry(resource_id: u16, xml: &str) -> ResEntry {
    ResEntry {
        type_: ResId::Num(RT_MANIFEST),
        name: ResId::Num(resource_id),
        language: 1033,
        data: xml.as_bytes().to_vec(),
    }
}

/// Serializes entries back into `.res` framing (used by tests and the
/// manifest round trip).
pub fn write_res(entries: &[ResEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    // leading null entry
    out.write(0u32).unwrap();
    out.write(32u32).unwrap();
    out.extend_from_slice(&[0u8; 24]);

    for entry in entries {
        let mut header = Vec::new();
        let write_id = |out: &mut Vec<u8>, id: &ResId| match id {
            ResId::Num(id) => {
                out.write(0xFFFFu16).unwrap();
                out.write(*id).unwrap();
            }
            ResId::Name(chars) => {
                for &ch in chars {
                    out.write(ch).unwrap();
                }
                out.write(0u16).unwrap();
            }
        };
        write_id(&mut header, &entry.type_);
        write_id(&mut header, &entry.name);
        if header.len() % 4 != 0 {
            header.write(0u16).unwrap();
        }
        header.write(0u32).unwrap(); // data version
        header.write(0x1030u16).unwrap(); // memory flags
        header.write(entry.language).unwrap();
        header.write(0u32).unwrap(); // version
        header.write(0u32).unwrap(); // characteristics

        out.write(entry.data.len() as u32).unwrap();
        out.write(8 + header.len() as u32).unwrap();
        out.extend_from_slice(&header);
        out.extend_from_slice(&entry.data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;

    fn utf16(text: &str) -> Vec<u16> {
        text.encode_utf16().collect()
    }

    #[test]
    fn res_round_trip() {
        let entries = vec![
            ResEntry {
                type_: ResId::Num(RT_MANIFEST),
                name: ResId::Num(1),
                language: 1033,
                data: b"<assembly/>".to_vec(),
            },
            ResEntry {
                type_: ResId::Name(utf16("CUSTOM")),
                name: ResId::Num(7),
                language: 0,
                data: vec![1, 2, 3, 4, 5],
            },
        ];
        let res = write_res(&entries);
        assert!(is_res(&res));
        let parsed = parse_res(&res).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].data, b"<assembly/>");
        assert_eq!(parsed[1].type_, ResId::Name(utf16("CUSTOM")));
        assert_eq!(parsed[1].language, 0);
    }

    #[test]
    fn rsrc_obj_directory_shape() {
        let entries = vec![
            ResEntry {
                type_: ResId::Num(RT_MANIFEST),
                name: ResId::Num(1),
                language: 1033,
                data: b"<assembly/>".to_vec(),
            },
            ResEntry {
                type_: ResId::Num(3),
                name: ResId::Num(2),
                language: 1033,
                data: vec![0xAB; 16],
            },
        ];
        let data = make_rsrc_obj(MachineType::Amd64, 0, &entries);
        let object = ObjectFile::parse(data).unwrap();
        assert_eq!(object.section_names, vec![".rsrc$01", ".rsrc$02"]);
        // one data-rva relocation per leaf
        assert_eq!(object.relocs[0].len(), 2);

        let table = object.section_data(0).unwrap();
        // root header: 0 named, 2 numbered types
        assert_eq!(&table[12..16], &[0, 0, 2, 0]);
        // first root entry is type 3 (numbered ids ascend)
        assert_eq!(&table[16..20], &3u32.to_le_bytes());

        let blobs = object.section_data(1).unwrap();
        assert_eq!(&blobs[0..16], &[0xAB; 16]);
    }

    #[test]
    fn named_types_sort_before_numbered() {
        let tree_order = vec![
            ResEntry {
                type_: ResId::Num(2),
                name: ResId::Num(1),
                language: 0,
                data: vec![1],
            },
            ResEntry {
                type_: ResId::Name(utf16("AAA")),
                name: ResId::Num(1),
                language: 0,
                data: vec![2],
            },
        ];
        let data = make_rsrc_obj(MachineType::Amd64, 0, &tree_order);
        let object = ObjectFile::parse(data).unwrap();
        let table = object.section_data(0).unwrap();
        // root header counts: 1 named, 1 numbered
        assert_eq!(&table[12..16], &[1, 0, 1, 0]);
        // first entry's id field has the name flag
        let first_id = u32::from_le_bytes(table[16..20].try_into().unwrap());
        assert!(first_id & SUBDIR_FLAG != 0);
    }
}
