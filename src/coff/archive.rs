//! COFF archives (`.lib`), regular and thin, plus short-import members.

use crate::error::{Result, SolderError};
use crate::io::{read_at, Reader, Writer};

use super::{BigObjHeader, MachineType};

pub const ARCHIVE_SIG: &[u8; 8] = b"!<arch>\n";
pub const THIN_ARCHIVE_SIG: &[u8; 8] = b"!<thin>\n";
pub const MEMBER_HEADER_SIZE: usize = 60;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchiveType {
    Regular,
    Thin,
}

/// What an archive member's payload is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemberKind {
    Import,
    Obj,
    BigObj,
    Unknown,
}

pub fn member_kind(data: &[u8]) -> MemberKind {
    if BigObjHeader::sniff(data) {
        return MemberKind::BigObj;
    }
    if data.len() >= 4 && data[0..4] == [0, 0, 0xFF, 0xFF] {
        return MemberKind::Import;
    }
    if data.len() >= super::FileHeader::SIZE {
        return MemberKind::Obj;
    }
    MemberKind::Unknown
}

#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub name: String,
    /// Byte range of the member payload inside the archive. Empty for thin
    /// archive members, whose payload lives on disk at `name` relative to
    /// the archive's directory.
    pub data_start: usize,
    pub data_size: usize,
}

#[derive(Debug)]
pub struct Archive {
    pub data: Vec<u8>,
    pub archive_type: ArchiveType,
    pub long_names: Vec<u8>,
    /// `(symbol name, member header offset)` pairs from the linker member.
    pub symbol_map: Vec<(String, u64)>,
}

impl Archive {
    pub fn sniff(data: &[u8]) -> Option<ArchiveType> {
        if data.len() < 8 {
            return None;
        }
        if &data[..8] == ARCHIVE_SIG {
            Some(ArchiveType::Regular)
        } else if &data[..8] == THIN_ARCHIVE_SIG {
            Some(ArchiveType::Thin)
        } else {
            None
        }
    }

    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let archive_type = Self::sniff(&data)
            .ok_or_else(|| SolderError::invalid_archive_format("bad archive signature"))?;

        let mut symbol_map = Vec::new();
        let mut long_names = Vec::new();

        // the leading special members: one or two linker members ("/") and
        // the optional long-names member ("//")
        let mut cursor = 8usize;
        let mut seen_linker_members = 0;
        while cursor + MEMBER_HEADER_SIZE <= data.len() {
            let (raw_name, size) = read_member_header(&data, cursor)?;
            let payload_start = cursor + MEMBER_HEADER_SIZE;

            if raw_name == "/" && seen_linker_members == 0 {
                symbol_map = parse_first_linker_member(read_at(&data, payload_start, size)?)?;
                seen_linker_members += 1;
            } else if raw_name == "/" && seen_linker_members == 1 {
                // the second linker member carries the same mapping sorted;
                // the first is authoritative here
                seen_linker_members += 1;
            } else if raw_name == "//" {
                long_names = read_at(&data, payload_start, size)?.to_vec();
            } else {
                break;
            }

            cursor = payload_start + size;
            cursor += cursor & 1; // members are 2-byte aligned
        }

        Ok(Self {
            data,
            archive_type,
            long_names,
            symbol_map,
        })
    }

    /// Parses the member whose *header* starts at `offset` (the offsets the
    /// linker member hands out).
    pub fn member_at(&self, offset: u64) -> Result<MemberInfo> {
        let offset = offset as usize;
        let (raw_name, size) = read_member_header(&self.data, offset)?;
        let name = self.resolve_member_name(&raw_name);

        let (data_start, data_size) = match self.archive_type {
            ArchiveType::Regular => {
                let start = offset + MEMBER_HEADER_SIZE;
                read_at(&self.data, start, size)?;
                (start, size)
            }
            ArchiveType::Thin => (0, 0),
        };

        Ok(MemberInfo {
            name,
            data_start,
            data_size,
        })
    }

    pub fn member_data(&self, member: &MemberInfo) -> &[u8] {
        &self.data[member.data_start..member.data_start + member.data_size]
    }

    fn resolve_member_name(&self, raw_name: &str) -> String {
        if let Some(digits) = raw_name.strip_prefix('/') {
            if let Ok(offset) = digits.parse::<usize>() {
                if offset < self.long_names.len() {
                    let tail = &self.long_names[offset..];
                    let end = tail
                        .iter()
                        .position(|&b| b == 0 || b == b'\n')
                        .unwrap_or(tail.len());
                    let mut name = String::from_utf8_lossy(&tail[..end]).into_owned();
                    // GNU-style long names terminate with a slash
                    if name.ends_with('/') {
                        name.pop();
                    }
                    return name;
                }
            }
        }
        let mut name = raw_name.to_owned();
        if name.ends_with('/') {
            name.pop();
        }
        name
    }
}

fn read_member_header(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let header = read_at(data, offset, MEMBER_HEADER_SIZE)?;
    if &header[58..60] != b"`\n" {
        return Err(SolderError::invalid_archive_format(
            "bad member header terminator",
        ));
    }
    let name = core::str::from_utf8(&header[0..16])
        .map_err(|_| SolderError::invalid_archive_format("member name is not utf-8"))?
        .trim_end()
        .to_owned();
    let size: usize = core::str::from_utf8(&header[48..58])
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SolderError::invalid_archive_format("bad member size field"))?;
    Ok((name, size))
}

/// The first linker member: big-endian symbol count, member-header offsets,
/// then the NUL-terminated symbol names.
fn parse_first_linker_member(data: &[u8]) -> Result<Vec<(String, u64)>> {
    let mut read_ptr = data;
    let count = u32::from_be_bytes(read_ptr.read::<[u8; 4]>()?) as usize;
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(u32::from_be_bytes(read_ptr.read::<[u8; 4]>()?) as u64);
    }
    let mut map = Vec::with_capacity(count);
    let mut names = read_ptr;
    for offset in offsets {
        let end = names
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| SolderError::invalid_archive_format("unterminated symbol name"))?;
        let name = String::from_utf8_lossy(&names[..end]).into_owned();
        names = &names[end + 1..];
        map.push((name, offset));
    }
    Ok(map)
}

pub mod import_type {
    pub const CODE: u16 = 0;
    pub const DATA: u16 = 1;
    pub const CONST: u16 = 2;
}

pub mod import_name_type {
    pub const ORDINAL: u16 = 0;
    pub const NAME: u16 = 1;
    pub const NAME_NO_PREFIX: u16 = 2;
    pub const NAME_UNDECORATE: u16 = 3;
}

/// A short-import archive member: a 20-byte header followed by the imported
/// symbol name and the DLL name, both NUL-terminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportHeader {
    pub machine: MachineType,
    pub time_date_stamp: u32,
    pub ordinal_or_hint: u16,
    pub import_type: u16,
    pub name_type: u16,
    pub func_name: String,
    pub dll_name: String,
}

impl ImportHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut read_ptr = data;
        let _sig1: u16 = read_ptr.read()?;
        let _sig2: u16 = read_ptr.read()?;
        let _version: u16 = read_ptr.read()?;
        let machine = MachineType::from_u16(read_ptr.read()?);
        let time_date_stamp: u32 = read_ptr.read()?;
        let _size_of_data: u32 = read_ptr.read()?;
        let ordinal_or_hint: u16 = read_ptr.read()?;
        let type_bits: u16 = read_ptr.read()?;

        let func_name = read_cstr(&mut read_ptr)?;
        let dll_name = read_cstr(&mut read_ptr)?;

        Ok(Self {
            machine,
            time_date_stamp,
            ordinal_or_hint,
            import_type: type_bits & 0x3,
            name_type: (type_bits >> 2) & 0x7,
            func_name,
            dll_name,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let names_size = self.func_name.len() + 1 + self.dll_name.len() + 1;
        out.write(0u16).unwrap();
        out.write(0xFFFFu16).unwrap();
        out.write(0u16).unwrap(); // version
        out.write(self.machine.to_u16()).unwrap();
        out.write(self.time_date_stamp).unwrap();
        out.write(names_size as u32).unwrap();
        out.write(self.ordinal_or_hint).unwrap();
        out.write(self.import_type | (self.name_type << 2)).unwrap();
        out.extend_from_slice(self.func_name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.dll_name.as_bytes());
        out.push(0);
    }

    /// The name looked up in the DLL's export table, after applying the
    /// name-type decoration rule.
    pub fn import_name(&self) -> &str {
        match self.name_type {
            import_name_type::NAME_NO_PREFIX => self.func_name.trim_start_matches(['_', '@', '?']),
            import_name_type::NAME_UNDECORATE => {
                let trimmed = self.func_name.trim_start_matches(['_', '@', '?']);
                trimmed.split('@').next().unwrap_or(trimmed)
            }
            _ => &self.func_name,
        }
    }
}

fn read_cstr(read_ptr: &mut &[u8]) -> Result<String> {
    let end = read_ptr
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| SolderError::invalid_archive_format("unterminated import name"))?;
    let name = String::from_utf8_lossy(&read_ptr[..end]).into_owned();
    *read_ptr = &read_ptr[end + 1..];
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::implib::ArchiveWriter;

    #[test]
    fn import_header_round_trip() {
        let expected = ImportHeader {
            machine: MachineType::Amd64,
            time_date_stamp: 0,
            ordinal_or_hint: 4,
            import_type: import_type::CODE,
            name_type: import_name_type::NAME,
            func_name: "CreateFileW".into(),
            dll_name: "kernel32.dll".into(),
        };
        let mut data = Vec::new();
        expected.serialize(&mut data);
        assert_eq!(member_kind(&data), MemberKind::Import);
        assert_eq!(ImportHeader::parse(&data).unwrap(), expected);
    }

    #[test]
    fn name_decoration_rules() {
        let mut header = ImportHeader {
            machine: MachineType::I386,
            time_date_stamp: 0,
            ordinal_or_hint: 0,
            import_type: import_type::CODE,
            name_type: import_name_type::NAME_UNDECORATE,
            func_name: "_func@12".into(),
            dll_name: "a.dll".into(),
        };
        assert_eq!(header.import_name(), "func");
        header.name_type = import_name_type::NAME_NO_PREFIX;
        assert_eq!(header.import_name(), "func@12");
        header.name_type = import_name_type::NAME;
        assert_eq!(header.import_name(), "_func@12");
    }

    #[test]
    fn parse_written_archive() {
        let mut import = Vec::new();
        ImportHeader {
            machine: MachineType::Amd64,
            time_date_stamp: 0,
            ordinal_or_hint: 1,
            import_type: import_type::CODE,
            name_type: import_name_type::NAME,
            func_name: "ExitProcess".into(),
            dll_name: "kernel32.dll".into(),
        }
        .serialize(&mut import);

        let mut writer = ArchiveWriter::new();
        writer.push_member("kernel32.dll", &["ExitProcess", "__imp_ExitProcess"], import);
        let data = writer.serialize();

        let archive = Archive::parse(data).unwrap();
        assert_eq!(archive.archive_type, ArchiveType::Regular);
        assert_eq!(archive.symbol_map.len(), 2);
        let (name, offset) = archive.symbol_map[0].clone();
        assert_eq!(name, "ExitProcess");

        let member = archive.member_at(offset).unwrap();
        assert_eq!(member.name, "kernel32.dll");
        let kind = member_kind(archive.member_data(&member));
        assert_eq!(kind, MemberKind::Import);
        let parsed = ImportHeader::parse(archive.member_data(&member)).unwrap();
        assert_eq!(parsed.func_name, "ExitProcess");
    }
}
