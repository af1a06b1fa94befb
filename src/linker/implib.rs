//! Import library output: an archive whose members are short-import records,
//! one per export, addressed through the first linker member.

use crate::coff::archive::{import_name_type, import_type, ImportHeader, MEMBER_HEADER_SIZE};
use crate::coff::MachineType;

use super::exports::FinalizedExports;

pub struct ArchiveWriter {
    members: Vec<Member>,
}

struct Member {
    name: String,
    symbols: Vec<String>,
    data: Vec<u8>,
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    pub fn push_member(&mut self, name: &str, symbols: &[&str], data: Vec<u8>) {
        self.members.push(Member {
            name: name.to_owned(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            data,
        });
    }

    pub fn serialize(self) -> Vec<u8> {
        // long names member is needed when any member name exceeds the
        // 15 chars that fit the header's `name/` field
        let mut long_names: Vec<u8> = Vec::new();
        let name_fields: Vec<String> = self
            .members
            .iter()
            .map(|member| {
                if member.name.len() <= 15 {
                    format!("{}/", member.name)
                } else {
                    let off = long_names.len();
                    long_names.extend_from_slice(member.name.as_bytes());
                    long_names.extend_from_slice(b"/\n");
                    format!("/{off}")
                }
            })
            .collect();

        // first linker member: symbol count, member header offsets, names
        let symbol_count: usize = self.members.iter().map(|m| m.symbols.len()).sum();
        let names_size: usize = self
            .members
            .iter()
            .flat_map(|m| m.symbols.iter())
            .map(|s| s.len() + 1)
            .sum();
        let linker_member_size = 4 + symbol_count * 4 + names_size;

        let mut cursor = 8 + MEMBER_HEADER_SIZE + linker_member_size;
        cursor += cursor & 1;
        if !long_names.is_empty() {
            cursor += MEMBER_HEADER_SIZE + long_names.len();
            cursor += cursor & 1;
        }

        let mut member_offsets = Vec::with_capacity(self.members.len());
        for member in &self.members {
            member_offsets.push(cursor as u32);
            cursor += MEMBER_HEADER_SIZE + member.data.len();
            cursor += cursor & 1;
        }

        let mut linker_member = Vec::with_capacity(linker_member_size);
        linker_member.extend_from_slice(&(symbol_count as u32).to_be_bytes());
        for (member, &offset) in self.members.iter().zip(&member_offsets) {
            for _ in &member.symbols {
                linker_member.extend_from_slice(&offset.to_be_bytes());
            }
        }
        for member in &self.members {
            for symbol in &member.symbols {
                linker_member.extend_from_slice(symbol.as_bytes());
                linker_member.push(0);
            }
        }
        debug_assert_eq!(linker_member.len(), linker_member_size);

        let mut out = Vec::with_capacity(cursor);
        out.extend_from_slice(crate::coff::archive::ARCHIVE_SIG);
        write_member_header(&mut out, "/", linker_member.len());
        out.extend_from_slice(&linker_member);
        pad_to_even(&mut out);
        if !long_names.is_empty() {
            write_member_header(&mut out, "//", long_names.len());
            out.extend_from_slice(&long_names);
            pad_to_even(&mut out);
        }
        for (member, name_field) in self.members.iter().zip(&name_fields) {
            write_member_header(&mut out, name_field, member.data.len());
            out.extend_from_slice(&member.data);
            pad_to_even(&mut out);
        }
        out
    }
}

fn write_member_header(out: &mut Vec<u8>, name_field: &str, size: usize) {
    let mut header = [b' '; MEMBER_HEADER_SIZE];
    header[..name_field.len()].copy_from_slice(name_field.as_bytes());
    let date = b"0";
    header[16..16 + date.len()].copy_from_slice(date);
    header[40..41].copy_from_slice(b"0"); // mode
    let size_field = size.to_string();
    header[48..48 + size_field.len()].copy_from_slice(size_field.as_bytes());
    header[58..60].copy_from_slice(b"`\n");
    out.extend_from_slice(&header);
}

fn pad_to_even(out: &mut Vec<u8>) {
    if out.len() & 1 == 1 {
        out.push(b'\n');
    }
}

/// Builds the import library for a DLL build: one short-import member per
/// export, under the image's file name.
pub fn make_import_lib(
    machine: MachineType,
    time_stamp: u32,
    image_file_name: &str,
    exports: &FinalizedExports,
) -> Vec<u8> {
    let mut writer = ArchiveWriter::new();
    for export in &exports.named {
        let header = ImportHeader {
            machine,
            time_date_stamp: time_stamp,
            ordinal_or_hint: export.ordinal.unwrap_or(0),
            import_type: if export.is_data {
                import_type::DATA
            } else {
                import_type::CODE
            },
            name_type: import_name_type::NAME,
            func_name: export.exported_name().to_owned(),
            dll_name: image_file_name.to_owned(),
        };
        let mut data = Vec::new();
        header.serialize(&mut data);

        let imp_name = format!("__imp_{}", export.exported_name());
        if export.is_data {
            writer.push_member(image_file_name, &[&imp_name], data);
        } else {
            writer.push_member(image_file_name, &[export.exported_name(), &imp_name], data);
        }
    }
    writer.serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::archive::Archive;
    use crate::linker::config::ExportDef;
    use crate::linker::exports::finalize_exports;

    #[test]
    fn import_lib_round_trips_through_the_reader() {
        let finalized = finalize_exports(&[
            ExportDef {
                name: "do_thing".into(),
                alias: None,
                ordinal: None,
                is_data: false,
                forwarder: None,
                origin: None,
            },
            ExportDef {
                name: "global_table".into(),
                alias: None,
                ordinal: None,
                is_data: true,
                forwarder: None,
                origin: None,
            },
        ]);
        let data = make_import_lib(MachineType::Amd64, 0, "plugin.dll", &finalized);
        let archive = Archive::parse(data).unwrap();

        // code export contributes both names, data export only __imp_
        let names: Vec<&str> = archive
            .symbol_map
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert!(names.contains(&"do_thing"));
        assert!(names.contains(&"__imp_do_thing"));
        assert!(names.contains(&"__imp_global_table"));
        assert!(!names.contains(&"global_table"));

        let (_, offset) = archive
            .symbol_map
            .iter()
            .find(|(name, _)| name == "do_thing")
            .unwrap();
        let member = archive.member_at(*offset).unwrap();
        let import = ImportHeader::parse(archive.member_data(&member)).unwrap();
        assert_eq!(import.func_name, "do_thing");
        assert_eq!(import.dll_name, "plugin.dll");
    }

    #[test]
    fn long_member_names_use_the_longnames_member() {
        let mut writer = ArchiveWriter::new();
        writer.push_member(
            "averylongdllname-that-overflows.dll",
            &["sym_a"],
            vec![0, 0, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        );
        let archive = Archive::parse(writer.serialize()).unwrap();
        let (_, offset) = archive.symbol_map[0].clone();
        let member = archive.member_at(offset).unwrap();
        assert_eq!(member.name, "averylongdllname-that-overflows.dll");
    }
}
