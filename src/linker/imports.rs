//! Synthesized import objects. Every DLL with pulled short-import members
//! gets one object carrying its import descriptor, lookup/address tables,
//! hint/name entries and code thunks; the null descriptor and null thunk
//! objects terminate the directory and address table.

use crate::coff::archive::{import_name_type, import_type, ImportHeader};
use crate::coff::reloc::x64;
use crate::coff::{MachineType, SectionFlags};
use crate::io::Writer;
use crate::pe::section_flags;

use super::synth::ObjWriter;

pub const NULL_IMPORT_DESCRIPTOR: &str = "__NULL_IMPORT_DESCRIPTOR";
pub const NULL_DELAY_IMPORT_DESCRIPTOR: &str = "__NULL_DELAY_IMPORT_DESCRIPTOR";

/// `\x7f<image>_NULL_THUNK_DATA`, the symbol bounding the import address
/// table; the delayed variant gets a `_DLA` suffix.
pub fn null_thunk_symbol(image_file_name: &str, delayed: bool) -> String {
    if delayed {
        format!("\x7f{image_file_name}_NULL_THUNK_DATA_DLA")
    } else {
        format!("\x7f{image_file_name}_NULL_THUNK_DATA")
    }
}

fn descriptor_symbol(dll_name: &str, delayed: bool) -> String {
    let stem = dll_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(dll_name)
        .replace(['.', '-'], "_");
    if delayed {
        format!("__DELAY_IMPORT_DESCRIPTOR_{stem}")
    } else {
        format!("__IMPORT_DESCRIPTOR_{stem}")
    }
}

fn sect(delayed: bool, suffix: &str) -> String {
    if delayed {
        format!(".didat${suffix}")
    } else {
        format!(".idata${suffix}")
    }
}

/// The ordinal-import flag bit for the machine's thunk entry width.
fn ordinal_flag(machine: MachineType) -> u64 {
    1u64 << (machine.word_size() * 8 - 1)
}

/// Builds the import object for one DLL.
pub fn make_import_dll_obj(
    machine: MachineType,
    time_stamp: u32,
    dll_name: &str,
    imports: &[ImportHeader],
    delayed: bool,
) -> Vec<u8> {
    let word = machine.word_size() as usize;
    let mut writer = ObjWriter::new(machine);
    writer.set_time_stamp(time_stamp);

    // hint/name blob and the dll name string
    let mut names_blob = Vec::new();
    let mut hint_offsets = Vec::with_capacity(imports.len());
    for import in imports {
        if import.name_type == import_name_type::ORDINAL {
            hint_offsets.push(None);
            continue;
        }
        if names_blob.len() & 1 == 1 {
            names_blob.push(0);
        }
        hint_offsets.push(Some(names_blob.len() as u32));
        names_blob.write(import.ordinal_or_hint).unwrap();
        names_blob.extend_from_slice(import.import_name().as_bytes());
        names_blob.push(0);
    }
    if names_blob.len() & 1 == 1 {
        names_blob.push(0);
    }
    let dll_name_off = names_blob.len() as u32;
    names_blob.extend_from_slice(dll_name.as_bytes());
    names_blob.push(0);

    let names_sect = writer.push_section(
        &sect(delayed, "6"),
        section_flags::IDATA | SectionFlags::from_align(2),
        names_blob,
    );
    let dll_name_symbol = writer.push_static(names_sect, "$dllname", dll_name_off);

    // lookup table and address table: one entry per import plus a null
    let table_size = (imports.len() + 1) * word;
    let mut table = vec![0u8; table_size];
    for (entry_idx, import) in imports.iter().enumerate() {
        if import.name_type == import_name_type::ORDINAL {
            let entry = ordinal_flag(machine) | import.ordinal_or_hint as u64;
            table[entry_idx * word..entry_idx * word + word]
                .copy_from_slice(&entry.to_le_bytes()[..word]);
        }
    }
    let table_align = SectionFlags::from_align(word as u32);
    let ilt_sect = writer.push_section(
        &sect(delayed, "4"),
        section_flags::IDATA | table_align,
        table.clone(),
    );
    let iat_sect = writer.push_section(
        &sect(delayed, "5"),
        section_flags::IDATA | table_align,
        table,
    );
    let ilt_symbol = writer.push_static(ilt_sect, "$ilt", 0);
    let iat_symbol = writer.push_static(iat_sect, "$iat", 0);

    // name entries are referenced from both tables
    for (entry_idx, hint_off) in hint_offsets.iter().enumerate() {
        let Some(hint_off) = hint_off else { continue };
        let hint_symbol = writer.push_static(names_sect, &format!("$hn{entry_idx}"), *hint_off);
        writer.push_reloc(
            ilt_sect,
            (entry_idx * word) as u32,
            hint_symbol,
            x64::ADDR32NB,
        );
        writer.push_reloc(
            iat_sect,
            (entry_idx * word) as u32,
            hint_symbol,
            x64::ADDR32NB,
        );
    }

    // `__imp_<name>` binds to the IAT slot
    let mut imp_symbols = Vec::with_capacity(imports.len());
    for (entry_idx, import) in imports.iter().enumerate() {
        let imp_symbol = writer.push_external(
            iat_sect,
            &format!("__imp_{}", import.func_name),
            (entry_idx * word) as u32,
            false,
        );
        imp_symbols.push(imp_symbol);
    }

    // descriptor
    if delayed {
        let mut descriptor = Vec::with_capacity(32);
        descriptor.write(1u32).unwrap(); // attributes: RVA-based
        descriptor.write(0u32).unwrap(); // dll name rva
        descriptor.write(0u32).unwrap(); // module handle rva
        descriptor.write(0u32).unwrap(); // delay IAT rva
        descriptor.write(0u32).unwrap(); // delay INT rva
        descriptor.write(0u32).unwrap(); // bound delay IT
        descriptor.write(0u32).unwrap(); // unload delay IT
        descriptor.write(time_stamp).unwrap();
        let desc_sect = writer.push_section(
            &sect(delayed, "2"),
            section_flags::IDATA | SectionFlags::from_align(4),
            descriptor,
        );

        // the loader writes the module handle here at the first delay call
        let hmod_sect = writer.push_section(
            ".data$dlh",
            section_flags::DATA | SectionFlags::from_align(8),
            vec![0u8; machine.word_size() as usize],
        );
        let hmod_symbol = writer.push_static(hmod_sect, "$hmod", 0);

        writer.push_reloc(desc_sect, 4, dll_name_symbol, x64::ADDR32NB);
        writer.push_reloc(desc_sect, 8, hmod_symbol, x64::ADDR32NB);
        writer.push_reloc(desc_sect, 12, iat_symbol, x64::ADDR32NB);
        writer.push_reloc(desc_sect, 16, ilt_symbol, x64::ADDR32NB);
        writer.push_external(desc_sect, &descriptor_symbol(dll_name, delayed), 0, false);
    } else {
        let descriptor = vec![0u8; 20];
        let desc_sect = writer.push_section(
            &sect(delayed, "2"),
            section_flags::IDATA | SectionFlags::from_align(4),
            descriptor,
        );
        writer.push_reloc(desc_sect, 0, ilt_symbol, x64::ADDR32NB);
        writer.push_reloc(desc_sect, 12, dll_name_symbol, x64::ADDR32NB);
        writer.push_reloc(desc_sect, 16, iat_symbol, x64::ADDR32NB);
        writer.push_external(desc_sect, &descriptor_symbol(dll_name, delayed), 0, false);
    }

    // code thunks: `jmp [__imp_<name>]`
    let code_imports: Vec<usize> = imports
        .iter()
        .enumerate()
        .filter(|(_, import)| import.import_type == import_type::CODE)
        .map(|(entry_idx, _)| entry_idx)
        .collect();
    if !code_imports.is_empty() {
        let thunk_size = 6usize;
        let mut code = Vec::with_capacity(code_imports.len() * thunk_size);
        for _ in &code_imports {
            code.extend_from_slice(&[0xFF, 0x25, 0, 0, 0, 0]);
        }
        let text_sect = writer.push_section(
            ".text$mn",
            section_flags::TEXT | SectionFlags::from_align(16),
            code,
        );
        for (thunk_idx, &entry_idx) in code_imports.iter().enumerate() {
            let thunk_off = (thunk_idx * thunk_size) as u32;
            writer.push_reloc(text_sect, thunk_off + 2, imp_symbols[entry_idx], x64::REL32);
            writer.push_external(text_sect, &imports[entry_idx].func_name, thunk_off, true);
        }
    }

    writer.serialize()
}

/// Terminates the import directory: an all-zero descriptor that sorts after
/// every real one.
pub fn make_null_import_descriptor_obj(machine: MachineType, delayed: bool) -> Vec<u8> {
    let mut writer = ObjWriter::new(machine);
    let size = if delayed { 32 } else { 20 };
    let desc_sect = writer.push_section(
        &sect(delayed, "3"),
        section_flags::IDATA | SectionFlags::from_align(4),
        vec![0u8; size],
    );
    let name = if delayed {
        NULL_DELAY_IMPORT_DESCRIPTOR
    } else {
        NULL_IMPORT_DESCRIPTOR
    };
    writer.push_external(desc_sect, name, 0, false);
    writer.serialize()
}

/// Terminates the lookup and address tables with one null entry each; the
/// null-thunk symbol gives the finalizer the end of the address table.
pub fn make_null_thunk_data_obj(
    machine: MachineType,
    image_file_name: &str,
    delayed: bool,
) -> Vec<u8> {
    let word = machine.word_size() as u32;
    let mut writer = ObjWriter::new(machine);
    let align = SectionFlags::from_align(word);
    let _ilt = writer.push_section(
        // sorts after every per-dll $4/$5 block
        &sect(delayed, "4zz"),
        section_flags::IDATA | align,
        vec![0u8; word as usize],
    );
    let iat = writer.push_section(
        &sect(delayed, "5zz"),
        section_flags::IDATA | align,
        vec![0u8; word as usize],
    );
    writer.push_external(iat, &null_thunk_symbol(image_file_name, delayed), 0, false);
    writer.serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;

    fn import(name: &str, hint: u16, import_type: u16, name_type: u16) -> ImportHeader {
        ImportHeader {
            machine: MachineType::Amd64,
            time_date_stamp: 0,
            ordinal_or_hint: hint,
            import_type,
            name_type,
            func_name: name.into(),
            dll_name: "kernel32.dll".into(),
        }
    }

    #[test]
    fn import_obj_carries_tables_and_thunks() {
        let imports = [
            import("ExitProcess", 7, import_type::CODE, import_name_type::NAME),
            import("GetStdHandle", 9, import_type::CODE, import_name_type::NAME),
        ];
        let data = make_import_dll_obj(MachineType::Amd64, 0, "kernel32.dll", &imports, false);
        let object = ObjectFile::parse(data).unwrap();

        let sect_idx = |name: &str| {
            object
                .section_names
                .iter()
                .position(|n| n == name)
                .unwrap_or_else(|| panic!("missing section {name}"))
        };
        // 3 entries: 2 imports + null terminator, 8 bytes each
        assert_eq!(object.sections[sect_idx(".idata$4")].size_of_raw_data, 24);
        assert_eq!(object.sections[sect_idx(".idata$5")].size_of_raw_data, 24);
        // descriptor has ILT, name and IAT relocations
        assert_eq!(object.relocs[sect_idx(".idata$2")].len(), 3);
        // each thunk is `jmp [rip+disp32]`
        let text = object.section_data(sect_idx(".text$mn")).unwrap();
        assert_eq!(&text[0..2], &[0xFF, 0x25]);
        assert_eq!(text.len(), 12);

        let names: Vec<_> = object
            .iter_symbols()
            .map(|(_, s)| s.name.clone())
            .collect();
        assert!(names.contains(&"__imp_ExitProcess".to_string()));
        assert!(names.contains(&"ExitProcess".to_string()));
        assert!(names.contains(&"__IMPORT_DESCRIPTOR_kernel32".to_string()));
    }

    #[test]
    fn ordinal_imports_have_no_hint_entry() {
        let imports = [import(
            "OrdOnly",
            42,
            import_type::CODE,
            import_name_type::ORDINAL,
        )];
        let data = make_import_dll_obj(MachineType::Amd64, 0, "custom.dll", &imports, false);
        let object = ObjectFile::parse(data).unwrap();
        let ilt_idx = object
            .section_names
            .iter()
            .position(|n| n == ".idata$4")
            .unwrap();
        let ilt = object.section_data(ilt_idx).unwrap();
        let entry = u64::from_le_bytes(ilt[0..8].try_into().unwrap());
        assert_eq!(entry, (1 << 63) | 42);
        // no relocation for an ordinal entry
        assert!(object.relocs[ilt_idx].is_empty());
    }

    #[test]
    fn null_thunk_symbol_names() {
        assert_eq!(
            null_thunk_symbol("app.exe", false),
            "\x7fapp.exe_NULL_THUNK_DATA"
        );
        assert_eq!(
            null_thunk_symbol("app.exe", true),
            "\x7fapp.exe_NULL_THUNK_DATA_DLA"
        );
    }
}
