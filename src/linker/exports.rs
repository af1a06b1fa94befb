//! The export table object. Exports come from `/EXPORT` and `export`
//! directives; resolved ones are finalized into ordinals and serialized as
//! one `.edata` blob whose internal references are relocations against a
//! section-start symbol with the target offset as the stored addend.

use crate::coff::reloc::x64;
use crate::coff::MachineType;
use crate::io::Writer;
use crate::pe::section_flags;

use super::config::ExportDef;
use super::synth::ObjWriter;

pub struct FinalizedExports {
    /// Sorted by exported name for the name-pointer table.
    pub named: Vec<ExportDef>,
    pub ordinal_base: u32,
    pub ordinal_count: u32,
}

/// Assigns ordinals and orders the name table. Explicit `@ordinal` requests
/// pin entries; the rest fill the gaps in name order.
pub fn finalize_exports(exports: &[ExportDef]) -> FinalizedExports {
    let mut named: Vec<ExportDef> = exports.to_vec();
    named.sort_by(|a, b| a.exported_name().cmp(b.exported_name()));
    named.dedup_by(|a, b| a.exported_name() == b.exported_name());

    let pinned: Vec<u32> = named
        .iter()
        .filter_map(|export| export.ordinal.map(u32::from))
        .collect();
    let ordinal_base = pinned.iter().copied().min().unwrap_or(1);

    let mut used: Vec<u32> = pinned;
    let mut next_free = ordinal_base;
    for export in named.iter_mut() {
        if export.ordinal.is_some() {
            continue;
        }
        while used.contains(&next_free) {
            next_free += 1;
        }
        export.ordinal = Some(next_free as u16);
        used.push(next_free);
    }
    let ordinal_count = used.iter().copied().max().unwrap_or(0) - ordinal_base + 1;

    FinalizedExports {
        named,
        ordinal_base,
        ordinal_count,
    }
}

impl ExportDef {
    pub fn exported_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Serializes the export directory, address/name-pointer/ordinal tables and
/// strings into one object.
pub fn make_edata_obj(
    machine: MachineType,
    time_stamp: u32,
    image_file_name: &str,
    exports: &FinalizedExports,
) -> Vec<u8> {
    let mut writer = ObjWriter::new(machine);
    writer.set_time_stamp(time_stamp);

    const DIR_SIZE: usize = 40;
    let address_table_off = DIR_SIZE;
    let name_ptr_off = address_table_off + exports.ordinal_count as usize * 4;
    let ordinal_table_off = name_ptr_off + exports.named.len() * 4;
    let strings_off = ordinal_table_off + exports.named.len() * 2;

    // string blob: image name first, then exported names and forwarders
    let mut strings = Vec::new();
    let image_name_off = strings_off;
    strings.extend_from_slice(image_file_name.as_bytes());
    strings.push(0);
    let mut name_offs = Vec::with_capacity(exports.named.len());
    let mut forwarder_offs = Vec::with_capacity(exports.named.len());
    for export in &exports.named {
        name_offs.push(strings_off + strings.len());
        strings.extend_from_slice(export.exported_name().as_bytes());
        strings.push(0);
        forwarder_offs.push(export.forwarder.as_ref().map(|forwarder| {
            let off = strings_off + strings.len();
            strings.extend_from_slice(forwarder.as_bytes());
            strings.push(0);
            off
        }));
    }

    let mut blob = Vec::with_capacity(strings_off + strings.len());
    blob.write(0u32).unwrap(); // characteristics
    blob.write(time_stamp).unwrap();
    blob.write(0u32).unwrap(); // version
    blob.write(0u32).unwrap(); // name rva, relocated
    blob.write(exports.ordinal_base).unwrap();
    blob.write(exports.ordinal_count).unwrap();
    blob.write(exports.named.len() as u32).unwrap();
    blob.write(0u32).unwrap(); // address table rva, relocated
    blob.write(0u32).unwrap(); // name pointer rva, relocated
    blob.write(0u32).unwrap(); // ordinal table rva, relocated
    blob.resize(strings_off, 0);
    blob.extend_from_slice(&strings);

    // name pointers and ordinal table are section-internal and filled via
    // the root-symbol relocations below; ordinals are plain numbers
    for (entry_idx, export) in exports.named.iter().enumerate() {
        let ordinal_idx = export.ordinal.unwrap() as u32 - exports.ordinal_base;
        let field = ordinal_table_off + entry_idx * 2;
        blob[field..field + 2].copy_from_slice(&(ordinal_idx as u16).to_le_bytes());
    }

    let edata = writer.push_section(".edata", section_flags::EDATA, blob);
    let root = writer.push_static(edata, "$edata", 0);

    // directory's internal rvas: relocate against the section start with the
    // target offset as the stored addend
    let reloc_internal = |field_off: u32, target_off: usize, writer: &mut ObjWriter| {
        writer.push_reloc(edata, field_off, root, x64::ADDR32NB);
        target_off
    };
    let patches = [
        (12u32, image_name_off),
        (28, address_table_off),
        (32, name_ptr_off),
        (36, ordinal_table_off),
    ];
    let mut addends = Vec::new();
    for (field_off, target_off) in patches {
        addends.push((field_off, reloc_internal(field_off, target_off, &mut writer)));
    }
    for (entry_idx, name_off) in name_offs.iter().enumerate() {
        let field_off = (name_ptr_off + entry_idx * 4) as u32;
        writer.push_reloc(edata, field_off, root, x64::ADDR32NB);
        addends.push((field_off, *name_off));
    }

    // address table entries: forwarders point back into this section,
    // regular exports relocate against the (undefined here) backing symbol
    for export in &exports.named {
        let ordinal_idx = export.ordinal.unwrap() as u32 - exports.ordinal_base;
        let field_off = (address_table_off + ordinal_idx as usize * 4) as u32;
        let entry_idx = exports
            .named
            .iter()
            .position(|e| e.exported_name() == export.exported_name())
            .unwrap();
        match forwarder_offs[entry_idx] {
            Some(forwarder_off) => {
                writer.push_reloc(edata, field_off, root, x64::ADDR32NB);
                addends.push((field_off, forwarder_off));
            }
            None => {
                let backing = writer.push_undefined(&export.name);
                writer.push_reloc(edata, field_off, backing, x64::ADDR32NB);
            }
        }
    }

    let mut data = writer.serialize();
    let addends: Vec<(u32, u32)> = addends
        .into_iter()
        .map(|(field_off, addend)| (field_off, addend as u32))
        .collect();
    super::synth::patch_section_data(&mut data, 1, &addends);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;

    fn export(name: &str, ordinal: Option<u16>) -> ExportDef {
        ExportDef {
            name: name.into(),
            alias: None,
            ordinal,
            is_data: false,
            forwarder: None,
            origin: None,
        }
    }

    #[test]
    fn ordinals_fill_gaps_around_pinned() {
        let finalized = finalize_exports(&[
            export("alpha", None),
            export("beta", Some(3)),
            export("gamma", None),
        ]);
        assert_eq!(finalized.ordinal_base, 3);
        let ordinals: Vec<_> = finalized
            .named
            .iter()
            .map(|e| (e.name.as_str(), e.ordinal.unwrap()))
            .collect();
        // names sorted, beta pinned at 3, others take 4 and 5
        assert_eq!(ordinals, vec![("alpha", 4), ("beta", 3), ("gamma", 5)]);
        assert_eq!(finalized.ordinal_count, 3);
    }

    #[test]
    fn duplicate_exported_names_are_dropped() {
        let finalized = finalize_exports(&[export("dup", None), export("dup", Some(9))]);
        assert_eq!(finalized.named.len(), 1);
    }

    #[test]
    fn edata_obj_references_backing_symbols() {
        let finalized = finalize_exports(&[export("do_thing", None)]);
        let data = make_edata_obj(MachineType::Amd64, 0, "plugin.dll", &finalized);
        let object = ObjectFile::parse(data).unwrap();
        assert_eq!(object.section_names[0], ".edata");
        assert!(object
            .iter_symbols()
            .any(|(_, s)| s.name == "do_thing" && s.section_number == 0));
        // directory name rva + 3 table rvas + 1 name pointer + 1 address entry
        assert_eq!(object.relocs[0].len(), 6);
        // the exported-name count landed in the directory
        let blob = object.section_data(0).unwrap();
        assert_eq!(&blob[24..28], &1u32.to_le_bytes());
    }
}
