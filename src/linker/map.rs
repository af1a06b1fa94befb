//! The chunk map: a text listing of every section contribution with its
//! final addresses, a blake3 over its bytes, its alignment and provenance.

use std::fmt::Write as _;

use crate::coff::SectionFlags;

use super::layout::{ContribData, Layout};
use super::libs::Lib;
use super::objects::Obj;

pub fn build_map(layout: &Layout, objs: &[Obj], libs: &[Lib], image: &[u8]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "VOFF             FOFF             SIZE     BLAKE3           ALIGN SOURCE");

    for section in layout.live_sections() {
        let _ = writeln!(
            out,
            "# {} voff={:#x} vsize={:#x} foff={:#x} fsize={:#x}",
            section.name, section.voff, section.vsize, section.foff, section.fsize
        );
        for contrib in section.iter_contribs() {
            let voff = section.voff + contrib.off;
            let foff = if section
                .flags
                .contains(SectionFlags::CNT_UNINITIALIZED_DATA)
            {
                0
            } else {
                section.foff + contrib.off
            };
            let size = contrib.size();

            let hash = match &contrib.data {
                ContribData::Zero { .. } => "0".repeat(16),
                _ => {
                    let start = foff as usize;
                    let end = (start + size as usize).min(image.len());
                    let digest = blake3::hash(&image[start..end]);
                    digest.to_hex()[..16].to_string()
                }
            };

            let source = if contrib.obj_idx == u32::MAX {
                "(linker)".to_string()
            } else {
                let obj = &objs[contrib.obj_idx as usize];
                let obj_name = obj.path.rsplit(['/', '\\']).next().unwrap_or(&obj.path);
                let origin = match obj.lib {
                    Some(lib_idx) => {
                        let lib = &libs[lib_idx as usize];
                        let lib_name =
                            lib.path.rsplit(['/', '\\']).next().unwrap_or(&lib.path);
                        format!("{lib_name}({obj_name})")
                    }
                    None => obj_name.to_string(),
                };
                format!(
                    "{origin} SECT{:X} ({})",
                    contrib.obj_sect_idx + 1,
                    obj.object.section_names[contrib.obj_sect_idx as usize]
                )
            };

            let _ = writeln!(
                out,
                "{voff:016x} {foff:016x} {size:08x} {hash} {:5} {source}",
                contrib.align
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::object::ObjectFile;
    use crate::coff::MachineType;
    use crate::linker::config::Config;
    use crate::linker::pool::ThreadPool;
    use crate::linker::session::Session;
    use crate::linker::symtab::SymbolTable;
    use crate::linker::synth::ObjWriter;
    use crate::pe::section_flags;

    #[test]
    fn map_lists_every_contribution() {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        writer.push_section(".text$mn", section_flags::TEXT, vec![0x90; 16]);
        let objs = vec![Obj::new(
            ObjectFile::parse(writer.serialize()).unwrap(),
            0,
            0,
            "dir/app.obj".into(),
            None,
        )];

        let pool = ThreadPool::new(1);
        let session = Session::new();
        let config = Config::default();
        let symtab = SymbolTable::new();
        let mut layout =
            crate::linker::layout::gather(&pool, &session, &config, &objs, &symtab);
        layout.sort_chunks_and_merge(&session, &config);
        layout.finalize_all(&config);
        layout.assign_virtual_space(&config, 0x400);
        layout.assign_file_space(&config, 0x400);
        let image = layout.fill_image(&objs, MachineType::Amd64);

        let map = build_map(&layout, &objs, &[], &image);
        assert!(map.contains("# .text"));
        assert!(map.contains("app.obj SECT1 (.text$mn)"));
        // deterministic hash of sixteen nops
        let expected = blake3::hash(&[0x90u8; 16]).to_hex()[..16].to_string();
        assert!(map.contains(&expected));
    }
}
