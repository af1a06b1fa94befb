//! End-to-end link scenarios: synthesized objects and archives go in
//! through the public entry point, the written PE image comes out and is
//! read back with the crate's own readers.

use std::path::PathBuf;

use solder::coff::archive::{import_name_type, import_type, ImportHeader};
use solder::coff::reloc::x64;
use solder::coff::{FileHeader, MachineType, SectionFlags, SectionHeader};
use solder::io::{ReadData, Reader};
use solder::linker::implib::ArchiveWriter;
use solder::linker::session::DiagKind;
use solder::linker::synth::ObjWriter;
use solder::pe::dos::ImageDosHeader;
use solder::pe::optional_header::OptionalHeader;
use solder::pe::section_flags;
use solder::pe::Subsystem;
use solder::{Config, Session};

struct TestDir {
    root: PathBuf,
}

impl TestDir {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "solder-test-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    fn write(&self, name: &str, data: &[u8]) -> String {
        let path = self.root.join(name);
        std::fs::write(&path, data).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn path(&self, name: &str) -> String {
        self.root.join(name).to_string_lossy().into_owned()
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

struct ParsedImage {
    file_header: FileHeader,
    optional_header: OptionalHeader,
    sections: Vec<SectionHeader>,
    data: Vec<u8>,
}

fn read_image(path: &str) -> ParsedImage {
    let data = std::fs::read(path).unwrap();
    let dos = ImageDosHeader::read(&mut data.as_slice()).unwrap();
    assert_eq!(dos.e_magic, ImageDosHeader::MAGIC_CONSTANT);
    let mut read_ptr = &data[dos.e_lfanew as usize..];
    let signature: [u8; 4] = read_ptr.read().unwrap();
    assert_eq!(signature, *b"PE\0\0");
    let file_header: FileHeader = read_ptr.read().unwrap();
    let optional_header: OptionalHeader = read_ptr.read().unwrap();
    let mut sections = Vec::new();
    for _ in 0..file_header.number_of_sections {
        sections.push(read_ptr.read::<SectionHeader>().unwrap());
    }
    ParsedImage {
        file_header,
        optional_header,
        sections,
        data,
    }
}

impl ParsedImage {
    fn section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections
            .iter()
            .find(|section| section.name_str(&[]) == name)
    }
}

fn link_args(session: &Session, args: &[String]) -> Config {
    let mut config = Config::from_args(session, args);
    assert!(!session.has_errors(), "bad command line");
    solder::run(session, &mut config);
    config
}

fn make_entry_obj() -> Vec<u8> {
    let mut writer = ObjWriter::new(MachineType::Amd64);
    let text = writer.push_section(
        ".text$mn",
        section_flags::TEXT | SectionFlags::from_align(16),
        vec![0xC3; 16],
    );
    writer.push_external(text, "mainCRTStartup", 0, true);
    writer.serialize()
}

/// Scenario: minimal console app. One obj, `.text$mn`, 16 bytes, declaring
/// `mainCRTStartup`; subsystem and entry unset. The subsystem resolves to
/// the console, the entry VA is the `.text` VOFF at 0x1000, no `.reloc`
/// appears and the checksum stays zero.
#[test]
fn minimal_console_app() {
    let dir = TestDir::new("minimal");
    let obj_path = dir.write("main.obj", &make_entry_obj());
    let exe_path = dir.path("main.exe");

    let session = Session::new();
    link_args(&session, &[obj_path, format!("/OUT:{exe_path}")]);
    assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());

    let image = read_image(&exe_path);
    assert_eq!(image.file_header.machine, MachineType::Amd64);
    assert_eq!(image.optional_header.subsystem, Subsystem::WindowsCui);
    assert_eq!(image.optional_header.address_of_entry_point, 0x1000);
    assert_eq!(image.optional_header.image_base, 0x1_4000_0000);
    assert_eq!(image.optional_header.section_alignment, 0x1000);
    assert_eq!(image.optional_header.file_alignment, 0x200);
    assert_eq!(image.optional_header.check_sum, 0);
    assert!(image.optional_header.size_of_code >= 16);

    let text = image.section(".text").unwrap();
    assert_eq!(text.virtual_address, 0x1000);
    assert_eq!(image.sections[0].name_str(&[]), ".text");
    assert!(image.section(".reloc").is_none(), "no relocs expected");

    // the code bytes made it to the right file offset
    let foff = text.pointer_to_raw_data as usize;
    assert_eq!(&image.data[foff..foff + 16], &[0xC3; 16]);
}

/// Scenario: one ADDR64 relocation at VOFF 0x2010. The `.reloc` section
/// holds a single DIR64 block for page 0x2000 and the site receives
/// image base + target VOFF.
#[test]
fn base_reloc_emission() {
    let mut writer = ObjWriter::new(MachineType::Amd64);
    let text = writer.push_section(
        ".text$mn",
        section_flags::TEXT | SectionFlags::from_align(16),
        vec![0xC3; 16],
    );
    let entry = writer.push_external(text, "mainCRTStartup", 0, true);
    let data = writer.push_section(
        ".data",
        section_flags::DATA | SectionFlags::from_align(8),
        vec![0u8; 0x18],
    );
    writer.push_reloc(data, 0x10, entry, x64::ADDR64);

    let dir = TestDir::new("basereloc");
    let obj_path = dir.write("app.obj", &writer.serialize());
    let exe_path = dir.path("app.exe");

    let session = Session::new();
    link_args(
        &session,
        &[
            obj_path,
            format!("/OUT:{exe_path}"),
            "/LARGEADDRESSAWARE:NO".into(),
            "/SUBSYSTEM:CONSOLE".into(),
        ],
    );
    assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());

    let image = read_image(&exe_path);
    let data_sect = image.section(".data").unwrap();
    assert_eq!(data_sect.virtual_address, 0x2000);

    // the relocated site holds base + entry voff
    let site = data_sect.pointer_to_raw_data as usize + 0x10;
    let value = u64::from_le_bytes(image.data[site..site + 8].try_into().unwrap());
    assert_eq!(value, image.optional_header.image_base + 0x1000);

    // one block: page 0x2000, size 12, one DIR64 entry at offset 0x10
    let reloc_sect = image.section(".reloc").unwrap();
    let reloc = reloc_sect.pointer_to_raw_data as usize;
    assert_eq!(&image.data[reloc..reloc + 4], &0x2000u32.to_le_bytes());
    assert_eq!(&image.data[reloc + 4..reloc + 8], &12u32.to_le_bytes());
    let entry_word = u16::from_le_bytes(image.data[reloc + 8..reloc + 10].try_into().unwrap());
    assert_eq!(entry_word, (10 << 12) | 0x10);

    let dir_entry = &image.optional_header.data_directories[5];
    assert_eq!(dir_entry.virtual_address, reloc_sect.virtual_address);
    assert_eq!(dir_entry.size, 12);
}

/// Scenario: an undefined `__imp_` reference resolved from an import
/// library. The linker synthesizes the `.idata` tables, binds the thunk,
/// and fills the import data directories.
#[test]
fn import_resolved_from_library() {
    // import library providing ExitProcess from kernel32.dll
    let mut import_member = Vec::new();
    ImportHeader {
        machine: MachineType::Amd64,
        time_date_stamp: 0,
        ordinal_or_hint: 7,
        import_type: import_type::CODE,
        name_type: import_name_type::NAME,
        func_name: "ExitProcess".into(),
        dll_name: "kernel32.dll".into(),
    }
    .serialize(&mut import_member);
    let mut archive = ArchiveWriter::new();
    archive.push_member(
        "kernel32.dll",
        &["ExitProcess", "__imp_ExitProcess"],
        import_member,
    );

    // obj calling through the import
    let mut writer = ObjWriter::new(MachineType::Amd64);
    let mut code = vec![0xFF, 0x15, 0, 0, 0, 0]; // call [rip+disp32]
    code.resize(16, 0xCC);
    let text = writer.push_section(
        ".text$mn",
        section_flags::TEXT | SectionFlags::from_align(16),
        code,
    );
    writer.push_external(text, "mainCRTStartup", 0, true);
    let imp = writer.push_undefined("__imp_ExitProcess");
    writer.push_reloc(text, 2, imp, x64::REL32);

    let dir = TestDir::new("imports");
    let obj_path = dir.write("main.obj", &writer.serialize());
    let lib_path = dir.write("kernel32.lib", &archive.serialize());
    let exe_path = dir.path("main.exe");

    let session = Session::new();
    link_args(
        &session,
        &[
            obj_path,
            lib_path,
            format!("/OUT:{exe_path}"),
            "/SUBSYSTEM:CONSOLE".into(),
        ],
    );
    assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());

    let image = read_image(&exe_path);
    let idata = image.section(".idata").expect("idata synthesized");
    let window = &image.data[idata.pointer_to_raw_data as usize
        ..(idata.pointer_to_raw_data + idata.size_of_raw_data) as usize];
    assert!(
        window.windows(12).any(|w| w == b"kernel32.dll"),
        "dll name string present"
    );

    // import directory points into .idata
    let import_dir = &image.optional_header.data_directories[1];
    assert!(import_dir.virtual_address >= idata.virtual_address);
    assert!(import_dir.size >= 20);
    let iat_dir = &image.optional_header.data_directories[12];
    assert!(iat_dir.size >= 8);

    // the call site's rel32 lands inside .idata (the IAT slot)
    let site = image
        .section(".text")
        .unwrap()
        .pointer_to_raw_data as usize
        + 2;
    let disp = i32::from_le_bytes(image.data[site..site + 4].try_into().unwrap());
    let next_va = image.section(".text").unwrap().virtual_address as i64 + 6;
    let target = (next_va + disp as i64) as u32;
    assert!(
        target >= idata.virtual_address
            && target < idata.virtual_address + idata.virtual_size.max(idata.size_of_raw_data),
        "thunk targets the IAT"
    );
}

/// Scenario: anti-dependency weak cycle. Both weaks tag each other with no
/// strong definition anywhere: a weak-cycle diagnostic names the loop and
/// no image is emitted.
#[test]
fn weak_cycle_is_fatal() {
    let mut writer_a = ObjWriter::new(MachineType::Amd64);
    let tag_b = writer_a.push_undefined("b");
    writer_a.push_weak("a", tag_b, solder::coff::symbol::WeakSearch::SearchLibrary);
    let mut writer_b = ObjWriter::new(MachineType::Amd64);
    let tag_a = writer_b.push_undefined("a");
    writer_b.push_weak("b", tag_a, solder::coff::symbol::WeakSearch::SearchLibrary);

    let dir = TestDir::new("weakcycle");
    let a_path = dir.write("a.obj", &writer_a.serialize());
    let b_path = dir.write("b.obj", &writer_b.serialize());
    let entry_path = dir.write("entry.obj", &make_entry_obj());
    let exe_path = dir.path("cycle.exe");

    let session = Session::new();
    link_args(
        &session,
        &[a_path, b_path, entry_path, format!("/OUT:{exe_path}")],
    );

    assert!(session.has_diag(DiagKind::WeakCycle));
    assert_ne!(session.exit_code(), 0);
    assert!(
        !std::path::Path::new(&exe_path).exists(),
        "no image on fatal diagnostics"
    );
}

/// A DLL with an export: `.edata` lands in the export directory and the
/// import library is emitted alongside.
#[test]
fn dll_exports_and_import_library() {
    let mut writer = ObjWriter::new(MachineType::Amd64);
    let text = writer.push_section(
        ".text$mn",
        section_flags::TEXT | SectionFlags::from_align(16),
        vec![0xC3; 32],
    );
    writer.push_external(text, "_DllMainCRTStartup", 0, true);
    writer.push_external(text, "do_thing", 16, true);

    let dir = TestDir::new("dll");
    let obj_path = dir.write("plugin.obj", &writer.serialize());
    let dll_path = dir.path("plugin.dll");
    let lib_path = dir.path("plugin.lib");

    let session = Session::new();
    link_args(
        &session,
        &[
            obj_path,
            format!("/OUT:{dll_path}"),
            format!("/IMPLIB:{lib_path}"),
            "/DLL".into(),
            "/SUBSYSTEM:WINDOWS".into(),
            "/EXPORT:do_thing".into(),
        ],
    );
    assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());

    let image = read_image(&dll_path);
    assert!(image
        .file_header
        .characteristics
        & 0x2000
        != 0);
    let edata = image.section(".edata").expect("export section");
    let export_dir = &image.optional_header.data_directories[0];
    assert_eq!(export_dir.virtual_address, edata.virtual_address);
    assert!(export_dir.size >= 40);

    // exported name table carries the symbol and the image name
    let window = &image.data[edata.pointer_to_raw_data as usize
        ..(edata.pointer_to_raw_data + edata.size_of_raw_data) as usize];
    assert!(window.windows(8).any(|w| w == b"do_thing"));
    assert!(window.windows(10).any(|w| w == b"plugin.dll"));

    // the import library round-trips through the archive reader
    let implib = std::fs::read(&lib_path).unwrap();
    let archive = solder::coff::archive::Archive::parse(implib).unwrap();
    let names: Vec<&str> = archive
        .symbol_map
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert!(names.contains(&"do_thing"));
    assert!(names.contains(&"__imp_do_thing"));
}

/// Two runs over the same inputs produce byte-identical images (and the
/// `/RELEASE` checksum is stable and nonzero).
#[test]
fn deterministic_output() {
    let dir = TestDir::new("determinism");
    let obj_data = {
        let mut writer = ObjWriter::new(MachineType::Amd64);
        let text = writer.push_section(
            ".text$mn",
            section_flags::TEXT | SectionFlags::from_align(16),
            vec![0xC3; 16],
        );
        writer.push_external(text, "mainCRTStartup", 0, true);
        writer.push_common("shared_buffer", 64);
        let data = writer.push_section(".data", section_flags::DATA, vec![7u8; 24]);
        writer.push_external(data, "table", 0, false);
        writer.serialize()
    };
    let obj_path = dir.write("main.obj", &obj_data);

    let mut images = Vec::new();
    for round in 0..2 {
        let exe_path = dir.path(&format!("out{round}.exe"));
        let session = Session::new();
        link_args(
            &session,
            &[
                obj_path.clone(),
                format!("/OUT:{exe_path}"),
                "/SUBSYSTEM:CONSOLE".into(),
                "/RELEASE".into(),
            ],
        );
        assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());
        images.push(std::fs::read(&exe_path).unwrap());
    }
    assert_eq!(images[0], images[1]);

    let image = read_image(&dir.path("out0.exe"));
    assert_ne!(image.optional_header.check_sum, 0);
    // common block landed in .bss with file size zero
    let bss = image.section(".bss").unwrap();
    assert_eq!(bss.pointer_to_raw_data, 0);
    assert!(bss.virtual_size >= 64);
}

/// `/FIXED` strips base relocations entirely.
#[test]
fn fixed_image_has_no_relocs() {
    let mut writer = ObjWriter::new(MachineType::Amd64);
    let text = writer.push_section(
        ".text$mn",
        section_flags::TEXT | SectionFlags::from_align(16),
        vec![0xC3; 16],
    );
    let entry = writer.push_external(text, "mainCRTStartup", 0, true);
    let data = writer.push_section(".data", section_flags::DATA, vec![0u8; 8]);
    writer.push_reloc(data, 0, entry, x64::ADDR64);

    let dir = TestDir::new("fixed");
    let obj_path = dir.write("main.obj", &writer.serialize());
    let exe_path = dir.path("main.exe");

    let session = Session::new();
    link_args(
        &session,
        &[
            obj_path,
            format!("/OUT:{exe_path}"),
            "/SUBSYSTEM:CONSOLE".into(),
            "/FIXED".into(),
        ],
    );
    assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());

    let image = read_image(&exe_path);
    assert!(image.section(".reloc").is_none());
    // RELOCS_STRIPPED
    assert!(image.file_header.characteristics & 0x0001 != 0);
}

/// The chunk map lists contributions with their provenance.
#[test]
fn map_file_output() {
    let dir = TestDir::new("map");
    let obj_path = dir.write("main.obj", &make_entry_obj());
    let exe_path = dir.path("main.exe");
    let map_path = dir.path("main.map");

    let session = Session::new();
    link_args(
        &session,
        &[
            obj_path,
            format!("/OUT:{exe_path}"),
            format!("/MAP:{map_path}"),
            "/SUBSYSTEM:CONSOLE".into(),
        ],
    );
    assert_eq!(session.exit_code(), 0, "{:?}", session.diagnostics());

    let map = std::fs::read_to_string(&map_path).unwrap();
    assert!(map.contains("# .text"));
    assert!(map.contains("main.obj SECT1 (.text$mn)"));
}
