//! Link configuration: the MSVC-style switch parser, shared between the
//! command line and obj-embedded `.drectve` directives, and the `Config`
//! value the driver consumes. Response files (`@file`) are expanded by the
//! binary before parsing.

use indexmap::IndexSet;

use crate::coff::MachineType;
use crate::pe::{DllCharacteristics, FileCharacteristics, Subsystem};

use super::session::{DiagKind, Session};

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchState {
    #[default]
    Null,
    Yes,
    No,
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ManifestOpt {
    #[default]
    Null,
    Embed,
    WriteToFile,
    No,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltName {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportDef {
    /// The defined symbol that backs the export.
    pub name: String,
    /// Exported name when it differs from `name`.
    pub alias: Option<String>,
    pub ordinal: Option<u16>,
    pub is_data: bool,
    /// `to.dll.func` forwarder string instead of a local definition.
    pub forwarder: Option<String>,
    pub origin: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeRule {
    pub src: String,
    pub dst: String,
}

/// Library input priority: command line, `/DEFAULTLIB`, obj directives.
pub const LIB_SOURCE_COUNT: usize = 3;
pub const LIB_SOURCE_CMDLINE: usize = 0;
pub const LIB_SOURCE_DEFAULT: usize = 1;
pub const LIB_SOURCE_OBJ: usize = 2;

pub struct Config {
    pub image_name: String,
    pub implib_name: Option<String>,
    pub map_name: Option<String>,
    pub pdb_name: String,
    pub machine: MachineType,
    pub subsystem: Subsystem,
    pub subsystem_ver: Option<(u16, u16)>,
    pub os_ver: (u16, u16),
    pub image_ver: (u16, u16),
    pub link_ver: (u8, u8),
    pub entry_point_name: Option<String>,
    pub image_base: Option<u64>,
    pub sect_align: u32,
    pub file_align: u32,
    pub stack_reserve: u64,
    pub stack_commit: u64,
    pub heap_reserve: u64,
    pub heap_commit: u64,
    pub time_stamp: u32,
    pub file_characteristics: FileCharacteristics,
    pub dll_characteristics: DllCharacteristics,
    pub fixed: bool,
    pub large_address_aware: SwitchState,
    pub opt_ref: SwitchState,
    pub write_checksum: bool,
    pub debug: bool,
    pub rad_debug: bool,
    pub guard_cf: bool,
    pub guard_ehcont: bool,
    pub guard_longjmp: bool,
    pub function_pad_min: Option<u32>,
    pub infer_function_pad_min: bool,
    pub worker_count: usize,
    pub no_default_libs: bool,
    pub no_ts_aware: bool,
    pub build_implib: bool,
    pub log_timers: bool,

    // input queues; the driver keeps cursors into these, directives append
    pub input_objs: Vec<String>,
    pub lib_inputs: [Vec<String>; LIB_SOURCE_COUNT],
    pub input_res: Vec<String>,
    pub input_manifests: Vec<String>,
    pub lib_dirs: Vec<String>,
    pub disallow_libs: Vec<String>,
    pub include_symbols: Vec<String>,
    pub alt_names: Vec<AltName>,
    pub exports: Vec<ExportDef>,
    pub merges: Vec<MergeRule>,
    pub delay_load_dlls: Vec<String>,
    pub manifest_dependencies: Vec<String>,

    pub manifest_opt: ManifestOpt,
    pub manifest_name: String,
    pub manifest_uac_level: String,
    pub manifest_ui_access: bool,
    pub manifest_resource_id: u32,
    pub mt_path: String,

    pub raw_cmd_line: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_name: String::new(),
            implib_name: None,
            map_name: None,
            pdb_name: String::new(),
            machine: MachineType::Unknown,
            subsystem: Subsystem::Unknown,
            subsystem_ver: None,
            os_ver: (6, 0),
            image_ver: (0, 0),
            link_ver: (14, 0),
            entry_point_name: None,
            image_base: None,
            sect_align: 0x1000,
            file_align: 0x200,
            stack_reserve: 0x10_0000,
            stack_commit: 0x1000,
            heap_reserve: 0x10_0000,
            heap_commit: 0x1000,
            time_stamp: 0,
            file_characteristics: FileCharacteristics::EXECUTABLE_IMAGE,
            dll_characteristics: DllCharacteristics::DYNAMIC_BASE
                | DllCharacteristics::NX_COMPAT
                | DllCharacteristics::HIGH_ENTROPY_VA,
            fixed: false,
            large_address_aware: SwitchState::Null,
            opt_ref: SwitchState::Null,
            write_checksum: false,
            debug: false,
            rad_debug: false,
            guard_cf: false,
            guard_ehcont: false,
            guard_longjmp: false,
            function_pad_min: None,
            infer_function_pad_min: false,
            worker_count: 0,
            no_default_libs: false,
            no_ts_aware: false,
            build_implib: true,
            log_timers: false,
            input_objs: Vec::new(),
            lib_inputs: Default::default(),
            input_res: Vec::new(),
            input_manifests: Vec::new(),
            lib_dirs: Vec::new(),
            disallow_libs: Vec::new(),
            include_symbols: Vec::new(),
            alt_names: Vec::new(),
            exports: Vec::new(),
            merges: Vec::new(),
            delay_load_dlls: Vec::new(),
            manifest_dependencies: Vec::new(),
            manifest_opt: ManifestOpt::Null,
            manifest_name: String::new(),
            manifest_uac_level: "asInvoker".into(),
            manifest_ui_access: false,
            manifest_resource_id: 1,
            mt_path: "mt.exe".into(),
            raw_cmd_line: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_args(session: &Session, args: &[String]) -> Self {
        let mut config = Config {
            raw_cmd_line: args.to_vec(),
            ..Default::default()
        };
        for arg in args {
            let switch = arg
                .strip_prefix('/')
                .or_else(|| arg.strip_prefix('-').filter(|_| !arg.contains('/')));
            match switch {
                Some(rest) => {
                    let (name, value) = match rest.split_once(':') {
                        Some((name, value)) => (name, value),
                        None => (rest, ""),
                    };
                    config.apply_option(session, name, value, None);
                }
                None => config.push_input_file(arg),
            }
        }
        config.finish_defaults();
        config
    }

    fn finish_defaults(&mut self) {
        if self.image_name.is_empty() {
            let is_dll = self
                .file_characteristics
                .contains(FileCharacteristics::FILE_DLL);
            let stem = self
                .input_objs
                .first()
                .map(|path| {
                    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
                    file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file)
                })
                .unwrap_or("a");
            self.image_name = format!("{stem}.{}", if is_dll { "dll" } else { "exe" });
        }
        if self.pdb_name.is_empty() {
            self.pdb_name = replace_extension(&self.image_name, "pdb");
        }
    }

    fn push_input_file(&mut self, path: &str) {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".lib") {
            self.lib_inputs[LIB_SOURCE_CMDLINE].push(path.to_owned());
        } else if lower.ends_with(".res") {
            self.input_res.push(path.to_owned());
        } else {
            self.input_objs.push(path.to_owned());
        }
    }

    pub fn is_dll(&self) -> bool {
        self.file_characteristics
            .contains(FileCharacteristics::FILE_DLL)
    }

    pub fn base_addr(&self) -> u64 {
        if let Some(base) = self.image_base {
            return base;
        }
        match (self.machine.word_size(), self.is_dll()) {
            (8, true) => 0x1_8000_0000,
            (8, false) => 0x1_4000_0000,
            (_, true) => 0x1000_0000,
            (_, false) => 0x40_0000,
        }
    }

    pub fn is_large_address_aware(&self) -> bool {
        match self.large_address_aware {
            SwitchState::Yes => true,
            SwitchState::No => false,
            SwitchState::Null => self.machine.word_size() == 8,
        }
    }

    pub fn do_debug_info(&self) -> bool {
        self.debug || self.rad_debug
    }

    /// The file name imports are matched against (`\x7f<image>_NULL_THUNK_DATA`).
    pub fn image_file_name(&self) -> &str {
        self.image_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.image_name)
    }

    /// Applies one switch. Shared between the command line and `.drectve`
    /// directives; `origin` names the obj a directive came from.
    pub fn apply_option(
        &mut self,
        session: &Session,
        name: &str,
        value: &str,
        origin: Option<&str>,
    ) {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "out" => self.image_name = value.to_owned(),
            "implib" => self.implib_name = Some(value.to_owned()),
            "pdb" => self.pdb_name = value.to_owned(),
            "map" => self.map_name = Some(if value.is_empty() {
                replace_extension(&self.image_name, "map")
            } else {
                value.to_owned()
            }),
            "machine" => match value.to_ascii_uppercase().as_str() {
                "X64" | "AMD64" => self.machine = MachineType::Amd64,
                "X86" | "I386" => self.machine = MachineType::I386,
                "ARM64" => self.machine = MachineType::Arm64,
                "ARM" => self.machine = MachineType::ArmNT,
                other => session.error(DiagKind::CmdLine, format!("unknown machine {other}")),
            },
            "subsystem" => {
                let mut parts = value.splitn(2, ',');
                let subsystem_name = parts.next().unwrap_or("");
                match Subsystem::parse(subsystem_name) {
                    Some(subsystem) => self.subsystem = subsystem,
                    None => session.error(
                        DiagKind::CmdLine,
                        format!("unknown subsystem {subsystem_name}"),
                    ),
                }
                if let Some(version) = parts.next() {
                    if let Some(version) = parse_version(version) {
                        self.subsystem_ver = Some(version);
                    } else {
                        session.error(
                            DiagKind::CmdLine,
                            format!("bad subsystem version \"{version}\""),
                        );
                    }
                }
            }
            "entry" => self.entry_point_name = Some(value.to_owned()),
            "base" => match parse_number(value) {
                Some(base) => self.image_base = Some(base),
                None => session.error(DiagKind::CmdLine, format!("bad /BASE value \"{value}\"")),
            },
            "align" => match parse_number(value) {
                Some(align) if align.is_power_of_two() => self.sect_align = align as u32,
                _ => session.error(DiagKind::CmdLine, format!("bad /ALIGN value \"{value}\"")),
            },
            "filealign" => match parse_number(value) {
                Some(align) if align.is_power_of_two() => self.file_align = align as u32,
                _ => session.error(DiagKind::CmdLine, format!("bad /FILEALIGN value \"{value}\"")),
            },
            "stack" => self.parse_reserve_commit(session, value, true),
            "heap" => self.parse_reserve_commit(session, value, false),
            "fixed" => self.fixed = !value.eq_ignore_ascii_case("no"),
            "largeaddressaware" => {
                self.large_address_aware = if value.eq_ignore_ascii_case("no") {
                    SwitchState::No
                } else {
                    SwitchState::Yes
                }
            }
            "opt" => {
                for opt in value.split(',') {
                    match opt.to_ascii_lowercase().as_str() {
                        "ref" => self.opt_ref = SwitchState::Yes,
                        "noref" => self.opt_ref = SwitchState::No,
                        "icf" | "noicf" | "lbr" | "nolbr" | "" => {}
                        other => session.error(
                            DiagKind::CmdLine,
                            format!("unknown /OPT argument \"{other}\""),
                        ),
                    }
                }
            }
            "release" => self.write_checksum = true,
            "debug" => self.debug = !value.eq_ignore_ascii_case("none"),
            "raddebug" => self.rad_debug = !value.eq_ignore_ascii_case("none"),
            "dll" => {
                self.file_characteristics |= FileCharacteristics::FILE_DLL;
            }
            "force" => {
                if value.is_empty() || value.eq_ignore_ascii_case("unresolved") {
                    session.set_force_unresolved(true);
                }
            }
            "guard" => {
                for guard in value.split(',') {
                    match guard.to_ascii_lowercase().as_str() {
                        "cf" => self.guard_cf = true,
                        "ehcont" => self.guard_ehcont = true,
                        "longjmp" => self.guard_longjmp = true,
                        "no" => {
                            self.guard_cf = false;
                            self.guard_ehcont = false;
                            self.guard_longjmp = false;
                        }
                        other => session
                            .error(DiagKind::CmdLine, format!("unknown /GUARD \"{other}\"")),
                    }
                }
            }
            "functionpadmin" => {
                if value.is_empty() {
                    self.infer_function_pad_min = true;
                } else {
                    match parse_number(value) {
                        Some(pad) => self.function_pad_min = Some(pad as u32),
                        None => session.error(
                            DiagKind::CmdLine,
                            format!("bad /FUNCTIONPADMIN value \"{value}\""),
                        ),
                    }
                }
            }
            "libpath" => self.lib_dirs.push(value.to_owned()),
            "defaultlib" => {
                let source = if origin.is_some() {
                    LIB_SOURCE_OBJ
                } else {
                    LIB_SOURCE_DEFAULT
                };
                for lib in value.split(',').filter(|v| !v.is_empty()) {
                    self.lib_inputs[source].push(with_lib_extension(lib));
                }
            }
            "disallowlib" | "nodefaultlib" if !value.is_empty() => {
                for lib in value.split(',').filter(|v| !v.is_empty()) {
                    self.disallow_libs.push(with_lib_extension(lib));
                }
            }
            "nodefaultlib" => self.no_default_libs = true,
            "disallowlib" => {}
            "include" => {
                for symbol in value.split(',').filter(|v| !v.is_empty()) {
                    self.include_symbols.push(symbol.to_owned());
                }
            }
            "alternatename" => match value.split_once('=') {
                Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                    self.alt_names.push(AltName {
                        from: from.to_owned(),
                        to: to.to_owned(),
                    });
                }
                _ => session.error(
                    DiagKind::CmdLine,
                    format!("bad /ALTERNATENAME value \"{value}\""),
                ),
            },
            "merge" => match value.split_once('=') {
                Some((src, dst)) if !src.is_empty() && !dst.is_empty() => {
                    self.merges.push(MergeRule {
                        src: src.to_owned(),
                        dst: dst.to_owned(),
                    });
                }
                _ => session.error(DiagKind::CmdLine, format!("bad /MERGE value \"{value}\"")),
            },
            "export" => match parse_export(value, origin) {
                Some(export) => self.exports.push(export),
                None => session.error_obj(
                    DiagKind::IllExport,
                    origin.unwrap_or("<cmdline>"),
                    format!("invalid export directive \"{value}\""),
                ),
            },
            "delayload" => {
                let dll = value.to_ascii_lowercase();
                if !dll.is_empty() && !self.delay_load_dlls.contains(&dll) {
                    self.delay_load_dlls.push(dll);
                }
            }
            "manifest" => {
                self.manifest_opt = match value.to_ascii_lowercase().as_str() {
                    "" | "embed" => ManifestOpt::Embed,
                    "no" => ManifestOpt::No,
                    _ => ManifestOpt::Embed,
                }
            }
            "manifestfile" => {
                self.manifest_name = value.to_owned();
                if self.manifest_opt == ManifestOpt::Null {
                    self.manifest_opt = ManifestOpt::WriteToFile;
                }
            }
            "manifestinput" => self.input_manifests.push(value.to_owned()),
            "manifestdependency" => self.manifest_dependencies.push(value.to_owned()),
            "manifestuac" => {
                for part in value.split(' ') {
                    if let Some(level) = part.strip_prefix("level=") {
                        self.manifest_uac_level = level.trim_matches('\'').to_owned();
                    } else if let Some(access) = part.strip_prefix("uiAccess=") {
                        self.manifest_ui_access = access.trim_matches('\'') == "true";
                    }
                }
            }
            "tsaware" => self.no_ts_aware = value.eq_ignore_ascii_case("no"),
            "dynamicbase" => {
                self.dll_characteristics
                    .set(DllCharacteristics::DYNAMIC_BASE, !value.eq_ignore_ascii_case("no"));
            }
            "nxcompat" => {
                self.dll_characteristics
                    .set(DllCharacteristics::NX_COMPAT, !value.eq_ignore_ascii_case("no"));
            }
            "highentropyva" => {
                self.dll_characteristics.set(
                    DllCharacteristics::HIGH_ENTROPY_VA,
                    !value.eq_ignore_ascii_case("no"),
                );
            }
            "threads" | "workers" => {
                self.worker_count = parse_number(value).unwrap_or(0) as usize;
            }
            "timestamp" => self.time_stamp = parse_number(value).unwrap_or(0) as u32,
            "mtpath" => self.mt_path = value.to_owned(),
            "time" => self.log_timers = true,
            // recognized and deliberately ignored
            "nologo" | "incremental" | "ignore" | "errorreport" | "section" | "guardsym"
            | "failifmismatch" | "editandcontinue" | "throwingnew" | "natvis" | "ilk"
            | "machine32bit" => {}
            _ => {
                let origin = origin.unwrap_or("<cmdline>");
                session.error_obj(
                    DiagKind::UnknownDirective,
                    origin,
                    format!("unknown directive \"{name}\""),
                );
            }
        }
    }

    fn parse_reserve_commit(&mut self, session: &Session, value: &str, is_stack: bool) {
        let mut parts = value.splitn(2, ',');
        let reserve = parts.next().and_then(parse_number);
        let commit = parts.next().map(parse_number);
        match (reserve, commit) {
            (Some(reserve), None) => {
                if is_stack {
                    self.stack_reserve = reserve;
                } else {
                    self.heap_reserve = reserve;
                }
            }
            (Some(reserve), Some(Some(commit))) => {
                if is_stack {
                    self.stack_reserve = reserve;
                    self.stack_commit = commit;
                } else {
                    self.heap_reserve = reserve;
                    self.heap_commit = commit;
                }
            }
            _ => session.error(
                DiagKind::CmdLine,
                format!(
                    "bad /{} value \"{value}\"",
                    if is_stack { "STACK" } else { "HEAP" }
                ),
            ),
        }
    }

    /// Parses `.drectve` contents and applies every recognized option.
    pub fn apply_directives(&mut self, session: &Session, text: &[u8], obj_path: &str) {
        // BOM or the all-spaces prefix some compilers emit
        let text = if text.starts_with(&[0xEF, 0xBB, 0xBF]) {
            &text[3..]
        } else {
            text
        };
        let text = String::from_utf8_lossy(text);
        for arg in parse_windows_args(&text) {
            let Some(rest) = arg.strip_prefix(['/', '-']) else {
                session.error_obj(
                    DiagKind::UnknownDirective,
                    obj_path,
                    format!("directive is not a switch: \"{arg}\""),
                );
                continue;
            };
            let (name, value) = match rest.split_once(':') {
                Some((name, value)) => (name, value),
                None => (rest, ""),
            };
            self.apply_option(session, name, value, Some(obj_path));
        }
    }
}

fn parse_export(value: &str, origin: Option<&str>) -> Option<ExportDef> {
    let mut parts = value.split(',');
    let spec = parts.next()?;
    if spec.is_empty() {
        return None;
    }
    let (exported, internal) = match spec.split_once('=') {
        Some((exported, internal)) => (Some(exported.to_owned()), internal.to_owned()),
        None => (None, spec.to_owned()),
    };
    let forwarder = internal.contains('.').then(|| internal.clone());
    let mut export = ExportDef {
        name: internal,
        alias: exported,
        ordinal: None,
        is_data: false,
        forwarder,
        origin: origin.map(str::to_owned),
    };
    for extra in parts {
        if let Some(ordinal) = extra.strip_prefix('@') {
            export.ordinal = ordinal.parse().ok();
        } else if extra.eq_ignore_ascii_case("data") {
            export.is_data = true;
        }
    }
    Some(export)
}

/// Windows command-line token rules, as far as directives need them: tokens
/// split on whitespace, double quotes group.
pub fn parse_windows_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in text.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

pub fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_version(text: &str) -> Option<(u16, u16)> {
    match text.split_once('.') {
        Some((major, minor)) => Some((major.parse().ok()?, minor.parse().ok()?)),
        None => Some((text.parse().ok()?, 0)),
    }
}

pub fn with_lib_extension(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".lib") {
        name.to_owned()
    } else {
        format!("{name}.lib")
    }
}

pub fn replace_extension(path: &str, new_ext: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.{new_ext}"),
        None => format!("{path}.{new_ext}"),
    }
}

/// Case-normalized path identity for loaded/disallowed-library sets.
pub fn lib_identity(path: &str) -> String {
    path.to_ascii_lowercase().replace('\\', "/")
}

/// Deterministic, insertion-ordered string set used for the loaded and
/// disallowed library ledgers.
pub type PathSet = IndexSet<String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_inputs_by_extension() {
        let session = Session::new();
        let config = Config::from_args(
            &session,
            &args(&["main.obj", "helper.lib", "version.res", "other.o"]),
        );
        assert_eq!(config.input_objs, vec!["main.obj", "other.o"]);
        assert_eq!(config.lib_inputs[LIB_SOURCE_CMDLINE], vec!["helper.lib"]);
        assert_eq!(config.input_res, vec!["version.res"]);
        assert_eq!(config.image_name, "main.exe");
    }

    #[test]
    fn parses_core_switches() {
        let session = Session::new();
        let config = Config::from_args(
            &session,
            &args(&[
                "/OUT:game.exe",
                "/MACHINE:X64",
                "/SUBSYSTEM:CONSOLE,6.2",
                "/ENTRY:wmainCRTStartup",
                "/BASE:0x180000000",
                "/STACK:0x200000,0x2000",
                "/OPT:REF",
                "/FIXED",
                "/MERGE:.mytext=.text",
                "/INCLUDE:keep_this",
                "/ALTERNATENAME:old=new",
                "/DELAYLOAD:winmm.dll",
                "main.obj",
            ]),
        );
        assert_eq!(config.image_name, "game.exe");
        assert_eq!(config.machine, MachineType::Amd64);
        assert_eq!(config.subsystem, Subsystem::WindowsCui);
        assert_eq!(config.subsystem_ver, Some((6, 2)));
        assert_eq!(config.entry_point_name.as_deref(), Some("wmainCRTStartup"));
        assert_eq!(config.image_base, Some(0x1_8000_0000));
        assert_eq!((config.stack_reserve, config.stack_commit), (0x200000, 0x2000));
        assert_eq!(config.opt_ref, SwitchState::Yes);
        assert!(config.fixed);
        assert_eq!(config.merges[0], MergeRule { src: ".mytext".into(), dst: ".text".into() });
        assert_eq!(config.include_symbols, vec!["keep_this"]);
        assert_eq!(config.alt_names[0], AltName { from: "old".into(), to: "new".into() });
        assert_eq!(config.delay_load_dlls, vec!["winmm.dll"]);
        assert!(!session.has_errors());
    }

    #[test]
    fn export_directive_forms() {
        let export = parse_export("my_func", None).unwrap();
        assert_eq!(export.name, "my_func");
        assert!(export.alias.is_none() && export.forwarder.is_none());

        let export = parse_export("ExpName=internal_name,@4,DATA", None).unwrap();
        assert_eq!(export.name, "internal_name");
        assert_eq!(export.alias.as_deref(), Some("ExpName"));
        assert_eq!(export.ordinal, Some(4));
        assert!(export.is_data);

        let export = parse_export("fwd=other.dll.func", None).unwrap();
        assert_eq!(export.forwarder.as_deref(), Some("other.dll.func"));

        assert!(parse_export("", None).is_none());
    }

    #[test]
    fn directives_share_the_switch_grammar() {
        let session = Session::new();
        let mut config = Config::default();
        config.apply_directives(
            &session,
            b"/DEFAULTLIB:libcmt /DEFAULTLIB:oldnames /EXPORT:foo /unknowndir:x",
            "crt.obj",
        );
        assert_eq!(
            config.lib_inputs[LIB_SOURCE_OBJ],
            vec!["libcmt.lib", "oldnames.lib"]
        );
        assert_eq!(config.exports.len(), 1);
        assert_eq!(config.exports[0].origin.as_deref(), Some("crt.obj"));
        assert!(session.has_diag(DiagKind::UnknownDirective));
        assert!(!session.has_errors());
    }

    #[test]
    fn quoted_directive_values_keep_spaces() {
        let parsed = parse_windows_args(
            "/manifestdependency:\"type='win32' name='Common-Controls'\" /include:a",
        );
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].contains("name='Common-Controls'"));
    }

    #[test]
    fn default_base_addresses() {
        let session = Session::new();
        let mut config = Config::from_args(&session, &args(&["/MACHINE:X64", "a.obj"]));
        assert_eq!(config.base_addr(), 0x1_4000_0000);
        config.file_characteristics |= FileCharacteristics::FILE_DLL;
        assert_eq!(config.base_addr(), 0x1_8000_0000);
        assert!(config.is_large_address_aware());
        config.large_address_aware = SwitchState::No;
        assert!(!config.is_large_address_aware());
    }
}
