//! The input driver: a state machine over queues of pending work that runs
//! object/library/import ingestion to a fixed point, then locates the entry
//! point and synthesizes the linker-generated objects.

use indexmap::IndexMap;

use crate::coff::archive::{Archive, ImportHeader};
use crate::coff::object::ObjectFile;
use crate::coff::symbol::{SymbolInterp, WeakSearch};
use crate::pe::{entry_point_names, remap_user_entry, Subsystem};

use super::config::{
    lib_identity, Config, ManifestOpt, PathSet, LIB_SOURCE_COUNT, LIB_SOURCE_DEFAULT,
    LIB_SOURCE_OBJ,
};
use super::exports::finalize_exports;
use super::image::LOAD_CONFIG_SYMBOL_NAME;
use super::libs::{queue_lib_member_input, InputObj, Lib, MemberInputs};
use super::objects::{input_obj_symbols, Obj};
use super::patch::finalize_weak_symbols;
use super::pool::{SlotBuffer, ThreadPool};
use super::select::Selector;
use super::session::{DiagKind, Session};
use super::symtab::{SymbolLoc, SymbolScope, SymbolTable};
use super::synth;

pub struct LinkContext {
    pub objs: Vec<Obj>,
    pub libs: Vec<Lib>,
    pub symtab: SymbolTable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    InputDisallowLibs,
    InputImports,
    InputSymbols,
    InputObjs,
    InputLibs,
    InputAlternateNames,
    PushDllHelperUndefSymbol,
    PushLoadConfigUndefSymbol,
    LookupUndef,
    LookupWeak,
    LookupEntryPoint,
    InputLinkerObjs,
    ReportUnresolvedSymbols,
}

struct Driver<'a> {
    session: &'a Session,
    pool: &'a ThreadPool,

    // cursors into the growable config lists: everything past a cursor is
    // pending work a directive may have appended
    next_disallow: usize,
    next_include: usize,
    next_alt_name: usize,
    next_obj_input: usize,
    next_lib_input: [usize; LIB_SOURCE_COUNT],

    pending_objs: Vec<InputObj>,
    pending_imports: Vec<(Vec<u8>, u64)>,

    loaded_objs: PathSet,
    disallowed_libs: PathSet,
    loaded_libs: PathSet,
    missing_libs: PathSet,

    lookup_undef: Vec<(u32, u32)>,
    lookup_weak: Vec<(u32, u32)>,
    unresolved_undef: Vec<(u32, u32)>,
    unresolved_weak: Vec<(u32, u32)>,

    static_imports: IndexMap<String, Vec<ImportHeader>>,
    delayed_imports: IndexMap<String, Vec<ImportHeader>>,

    next_synthetic_ord: u64,
    entry_point_attempted: bool,
    linker_objs_pending: bool,
    report_pending: bool,
}

pub fn build_link_context(
    pool: &ThreadPool,
    session: &Session,
    config: &mut Config,
) -> LinkContext {
    let mut ctx = LinkContext {
        objs: Vec::new(),
        libs: Vec::new(),
        symtab: SymbolTable::new(),
    };
    let mut driver = Driver {
        session,
        pool,
        next_disallow: 0,
        next_include: 0,
        next_alt_name: 0,
        next_obj_input: 0,
        next_lib_input: [0; LIB_SOURCE_COUNT],
        pending_objs: Vec::new(),
        pending_imports: Vec::new(),
        loaded_objs: PathSet::default(),
        disallowed_libs: PathSet::default(),
        loaded_libs: PathSet::default(),
        missing_libs: PathSet::default(),
        lookup_undef: Vec::new(),
        lookup_weak: Vec::new(),
        unresolved_undef: Vec::new(),
        unresolved_weak: Vec::new(),
        static_imports: IndexMap::new(),
        delayed_imports: IndexMap::new(),
        next_synthetic_ord: 0,
        entry_point_attempted: false,
        linker_objs_pending: true,
        report_pending: true,
    };

    // the null obj donates the import stub placeholder
    driver.push_synthetic_obj("* null obj *", synth::make_null_obj());

    let mut states = std::collections::VecDeque::new();
    states.push_back(State::InputDisallowLibs);
    states.push_back(State::InputObjs);
    states.push_back(State::InputLibs);
    if !config.delay_load_dlls.is_empty() {
        states.push_back(State::PushDllHelperUndefSymbol);
    }
    if config.guard_cf || config.guard_ehcont || config.guard_longjmp {
        states.push_back(State::PushLoadConfigUndefSymbol);
    }

    loop {
        while let Some(state) = states.pop_front() {
            driver.run_state(state, config, &mut ctx);
            if state == State::ReportUnresolvedSymbols && !driver.unresolved_undef.is_empty() {
                return ctx;
            }
        }

        // schedule the next state by pending-work priority
        if driver.next_disallow < config.disallow_libs.len() {
            states.push_back(State::InputDisallowLibs);
        } else if !driver.pending_imports.is_empty() {
            states.push_back(State::InputImports);
        } else if driver.next_include < config.include_symbols.len() {
            states.push_back(State::InputSymbols);
        } else if driver.next_alt_name < config.alt_names.len() {
            states.push_back(State::InputAlternateNames);
        } else if !driver.pending_objs.is_empty() || driver.next_obj_input < config.input_objs.len()
        {
            states.push_back(State::InputObjs);
        } else if driver.has_pending_lib_inputs(config) {
            states.push_back(State::InputLibs);
        } else if !driver.lookup_undef.is_empty() {
            states.push_back(State::LookupUndef);
        } else if !driver.lookup_weak.is_empty() {
            states.push_back(State::LookupWeak);
        } else if !driver.unresolved_weak.is_empty() {
            // no strong definitions exist for these; fall back to their tags
            driver.unresolved_weak.clear();
        } else if !driver.entry_point_attempted {
            driver.entry_point_attempted = true;
            states.push_back(State::LookupEntryPoint);
        } else if driver.linker_objs_pending {
            driver.linker_objs_pending = false;
            states.push_back(State::InputLinkerObjs);
        } else if !driver.unresolved_undef.is_empty() && driver.report_pending {
            driver.report_pending = false;
            states.push_back(State::ReportUnresolvedSymbols);
        } else {
            break;
        }
    }

    // replace weak symbols without a strong definition by their fallbacks
    finalize_weak_symbols(pool, session, &ctx.symtab, &ctx.objs);

    ctx
}

impl<'a> Driver<'a> {
    fn push_synthetic_obj(&mut self, name: &str, data: Vec<u8>) {
        let ord = self.next_synthetic_ord;
        self.next_synthetic_ord += 1;
        self.pending_objs.push(InputObj {
            path: name.to_owned(),
            dedup_id: format!("{name}#{ord}"),
            data: Some(data),
            is_thin: false,
            lib: None,
            input_ord: ord,
        });
    }

    fn has_pending_lib_inputs(&self, config: &Config) -> bool {
        let source_count = if config.no_default_libs {
            1
        } else {
            LIB_SOURCE_COUNT
        };
        (0..source_count).any(|source| self.next_lib_input[source] < config.lib_inputs[source].len())
    }

    fn run_state(&mut self, state: State, config: &mut Config, ctx: &mut LinkContext) {
        match state {
            State::InputDisallowLibs => {
                for lib in &config.disallow_libs[self.next_disallow..] {
                    self.disallowed_libs.insert(lib_identity(lib));
                }
                self.next_disallow = config.disallow_libs.len();
            }
            State::InputImports => self.input_imports(config, ctx),
            State::InputSymbols => {
                let symbols: Vec<String> =
                    config.include_symbols[self.next_include..].to_vec();
                self.next_include = config.include_symbols.len();
                self.push_synthetic_obj("* include symbols *", synth::make_include_obj(&symbols));
            }
            State::InputAlternateNames => {
                let pairs: Vec<(String, String)> = config.alt_names[self.next_alt_name..]
                    .iter()
                    .map(|alt| (alt.from.clone(), alt.to.clone()))
                    .collect();
                self.next_alt_name = config.alt_names.len();
                self.push_synthetic_obj("* alternate names *", synth::make_alt_names_obj(&pairs));
            }
            State::InputObjs => self.input_objs(config, ctx),
            State::InputLibs => self.input_libs(config, ctx),
            State::PushDllHelperUndefSymbol => {
                let helper = match config.machine {
                    crate::coff::MachineType::I386 => "___delayLoadHelper2@8",
                    _ => "__delayLoadHelper2",
                };
                config.apply_option(self.session, "include", helper, None);
            }
            State::PushLoadConfigUndefSymbol => {
                config.apply_option(self.session, "include", LOAD_CONFIG_SYMBOL_NAME, None);
            }
            State::LookupUndef => self.lookup_undef(ctx),
            State::LookupWeak => self.lookup_weak(ctx),
            State::LookupEntryPoint => self.lookup_entry_point(config, ctx),
            State::InputLinkerObjs => self.input_linker_objs(config, ctx),
            State::ReportUnresolvedSymbols => {
                let mut unresolved = std::mem::take(&mut self.unresolved_undef);
                unresolved.sort_unstable();
                unresolved.dedup();
                for (obj_idx, symbol_idx) in &unresolved {
                    let obj = &ctx.objs[*obj_idx as usize];
                    let name = obj
                        .object
                        .symbol(*symbol_idx)
                        .map(|symbol| symbol.name.clone())
                        .unwrap_or_default();
                    self.session.error_obj(
                        DiagKind::UnresolvedSymbol,
                        &obj.path,
                        format!("unresolved symbol {name}"),
                    );
                }
                self.unresolved_undef = unresolved;
            }
        }
    }

    fn input_imports(&mut self, config: &Config, ctx: &mut LinkContext) {
        let pending = std::mem::take(&mut self.pending_imports);
        for (data, _) in pending {
            let import = match ImportHeader::parse(&data) {
                Ok(import) => import,
                Err(parse_error) => {
                    self.session
                        .error(DiagKind::IllData, format!("bad import member: {parse_error}"));
                    continue;
                }
            };

            if import.machine != config.machine
                && import.machine != crate::coff::MachineType::Unknown
            {
                self.session.error(
                    DiagKind::IncompatibleMachine,
                    format!(
                        "symbol {} pulled in import with incompatible machine {} (expected {})",
                        import.func_name,
                        import.machine.name(),
                        config.machine.name()
                    ),
                );
                continue;
            }

            if ctx
                .symtab
                .search(SymbolScope::Defined, &import.func_name)
                .is_some()
            {
                continue;
            }

            // point the thunk names at the stub until the real import
            // objects are synthesized
            let Some(stub) = ctx.symtab.search(SymbolScope::Defined, synth::IMPORT_STUB_SYMBOL)
            else {
                continue;
            };
            let (stub_obj, stub_symbol) = stub.defined();
            let stub_loc = SymbolLoc::Defined {
                obj: stub_obj,
                symbol_idx: stub_symbol,
            };
            let selector = Selector {
                objs: &ctx.objs,
                session: self.session,
            };
            ctx.symtab
                .insert_or_replace(SymbolScope::Defined, &import.func_name, stub_loc, &selector);
            ctx.symtab.insert_or_replace(
                SymbolScope::Defined,
                &format!("__imp_{}", import.func_name),
                stub_loc,
                &selector,
            );

            let dll_key = import.dll_name.to_ascii_lowercase();
            let imports = if config.delay_load_dlls.contains(&dll_key) {
                &mut self.delayed_imports
            } else {
                &mut self.static_imports
            };
            imports.entry(import.dll_name.clone()).or_default().push(import);
        }
    }

    fn input_objs(&mut self, config: &mut Config, ctx: &mut LinkContext) {
        // collect this round's unique inputs
        let mut batch: Vec<InputObj> = Vec::new();
        for path in &config.input_objs[self.next_obj_input..] {
            let ord = self.next_synthetic_ord;
            self.next_synthetic_ord += 1;
            batch.push(InputObj {
                path: path.clone(),
                dedup_id: path.clone(),
                data: None,
                is_thin: false,
                lib: None,
                input_ord: ord,
            });
        }
        self.next_obj_input = config.input_objs.len();
        batch.append(&mut self.pending_objs);
        batch.sort_by_key(|input| input.input_ord);

        let mut unique: Vec<InputObj> = Vec::new();
        for input in batch {
            if self.loaded_objs.contains(&input.dedup_id) {
                continue;
            }
            if input.data.is_none() {
                // disk-backed inputs additionally dedup by resolved path
                let full = std::fs::canonicalize(&input.path)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| input.path.clone());
                let full_id = lib_identity(&full);
                if self.loaded_objs.contains(&full_id) {
                    continue;
                }
                self.loaded_objs.insert(full_id);
            }
            self.loaded_objs.insert(input.dedup_id.clone());
            unique.push(input);
        }
        if unique.is_empty() {
            return;
        }

        // parallel disk read for inputs without bytes
        self.pool.for_each_mut(&mut unique, |_, input| {
            if input.data.is_none() {
                input.data = std::fs::read(&input.path).ok();
            }
        });
        unique.retain(|input| {
            if input.data.is_none() {
                self.session.error(
                    DiagKind::InvalidPath,
                    format!("unable to find obj \"{}\"", input.path),
                );
                return false;
            }
            true
        });

        // parallel parse
        let parsed = SlotBuffer::with_capacity(unique.len());
        self.pool.for_parallel(unique.len(), |_, input_idx| {
            let data = unique[input_idx].data.clone().unwrap();
            parsed.push((input_idx, ObjectFile::parse(data)));
        });
        let mut parsed = parsed.into_vec();
        parsed.sort_unstable_by_key(|(input_idx, _)| *input_idx);

        let first_new_obj = ctx.objs.len();
        for (input_idx, result) in parsed {
            let input = &unique[input_idx];
            let object = match result {
                Ok(object) => object,
                Err(parse_error) => {
                    self.session.error_obj(
                        DiagKind::IllData,
                        &input.path,
                        format!("unable to parse obj: {parse_error}"),
                    );
                    continue;
                }
            };

            // machine inference and compatibility
            if object.machine != crate::coff::MachineType::Unknown {
                if config.machine == crate::coff::MachineType::Unknown {
                    config.machine = object.machine;
                } else if object.machine != config.machine {
                    self.session.error_obj(
                        DiagKind::IncompatibleMachine,
                        &input.path,
                        format!(
                            "obj machine {} is incompatible with link machine {}",
                            object.machine.name(),
                            config.machine.name()
                        ),
                    );
                    continue;
                }
            }

            let obj = Obj::new(
                object,
                ctx.objs.len() as u32,
                input.input_ord,
                input.path.clone(),
                input.lib,
            );
            ctx.objs.push(obj);
        }

        if config.machine != crate::coff::MachineType::Unknown && config.infer_function_pad_min {
            config.function_pad_min = Some(match config.machine {
                crate::coff::MachineType::Amd64 | crate::coff::MachineType::I386 => 6,
                _ => 8,
            });
            config.infer_function_pad_min = false;
        }

        // apply directives before symbol input so defaultlibs and includes
        // of this round schedule properly
        for obj_idx in first_new_obj..ctx.objs.len() {
            let directive_data = ctx.objs[obj_idx]
                .object
                .directive_data()
                .map(<[u8]>::to_vec);
            if let Some(directive_data) = directive_data {
                let path = ctx.objs[obj_idx].path.clone();
                config.apply_directives(self.session, &directive_data, &path);
            }
        }

        // input symbols, queue lookups
        let selector = Selector {
            objs: &ctx.objs,
            session: self.session,
        };
        let result = input_obj_symbols(
            self.pool,
            &ctx.symtab,
            &ctx.objs,
            first_new_obj..ctx.objs.len(),
            &selector,
        );
        // unresolved references get another chance against the new inputs
        self.lookup_undef.append(&mut self.unresolved_undef);
        self.lookup_undef.extend(result.undef);
        self.lookup_weak.extend(result.weak);
    }

    fn input_libs(&mut self, config: &mut Config, ctx: &mut LinkContext) {
        let source_count = if config.no_default_libs {
            1
        } else {
            LIB_SOURCE_COUNT
        };
        for source in 0..source_count {
            let pending: Vec<String> =
                config.lib_inputs[source][self.next_lib_input[source]..].to_vec();
            self.next_lib_input[source] = config.lib_inputs[source].len();

            for path in pending {
                if source == LIB_SOURCE_DEFAULT || source == LIB_SOURCE_OBJ {
                    if self.disallowed_libs.contains(&lib_identity(&path)) {
                        continue;
                    }
                }
                if self.loaded_libs.contains(&lib_identity(&path)) {
                    continue;
                }

                let matches = search_lib_dirs(&config.lib_dirs, &path);
                if matches.is_empty() {
                    if self.missing_libs.insert(lib_identity(&path)) {
                        self.session.error(
                            DiagKind::FileNotFound,
                            format!("unable to find library `{path}`"),
                        );
                    }
                    continue;
                }
                let full_path = matches[0].clone();
                if self.loaded_libs.contains(&lib_identity(&full_path)) {
                    continue;
                }
                if matches.len() > 1 {
                    self.session.error(
                        DiagKind::MultipleLibMatch,
                        format!("multiple libs match `{path}` (picking first match)"),
                    );
                }
                self.loaded_libs.insert(lib_identity(&path));
                self.loaded_libs.insert(lib_identity(&full_path));

                let data = match std::fs::read(&full_path) {
                    Ok(data) => data,
                    Err(io_error) => {
                        self.session.error(
                            DiagKind::InvalidPath,
                            format!("unable to read library `{full_path}`: {io_error}"),
                        );
                        continue;
                    }
                };
                let archive = match Archive::parse(data) {
                    Ok(archive) => archive,
                    Err(parse_error) => {
                        self.session.error_obj(
                            DiagKind::IllData,
                            &full_path,
                            format!("unable to parse library: {parse_error}"),
                        );
                        continue;
                    }
                };

                let lib_idx = ctx.libs.len() as u32;
                ctx.libs.push(Lib {
                    archive,
                    input_idx: lib_idx,
                    path: full_path,
                });

                // push member symbols into the lib scope in parallel
                let lib = &ctx.libs[lib_idx as usize];
                let selector = Selector {
                    objs: &ctx.objs,
                    session: self.session,
                };
                self.pool
                    .for_parallel(lib.archive.symbol_map.len(), |_, symbol_idx| {
                        let (name, member_off) = &lib.archive.symbol_map[symbol_idx];
                        ctx.symtab.insert_or_replace(
                            SymbolScope::Lib,
                            name,
                            SymbolLoc::Lib {
                                lib: lib_idx,
                                member_off: *member_off,
                            },
                            &selector,
                        );
                    });
            }
        }
    }

    fn lookup_undef(&mut self, ctx: &mut LinkContext) {
        let lookups = std::mem::take(&mut self.lookup_undef);
        let mut inputs = MemberInputs::default();
        for (obj_idx, symbol_idx) in lookups {
            let obj = &ctx.objs[obj_idx as usize];
            let Some(symbol) = obj.object.symbol(symbol_idx) else {
                continue;
            };
            if ctx
                .symtab
                .search(SymbolScope::Defined, &symbol.name)
                .is_some()
            {
                continue;
            }
            match ctx.symtab.search(SymbolScope::Lib, &symbol.name) {
                Some(member) => {
                    let SymbolLoc::Lib { lib, member_off } = member.loc else {
                        continue;
                    };
                    queue_lib_member_input(self.session, &ctx.libs, lib, member_off, &mut inputs);
                }
                None => self.unresolved_undef.push((obj_idx, symbol_idx)),
            }
        }
        self.queue_member_inputs(inputs);
    }

    fn lookup_weak(&mut self, ctx: &mut LinkContext) {
        let lookups = std::mem::take(&mut self.lookup_weak);
        let mut inputs = MemberInputs::default();
        for (obj_idx, symbol_idx) in lookups {
            let obj = &ctx.objs[obj_idx as usize];
            let Some(symbol) = obj.object.symbol(symbol_idx) else {
                continue;
            };

            // a strong definition settles the weak
            if let Some(defn) = ctx.symtab.search(SymbolScope::Defined, &symbol.name) {
                let (defn_obj, defn_symbol) = defn.defined();
                let is_strong = ctx.objs[defn_obj as usize]
                    .object
                    .symbol(defn_symbol)
                    .map(|parsed| parsed.interp() != SymbolInterp::Weak)
                    .unwrap_or(false);
                if is_strong {
                    continue;
                }
            }

            let member = match symbol.weak.as_ref().map(|weak| weak.characteristics) {
                // resolves only if a strong definition pulls the member in
                Some(WeakSearch::NoLibrary) | None => None,
                Some(WeakSearch::AntiDependency) | Some(WeakSearch::SearchLibrary) => {
                    ctx.symtab.search(SymbolScope::Lib, &symbol.name)
                }
                Some(WeakSearch::SearchAlias) => {
                    ctx.symtab.search(SymbolScope::Lib, &symbol.name).or_else(|| {
                        let tag_name = symbol
                            .weak
                            .as_ref()
                            .and_then(|weak| obj.object.symbol(weak.tag_index))
                            .map(|tag| tag.name.as_str())?;
                        if let Some((alias_name, alias_tag)) = parse_mingw_weak_alias(tag_name) {
                            // `.weak.<name>.default.<tag>`: search both parts
                            ctx.symtab
                                .search(SymbolScope::Lib, alias_name)
                                .or_else(|| ctx.symtab.search(SymbolScope::Lib, alias_tag))
                        } else {
                            ctx.symtab.search(SymbolScope::Lib, tag_name)
                        }
                    })
                }
            };

            match member {
                Some(member) => {
                    let SymbolLoc::Lib { lib, member_off } = member.loc else {
                        continue;
                    };
                    queue_lib_member_input(self.session, &ctx.libs, lib, member_off, &mut inputs);
                }
                None => {
                    if symbol.weak.as_ref().map(|weak| weak.characteristics)
                        != Some(WeakSearch::NoLibrary)
                    {
                        self.unresolved_weak.push((obj_idx, symbol_idx));
                    }
                }
            }
        }
        self.queue_member_inputs(inputs);
    }

    fn queue_member_inputs(&mut self, mut inputs: MemberInputs) {
        // deterministic ordering across the parallel-discovered members
        inputs.objs.sort_by_key(|input| input.input_ord);
        inputs.imports.sort_by_key(|input| input.input_ord);
        self.pending_objs.extend(inputs.objs);
        self.pending_imports
            .extend(inputs.imports.into_iter().map(|i| (i.data, i.input_ord)));
    }

    fn lookup_entry_point(&mut self, config: &mut Config, ctx: &mut LinkContext) {
        if config.entry_point_name.is_none() {
            let mut chosen: Option<String> = None;

            if config.subsystem == Subsystem::Unknown {
                // probe every subsystem in both scopes
                'search: for scope in [SymbolScope::Defined, SymbolScope::Lib] {
                    for subsystem in Subsystem::ALL {
                        for name in
                            entry_point_names(config.machine, subsystem, config.file_characteristics)
                        {
                            if ctx.symtab.search(scope, name).is_some() {
                                config.subsystem = subsystem;
                                chosen = Some((*name).to_owned());
                                break 'search;
                            }
                        }
                    }
                }
            } else {
                let names =
                    entry_point_names(config.machine, config.subsystem, config.file_characteristics);
                for name in names {
                    if ctx.symtab.search(SymbolScope::Defined, name).is_some() {
                        if let Some(existing) = &chosen {
                            self.session.error(
                                DiagKind::EntryPoint,
                                format!("multiple entry point symbols found: {existing} and {name}"),
                            );
                        } else {
                            chosen = Some((*name).to_owned());
                        }
                    }
                }
                if chosen.is_none() {
                    for name in names {
                        if ctx.symtab.search(SymbolScope::Lib, name).is_some() {
                            chosen = Some((*name).to_owned());
                            break;
                        }
                    }
                }
            }

            if let Some(name) = chosen {
                config.entry_point_name = Some(remap_user_entry(&name).to_owned());
            }
        }

        match config.entry_point_name.clone() {
            // pull the entry from an archive if that is where it lives
            Some(name) => config.apply_option(self.session, "include", &name, None),
            None => self
                .session
                .error(DiagKind::EntryPoint, "unable to find entry point symbol"),
        }

        if !config.no_ts_aware
            && !config.is_dll()
            && matches!(config.subsystem, Subsystem::WindowsGui | Subsystem::WindowsCui)
        {
            config.dll_characteristics |=
                crate::pe::DllCharacteristics::TERMINAL_SERVER_AWARE;
        }

        if config.subsystem == Subsystem::Unknown {
            self.session.error(
                DiagKind::NoSubsystem,
                "unknown subsystem, use /SUBSYSTEM to set the subsystem type",
            );
        }
        if config.subsystem_ver.is_none() {
            config.subsystem_ver = Some(match config.subsystem {
                Subsystem::WindowsGui | Subsystem::WindowsCui => (6, 0),
                _ => (1, 0),
            });
        }
    }

    fn input_linker_objs(&mut self, config: &mut Config, ctx: &mut LinkContext) {
        self.push_synthetic_obj("* linker symbols *", synth::make_linker_obj());

        // delay-loads that pulled no import are worth a warning
        for dll in &config.delay_load_dlls {
            let used = self
                .delayed_imports
                .keys()
                .any(|name| name.eq_ignore_ascii_case(dll));
            if !used {
                self.session.error(
                    DiagKind::UnusedDelayLoadDll,
                    format!("/DELAYLOAD: {dll} found no imports"),
                );
            }
        }

        // imports
        let image_file_name = config.image_file_name().to_owned();
        for (delayed, imports) in [
            (true, std::mem::take(&mut self.delayed_imports)),
            (false, std::mem::take(&mut self.static_imports)),
        ] {
            if imports.is_empty() {
                continue;
            }
            for (dll_name, dll_imports) in &imports {
                self.push_synthetic_obj(
                    dll_name,
                    super::imports::make_import_dll_obj(
                        config.machine,
                        config.time_stamp,
                        dll_name,
                        dll_imports,
                        delayed,
                    ),
                );
            }
            self.push_synthetic_obj(
                if delayed {
                    "* delayed null import descriptor *"
                } else {
                    "* null import descriptor *"
                },
                super::imports::make_null_import_descriptor_obj(config.machine, delayed),
            );
            self.push_synthetic_obj(
                if delayed {
                    "* delayed null thunk data *"
                } else {
                    "* null thunk data *"
                },
                super::imports::make_null_thunk_data_obj(config.machine, &image_file_name, delayed),
            );
        }

        // exports
        if !config.exports.is_empty() {
            let entry_name = config.entry_point_name.as_deref().unwrap_or("");
            let mut resolved = Vec::new();
            for export in &config.exports {
                let origin = export.origin.as_deref().unwrap_or("<cmdline>");
                if export.name == entry_name {
                    self.session.error_obj(
                        DiagKind::TryingToExportEntryPoint,
                        origin,
                        format!("exported entry point \"{}\"", export.name),
                    );
                }
                if export.alias.as_deref() == Some(entry_name) {
                    self.session.error_obj(
                        DiagKind::TryingToExportEntryPoint,
                        origin,
                        format!("alias exports entry point \"{}\"", export.name),
                    );
                    continue;
                }
                if export.forwarder.is_none()
                    && ctx
                        .symtab
                        .search(SymbolScope::Defined, &export.name)
                        .is_none()
                {
                    self.session.error_obj(
                        DiagKind::IllExport,
                        origin,
                        format!("unresolved export symbol {}", export.name),
                    );
                    continue;
                }
                resolved.push(export.clone());
            }
            if !resolved.is_empty() {
                let finalized = finalize_exports(&resolved);
                config.exports = finalized.named.clone();
                self.push_synthetic_obj(
                    "* exports *",
                    super::exports::make_edata_obj(
                        config.machine,
                        config.time_stamp,
                        &image_file_name,
                        &finalized,
                    ),
                );
            }
        }

        // resources: .res inputs plus the embedded manifest
        {
            let mut entries = Vec::new();
            let mut manifest_opt = config.manifest_opt;
            if !config.manifest_dependencies.is_empty() && manifest_opt == ManifestOpt::Null {
                manifest_opt = ManifestOpt::Embed;
            }
            match manifest_opt {
                ManifestOpt::Embed => {
                    if let Some(xml) = super::manifest::manifest_from_inputs(self.session, config) {
                        entries.push(super::resources::manifest_entry(
                            config.manifest_resource_id as u16,
                            &xml,
                        ));
                    }
                }
                ManifestOpt::WriteToFile => {
                    if let Some(xml) = super::manifest::manifest_from_inputs(self.session, config) {
                        let name = if config.manifest_name.is_empty() {
                            format!("{}.manifest", config.image_name)
                        } else {
                            config.manifest_name.clone()
                        };
                        if let Err(io_error) = std::fs::write(&name, xml) {
                            self.session.error(
                                DiagKind::InvalidPath,
                                format!("unable to write manifest {name}: {io_error}"),
                            );
                        }
                    }
                }
                ManifestOpt::Null | ManifestOpt::No => {}
            }

            for res_path in std::mem::take(&mut config.input_res) {
                match std::fs::read(&res_path) {
                    Ok(data) if super::resources::is_res(&data) => {
                        match super::resources::parse_res(&data) {
                            Ok(mut parsed) => entries.append(&mut parsed),
                            Err(parse_error) => self.session.error(
                                DiagKind::LoadRes,
                                format!("unable to parse res file {res_path}: {parse_error}"),
                            ),
                        }
                    }
                    Ok(_) => self.session.error(
                        DiagKind::LoadRes,
                        format!("file is not of RES format: {res_path}"),
                    ),
                    Err(_) => self.session.error(
                        DiagKind::LoadRes,
                        format!("unable to open res file: {res_path}"),
                    ),
                }
            }

            if !entries.is_empty() {
                self.push_synthetic_obj(
                    "* resources *",
                    super::resources::make_rsrc_obj(config.machine, config.time_stamp, &entries),
                );
            }
        }

        // debug directories
        if config.do_debug_info() {
            if config.debug {
                self.push_synthetic_obj(
                    "* debug directory pdb *",
                    synth::make_debug_directory_obj(
                        config.machine,
                        b"RSDS",
                        [0; 16],
                        1,
                        config.time_stamp,
                        &config.pdb_name,
                        synth::DEBUG_GUID_PDB_SYMBOL,
                    ),
                );
            }
            if config.rad_debug {
                let rdi_name = super::config::replace_extension(&config.image_name, "rdi");
                self.push_synthetic_obj(
                    "* debug directory rdi *",
                    synth::make_debug_directory_obj(
                        config.machine,
                        b"RADI",
                        [0; 16],
                        1,
                        config.time_stamp,
                        &rdi_name,
                        synth::DEBUG_GUID_RDI_SYMBOL,
                    ),
                );
            }
        }
    }
}

/// `.weak.<name>.default.<tag>` (Clang/MinGW alias encoding).
fn parse_mingw_weak_alias(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(".weak.")?;
    let (alias_name, tag) = rest.split_once(".default.")?;
    if alias_name.is_empty() || tag.is_empty() {
        return None;
    }
    Some((alias_name, tag))
}

fn search_lib_dirs(lib_dirs: &[String], path: &str) -> Vec<String> {
    let mut matches = Vec::new();
    if std::path::Path::new(path).exists() {
        matches.push(path.to_owned());
    }
    let is_bare_name = !path.contains('/') && !path.contains('\\');
    if is_bare_name {
        for dir in lib_dirs {
            let candidate = format!("{dir}/{path}");
            if std::path::Path::new(&candidate).exists() {
                matches.push(candidate);
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mingw_weak_alias_parse() {
        assert_eq!(
            parse_mingw_weak_alias(".weak.bar.default.foo"),
            Some(("bar", "foo"))
        );
        assert_eq!(parse_mingw_weak_alias(".weak.bar"), None);
        assert_eq!(parse_mingw_weak_alias("bar.default.foo"), None);
    }
}
