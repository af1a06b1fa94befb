//! The layout engine: groups object sections into image sections, reserves
//! contribution chunks, assigns offsets, virtual addresses and file offsets.
//!
//! Contributions live in per-chunk backing arrays that never reorder, so a
//! `(section, chunk, slot)` triple is a stable reference; ordering is a
//! separate per-chunk index vector sorted by input order. Chunks are created
//! one per `(object-section name, flags)` definition and later ordered
//! lexically by sort suffix, which is what groups `.text$a` before
//! `.text$b` inside `.text`.

use indexmap::IndexMap;

use crate::coff::{parse_section_name, MachineType, SectionFlags};
use crate::pe::section_flags;

use super::config::Config;
use super::objects::Obj;
use super::pool::{SlotBuffer, ThreadPool};
use super::session::{DiagKind, Session};
use super::symtab::SymbolTable;

#[derive(Debug)]
pub enum ContribData {
    /// Bytes inside the owning object's file data.
    ObjBytes { foff: u64, size: u64 },
    /// Uninitialized bytes of known size.
    Zero { size: u64 },
    /// Linker-generated bytes.
    Owned(Vec<u8>),
}

#[derive(Debug)]
pub struct SectionContrib {
    /// Owning object, or `u32::MAX` for linker-generated contributions.
    pub obj_idx: u32,
    pub obj_sect_idx: u32,
    pub align: u32,
    pub hotpatch: bool,
    pub data: ContribData,
    /// Offset inside the image section, assigned during finalization.
    pub off: u64,
}

impl SectionContrib {
    pub fn size(&self) -> u64 {
        match &self.data {
            ContribData::ObjBytes { size, .. } => *size,
            ContribData::Zero { size } => *size,
            ContribData::Owned(bytes) => bytes.len() as u64,
        }
    }
}

pub struct ContribChunk {
    /// The `$suffix` of the defining object-section name; chunks inside a
    /// section are laid out in lexical `sort_key` order.
    pub sort_key: String,
    pub contribs: Vec<SectionContrib>,
    /// Layout order of `contribs` (indices), sorted by input order.
    pub order: Vec<u32>,
}

impl ContribChunk {
    fn sort(&mut self) {
        let contribs = &self.contribs;
        self.order = (0..contribs.len() as u32).collect();
        self.order.sort_by_key(|&slot| {
            let contrib = &contribs[slot as usize];
            (contrib.obj_idx, contrib.obj_sect_idx)
        });
    }
}

pub struct ImageSection {
    pub name: String,
    pub flags: SectionFlags,
    pub chunks: Vec<ContribChunk>,
    pub voff: u64,
    pub vsize: u64,
    pub foff: u64,
    pub fsize: u64,
    /// Zero-based ordinal among live sections; section number is this +1.
    pub ordinal: u32,
    pub live: bool,
    /// `(destination section, chunk base)` when folded by `/MERGE`.
    pub merged_into: Option<(u32, u32)>,
    /// Number of chunks this merged section moved into the destination.
    merged_chunk_count: u32,
}

impl ImageSection {
    fn new(name: String, flags: SectionFlags) -> Self {
        Self {
            name,
            flags,
            chunks: Vec::new(),
            voff: 0,
            vsize: 0,
            foff: 0,
            fsize: 0,
            ordinal: 0,
            live: false,
            merged_into: None,
            merged_chunk_count: 0,
        }
    }

    pub fn section_number(&self) -> u32 {
        self.ordinal + 1
    }

    pub fn is_uninitialized(&self) -> bool {
        self.flags.contains(SectionFlags::CNT_UNINITIALIZED_DATA)
    }

    /// Contributions in layout order.
    pub fn iter_contribs(&self) -> impl Iterator<Item = &SectionContrib> {
        self.chunks.iter().flat_map(|chunk| {
            chunk
                .order
                .iter()
                .map(move |&slot| &chunk.contribs[slot as usize])
        })
    }

    pub fn first_contrib(&self) -> Option<&SectionContrib> {
        self.iter_contribs().next()
    }

    pub fn last_contrib(&self) -> Option<&SectionContrib> {
        let mut last = None;
        for contrib in self.iter_contribs() {
            last = Some(contrib);
        }
        last
    }

    /// Bytes spanned by the contributions (the data directories use this,
    /// not the aligned `vsize`).
    pub fn contrib_span(&self) -> u64 {
        match (self.first_contrib(), self.last_contrib()) {
            (Some(first), Some(last)) => last.off + last.size() - first.off,
            _ => 0,
        }
    }
}

/// Stable reference to one contribution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContribRef {
    pub sect: u32,
    pub chunk: u32,
    pub idx: u32,
}

pub const NULL_CONTRIB: ContribRef = ContribRef {
    sect: u32::MAX,
    chunk: u32::MAX,
    idx: u32::MAX,
};

pub struct Layout {
    pub sections: Vec<ImageSection>,
    /// `sect_map[obj][obj_sect]`: where each object section landed.
    pub sect_map: Vec<Vec<ContribRef>>,
    next_voff: u64,
    next_ordinal: u32,
}

impl Layout {
    pub fn contrib(&self, reference: ContribRef) -> &SectionContrib {
        let (sect, chunk, idx) = self.resolve(reference);
        &self.sections[sect as usize].chunks[chunk as usize].contribs[idx as usize]
    }

    fn contrib_mut(&mut self, reference: ContribRef) -> &mut SectionContrib {
        let (sect, chunk, idx) = self.resolve(reference);
        &mut self.sections[sect as usize].chunks[chunk as usize].contribs[idx as usize]
    }

    /// Final image section index a contribution landed in (through merges).
    pub fn contrib_section(&self, reference: ContribRef) -> u32 {
        self.resolve(reference).0
    }

    fn resolve(&self, reference: ContribRef) -> (u32, u32, u32) {
        match self.sections[reference.sect as usize].merged_into {
            Some((dst, chunk_base)) => (dst, chunk_base + reference.chunk, reference.idx),
            None => (reference.sect, reference.chunk, reference.idx),
        }
    }

    pub fn find_section(&self, name: &str, flags: SectionFlags) -> Option<usize> {
        self.sections
            .iter()
            .position(|section| section.name == name && section.flags == flags)
    }

    pub fn find_live_by_name(&self, name: &str) -> Option<usize> {
        self.sections
            .iter()
            .position(|section| section.live && section.name == name)
    }

    /// Live sections ordered by their assigned ordinal.
    pub fn live_sections(&self) -> Vec<&ImageSection> {
        let mut live: Vec<&ImageSection> = self
            .sections
            .iter()
            .filter(|section| section.live)
            .collect();
        live.sort_by_key(|section| section.ordinal);
        live
    }

    /// `(voff, foff)` of a final one-based section number.
    pub fn section_addr(&self, section_number: u32) -> Option<(u64, u64)> {
        self.sections
            .iter()
            .find(|section| section.live && section.section_number() == section_number)
            .map(|section| (section.voff, section.foff))
    }
}

struct SectDefn {
    flags: SectionFlags,
    obj_idx: u32,
    contribs_count: u32,
}

/// Sections the layout never carries into the image: debug data feeds the
/// debug pipeline straight from the objects, directives were consumed at
/// ingest.
fn is_layout_filtered(short_name: &str) -> bool {
    short_name.starts_with(".debug") || short_name == ".drectve"
}

/// Passes A through E: gather definitions, create sections and chunks,
/// gather contributions in parallel, redirect COMDAT followers, sort.
pub fn gather(
    pool: &ThreadPool,
    session: &Session,
    config: &Config,
    objs: &[Obj],
    symtab: &SymbolTable,
) -> Layout {
    // pass A: definitions per object, merged in deterministic object order
    let per_obj_defns = SlotBuffer::with_capacity(objs.len());
    pool.for_parallel(objs.len(), |_, obj_idx| {
        let obj = &objs[obj_idx];
        let mut defns: Vec<(String, SectionFlags, u32)> = Vec::new();
        for (sect_idx, header) in obj.object.sections.iter().enumerate() {
            if obj.is_removed(sect_idx) || header.size_of_raw_data == 0 {
                continue;
            }
            let flags = header.characteristics & !SectionFlags::link_only();
            defns.push((
                obj.object.section_names[sect_idx].clone(),
                flags,
                sect_idx as u32,
            ));
        }
        per_obj_defns.push((obj_idx as u32, defns));
    });
    let mut per_obj_defns = per_obj_defns.into_vec();
    per_obj_defns.sort_unstable_by_key(|(obj_idx, _)| *obj_idx);

    let mut defns: IndexMap<(String, u32), SectDefn> = IndexMap::new();
    for (obj_idx, obj_defns) in per_obj_defns {
        for (full_name, flags, _) in obj_defns {
            let key = (full_name.clone(), flags.bits());
            match defns.get_mut(&key) {
                Some(defn) => defn.contribs_count += 1,
                None => {
                    defns.insert(
                        key,
                        SectDefn {
                            flags,
                            obj_idx,
                            contribs_count: 1,
                        },
                    );
                }
            }
        }
    }

    // pass B: create image sections and reserve contribution chunks
    let mut layout = Layout {
        sections: vec![
            ImageSection::new(".text".into(), section_flags::TEXT),
            ImageSection::new(".rdata".into(), section_flags::RDATA),
            ImageSection::new(".data".into(), section_flags::DATA),
            ImageSection::new(".bss".into(), section_flags::BSS),
        ],
        sect_map: Vec::new(),
        next_voff: 0,
        next_ordinal: 0,
    };

    let mut chunk_map: IndexMap<(String, u32), ContribRef> = IndexMap::new();
    let mut chunk_buffers: Vec<SlotBuffer<SectionContrib>> = Vec::new();
    for ((full_name, flag_bits), defn) in defns.iter() {
        let (short_name, sort_key) = parse_section_name(full_name);
        if is_layout_filtered(short_name) {
            continue;
        }

        for existing in &layout.sections {
            if existing.name == short_name && existing.flags != defn.flags {
                let obj = &objs[defn.obj_idx as usize];
                session.error_obj(
                    DiagKind::SectionFlagsConflict,
                    &obj.path,
                    format!(
                        "section {short_name} flags {:#x} conflict with {:#x}",
                        defn.flags.bits(),
                        existing.flags.bits()
                    ),
                );
                break;
            }
        }

        let sect_idx = match layout.find_section(short_name, defn.flags) {
            Some(sect_idx) => sect_idx,
            None => {
                layout
                    .sections
                    .push(ImageSection::new(short_name.to_owned(), defn.flags));
                layout.sections.len() - 1
            }
        };
        let section = &mut layout.sections[sect_idx];
        section.chunks.push(ContribChunk {
            sort_key: sort_key.to_owned(),
            contribs: Vec::new(),
            order: Vec::new(),
        });
        let chunk_idx = (section.chunks.len() - 1) as u32;
        chunk_map.insert(
            (full_name.clone(), *flag_bits),
            ContribRef {
                sect: sect_idx as u32,
                chunk: chunk_idx,
                idx: 0,
            },
        );
        chunk_buffers.push(SlotBuffer::with_capacity(defn.contribs_count as usize));
    }

    // pass C: gather contributions in parallel into the reserved chunks
    let default_align = config.machine.default_align();
    let sect_map_rows = SlotBuffer::with_capacity(objs.len());
    pool.for_parallel(objs.len(), |_, obj_idx| {
        let obj = &objs[obj_idx];
        let mut row = vec![NULL_CONTRIB; obj.object.section_count()];
        for (sect_idx, header) in obj.object.sections.iter().enumerate() {
            if obj.is_removed(sect_idx) || header.size_of_raw_data == 0 {
                continue;
            }
            let flags = header.characteristics & !SectionFlags::link_only();
            let key = (obj.object.section_names[sect_idx].clone(), flags.bits());
            let Some((buffer_idx, _, reference)) = chunk_map.get_full(&key) else {
                continue;
            };
            let data = if header
                .characteristics
                .contains(SectionFlags::CNT_UNINITIALIZED_DATA)
            {
                ContribData::Zero {
                    size: header.size_of_raw_data as u64,
                }
            } else {
                ContribData::ObjBytes {
                    foff: header.pointer_to_raw_data as u64,
                    size: header.size_of_raw_data as u64,
                }
            };
            let slot = chunk_buffers[buffer_idx].push(SectionContrib {
                obj_idx: obj_idx as u32,
                obj_sect_idx: sect_idx as u32,
                align: header.characteristics.align().unwrap_or(default_align),
                hotpatch: false,
                data,
                off: 0,
            });
            row[sect_idx] = ContribRef {
                idx: slot as u32,
                ..*reference
            };
        }
        sect_map_rows.push((obj_idx as u32, row));
    });

    // move the filled buffers into their chunks
    for (buffer, reference) in chunk_buffers.into_iter().zip(chunk_map.values()) {
        let chunk =
            &mut layout.sections[reference.sect as usize].chunks[reference.chunk as usize];
        chunk.contribs = buffer.into_vec();
    }
    let mut rows = sect_map_rows.into_vec();
    rows.sort_unstable_by_key(|(obj_idx, _)| *obj_idx);
    layout.sect_map = rows.into_iter().map(|(_, row)| row).collect();

    // pass D: COMDAT followers evaporate into their leader's contribution
    for obj_idx in 0..objs.len() {
        let obj = &objs[obj_idx];
        for sect_idx in 0..obj.object.section_count() {
            if !obj.is_comdat(sect_idx) {
                continue;
            }
            let Some(symlink) = obj.comdat_symlink(sect_idx as i32 + 1, symtab) else {
                continue;
            };
            let (leader_obj, leader_symbol) = symlink.defined();
            let leader = &objs[leader_obj as usize];
            let Some(leader_parsed) = leader.object.symbol(leader_symbol) else {
                continue;
            };
            if leader_parsed.section_number >= 1 {
                layout.sect_map[obj_idx][sect_idx] = layout.sect_map[leader_obj as usize]
                    [leader_parsed.section_number as usize - 1];
            }
        }
    }

    // pass E: deterministic input ordering inside each chunk
    let mut chunk_refs: Vec<&mut ContribChunk> = layout
        .sections
        .iter_mut()
        .flat_map(|section| section.chunks.iter_mut())
        .collect();
    pool.for_each_mut(&mut chunk_refs, |_, chunk| chunk.sort());

    // hotpatchable functions get pad bytes in front of their contribution
    if config.function_pad_min.is_some() || config.infer_function_pad_min {
        for (obj_idx, obj) in objs.iter().enumerate() {
            for (_, symbol) in obj.object.iter_symbols() {
                if !symbol.is_function() || symbol.section_number < 1 {
                    continue;
                }
                let sect_idx = symbol.section_number as usize - 1;
                let reference = layout.sect_map[obj_idx][sect_idx];
                if reference == NULL_CONTRIB {
                    continue;
                }
                let is_code = obj.object.sections[sect_idx]
                    .characteristics
                    .contains(SectionFlags::CNT_CODE);
                if is_code {
                    layout.contrib_mut(reference).hotpatch = true;
                }
            }
        }
    }

    layout
}

impl Layout {
    /// Lexical chunk ordering within each section ("blocks of contributions
    /// are sorted in lexical order by object-section name"), then `/MERGE`.
    pub fn sort_chunks_and_merge(&mut self, session: &Session, config: &Config) {
        // sort through a permutation so the chunk indices stored in
        // `sect_map` can be rewritten; equal sort keys keep definition order
        let mut chunk_remaps: Vec<Vec<u32>> = Vec::with_capacity(self.sections.len());
        for section in self.sections.iter_mut() {
            let mut perm: Vec<usize> = (0..section.chunks.len()).collect();
            perm.sort_by(|&a, &b| section.chunks[a].sort_key.cmp(&section.chunks[b].sort_key));

            let mut remap = vec![0u32; perm.len()];
            for (new_idx, &old_idx) in perm.iter().enumerate() {
                remap[old_idx] = new_idx as u32;
            }
            let mut old_chunks: Vec<Option<ContribChunk>> =
                std::mem::take(&mut section.chunks).into_iter().map(Some).collect();
            section.chunks = perm
                .iter()
                .map(|&old_idx| old_chunks[old_idx].take().unwrap())
                .collect();
            chunk_remaps.push(remap);
        }
        for row in self.sect_map.iter_mut() {
            for reference in row.iter_mut() {
                if *reference != NULL_CONTRIB {
                    reference.chunk = chunk_remaps[reference.sect as usize][reference.chunk as usize];
                }
            }
        }

        for rule in &config.merges {
            let Some(src_idx) = self
                .sections
                .iter()
                .position(|section| section.name == rule.src && section.merged_into.is_none())
            else {
                continue;
            };
            let Some(dst_idx) = self
                .sections
                .iter()
                .position(|section| section.name == rule.dst && section.merged_into.is_none())
            else {
                session.error(
                    DiagKind::CmdLine,
                    format!("/MERGE destination {} does not exist", rule.dst),
                );
                continue;
            };
            if src_idx == dst_idx {
                continue;
            }
            let src_chunks = std::mem::take(&mut self.sections[src_idx].chunks);
            let chunk_base = self.sections[dst_idx].chunks.len() as u32;
            let chunk_count = src_chunks.len() as u32;
            self.sections[dst_idx].chunks.extend(src_chunks);
            self.sections[src_idx].merged_into = Some((dst_idx as u32, chunk_base));
            self.sections[src_idx].merged_chunk_count = chunk_count;
        }
    }

    /// Offset of the first contribution and byte span of a merged section's
    /// chunks inside their destination.
    fn merged_window(&self, sect_idx: usize) -> Option<(u64, u64)> {
        let (dst, chunk_base) = self.sections[sect_idx].merged_into?;
        let chunk_count = self.sections[sect_idx].merged_chunk_count as usize;
        let dst = &self.sections[dst as usize];
        let chunks = &dst.chunks[chunk_base as usize..chunk_base as usize + chunk_count];

        let mut first: Option<u64> = None;
        let mut last: Option<(u64, u64)> = None;
        for chunk in chunks {
            for &slot in &chunk.order {
                let contrib = &chunk.contribs[slot as usize];
                if first.is_none() {
                    first = Some(contrib.off);
                }
                last = Some((contrib.off, contrib.size()));
            }
        }
        let first = first?;
        let (last_off, last_size) = last?;
        Some((first, last_off + last_size - first))
    }

    /// Pass F for one section: walk contributions in order, place each at
    /// the next aligned offset.
    pub fn finalize_section(&mut self, sect_idx: usize, config: &Config) {
        let function_pad_min = config.function_pad_min.unwrap_or(0) as u64;
        let section = &mut self.sections[sect_idx];
        if section.merged_into.is_some() {
            return;
        }
        let mut cursor = 0u64;
        for chunk in section.chunks.iter_mut() {
            for &slot in &chunk.order {
                let contrib = &mut chunk.contribs[slot as usize];
                if contrib.hotpatch && function_pad_min > 0 {
                    cursor += function_pad_min;
                }
                cursor = align_up(cursor, contrib.align as u64);
                contrib.off = cursor;
                cursor += contrib.size();
            }
        }
        section.vsize = cursor;
        section.fsize = if section.is_uninitialized() {
            0
        } else {
            align_up(cursor, config.file_align as u64)
        };
    }

    pub fn finalize_all(&mut self, config: &Config) {
        for sect_idx in 0..self.sections.len() {
            self.finalize_section(sect_idx, config);
        }
    }

    /// Pass G: drop empty sections, assign ordinals and virtual addresses.
    pub fn assign_virtual_space(&mut self, config: &Config, image_header_size: u64) {
        self.next_voff = align_up(image_header_size, config.sect_align as u64);
        self.next_ordinal = 0;
        for sect_idx in 0..self.sections.len() {
            let section = &mut self.sections[sect_idx];
            if section.merged_into.is_some() || section.vsize == 0 {
                section.live = false;
                continue;
            }
            section.live = true;
            section.ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            section.voff = self.next_voff;
            self.next_voff = align_up(self.next_voff + section.vsize, config.sect_align as u64);
        }
        // merged sections take their window inside the destination
        for sect_idx in 0..self.sections.len() {
            let Some((dst, _)) = self.sections[sect_idx].merged_into else {
                continue;
            };
            let dst = dst as usize;
            let (dst_ordinal, dst_voff) = (self.sections[dst].ordinal, self.sections[dst].voff);
            let (first_off, span) = self.merged_window(sect_idx).unwrap_or((0, 0));
            let section = &mut self.sections[sect_idx];
            section.ordinal = dst_ordinal;
            section.voff = dst_voff + first_off;
            section.vsize = span;
        }
    }

    /// Appends the `.reloc` section after content layout (its data depends
    /// on assigned virtual addresses).
    pub fn append_reloc_section(&mut self, data: Vec<u8>, config: &Config) {
        let mut section = ImageSection::new(".reloc".into(), section_flags::RELOC);
        let mut chunk = ContribChunk {
            sort_key: String::new(),
            contribs: vec![SectionContrib {
                obj_idx: u32::MAX,
                obj_sect_idx: u32::MAX,
                align: 1,
                hotpatch: false,
                data: ContribData::Owned(data),
                off: 0,
            }],
            order: vec![0],
        };
        chunk.contribs[0].off = 0;
        section.chunks.push(chunk);
        section.vsize = section.chunks[0].contribs[0].size();
        section.fsize = align_up(section.vsize, config.file_align as u64);
        section.live = true;
        section.ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        section.voff = self.next_voff;
        self.next_voff = align_up(self.next_voff + section.vsize, config.sect_align as u64);
        self.sections.push(section);
    }

    /// File offsets: initialized live sections claim file space in ordinal
    /// order; uninitialized ones occupy none.
    pub fn assign_file_space(&mut self, config: &Config, image_header_size: u64) {
        let mut cursor = align_up(image_header_size, config.file_align as u64);
        let mut order: Vec<usize> = (0..self.sections.len())
            .filter(|&idx| self.sections[idx].live)
            .collect();
        order.sort_by_key(|&idx| self.sections[idx].ordinal);
        for sect_idx in order {
            let section = &mut self.sections[sect_idx];
            if section.is_uninitialized() {
                section.foff = 0;
                continue;
            }
            section.foff = cursor;
            cursor += section.fsize;
        }
        for sect_idx in 0..self.sections.len() {
            if let Some((dst, _)) = self.sections[sect_idx].merged_into {
                let base = self.sections[dst as usize].foff;
                let first_off = self.merged_window(sect_idx).map(|(off, _)| off).unwrap_or(0);
                let section = &mut self.sections[sect_idx];
                section.foff = base + first_off;
                section.fsize = section.vsize;
            }
        }
    }

    pub fn image_size(&self) -> u64 {
        self.sections
            .iter()
            .filter(|section| section.live && !section.is_uninitialized())
            .map(|section| section.foff + section.fsize)
            .max()
            .unwrap_or(0)
    }

    pub fn image_virtual_size(&self) -> u64 {
        self.sections
            .iter()
            .filter(|section| section.live)
            .map(|section| section.voff + section.vsize)
            .max()
            .unwrap_or(0)
    }

    /// Pass H, virtual half: object section headers take their final image
    /// addresses so later per-obj logic sees them.
    pub fn patch_obj_headers_virtual(&self, pool: &ThreadPool, objs: &mut [Obj]) {
        let layout = &*self;
        pool.for_each_mut(objs, |obj_idx, obj| {
            for sect_idx in 0..obj.object.section_count() {
                let reference = layout.sect_map[obj_idx][sect_idx];
                if reference == NULL_CONTRIB || obj.is_removed(sect_idx) {
                    continue;
                }
                let contrib = layout.contrib(reference);
                let sect = &layout.sections[layout.contrib_section(reference) as usize];
                let header = &mut obj.object.sections[sect_idx];
                header.virtual_size = contrib.size() as u32;
                header.virtual_address = (sect.voff + contrib.off) as u32;
            }
        });
    }

    /// Pass H, file half.
    pub fn patch_obj_headers_file(&self, pool: &ThreadPool, objs: &mut [Obj]) {
        let layout = &*self;
        pool.for_each_mut(objs, |obj_idx, obj| {
            for sect_idx in 0..obj.object.section_count() {
                let reference = layout.sect_map[obj_idx][sect_idx];
                if reference == NULL_CONTRIB
                    || obj.is_removed(sect_idx)
                    || obj.object.is_debug_section(sect_idx)
                {
                    continue;
                }
                let sect = &layout.sections[layout.contrib_section(reference) as usize];
                if sect.is_uninitialized() {
                    continue;
                }
                let contrib = layout.contrib(reference);
                let header = &mut obj.object.sections[sect_idx];
                header.size_of_raw_data = contrib.size() as u32;
                header.pointer_to_raw_data = (sect.foff + contrib.off) as u32;
            }
        });
    }

    /// Allocates the image and copies every live contribution into place,
    /// filling alignment gaps (with int3 bytes in code sections).
    pub fn fill_image(&self, objs: &[Obj], machine: MachineType) -> Vec<u8> {
        let mut image = vec![0u8; self.image_size() as usize];
        for section in self.sections.iter() {
            if !section.live || section.is_uninitialized() || section.merged_into.is_some() {
                continue;
            }
            let fill_byte = if section.flags.contains(SectionFlags::CNT_CODE) {
                machine.code_fill_byte()
            } else {
                0
            };
            let base = section.foff as usize;
            let mut prev_end = 0usize;
            for contrib in section.iter_contribs() {
                let off = contrib.off as usize;
                image[base + prev_end..base + off].fill(fill_byte);
                prev_end = off + contrib.size() as usize;
                match &contrib.data {
                    ContribData::ObjBytes { foff, size } => {
                        let src = &objs[contrib.obj_idx as usize].object.data
                            [*foff as usize..(*foff + *size) as usize];
                        image[base + off..base + prev_end].copy_from_slice(src);
                    }
                    ContribData::Owned(bytes) => {
                        image[base + off..base + prev_end].copy_from_slice(bytes);
                    }
                    ContribData::Zero { .. } => {}
                }
            }
            image[base + prev_end..base + section.fsize as usize].fill(fill_byte);
        }
        image
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
