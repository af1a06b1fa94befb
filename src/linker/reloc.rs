//! The relocation patcher. Runs after layout and symbol patching: for every
//! live section of every object, compute each relocation's value against the
//! patched symbol locations and apply it. Image relocations are gathered in
//! parallel and committed in object order; debug-section relocations apply
//! into the object's own bytes so later debug consumers see final addresses.

use crate::coff::reloc::{reloc_value_x64, x64};
use crate::coff::MachineType;
use crate::coff::SectionFlags;

use super::layout::Layout;
use super::objects::{Obj, PatchedLoc};
use super::pool::{SlotBuffer, ThreadPool};
use super::session::{DiagKind, Session};

struct ImagePatch {
    foff: u64,
    size: u8,
    value: u64,
}

pub struct RelocContext<'a> {
    pub layout: &'a Layout,
    pub image_base: u64,
}

/// Snapshot of every object's patched cells, so workers can read other
/// objects' results while mutating their own object's debug bytes.
pub struct PatchSnapshot {
    cells: Vec<Vec<(i32, u32, bool)>>,
}

impl PatchSnapshot {
    pub fn take(objs: &[Obj]) -> Self {
        let cells = objs
            .iter()
            .map(|obj| {
                (0..obj.object.symbol_count() as u32)
                    .map(|symbol_idx| {
                        let (section_number, value) = obj.patch.get(symbol_idx);
                        (section_number, value, obj.patch.is_patched(symbol_idx))
                    })
                    .collect()
            })
            .collect();
        Self { cells }
    }
}

pub fn patch_relocs(
    pool: &ThreadPool,
    session: &Session,
    ctx: &RelocContext,
    objs: &mut [Obj],
    image: &mut Vec<u8>,
) {
    let snapshot = PatchSnapshot::take(objs);
    let image_view: &[u8] = image;
    let patch_lists = SlotBuffer::with_capacity(objs.len());

    {
        let patch_lists = &patch_lists;
        let snapshot = &snapshot;
        pool.for_each_mut(objs, move |obj_idx, obj| {
            let mut patches: Vec<ImagePatch> = Vec::new();
            patch_obj_relocs(session, ctx, snapshot, obj_idx, obj, image_view, &mut patches);
            patch_lists.push((obj_idx as u32, patches));
        });
    }

    let mut patch_lists = patch_lists.into_vec();
    patch_lists.sort_unstable_by_key(|(obj_idx, _)| *obj_idx);
    for (_, patches) in patch_lists {
        for patch in patches {
            let at = patch.foff as usize;
            let size = patch.size as usize;
            image[at..at + size].copy_from_slice(&patch.value.to_le_bytes()[..size]);
        }
    }
}

fn patch_obj_relocs(
    session: &Session,
    ctx: &RelocContext,
    snapshot: &PatchSnapshot,
    obj_idx: usize,
    obj: &mut Obj,
    image: &[u8],
    patches: &mut Vec<ImagePatch>,
) {
    match obj.object.machine {
        MachineType::Amd64 | MachineType::Unknown => {}
        other => {
            let has_live_relocs = obj
                .object
                .relocs
                .iter()
                .enumerate()
                .any(|(sect_idx, relocs)| !relocs.is_empty() && !obj.is_removed(sect_idx));
            if has_live_relocs {
                session.error_obj(
                    DiagKind::IllegalRelocation,
                    &obj.path,
                    format!("relocations for machine {} are not implemented", other.name()),
                );
            }
            return;
        }
    }

    for sect_idx in 0..obj.object.section_count() {
        if obj.is_removed(sect_idx) {
            continue;
        }
        let header = &obj.object.sections[sect_idx];
        if header
            .characteristics
            .contains(SectionFlags::CNT_UNINITIALIZED_DATA)
        {
            continue;
        }
        let is_debug = obj.object.is_debug_section(sect_idx);
        // pass H patched this header: voff/foff are final image addresses
        // (debug sections keep their obj-local offsets)
        let section_voff = header.virtual_address as u64;
        let section_foff = header.pointer_to_raw_data as u64;

        let relocs = obj.object.relocs[sect_idx].clone();
        for (reloc_idx, reloc) in relocs.iter().enumerate() {
            if reloc.kind > x64::LAST && obj.object.machine == MachineType::Amd64 {
                session.error_obj(
                    DiagKind::IllegalRelocation,
                    &obj.path,
                    format!("unknown relocation type {:#x}", reloc.kind),
                );
                continue;
            }

            let reloc_voff = section_voff + reloc.apply_off as u64;

            // resolve the target through the patch snapshot
            let mut symbol_secnum = 0u32;
            let mut symbol_secoff = 0u32;
            let mut symbol_voff = 0i64;
            let cell = snapshot.cells[obj_idx]
                .get(reloc.symbol_index as usize)
                .copied();
            match cell.map(|(section_number, value, patched)| {
                decode_patched(section_number, value, patched)
            }) {
                Some(Some(PatchedLoc::Image {
                    section_number,
                    off,
                })) => {
                    let Some((target_voff, _)) = ctx.layout.section_addr(section_number) else {
                        continue;
                    };
                    symbol_secnum = section_number;
                    symbol_secoff = off;
                    symbol_voff = (target_voff + off as u64) as i64;
                }
                Some(Some(PatchedLoc::Abs { value })) => {
                    let value = if is_image_base_symbol(obj, reloc.symbol_index) {
                        ctx.image_base
                    } else {
                        value as u64
                    };
                    symbol_voff = value as i64 - ctx.image_base as i64;
                }
                Some(Some(PatchedLoc::Removed)) => {
                    if !is_debug {
                        let symbol_name = obj
                            .object
                            .symbol(reloc.symbol_index)
                            .map(|p| p.name.clone())
                            .unwrap_or_default();
                        session.error_obj(
                            DiagKind::RelocationAgainstRemovedSection,
                            &obj.path,
                            format!(
                                "relocating against symbol in a removed section (symbol: {symbol_name}, section: {}, reloc: {reloc_idx:#x})",
                                obj.object.section_names[sect_idx]
                            ),
                        );
                    }
                    continue;
                }
                // unresolved weak/undefined surviving under /FORCE: zeros
                _ => {}
            }

            let reloc_value = reloc_value_x64(
                reloc.kind,
                ctx.image_base,
                reloc_voff,
                symbol_secnum,
                symbol_secoff,
                symbol_voff,
            );
            if reloc_value.size == 0 {
                continue;
            }
            let size = reloc_value.size as usize;

            let site_foff = section_foff + reloc.apply_off as u64;
            let addend = if is_debug {
                read_sign_extended(&obj.object.data, site_foff as usize, size)
            } else {
                read_sign_extended(image, site_foff as usize, size)
            };
            let result = reloc_value.value.wrapping_add(addend as u64);

            if is_debug {
                let at = site_foff as usize;
                obj.object.data[at..at + size].copy_from_slice(&result.to_le_bytes()[..size]);
            } else {
                patches.push(ImagePatch {
                    foff: site_foff,
                    size: reloc_value.size,
                    value: result,
                });
            }
        }
    }
}

fn decode_patched(section_number: i32, value: u32, patched: bool) -> Option<PatchedLoc> {
    if !patched {
        return None;
    }
    Some(match section_number {
        super::objects::REMOVED_SECTION_NUMBER => PatchedLoc::Removed,
        crate::coff::symbol::section_number::ABSOLUTE => PatchedLoc::Abs { value },
        n if n > 0 => PatchedLoc::Image {
            section_number: n as u32,
            off: value,
        },
        _ => PatchedLoc::Removed,
    })
}

/// There aren't enough bits in a COFF symbol value to hold a 64-bit image
/// base, so `__ImageBase` is special-cased by name.
fn is_image_base_symbol(obj: &Obj, symbol_idx: u32) -> bool {
    obj.object
        .symbol(symbol_idx)
        .map(|symbol| symbol.name == "__ImageBase")
        .unwrap_or(false)
}

fn read_sign_extended(data: &[u8], at: usize, size: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw[..size].copy_from_slice(&data[at..at + size]);
    let unsigned = u64::from_le_bytes(raw);
    let shift = 64 - size as u32 * 8;
    ((unsigned << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extension_by_width() {
        let data = 0xFFFF_FFFFu32.to_le_bytes();
        assert_eq!(read_sign_extended(&data, 0, 4), -1);
        let data = 0x7FFFu16.to_le_bytes();
        assert_eq!(read_sign_extended(&data, 0, 2), 0x7FFF);
        let data = 0x80u8.to_le_bytes();
        assert_eq!(read_sign_extended(&data, 0, 1), -128);
    }
}
