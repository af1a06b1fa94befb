//! The link pipeline: input driver, symbol resolution, layout, patching and
//! image emission, in the fixed phase order the whole crate is built around.

pub mod baserel;
pub mod common;
pub mod config;
pub mod exports;
pub mod gc;
pub mod guard;
pub mod image;
pub mod implib;
pub mod imports;
pub mod input;
pub mod layout;
pub mod libs;
pub mod manifest;
pub mod map;
pub mod objects;
pub mod patch;
pub mod pool;
pub mod reloc;
pub mod resources;
pub mod select;
pub mod session;
pub mod symtab;
pub mod synth;

use log::info;

use crate::pe::section_flags;

use config::{Config, SwitchState};
use input::LinkContext;
use pool::ThreadPool;
use session::Session;

pub struct LinkedImage {
    pub image: Vec<u8>,
    pub layout: layout::Layout,
    pub ctx: LinkContext,
}

/// Runs the whole link. Returns the finished image and its layout, or
/// `None` when diagnostics stopped the pipeline; nothing is written to disk.
pub fn link(session: &Session, config: &mut Config) -> Option<LinkedImage> {
    let pool = ThreadPool::new(config.worker_count);

    let mut ctx = session.time("input", || input::build_link_context(&pool, session, config));
    if session.has_errors() {
        return None;
    }

    let (image, layout) = session.time("image", || {
        build_image(&pool, session, config, &mut ctx)
    })?;
    if session.has_errors() {
        return None;
    }

    Some(LinkedImage { image, layout, ctx })
}

fn build_image(
    pool: &ThreadPool,
    session: &Session,
    config: &Config,
    ctx: &mut LinkContext,
) -> Option<(Vec<u8>, layout::Layout)> {
    // remove unreachable COMDAT sections
    if config.opt_ref == SwitchState::Yes {
        session.time("gc", || {
            gc::gc_comdats(
                &ctx.symtab,
                &ctx.objs,
                &config.include_symbols,
                image::TLS_SYMBOL_NAME,
            )
        });
    }

    let mut layout = session.time("layout", || {
        layout::gather(pool, session, config, &ctx.objs, &ctx.symtab)
    });
    layout.sort_chunks_and_merge(session, config);

    // the common block packs at the end of the finalized .bss
    let bss_idx = layout
        .find_section(".bss", section_flags::BSS)
        .expect("the .bss section is preallocated");
    layout.finalize_section(bss_idx, config);
    let common_block = common::build_common_block(pool, &ctx.symtab, &ctx.objs, &mut layout, bss_idx);

    layout.finalize_all(config);

    // reserve header room for one more section in case .reloc appears
    let live_estimate = layout
        .sections
        .iter()
        .filter(|section| section.vsize > 0 && section.merged_into.is_none())
        .count();
    let header_estimate = image::image_header_size(config, live_estimate + 1);
    layout.assign_virtual_space(config, header_estimate);

    session.time("patch symbols", || {
        patch::run_patch_stages(pool, session, &ctx.symtab, &ctx.objs, &layout, &common_block)
    });
    layout.patch_obj_headers_virtual(pool, &mut ctx.objs);

    // disabled hook: /GUARD inputs are carried, the table builder is not
    // implemented
    let _ = guard::build_guard_tables(config);

    if !config.fixed {
        let reloc_data = session.time("base relocs", || {
            baserel::build_base_relocs(
                pool,
                session,
                &ctx.objs,
                config.machine,
                config.is_large_address_aware(),
            )
        });
        if !reloc_data.is_empty() {
            layout.append_reloc_section(reloc_data, config);
        }
    }

    let header_size = image::image_header_size(config, layout.live_sections().len());
    layout.assign_file_space(config, header_size);
    layout.patch_obj_headers_file(pool, &mut ctx.objs);

    let mut image = layout.fill_image(&ctx.objs, config.machine);
    let min_size = layout::align_up(header_size, config.file_align as u64) as usize;
    if image.len() < min_size {
        image.resize(min_size, 0);
    }

    let header = image::write_headers(&mut image, session, config, &layout, &ctx.objs, &ctx.symtab);
    session.time("patch relocs", || {
        reloc::patch_relocs(
            pool,
            session,
            &reloc::RelocContext {
                layout: &layout,
                image_base: config.base_addr(),
            },
            &mut ctx.objs,
            &mut image,
        )
    });
    image::patch_data_directories(&mut image, &header, config, &layout, &ctx.objs, &ctx.symtab);
    image::finalize_checksum_and_guid(&mut image, &header, config, &layout, &ctx.objs, &ctx.symtab);

    Some((image, layout))
}

/// Links and writes every requested artifact: the image (from a background
/// thread), the chunk map and the import library.
pub fn run(session: &Session, config: &mut Config) {
    let Some(linked) = link(session, config) else {
        return;
    };
    let LinkedImage { image, layout, ctx } = linked;

    std::thread::scope(|scope| {
        let image_name = config.image_name.clone();
        let image_ref = &image;
        let writer = scope.spawn(move || {
            if let Err(io_error) = std::fs::write(&image_name, image_ref) {
                Some(format!("unable to write image {image_name}: {io_error}"))
            } else {
                info!("wrote {image_name} ({} bytes)", image_ref.len());
                None
            }
        });

        if let Some(map_name) = &config.map_name {
            let map_text = map::build_map(&layout, &ctx.objs, &ctx.libs, &image);
            if let Err(io_error) = std::fs::write(map_name, map_text) {
                session.error(
                    session::DiagKind::InvalidPath,
                    format!("unable to write map {map_name}: {io_error}"),
                );
            }
        }

        if config.build_implib && config.is_dll() && !config.exports.is_empty() {
            let finalized = exports::finalize_exports(&config.exports);
            let implib = implib::make_import_lib(
                config.machine,
                config.time_stamp,
                config.image_file_name(),
                &finalized,
            );
            let implib_name = config
                .implib_name
                .clone()
                .unwrap_or_else(|| config::replace_extension(&config.image_name, "lib"));
            if let Err(io_error) = std::fs::write(&implib_name, implib) {
                session.error(
                    session::DiagKind::InvalidPath,
                    format!("unable to write import library {implib_name}: {io_error}"),
                );
            }
        }

        if let Some(write_error) = writer.join().expect("image writer panicked") {
            session.error(session::DiagKind::InvalidPath, write_error);
        }
    });

    if config.log_timers {
        session.log_timers();
    }
}
