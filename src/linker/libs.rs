//! Library wrappers and the archive member resolver: given a lib-scope
//! symbol, pull the member at its offset and turn it into the next round of
//! linker input.

use crate::coff::archive::{member_kind, Archive, MemberKind};

use super::session::{DiagKind, Session};

pub struct Lib {
    pub archive: Archive,
    pub input_idx: u32,
    pub path: String,
}

/// A pending object input: command-line path, archive member bytes, or a
/// thin-archive path to read from disk.
pub struct InputObj {
    pub path: String,
    /// Identity used for ingest deduplication.
    pub dedup_id: String,
    pub data: Option<Vec<u8>>,
    pub is_thin: bool,
    pub lib: Option<u32>,
    /// Ordering key; see [`super::objects::Obj::input_ord`].
    pub input_ord: u64,
}

/// A pending short-import record pulled from an archive.
pub struct InputImport {
    pub data: Vec<u8>,
    pub input_ord: u64,
}

#[derive(Default)]
pub struct MemberInputs {
    pub objs: Vec<InputObj>,
    pub imports: Vec<InputImport>,
}

/// Composes the ordering key for an archive member: archive-provided objects
/// order after command-line ones (which use their small sequence numbers),
/// ties break by position inside the archive.
pub fn member_input_ord(lib_input_idx: u32, member_off: u64) -> u64 {
    ((lib_input_idx as u64 + 1) << 32) | (member_off & 0xFFFF_FFFF)
}

/// Resolves one lib-scope symbol to its archive member and queues it as
/// input. Import members are queued for thunk synthesis; object members
/// (embedded or thin paths) are queued for ingest.
pub fn queue_lib_member_input(
    session: &Session,
    libs: &[Lib],
    lib_idx: u32,
    member_off: u64,
    out: &mut MemberInputs,
) {
    let lib = &libs[lib_idx as usize];
    let input_ord = member_input_ord(lib.input_idx, member_off);

    let member = match lib.archive.member_at(member_off) {
        Ok(member) => member,
        Err(parse_error) => {
            session.error_obj(
                DiagKind::IllData,
                &lib.path,
                format!("bad archive member at {member_off:#x}: {parse_error}"),
            );
            return;
        }
    };

    if lib.archive.archive_type == crate::coff::archive::ArchiveType::Thin {
        // thin members carry a path relative to the archive's directory;
        // some tools append a slash to enable in-archive symbol paths
        let mut member_path = member.name.clone();
        if member_path.ends_with('/') {
            member_path.pop();
        }
        let archive_dir = match lib.path.rsplit_once(['/', '\\']) {
            Some((dir, _)) => dir,
            None => ".",
        };
        let full_path = format!("{archive_dir}/{member_path}");
        out.objs.push(InputObj {
            dedup_id: format!("{}/{member_path}", lib.path),
            path: full_path,
            data: None,
            is_thin: true,
            lib: Some(lib_idx),
            input_ord,
        });
        return;
    }

    let data = lib.archive.member_data(&member);
    match member_kind(data) {
        MemberKind::Import => out.imports.push(InputImport {
            data: data.to_vec(),
            input_ord,
        }),
        MemberKind::Obj | MemberKind::BigObj => out.objs.push(InputObj {
            dedup_id: format!("{}/{}@{member_off}", lib.path, member.name),
            path: member.name.clone(),
            data: Some(data.to_vec()),
            is_thin: false,
            lib: Some(lib_idx),
            input_ord,
        }),
        MemberKind::Unknown => session.error_obj(
            DiagKind::IllData,
            &lib.path,
            format!("archive member \"{}\" is neither obj nor import", member.name),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_ord_sorts_after_cmdline() {
        // command-line objs use their sequence number directly
        let cmdline_ord = 5u64;
        assert!(member_input_ord(0, 0) > cmdline_ord);
        assert!(member_input_ord(0, 0x4000) < member_input_ord(1, 0));
        assert!(member_input_ord(2, 64) < member_input_ord(2, 128));
    }
}
