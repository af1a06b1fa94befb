//! `solder` links COFF objects and archives (including import libraries and
//! `.res` resources) into PE images. The byte-level codecs live under
//! [`coff`] and [`pe`]; the link pipeline itself (symbol table, input
//! driver, layout, patchers, image finalizer) lives under [`linker`].

pub mod coff;
pub mod containers;
pub mod error;
pub mod io;
pub mod linker;
pub mod pe;

pub use error::{Result, SolderError};
pub use linker::config::Config;
pub use linker::session::Session;
pub use linker::{link, run};
