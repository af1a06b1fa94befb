use snafu::Snafu;

pub type Result<T> = core::result::Result<T, SolderError>;

/// Errors raised by the byte-level COFF/PE/archive codecs.
///
/// Diagnostics produced while *linking* (unresolved symbols, multiply defined
/// symbols, ...) do not go through this type; they are recorded into the
/// session's diagnostic table, see [`crate::linker::session`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SolderError {
    #[snafu(display("Attempted to read {attempted_read} bytes but there was not enough data."))]
    NotEnoughDataLeft { attempted_read: usize },

    #[snafu(display("Attempted to write {attempted_write} bytes but there was not enough space."))]
    NotEnoughSpaceLeft { attempted_write: usize },

    #[snafu(display("Invalid object format: {message}"))]
    InvalidObjectFormat { message: &'static str },

    #[snafu(display("Invalid archive format: {message}"))]
    InvalidArchiveFormat { message: &'static str },

    #[snafu(display("Invalid image format: {message}"))]
    InvalidImageFormat { message: &'static str },
}

impl SolderError {
    #[cold]
    pub const fn not_enough_data(size: usize) -> Self {
        Self::NotEnoughDataLeft {
            attempted_read: size,
        }
    }

    #[cold]
    pub const fn not_enough_space(size: usize) -> Self {
        Self::NotEnoughSpaceLeft {
            attempted_write: size,
        }
    }

    #[cold]
    pub const fn invalid_object_format(message: &'static str) -> Self {
        Self::InvalidObjectFormat { message }
    }

    #[cold]
    pub const fn invalid_archive_format(message: &'static str) -> Self {
        Self::InvalidArchiveFormat { message }
    }

    #[cold]
    pub const fn invalid_image_format(message: &'static str) -> Self {
        Self::InvalidImageFormat { message }
    }
}
