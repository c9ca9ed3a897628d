use snafu::Snafu;

use crate::string::String;

pub type Result<T> = core::result::Result<T, MustacheError>;

/// Everything that can go wrong while compiling, (de)serializing or
/// rendering a template image.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum MustacheError {
    /// Section or partial nesting went past [`NESTING_LIMIT`](crate::NESTING_LIMIT),
    /// or the instruction vector outgrew its addressable range.
    #[snafu(display("template nesting exceeds the supported depth"))]
    TooDeep,

    /// Unclosed delimiter, unmatched section, malformed `{{=..=}}` tag, or a
    /// closing tag whose name disagrees with its opener.
    #[snafu(display("mismatched tag or section closure"))]
    ClosureMismatch,

    /// A partial could not be resolved against any directory on the parse
    /// stack.
    #[snafu(display("partial template {name:?} was not found"))]
    FileNotFound { name: String },

    #[snafu(display("template file {name:?} is too big"))]
    FileTooBig { name: String },

    #[snafu(display("partial name is too long"))]
    FileNameTooLong,

    #[snafu(display("partial reference has an empty name"))]
    FileNameTooShort,

    /// Reserved: a root template with neither file nor data. Zero-length
    /// sources compile to an image that renders nothing, so this is never
    /// produced by the current compiler.
    #[snafu(display("empty template"))]
    EmptyTemplate,

    #[snafu(display("tag delimiter is longer than {} bytes", crate::DELIMITER_LENGTH_LIMIT))]
    DelimiterTooLong,

    #[snafu(display("tag name is too long"))]
    NameTooLong,

    /// A render callback asked for the build to stop.
    #[snafu(display("a render callback aborted the build"))]
    UserError,

    /// I/O failure while reading a template file.
    #[snafu(display("template file could not be read"))]
    Unknown,

    #[snafu(display("attempted to read {attempted_read} bytes but there was not enough data"))]
    NotEnoughData { attempted_read: usize },

    #[snafu(display("attempted to write {attempted_write} bytes but there was not enough space"))]
    NotEnoughSpace { attempted_write: usize },

    #[snafu(display("invalid image format: {message}"))]
    InvalidImage { message: &'static str },
}

impl MustacheError {
    #[cold]
    pub const fn not_enough_data(size: usize) -> Self {
        Self::NotEnoughData {
            attempted_read: size,
        }
    }

    #[cold]
    pub const fn not_enough_space(size: usize) -> Self {
        Self::NotEnoughSpace {
            attempted_write: size,
        }
    }

    #[cold]
    pub const fn invalid_image(message: &'static str) -> Self {
        Self::InvalidImage { message }
    }
}
