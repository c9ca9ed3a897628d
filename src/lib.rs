#![no_std]

#[cfg(not(feature = "std"))]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
mod alloc_containers {
    pub use std::{borrow, string, vec};
}
#[cfg(not(feature = "std"))]
mod alloc_containers {
    pub use alloc::{borrow, string, vec};
}

pub(crate) use alloc_containers::*;

pub mod compile;
pub mod containers;
pub mod error;
pub mod image;
pub mod io;
pub mod render;

#[cfg(feature = "std")]
pub use compile::DiskFilesystem;
pub use compile::{EmptyFilesystem, Filesystem};
pub use error::{MustacheError, Result};
pub use image::Image;
pub use render::{RenderHandler, Section};

/// Upper bound on section nesting, shared by the compiler's parse stack and
/// the renderer's section-frame stack. Recursive partial inclusion is cut
/// off at this depth as well.
pub const NESTING_LIMIT: usize = 96;

/// Longest accepted tag delimiter, in bytes (`{{=<open> <close>=}}`).
pub const DELIMITER_LENGTH_LIMIT: usize = 10;
