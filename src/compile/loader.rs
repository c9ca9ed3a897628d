//! Partial loading: path resolution against the parse stack, template
//! memoisation, and the filesystem seam behind it all.

use log::{debug, trace};
use snafu::ensure;

use crate::error::{
    FileNameTooLongSnafu, FileNameTooShortSnafu, FileNotFoundSnafu, FileTooBigSnafu, Result,
    TooDeepSnafu, UnknownSnafu,
};
use crate::image::segment::{self, SegmentHeader};
use crate::image::{Instruction, InstructionData, OpCode};
use crate::string::String;
use crate::vec::Vec;
use crate::NESTING_LIMIT;

use super::{Compiler, Delimiter, ParseFrame};

/// Extension tried after the bare partial name misses.
pub const DEFAULT_EXTENSION: &str = ".mustache";

/// Longest accepted partial reference, in bytes.
const PARTIAL_NAME_LIMIT: usize = 8192;

/// Largest loadable template file.
const FILE_SIZE_LIMIT: u64 = i32::MAX as u64;

/// How the compiler probes and reads template files. The compiler performs
/// no I/O of its own; hosts that keep templates somewhere exotic implement
/// this once and pass it to the `*_with` compile entry points.
pub trait Filesystem {
    /// Size of `path` in bytes, if it exists and is a regular file.
    fn file_size(&self, path: &str) -> Option<u64>;

    /// Reads the file at `path` into `out`, which is exactly
    /// [`file_size`](Self::file_size) bytes long.
    fn read_into(&self, path: &str, out: &mut [u8]) -> Result<()>;
}

/// A [`Filesystem`] with no files in it. Compiling against it confines a
/// template to in-memory data (and root self-references).
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFilesystem;

impl Filesystem for EmptyFilesystem {
    fn file_size(&self, _path: &str) -> Option<u64> {
        None
    }

    fn read_into(&self, _path: &str, _out: &mut [u8]) -> Result<()> {
        UnknownSnafu.fail()
    }
}

#[cfg(feature = "std")]
mod disk {
    use super::Filesystem;
    use crate::error::{MustacheError, Result};
    use crate::std::fs;
    use crate::std::io::Read;

    /// Reads template files from the local disk.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct DiskFilesystem;

    impl Filesystem for DiskFilesystem {
        fn file_size(&self, path: &str) -> Option<u64> {
            let meta = fs::metadata(path).ok()?;
            meta.is_file().then(|| meta.len())
        }

        fn read_into(&self, path: &str, out: &mut [u8]) -> Result<()> {
            let mut file = fs::File::open(path).map_err(|_| MustacheError::Unknown)?;
            file.read_exact(out).map_err(|_| MustacheError::Unknown)
        }
    }
}

#[cfg(feature = "std")]
pub use disk::DiskFilesystem;

impl<'a, F: Filesystem + ?Sized> Compiler<'a, F> {
    /// Registers a template's bytes in the data segment and pushes a parse
    /// frame for it. `body: None` reserves `body_len` zeroed bytes for a
    /// file read to land in.
    pub(crate) fn load_data(
        &mut self,
        name: &[u8],
        body_len: usize,
        body: Option<&[u8]>,
    ) -> Result<()> {
        debug_assert!(body.map_or(true, |body| body.len() == body_len));
        ensure!(name.len() < u16::MAX as usize, FileNameTooLongSnafu);

        let old_len = self.data.len();
        let seg_len = SegmentHeader::encoded_len(name.len());
        let total = old_len as u64 + seg_len as u64 + body_len as u64;
        ensure!(total <= u32::MAX as u64, TooDeepSnafu);
        ensure!(self.frames.len() < NESTING_LIMIT, TooDeepSnafu);

        segment::write_segment(
            &mut self.data,
            SegmentHeader {
                inst_start: self.instructions.len() as u32,
                next: total as u32,
                filename_len: name.len() as u16,
                path_len: segment::path_prefix_len(name),
            },
            name,
        );
        match body {
            Some(bytes) => self.data.extend_from_slice(bytes),
            None => self.data.resize(old_len + seg_len + body_len, 0),
        }

        self.push_instruction(Instruction::new(
            OpCode::SectionStart,
            InstructionData::default(),
        ))?;

        // Every template starts over with the stock delimiters.
        self.frames.push(ParseFrame {
            data_start: old_len as u32,
            data_pos: (old_len + seg_len) as u32,
            data_end: total as u32,
            open_sections: 0,
            del_open: Delimiter::DEFAULT_OPEN,
            del_close: Delimiter::DEFAULT_CLOSE,
        });
        trace!(
            "registered template {:?} ({} bytes)",
            String::from_utf8_lossy(name),
            body_len
        );
        Ok(())
    }

    /// Loads the template `name` refers to: resolves it against the parse
    /// stack's directories, reuses it if already loaded, reads it otherwise.
    pub(crate) fn load_file(&mut self, name: &[u8]) -> Result<()> {
        ensure!(!name.is_empty(), FileNameTooShortSnafu);
        ensure!(name.len() < PARTIAL_NAME_LIMIT, FileNameTooLongSnafu);

        if let Some((path, size)) = self.resolve(name) {
            ensure!(
                size < FILE_SIZE_LIMIT,
                FileTooBigSnafu { name: path }
            );
            if let Some(inst_start) = self.find_loaded(path.as_bytes()) {
                trace!("template {path:?} already loaded, splicing a goto");
                return self.push_goto(inst_start);
            }
            debug!("loading template file {path:?}");
            self.load_data(path.as_bytes(), size as usize, None)?;
            let body_start = self.data.len() - size as usize;
            let fs = self.fs;
            return fs.read_into(&path, &mut self.data[body_start..]);
        }

        // A miss that names the root template refers back to instruction
        // zero; that is how an in-memory root includes itself.
        if !self.data.is_empty() {
            let (_, root_name) = segment::read_segment(&self.data, 0)?;
            if root_name == name {
                trace!("self-referencing partial, splicing a goto to the root");
                return self.push_goto(0);
            }
        }

        FileNotFoundSnafu {
            name: String::from_utf8_lossy(name),
        }
        .fail()
    }

    /// Walks the parse stack from the including template outward, trying
    /// each template's directory with the bare name and then with
    /// [`DEFAULT_EXTENSION`]. Directory prefixes are only ever probed once.
    fn resolve(&self, name: &[u8]) -> Option<(String, u64)> {
        let name = core::str::from_utf8(name).ok()?;
        let mut tried: Vec<(u32, u16)> = Vec::new();
        let mut candidate = String::new();

        let mut index = self.frames.len();
        loop {
            let (prefix_pos, prefix_len) = if index == 0 {
                // Root load before any frame exists: bare working directory.
                (0, 0)
            } else {
                let frame = &self.frames[index - 1];
                let (header, _) =
                    segment::read_segment(&self.data, frame.data_start as usize).ok()?;
                (
                    frame.data_start + SegmentHeader::NAME_OFFSET as u32,
                    header.path_len,
                )
            };

            let prefix = &self.data[prefix_pos as usize..][..prefix_len as usize];
            let already_tried = tried.iter().any(|&(pos, len)| {
                len == prefix_len && self.data[pos as usize..][..len as usize] == *prefix
            });

            if !already_tried {
                tried.push((prefix_pos, prefix_len));
                if let Ok(prefix) = core::str::from_utf8(prefix) {
                    candidate.clear();
                    candidate.push_str(prefix);
                    candidate.push_str(name);
                    if let Some(size) = self.fs.file_size(&candidate) {
                        return Some((candidate, size));
                    }
                    candidate.push_str(DEFAULT_EXTENSION);
                    if let Some(size) = self.fs.file_size(&candidate) {
                        return Some((candidate, size));
                    }
                }
            }

            // The bare working directory ends the walk.
            if prefix_len == 0 || index <= 1 {
                return None;
            }
            index -= 1;
        }
    }

    /// The instruction a template is bracketed by, if its resolved path was
    /// loaded before.
    fn find_loaded(&self, path: &[u8]) -> Option<u32> {
        segment::Segments::new(&self.data)
            .find(|(_, name)| *name == path)
            .map(|(header, _)| header.inst_start)
    }

    fn push_goto(&mut self, target: u32) -> Result<()> {
        let resume = self.instructions.len() as u32;
        self.push_instruction(Instruction::new(
            OpCode::SectionGoto,
            InstructionData {
                end: resume,
                len: target,
                ..Default::default()
            },
        ))
    }
}
