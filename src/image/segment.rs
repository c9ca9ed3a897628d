//! Sub-headers introducing each loaded template inside the data segment.
//!
//! The data segment is a concatenation of `sub-header | template bytes`
//! regions, one per loaded template. `next` holds the absolute offset of the
//! following sub-header, so walking `offset = next` from zero visits every
//! loaded template and lands exactly on the segment length.

use crate::error::{MustacheError, Result};
use crate::io::{ReadData, Reader, WriteData, Writer};
use crate::vec::Vec;

/// Fixed-layout descriptor preceding one template's bytes in the data
/// segment. The stored name (resolved path for file templates) follows the
/// fixed fields, terminated by one NUL byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Index of the `SectionStart` pseudo-instruction bracketing this
    /// template.
    pub inst_start: u32,
    /// Absolute data-segment offset of the next sub-header; equals the
    /// segment length for the last template.
    pub next: u32,
    /// Stored name length in bytes.
    pub filename_len: u16,
    /// Length of the directory prefix within the name: the index just past
    /// the last `/` or `\`, or zero if the name has none.
    pub path_len: u16,
}

impl SegmentHeader {
    /// Fixed fields plus the trailing NUL.
    pub const FIXED_SIZE: usize = 13;

    /// Offset of the name bytes within an encoded sub-header.
    pub(crate) const NAME_OFFSET: usize = 12;

    /// Total encoded size for a template named with `filename_len` bytes.
    pub const fn encoded_len(filename_len: usize) -> usize {
        Self::FIXED_SIZE + filename_len
    }
}

impl ReadData for SegmentHeader {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            inst_start: reader.read()?,
            next: reader.read()?,
            filename_len: reader.read()?,
            path_len: reader.read()?,
        })
    }
}

impl WriteData for SegmentHeader {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.inst_start)?;
        writer.write(self.next)?;
        writer.write(self.filename_len)?;
        writer.write(self.path_len)?;
        Ok(())
    }
}

/// Appends a sub-header plus its name bytes (and NUL terminator) to `out`.
pub(crate) fn write_segment(out: &mut Vec<u8>, header: SegmentHeader, name: &[u8]) {
    debug_assert_eq!(header.filename_len as usize, name.len());
    // Vec writes cannot fail.
    let _ = out.write(header);
    out.extend_from_slice(name);
    out.push(0);
}

/// Decodes the sub-header at `offset`, returning it together with the stored
/// name bytes.
pub(crate) fn read_segment(data: &[u8], offset: usize) -> Result<(SegmentHeader, &[u8])> {
    let mut reader = data
        .get(offset..)
        .ok_or(MustacheError::invalid_image("sub-header out of bounds"))?;
    let header: SegmentHeader = reader.read()?;
    let name_start = offset + SegmentHeader::NAME_OFFSET;
    let name_end = name_start + header.filename_len as usize;
    let name = data
        .get(name_start..name_end)
        .ok_or(MustacheError::invalid_image("sub-header out of bounds"))?;
    Ok((header, name))
}

/// Index just past the last path separator in `name` (`/` or `\`), or zero.
pub(crate) fn path_prefix_len(name: &[u8]) -> u16 {
    let mut idx = name.len();
    while idx > 0 {
        idx -= 1;
        if name[idx] == b'/' || name[idx] == b'\\' {
            return (idx + 1) as u16;
        }
    }
    0
}

/// Walks the sub-header chain of a data segment.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Segments<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = (SegmentHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let (header, name) = read_segment(self.data, self.offset).ok()?;
        // A malformed `next` that fails to advance would loop forever.
        if header.next as usize <= self.offset {
            return None;
        }
        self.offset = header.next as usize;
        Some((header, name))
    }
}
