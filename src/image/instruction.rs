//! Fixed-width instruction records making up an image's code segment.

use crate::error::{MustacheError, Result};
use crate::io::{ReadData, Reader, WriteData, Writer};

/// Instruction tag. The numeric values are the on-wire encoding and are
/// stable across releases.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Emit a literal run of template text.
    WriteText = 0,
    /// Emit a named value, HTML-escaped by the host.
    WriteArg = 1,
    /// Emit a named value verbatim (`{{{..}}}` / `{{&..}}`).
    WriteArgUnescaped = 2,
    /// Open a section. Unnamed starts are injected by the partial loader to
    /// bracket each loaded template.
    SectionStart = 3,
    /// Open an inverted section (`{{^..}}`).
    SectionStartInv = 4,
    /// Close the innermost open section.
    SectionEnd = 5,
    /// Splice a previously-loaded template: jump to its `SectionStart` and
    /// resume after this instruction once it completes.
    SectionGoto = 6,
}

impl OpCode {
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::WriteText,
            1 => Self::WriteArg,
            2 => Self::WriteArgUnescaped,
            3 => Self::SectionStart,
            4 => Self::SectionStartInv,
            5 => Self::SectionEnd,
            6 => Self::SectionGoto,
            _ => return None,
        })
    }
}

impl ReadData for OpCode {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        let raw: u8 = reader.read()?;
        OpCode::from_u8(raw).ok_or(MustacheError::invalid_image("unknown instruction tag"))
    }
}

impl WriteData for OpCode {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self as u8)
    }
}

/// Payload shared by every instruction; fields are overloaded per tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionData {
    /// For section opens: index of the matching [`OpCode::SectionEnd`].
    /// For `SectionEnd`/`SectionGoto`: the instruction's own index at
    /// emission time (the renderer's resume point).
    pub end: u32,
    /// `WriteText`: byte length of the text run. Section opens: byte length
    /// of the raw inner source. `SectionGoto`: target instruction index.
    pub len: u32,
    /// Byte offset of the referenced name inside the data segment. Zero
    /// means unnamed (a sub-header occupies offset zero, so no real name can
    /// start there).
    pub name_pos: u32,
    /// Byte length of the referenced name.
    pub name_len: u16,
    /// Section opens: distance from the name start to the first byte of the
    /// inner content (just past the closing delimiter).
    pub offset: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub data: InstructionData,
}

impl Instruction {
    /// Serialized record width: a tag byte plus the five payload fields.
    pub const SIZE: usize = 17;

    pub(crate) const fn new(op: OpCode, data: InstructionData) -> Self {
        Self { op, data }
    }
}

impl ReadData for Instruction {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            op: reader.read()?,
            data: InstructionData {
                end: reader.read()?,
                len: reader.read()?,
                name_pos: reader.read()?,
                name_len: reader.read()?,
                offset: reader.read()?,
            },
        })
    }
}

impl WriteData for Instruction {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.op)?;
        writer.write(self.data.end)?;
        writer.write(self.data.len)?;
        writer.write(self.data.name_pos)?;
        writer.write(self.data.name_len)?;
        writer.write(self.data.offset)?;
        Ok(())
    }
}
