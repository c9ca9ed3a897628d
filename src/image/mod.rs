pub mod instruction;
pub mod segment;

pub use instruction::{Instruction, InstructionData, OpCode};
pub use segment::{SegmentHeader, Segments};

use crate::containers::Table;
use crate::error::{MustacheError, Result};
use crate::io::{Reader, Writer};
use crate::vec::Vec;

/// A compiled template: an instruction vector plus the data segment holding
/// every loaded template's sub-header and source bytes.
///
/// Images are immutable once compiled, so any number of threads may render
/// from the same image concurrently. The serialized form produced by
/// [`Image::write_to`] is position independent: an 8 byte header
/// (instruction count, data length, both little endian), the fixed-width
/// instruction records, then the data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    instructions: Table<Instruction>,
    data: Vec<u8>,
}

impl Image {
    pub(crate) fn new(instructions: Table<Instruction>, data: Vec<u8>) -> Self {
        Self { instructions, data }
    }

    #[inline(always)]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The raw data segment: sub-headers and template sources.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Walks the sub-headers of every template loaded into this image.
    pub fn segments(&self) -> Segments<'_> {
        Segments::new(&self.data)
    }

    /// Deserializes an image, re-checking every structural invariant the
    /// renderer relies on. Trailing bytes after the data segment are
    /// ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let reader = &mut bytes.as_ref();
        let instruction_count: u32 = reader.read()?;
        let data_length: u32 = reader.read()?;

        // Bound the upcoming allocation by what the buffer can actually
        // hold.
        let record_bytes = (instruction_count as usize)
            .checked_mul(Instruction::SIZE)
            .ok_or(MustacheError::not_enough_data(usize::MAX))?;
        if reader.len() < record_bytes {
            return Err(MustacheError::not_enough_data(record_bytes));
        }

        let instructions = Table::new_linear(reader, instruction_count as usize)?;
        let data = reader.read_slice(data_length as usize)?.to_vec();

        let image = Self {
            instructions,
            data,
        };
        image.validate()?;
        Ok(image)
    }

    pub fn write_to(&self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.instructions.len() as u32)?;
        writer.write(self.data.len() as u32)?;
        for instruction in self.instructions.iter() {
            writer.write(*instruction)?;
        }
        writer.write_slice(&self.data)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + self.instructions.len() * Instruction::SIZE + self.data.len(),
        );
        // Writes into a Vec cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    /// Checks the invariants the renderer assumes: section opens point at
    /// their closer, gotos point at loader-injected opens, name and text
    /// slices stay inside the data segment, and the sub-header chain covers
    /// it exactly.
    pub(crate) fn validate(&self) -> Result<()> {
        let instructions = self.instructions();
        let count = instructions.len();
        let data_len = self.data.len();

        if count == 0 {
            if data_len != 0 {
                return Err(MustacheError::invalid_image(
                    "data segment without instructions",
                ));
            }
            return Ok(());
        }

        if instructions[0].op != OpCode::SectionStart {
            return Err(MustacheError::invalid_image(
                "image does not begin with a template open",
            ));
        }

        let name_in_bounds = |d: &InstructionData| {
            (d.name_pos as usize)
                .checked_add(d.name_len as usize)
                .is_some_and(|end| end <= data_len)
        };

        for (idx, instruction) in instructions.iter().enumerate() {
            let d = &instruction.data;
            match instruction.op {
                OpCode::WriteText => {
                    let end = (d.name_pos as usize).checked_add(d.len as usize);
                    if !end.is_some_and(|end| end <= data_len) {
                        return Err(MustacheError::invalid_image("text run out of bounds"));
                    }
                }
                OpCode::WriteArg | OpCode::WriteArgUnescaped => {
                    if !name_in_bounds(d) {
                        return Err(MustacheError::invalid_image("name out of bounds"));
                    }
                }
                OpCode::SectionStart | OpCode::SectionStartInv => {
                    let end = d.end as usize;
                    if end <= idx || end >= count || instructions[end].op != OpCode::SectionEnd {
                        return Err(MustacheError::invalid_image(
                            "section open without matching close",
                        ));
                    }
                    if !name_in_bounds(d) {
                        return Err(MustacheError::invalid_image("name out of bounds"));
                    }
                    let text_end = (d.name_pos as usize)
                        .checked_add(d.offset as usize)
                        .and_then(|start| start.checked_add(d.len as usize));
                    if !text_end.is_some_and(|end| end <= data_len) {
                        return Err(MustacheError::invalid_image(
                            "section body out of bounds",
                        ));
                    }
                }
                OpCode::SectionGoto => {
                    let target = d.len as usize;
                    if target >= count || instructions[target].op != OpCode::SectionStart {
                        return Err(MustacheError::invalid_image("goto without target"));
                    }
                    if d.end as usize != idx {
                        return Err(MustacheError::invalid_image("goto resume point is off"));
                    }
                }
                OpCode::SectionEnd => {}
            }
        }

        // The sub-header chain must advance monotonically and terminate
        // exactly at the end of the data segment.
        let mut offset = 0usize;
        while offset < data_len {
            let (header, _) = segment::read_segment(&self.data, offset)?;
            if header.inst_start as usize >= count
                || instructions[header.inst_start as usize].op != OpCode::SectionStart
            {
                return Err(MustacheError::invalid_image(
                    "sub-header names a bad instruction",
                ));
            }
            let next = header.next as usize;
            if next <= offset || next > data_len {
                return Err(MustacheError::invalid_image("broken sub-header chain"));
            }
            offset = next;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::EmptyFilesystem;

    fn hello_image() -> Image {
        Image::compile_source_with(&EmptyFilesystem, "hello", b"Hello, {{name}}!").unwrap()
    }

    #[test]
    fn byte_round_trip_preserves_the_image() {
        let image = hello_image();
        let bytes = image.to_bytes();
        let read_back = Image::parse(&bytes).unwrap();
        assert_eq!(read_back, image);
    }

    #[test]
    fn compiled_images_validate() {
        let image = Image::compile_source_with(
            &EmptyFilesystem,
            "t",
            b"{{#a}}one {{#b}}two{{/b}}{{/a}}{{^c}}none{{/c}}",
        )
        .unwrap();
        image.validate().unwrap();
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let bytes = hello_image().to_bytes();
        for cut in [1, 7, 12, bytes.len() - 1] {
            assert!(Image::parse(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn corrupt_tag_is_rejected() {
        let mut bytes = hello_image().to_bytes();
        // First instruction tag byte lives right after the 8 byte header.
        bytes[8] = 250;
        assert!(Image::parse(&bytes).is_err());
    }

    #[test]
    fn mismatched_section_target_is_rejected() {
        let image = hello_image();
        let mut bytes = image.to_bytes();
        // Point the root open's `end` field past the instruction vector.
        bytes[9..13].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Image::parse(&bytes),
            Err(MustacheError::InvalidImage { .. })
        ));
    }

    #[test]
    fn empty_image_parses() {
        let empty = Image::new(Table::new(), Vec::new());
        let bytes = empty.to_bytes();
        assert_eq!(bytes, [0u8; 8]);
        let read_back = Image::parse(&bytes).unwrap();
        assert_eq!(read_back.instructions().len(), 0);
    }

    #[test]
    fn image_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<Image>();
    }
}
