//! The template compiler: folds mustache sources into a flat instruction
//! image, loading partials as it goes.
//!
//! Parsing never recurses. Each template (root or partial) gets a parse
//! frame on a bounded stack; the main loop lexes whichever frame is on top
//! until its byte range is exhausted, then seals that template's
//! instruction block and pops.

pub mod loader;

#[cfg(feature = "std")]
pub use loader::DiskFilesystem;
pub use loader::{EmptyFilesystem, Filesystem};

use log::debug;
use snafu::ensure;

use crate::containers::Table;
use crate::error::{
    ClosureMismatchSnafu, MustacheError, Result, TooDeepSnafu,
};
use crate::image::{segment, Image, Instruction, InstructionData, OpCode};
use crate::vec::Vec;
use crate::{DELIMITER_LENGTH_LIMIT, NESTING_LIMIT};

impl Image {
    /// Compiles the template file at `path`, resolving `{{>partial}}`
    /// references relative to it.
    #[cfg(feature = "std")]
    pub fn compile_file(path: &str) -> Result<Image> {
        Self::compile_file_with(&DiskFilesystem, path)
    }

    /// As [`Image::compile_file`], reading through a caller-supplied
    /// [`Filesystem`].
    pub fn compile_file_with<F: Filesystem + ?Sized>(fs: &F, path: &str) -> Result<Image> {
        let mut compiler = Compiler::new(fs);
        compiler.load_file(path.as_bytes())?;
        compiler.finish()
    }

    /// Compiles an in-memory root template. The root is registered under
    /// `name`; partials referencing that name splice in the root itself,
    /// anything else is resolved from disk.
    #[cfg(feature = "std")]
    pub fn compile_source(name: &str, source: &[u8]) -> Result<Image> {
        Self::compile_source_with(&DiskFilesystem, name, source)
    }

    /// As [`Image::compile_source`], reading through a caller-supplied
    /// [`Filesystem`].
    pub fn compile_source_with<F: Filesystem + ?Sized>(
        fs: &F,
        name: &str,
        source: &[u8],
    ) -> Result<Image> {
        let mut compiler = Compiler::new(fs);
        compiler.load_data(name.as_bytes(), source.len(), Some(source))?;
        compiler.finish()
    }
}

/// One tag delimiter, stored inline. Lengths run 1..=10 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Delimiter {
    bytes: [u8; DELIMITER_LENGTH_LIMIT],
    len: u8,
}

impl Delimiter {
    pub(crate) const DEFAULT_OPEN: Self = Self {
        bytes: [b'{', b'{', 0, 0, 0, 0, 0, 0, 0, 0],
        len: 2,
    };
    pub(crate) const DEFAULT_CLOSE: Self = Self {
        bytes: [b'}', b'}', 0, 0, 0, 0, 0, 0, 0, 0],
        len: 2,
    };

    fn new(src: &[u8]) -> Result<Self> {
        ensure!(!src.is_empty(), ClosureMismatchSnafu);
        ensure!(
            src.len() <= DELIMITER_LENGTH_LIMIT,
            crate::error::DelimiterTooLongSnafu
        );
        let mut bytes = [0u8; DELIMITER_LENGTH_LIMIT];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }

    #[inline(always)]
    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Parse state for one template on the compile stack.
pub(crate) struct ParseFrame {
    /// Data-segment offset of this template's sub-header.
    pub(crate) data_start: u32,
    /// Read position, somewhere inside the template's source bytes.
    pub(crate) data_pos: u32,
    /// End of this template's source bytes.
    pub(crate) data_end: u32,
    /// Sections opened in this template and not yet closed.
    pub(crate) open_sections: u16,
    pub(crate) del_open: Delimiter,
    pub(crate) del_close: Delimiter,
}

pub(crate) struct Compiler<'a, F: Filesystem + ?Sized> {
    pub(crate) fs: &'a F,
    pub(crate) instructions: Table<Instruction>,
    pub(crate) data: Vec<u8>,
    pub(crate) frames: Vec<ParseFrame>,
}

impl<'a, F: Filesystem + ?Sized> Compiler<'a, F> {
    pub(crate) fn new(fs: &'a F) -> Self {
        Self {
            fs,
            instructions: Table::new(),
            data: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub(crate) fn finish(mut self) -> Result<Image> {
        self.run()?;
        debug!(
            "compiled {} instructions, {} data bytes",
            self.instructions.len(),
            self.data.len()
        );
        self.instructions.shrink_to_fit();
        self.data.shrink_to_fit();
        Ok(Image::new(self.instructions, self.data))
    }

    fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.frames.last() {
            if frame.data_pos < frame.data_end {
                self.step()?;
            } else {
                self.close_frame()?;
            }
        }
        Ok(())
    }

    /// Lexes one tag (and any text before it) out of the top frame.
    fn step(&mut self) -> Result<()> {
        let frame_idx = self.frames.len() - 1;
        let (pos, end, del_open, del_close) = {
            let frame = &self.frames[frame_idx];
            (
                frame.data_pos as usize,
                frame.data_end as usize,
                frame.del_open,
                frame.del_close,
            )
        };

        let found = match find(&self.data[pos..end], del_open.as_bytes()) {
            Some(found) => found,
            None => {
                // No tags left, the rest is text.
                self.push_text(pos, end - pos)?;
                self.frames[frame_idx].data_pos = end as u32;
                return Ok(());
            }
        };

        let tag_start = pos + found;
        if found > 0 {
            self.push_text(pos, found)?;
        }

        let body_start = tag_start + del_open.as_bytes().len();
        let body_end = body_start
            + find(&self.data[body_start..end], del_close.as_bytes())
                .ok_or(MustacheError::ClosureMismatch)?;
        let after = body_end + del_close.as_bytes().len();
        self.frames[frame_idx].data_pos = after as u32;

        if body_start == body_end {
            // `{{}}`: an empty variable, left to the host to emit as empty.
            return self.push_arg(body_start, body_end, true);
        }

        match self.data[body_start] {
            b'!' => Ok(()),
            b'=' => self.set_delimiters(frame_idx, body_start + 1, body_end),
            b'#' => self.open_section(frame_idx, false, body_start + 1, body_end),
            b'^' => self.open_section(frame_idx, true, body_start + 1, body_end),
            b'/' => self.close_section(frame_idx, tag_start, body_start + 1, body_end),
            b'>' => {
                let (name_start, name_end) = trim(&self.data, body_start + 1, body_end);
                let name = self.data[name_start..name_end].to_vec();
                self.load_file(&name)
            }
            b'{' => {
                // Triple mustache: swallow the third `}` when the closing
                // delimiter is brace-shaped.
                let close = del_close.as_bytes();
                if after < end
                    && self.data[after] == b'}'
                    && close.first() == Some(&b'}')
                    && close.last() == Some(&b'}')
                {
                    self.frames[frame_idx].data_pos += 1;
                }
                self.push_arg(body_start + 1, body_end, false)
            }
            b'&' => self.push_arg(body_start + 1, body_end, false),
            // Reserved sigils: strip and treat as escaped variables.
            b':' | b'<' => self.push_arg(body_start + 1, body_end, true),
            _ => self.push_arg(body_start, body_end, true),
        }
    }

    /// Seals the finished template on top of the stack: its injected
    /// `SectionStart` gets its `end`, and a matching `SectionEnd` is
    /// appended.
    fn close_frame(&mut self) -> Result<()> {
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return Ok(()),
        };
        ensure!(frame.open_sections == 0, ClosureMismatchSnafu);

        let (header, _) = segment::read_segment(&self.data, frame.data_start as usize)?;
        self.instructions[header.inst_start as usize].data.end = self.instructions.len() as u32;
        self.push_instruction(Instruction::new(
            OpCode::SectionEnd,
            InstructionData::default(),
        ))
    }

    fn set_delimiters(&mut self, frame_idx: usize, from: usize, to: usize) -> Result<()> {
        // Body shape is `=<open> <close>=`; `from` points just past the
        // leading `=`.
        ensure!(to > from && self.data[to - 1] == b'=', ClosureMismatchSnafu);
        let (start, end) = trim(&self.data, from, to - 1);
        ensure!(start < end, ClosureMismatchSnafu);

        let mut div = start;
        while div < end && !self.data[div].is_ascii_whitespace() {
            div += 1;
        }
        ensure!(div > start && div < end, ClosureMismatchSnafu);
        let open = Delimiter::new(&self.data[start..div])?;

        while div < end && self.data[div].is_ascii_whitespace() {
            div += 1;
        }
        ensure!(div < end, ClosureMismatchSnafu);
        let close = Delimiter::new(&self.data[div..end])?;

        let frame = &mut self.frames[frame_idx];
        frame.del_open = open;
        frame.del_close = close;
        Ok(())
    }

    fn open_section(
        &mut self,
        frame_idx: usize,
        inverted: bool,
        from: usize,
        to: usize,
    ) -> Result<()> {
        let (start, end) = trim(&self.data, from, to);
        let name_len = end - start;
        ensure!(name_len < u16::MAX as usize, crate::error::NameTooLongSnafu);

        {
            let frame = &mut self.frames[frame_idx];
            frame.open_sections += 1;
            ensure!(
                (frame.open_sections as usize) < NESTING_LIMIT,
                TooDeepSnafu
            );
        }

        // `content_start - name_pos`; rebuilding the raw body later relies
        // on this distance.
        let content_start = self.frames[frame_idx].data_pos as usize;
        let offset = u16::try_from(content_start - start)
            .map_err(|_| MustacheError::NameTooLong)?;

        let op = if inverted {
            OpCode::SectionStartInv
        } else {
            OpCode::SectionStart
        };
        self.push_instruction(Instruction::new(
            op,
            InstructionData {
                name_pos: start as u32,
                name_len: name_len as u16,
                offset,
                ..Default::default()
            },
        ))
    }

    /// Back-patches the nearest unmatched opener of the same name and
    /// appends the closing instruction carrying the same payload.
    fn close_section(
        &mut self,
        frame_idx: usize,
        tag_start: usize,
        from: usize,
        to: usize,
    ) -> Result<()> {
        let (start, end) = trim(&self.data, from, to);
        let name_len = end - start;
        ensure!(
            self.frames[frame_idx].open_sections > 0,
            ClosureMismatchSnafu
        );

        let mut idx = self.instructions.len();
        let mut nested = 0u32;
        loop {
            ensure!(idx > 0, ClosureMismatchSnafu);
            idx -= 1;
            match self.instructions[idx].op {
                OpCode::SectionEnd => nested += 1,
                OpCode::SectionStart | OpCode::SectionStartInv => {
                    if nested > 0 {
                        nested -= 1;
                        continue;
                    }
                    let opener = self.instructions[idx].data;
                    let name_matches = opener.name_len as usize == name_len
                        && self.data[opener.name_pos as usize..][..name_len]
                            == self.data[start..end];
                    ensure!(name_matches, ClosureMismatchSnafu);

                    let content_start = opener.name_pos as usize + opener.offset as usize;
                    let new_end = self.instructions.len() as u32;
                    {
                        let opener = &mut self.instructions[idx].data;
                        opener.end = new_end;
                        opener.len = (tag_start - content_start) as u32;
                    }
                    let payload = self.instructions[idx].data;
                    self.push_instruction(Instruction::new(OpCode::SectionEnd, payload))?;
                    self.frames[frame_idx].open_sections -= 1;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn push_text(&mut self, pos: usize, len: usize) -> Result<()> {
        self.push_instruction(Instruction::new(
            OpCode::WriteText,
            InstructionData {
                name_pos: pos as u32,
                len: len as u32,
                ..Default::default()
            },
        ))
    }

    fn push_arg(&mut self, from: usize, to: usize, escape: bool) -> Result<()> {
        let (start, end) = trim(&self.data, from, to);
        let name_len = end - start;
        ensure!(name_len < u16::MAX as usize, crate::error::NameTooLongSnafu);
        let op = if escape {
            OpCode::WriteArg
        } else {
            OpCode::WriteArgUnescaped
        };
        self.push_instruction(Instruction::new(
            op,
            InstructionData {
                name_pos: start as u32,
                name_len: name_len as u16,
                ..Default::default()
            },
        ))
    }

    pub(crate) fn push_instruction(&mut self, instruction: Instruction) -> Result<()> {
        ensure!(self.instructions.len() < i32::MAX as usize, TooDeepSnafu);
        self.instructions.push(instruction);
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn trim(data: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && data[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::String;

    fn compile(source: &[u8]) -> Result<Image> {
        Image::compile_source_with(&EmptyFilesystem, "root", source)
    }

    fn ops(image: &Image) -> Vec<OpCode> {
        image.instructions().iter().map(|i| i.op).collect()
    }

    fn name_of<'a>(image: &'a Image, idx: usize) -> &'a [u8] {
        let data = image.instructions()[idx].data;
        &image.data()[data.name_pos as usize..][..data.name_len as usize]
    }

    #[test]
    fn plain_text_is_one_write() {
        let image = compile(b"Hello, world!").unwrap();
        assert_eq!(
            ops(&image),
            [OpCode::SectionStart, OpCode::WriteText, OpCode::SectionEnd]
        );
        let text = image.instructions()[1].data;
        assert_eq!(
            &image.data()[text.name_pos as usize..][..text.len as usize],
            b"Hello, world!"
        );
        // The injected open brackets the whole template.
        assert_eq!(image.instructions()[0].data.end, 2);
    }

    #[test]
    fn variables_split_the_text() {
        let image = compile(b"Hello, {{name}}!").unwrap();
        assert_eq!(
            ops(&image),
            [
                OpCode::SectionStart,
                OpCode::WriteText,
                OpCode::WriteArg,
                OpCode::WriteText,
                OpCode::SectionEnd,
            ]
        );
        assert_eq!(name_of(&image, 2), b"name");
    }

    #[test]
    fn variable_names_are_trimmed() {
        let image = compile(b"{{  spaced name  }}").unwrap();
        assert_eq!(name_of(&image, 1), b"spaced name");
    }

    #[test]
    fn comments_emit_nothing() {
        let image = compile(b"a{{! ignore me }}b").unwrap();
        assert_eq!(
            ops(&image),
            [
                OpCode::SectionStart,
                OpCode::WriteText,
                OpCode::WriteText,
                OpCode::SectionEnd,
            ]
        );
    }

    #[test]
    fn triple_and_ampersand_are_equivalent() {
        let triple = compile(b"{{{raw}}}").unwrap();
        let ampersand = compile(b"{{&raw}}").unwrap();
        assert_eq!(ops(&triple), ops(&ampersand));
        assert_eq!(triple.instructions()[1].op, OpCode::WriteArgUnescaped);
        assert_eq!(name_of(&triple, 1), b"raw");
        assert_eq!(name_of(&ampersand, 1), b"raw");
    }

    #[test]
    fn reserved_sigils_strip_and_escape() {
        for source in [b"{{:key}}".as_slice(), b"{{<key}}".as_slice()] {
            let image = compile(source).unwrap();
            assert_eq!(image.instructions()[1].op, OpCode::WriteArg);
            assert_eq!(name_of(&image, 1), b"key");
        }
    }

    #[test]
    fn empty_tag_is_an_empty_variable() {
        let image = compile(b"{{}}").unwrap();
        assert_eq!(image.instructions()[1].op, OpCode::WriteArg);
        assert_eq!(name_of(&image, 1), b"");
    }

    #[test]
    fn sections_backpatch_their_closer() {
        let image = compile(b"{{#items}}x{{/items}}").unwrap();
        assert_eq!(
            ops(&image),
            [
                OpCode::SectionStart,
                OpCode::SectionStart,
                OpCode::WriteText,
                OpCode::SectionEnd,
                OpCode::SectionEnd,
            ]
        );
        let opener = image.instructions()[1].data;
        assert_eq!(opener.end, 3);
        assert_eq!(name_of(&image, 1), b"items");
        // Raw inner source is recoverable from name_pos/offset/len.
        let body_start = opener.name_pos as usize + opener.offset as usize;
        assert_eq!(&image.data()[body_start..][..opener.len as usize], b"x");
        // The closer carries the opener's payload.
        assert_eq!(image.instructions()[3].data, opener);
    }

    #[test]
    fn inverted_sections_get_their_own_tag() {
        let image = compile(b"{{^missing}}none{{/missing}}").unwrap();
        assert_eq!(image.instructions()[1].op, OpCode::SectionStartInv);
        assert_eq!(image.instructions()[1].data.end, 3);
    }

    #[test]
    fn nested_sections_match_innermost_first() {
        let image = compile(b"{{#a}}{{#b}}{{/b}}{{/a}}").unwrap();
        let outer = image.instructions()[1].data;
        let inner = image.instructions()[2].data;
        assert_eq!(inner.end, 3);
        assert_eq!(outer.end, 4);
    }

    #[test]
    fn same_name_nesting_closes_the_nearest() {
        let image = compile(b"{{#a}}{{#a}}{{/a}}{{/a}}").unwrap();
        assert_eq!(image.instructions()[2].data.end, 3);
        assert_eq!(image.instructions()[1].data.end, 4);
    }

    #[test]
    fn section_raw_body_spans_nested_tags() {
        let image = compile(b"{{#wrap}}pre {{inner}} post{{/wrap}}").unwrap();
        let opener = image.instructions()[1].data;
        let body_start = opener.name_pos as usize + opener.offset as usize;
        assert_eq!(
            &image.data()[body_start..][..opener.len as usize],
            b"pre {{inner}} post"
        );
    }

    #[test]
    fn delimiters_can_change_mid_template() {
        let image = compile(b"A{{=<% %>=}}<%x%>B").unwrap();
        assert_eq!(
            ops(&image),
            [
                OpCode::SectionStart,
                OpCode::WriteText,
                OpCode::WriteArg,
                OpCode::WriteText,
                OpCode::SectionEnd,
            ]
        );
        assert_eq!(name_of(&image, 2), b"x");
    }

    #[test]
    fn changed_delimiters_hide_the_old_ones() {
        let image = compile(b"{{=[[ ]]=}}[[x]] {{y}}").unwrap();
        // `{{y}}` is plain text under the new delimiters.
        assert_eq!(name_of(&image, 1), b"x");
        assert_eq!(image.instructions()[2].op, OpCode::WriteText);
    }

    #[test]
    fn delimiter_errors() {
        assert_eq!(
            compile(b"{{=onlyone=}}").unwrap_err(),
            MustacheError::ClosureMismatch
        );
        assert_eq!(
            compile(b"{{=a b}}").unwrap_err(),
            MustacheError::ClosureMismatch
        );
        assert_eq!(
            compile(b"{{=abcdefghijkl mn=}}").unwrap_err(),
            MustacheError::DelimiterTooLong
        );
        assert_eq!(
            compile(b"{{={{ abcdefghijklmno=}}").unwrap_err(),
            MustacheError::DelimiterTooLong
        );
    }

    #[test]
    fn closure_mismatches() {
        for source in [
            b"{{#a}}{{/b}}".as_slice(),
            b"{{#a}}never closed".as_slice(),
            b"stray closer {{/a}}".as_slice(),
            b"unclosed {{tag".as_slice(),
            b"{{#a}}{{#b}}{{/a}}{{/b}}".as_slice(),
        ] {
            assert_eq!(
                compile(source).unwrap_err(),
                MustacheError::ClosureMismatch,
            );
        }
    }

    #[test]
    fn runaway_nesting_is_too_deep() {
        let mut source = String::new();
        for _ in 0..NESTING_LIMIT {
            source.push_str("{{#a}}");
        }
        assert_eq!(
            compile(source.as_bytes()).unwrap_err(),
            MustacheError::TooDeep
        );
    }

    #[test]
    fn oversized_names_are_rejected() {
        let mut source = String::from("{{");
        for _ in 0..u16::MAX as usize {
            source.push('n');
        }
        source.push_str("}}");
        assert_eq!(
            compile(source.as_bytes()).unwrap_err(),
            MustacheError::NameTooLong
        );
    }

    #[test]
    fn empty_template_compiles_to_an_empty_body() {
        let image = compile(b"").unwrap();
        assert_eq!(ops(&image), [OpCode::SectionStart, OpCode::SectionEnd]);
    }

    #[test]
    fn self_reference_splices_a_goto_to_the_root() {
        let image =
            Image::compile_source_with(&EmptyFilesystem, "root", b"{{#x}}{{>root}}{{/x}}")
                .unwrap();
        let goto_idx = image
            .instructions()
            .iter()
            .position(|i| i.op == OpCode::SectionGoto)
            .unwrap();
        let goto = image.instructions()[goto_idx].data;
        assert_eq!(goto.len, 0);
        assert_eq!(goto.end as usize, goto_idx);
        image.validate().unwrap();
    }

    #[test]
    fn unknown_partials_are_not_found() {
        let err = compile(b"{{>nowhere}}").unwrap_err();
        assert_eq!(
            err,
            MustacheError::FileNotFound {
                name: String::from("nowhere")
            }
        );
    }

    #[test]
    fn empty_partial_name_is_too_short() {
        assert_eq!(
            compile(b"{{>}}").unwrap_err(),
            MustacheError::FileNameTooShort
        );
        assert_eq!(
            compile(b"{{>   }}").unwrap_err(),
            MustacheError::FileNameTooShort
        );
    }
}
