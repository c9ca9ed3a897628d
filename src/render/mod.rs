//! The rendering virtual machine.
//!
//! Rendering walks the instruction vector with an explicit stack of section
//! frames, so arbitrarily nested (and recursive) templates never recurse
//! through the host call stack. An [`Image`] is immutable here; any number
//! of threads may render from it at once, each invocation owning its own
//! frame stack.

use snafu::ensure;

use crate::error::{Result, TooDeepSnafu, UnknownSnafu};
use crate::image::{Image, Instruction, OpCode};
use crate::vec::Vec;
use crate::NESTING_LIMIT;

/// Host callbacks driving value lookup and output.
///
/// `U` is the per-section user data: every section frame carries one value,
/// children start each iteration with a fresh copy of their parent's, and
/// rebinding it (usually from [`RenderHandler::on_section_start`]) is
/// visible to the section's body but never to the parent.
///
/// A callback returning an error aborts the render;
/// [`MustacheError::UserError`](crate::MustacheError::UserError) is the
/// conventional value. [`RenderHandler::on_formatting_error`] then runs
/// exactly once before the error is handed back.
pub trait RenderHandler<U> {
    /// Emit the named value. Missing or empty names are emitted as empty.
    /// `escape` asks for the host's HTML escaping.
    fn on_arg(&mut self, section: &mut Section<'_, U>, name: &[u8], escape: bool) -> Result<()>;

    /// Emit literal template text.
    fn on_text(&mut self, section: &mut Section<'_, U>, text: &[u8]) -> Result<()>;

    /// Report how many times the named section iterates: 0 for false/empty,
    /// 1 for truthy scalars, the length for arrays. When `callable` is true
    /// the host may instead invoke the section as a lambda (its raw body is
    /// [`Section::text`]) and return 0 to suppress default iteration.
    fn on_section_test(
        &mut self,
        section: &mut Section<'_, U>,
        name: &[u8],
        callable: bool,
    ) -> Result<u32>;

    /// Runs before each iteration of a named section; the place to rebind
    /// [`Section::udata_mut`] to the current element.
    fn on_section_start(
        &mut self,
        section: &mut Section<'_, U>,
        name: &[u8],
        index: u32,
    ) -> Result<()> {
        let _ = (section, name, index);
        Ok(())
    }

    /// Cleanup hook, called exactly once when a render fails for any
    /// reason.
    fn on_formatting_error(&mut self, udata: &U) {
        let _ = udata;
    }
}

/// One renderer stack frame.
#[derive(Debug)]
struct Frame<U> {
    udata: U,
    /// Instruction index the section body restarts from.
    start: u32,
    /// Instruction index to resume at once iteration finishes.
    end: u32,
    /// Zero-based iteration counter.
    index: u32,
    /// Iterations the host asked for.
    count: u32,
}

/// Opaque handle onto the renderer's section stack, passed to every
/// callback. Lets the host read and rebind the current section's user data,
/// walk outward through enclosing scopes, and grab a section's raw source.
pub struct Section<'a, U> {
    frames: &'a mut [Frame<U>],
    instructions: &'a [Instruction],
    data: &'a [u8],
    pos: u32,
}

impl<'a, U> Section<'a, U> {
    /// User data of the current section.
    #[inline(always)]
    pub fn udata(&self) -> &U {
        &self.frames[self.frames.len() - 1].udata
    }

    /// Rebinds the current section's user data. Children inherit the new
    /// value; the parent keeps its own.
    #[inline(always)]
    pub fn udata_mut(&mut self) -> &mut U {
        let top = self.frames.len() - 1;
        &mut self.frames[top].udata
    }

    /// Zero-based nesting depth of the current section.
    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    /// The unparsed bytes of the section under test, for hosts that treat
    /// the section as a lambda. Only meaningful while a plain section's
    /// open is executing (`on_section_test` / `on_section_start`); yields
    /// `None` elsewhere, including inverted sections.
    pub fn text(&self) -> Option<&'a [u8]> {
        let instruction = &self.instructions[self.pos as usize];
        if instruction.op != OpCode::SectionStart {
            return None;
        }
        let start = instruction.data.name_pos as usize + instruction.data.offset as usize;
        Some(&self.data[start..start + instruction.data.len as usize])
    }
}

impl<'a, U: PartialEq> Section<'a, U> {
    /// User data of the nearest enclosing section whose value differs from
    /// the current one, or `None` at the root. Mustache name lookup walks
    /// these outward.
    pub fn parent(&self) -> Option<&U> {
        self.scopes().nth(1)
    }

    /// Iterates the distinct scopes from the current section outward to the
    /// root. The current scope comes first; frames sharing their parent's
    /// value are skipped.
    pub fn scopes(&self) -> Scopes<'_, U> {
        Scopes {
            frames: &self.frames[..],
            prev: None,
        }
    }
}

/// Iterator over distinct enclosing scopes, innermost first.
pub struct Scopes<'a, U> {
    frames: &'a [Frame<U>],
    prev: Option<&'a U>,
}

impl<'a, U: PartialEq> Iterator for Scopes<'a, U> {
    type Item = &'a U;

    fn next(&mut self) -> Option<&'a U> {
        while let Some((last, rest)) = self.frames.split_last() {
            self.frames = rest;
            match self.prev {
                Some(prev) if *prev == last.udata => continue,
                _ => {
                    self.prev = Some(&last.udata);
                    return Some(&last.udata);
                }
            }
        }
        None
    }
}

impl Image {
    /// Renders this image once, driving `handler`'s callbacks in program
    /// order. `udata` seeds the root section; every nested section starts
    /// from its parent's value.
    pub fn render<U, H>(&self, handler: &mut H, udata: U) -> Result<()>
    where
        U: Clone + PartialEq,
        H: RenderHandler<U>,
    {
        let instructions = self.instructions();
        if instructions.is_empty() {
            return Ok(());
        }

        let mut stack: Vec<Frame<U>> = Vec::with_capacity(NESTING_LIMIT);
        stack.push(Frame {
            udata,
            start: 0,
            end: instructions[0].data.end,
            index: 0,
            count: 0,
        });

        match run(instructions, self.data(), handler, &mut stack) {
            Ok(()) => Ok(()),
            Err(error) => {
                handler.on_formatting_error(&stack[0].udata);
                Err(error)
            }
        }
    }
}

fn run<U, H>(
    instructions: &[Instruction],
    data: &[u8],
    handler: &mut H,
    stack: &mut Vec<Frame<U>>,
) -> Result<()>
where
    U: Clone + PartialEq,
    H: RenderHandler<U>,
{
    let mut pos: usize = 0;
    while pos < instructions.len() {
        let instruction = instructions[pos];
        let d = instruction.data;
        match instruction.op {
            OpCode::WriteText => {
                let text = &data[d.name_pos as usize..][..d.len as usize];
                let mut section = Section {
                    frames: stack.as_mut_slice(),
                    instructions,
                    data,
                    pos: pos as u32,
                };
                handler.on_text(&mut section, text)?;
            }
            OpCode::WriteArg | OpCode::WriteArgUnescaped => {
                let name = &data[d.name_pos as usize..][..d.name_len as usize];
                let escape = instruction.op == OpCode::WriteArg;
                let mut section = Section {
                    frames: stack.as_mut_slice(),
                    instructions,
                    data,
                    pos: pos as u32,
                };
                handler.on_arg(&mut section, name, escape)?;
            }
            OpCode::SectionGoto | OpCode::SectionStart | OpCode::SectionStartInv => {
                ensure!(stack.len() < NESTING_LIMIT, TooDeepSnafu);
                let inherited = stack[stack.len() - 1].udata.clone();
                stack.push(Frame {
                    udata: inherited,
                    start: if instruction.op == OpCode::SectionGoto {
                        d.len
                    } else {
                        pos as u32
                    },
                    end: d.end,
                    index: 0,
                    count: 1,
                });

                if d.name_pos != 0 {
                    // Named sections iterate however the host says.
                    let name = &data[d.name_pos as usize..][..d.name_len as usize];
                    let callable = instruction.op == OpCode::SectionStart;
                    let value = {
                        let mut section = Section {
                            frames: stack.as_mut_slice(),
                            instructions,
                            data,
                            pos: pos as u32,
                        };
                        handler.on_section_test(&mut section, name, callable)?
                    };
                    let count = if instruction.op == OpCode::SectionStartInv {
                        (value == 0) as u32
                    } else {
                        value
                    };
                    let top = stack.len() - 1;
                    stack[top].count = count;
                }

                pos = advance_section(instructions, data, handler, stack)?;
            }
            OpCode::SectionEnd => {
                pos = advance_section(instructions, data, handler, stack)?;
            }
        }
        pos += 1;
    }
    Ok(())
}

/// Shared tail of every section instruction: either begin the next
/// iteration at `start`, or finish by jumping to `end` and popping.
fn advance_section<U, H>(
    instructions: &[Instruction],
    data: &[u8],
    handler: &mut H,
    stack: &mut Vec<Frame<U>>,
) -> Result<usize>
where
    U: Clone + PartialEq,
    H: RenderHandler<U>,
{
    ensure!(stack.len() > 1, UnknownSnafu);
    let depth = stack.len() - 1;

    if stack[depth].index < stack[depth].count {
        let new_pos = stack[depth].start as usize;
        // Each iteration starts from the parent's user data, so rebinds
        // made during the previous pass never leak backward.
        let inherited = stack[depth - 1].udata.clone();
        stack[depth].udata = inherited;

        let opener = instructions[new_pos];
        if opener.data.name_pos != 0 {
            let name =
                &data[opener.data.name_pos as usize..][..opener.data.name_len as usize];
            let index = stack[depth].index;
            let mut section = Section {
                frames: stack.as_mut_slice(),
                instructions,
                data,
                pos: new_pos as u32,
            };
            handler.on_section_start(&mut section, name, index)?;
        }
        stack[depth].index += 1;
        Ok(new_pos)
    } else {
        let new_pos = stack[depth].end as usize;
        stack.pop();
        Ok(new_pos)
    }
}
