//! The frame cursor: steps one physical stack frame at a time, trying
//! the compact unwind side table first and falling back to DWARF call
//! frame information.

use tracing::trace;

use crate::compact_unwind::{CfeEntry, CfeEntryKind, CfeReader};
use crate::dwarf::cfa::CfaState;
use crate::dwarf::frame::FrameReader;
use crate::error::{Error, Result};
use crate::list::ImageList;
use crate::macho::{MachImage, SECT_EH_FRAME, SECT_UNWIND_INFO, SEG_TEXT};
use crate::mem::TaskMemory;
use crate::regs::RegisterState;

/// Hard ceiling on walked frames; cyclic or degenerate frame data must
/// terminate, and deeper stacks than this do not produce useful reports.
pub const MAX_FRAMES: usize = 512;

/// Cursor progress. "Can't unwind further" is an expected outcome at the
/// top of most stacks, not an error, so every step failure lands in
/// `NoFrame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    /// The initial register state has not been yielded yet.
    Initial,
    /// A frame is current; stepping may continue.
    HasFrame,
    /// The walk has ended.
    NoFrame,
}

enum CompactOutcome {
    /// The entry fully restored the caller's state.
    State(RegisterState),
    /// A zero encoding: the function deliberately has no unwind info.
    NoInfo,
    /// The entry defers to the DWARF call frame information.
    Defer,
    /// No section or no entry covering the pc.
    Absent,
}

/// Steps frames for one thread of a target task.
///
/// The cursor holds a reader bracket over the image list only for the
/// duration of each step, and only reads task memory through the
/// bounds-checked mapper, so it is safe to drive from the same
/// signal-handler context the initial register state was captured in.
pub struct FrameCursor<'a, T: TaskMemory> {
    task: &'a T,
    images: &'a ImageList,
    state: CursorState,
    frame: RegisterState,
    depth: usize,
}

impl<'a, T: TaskMemory> FrameCursor<'a, T> {
    pub fn new(task: &'a T, images: &'a ImageList, initial: RegisterState) -> FrameCursor<'a, T> {
        FrameCursor {
            task,
            images,
            state: CursorState::Initial,
            frame: initial,
            depth: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Yield the next frame's register state: the initial state first,
    /// then one caller frame per call. `None` ends the walk, cleanly for
    /// exhausted stacks and silently (logged) for undecodable ones.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<RegisterState> {
        match self.state {
            CursorState::NoFrame => None,
            CursorState::Initial => {
                self.state = CursorState::HasFrame;
                self.depth = 1;
                Some(self.frame.clone())
            }
            CursorState::HasFrame => {
                if self.depth >= MAX_FRAMES {
                    trace!("frame limit reached, ending the walk");
                    self.state = CursorState::NoFrame;
                    return None;
                }
                let next = match self.step() {
                    Ok(Some(next)) => next,
                    Ok(None) => {
                        self.state = CursorState::NoFrame;
                        return None;
                    }
                    Err(err) => {
                        // Undecodable data ends the walk; it never
                        // becomes a crash of the monitor itself.
                        trace!(%err, "unwind step failed, ending the walk");
                        self.state = CursorState::NoFrame;
                        return None;
                    }
                };

                // The stack grows downwards; a caller frame below the
                // callee means a cycle or corrupt frame data.
                if let (Some(old_sp), Some(new_sp)) = (self.frame.sp(), next.sp()) {
                    if new_sp < old_sp {
                        trace!(old_sp, new_sp, "stack pointer moved backwards, ending the walk");
                        self.state = CursorState::NoFrame;
                        return None;
                    }
                }

                // A restored pc of zero is the base of the thread; the
                // null frame itself is not part of the walk.
                if next.ip().map_or(true, |ip| ip == 0) {
                    self.state = CursorState::NoFrame;
                    return None;
                }

                self.frame = next.clone();
                self.depth += 1;
                Some(next)
            }
        }
    }

    fn step(&self) -> Result<Option<RegisterState>> {
        let pc = match self.frame.ip() {
            None | Some(0) => return Ok(None),
            Some(pc) => pc,
        };

        let reader = self.images.read();
        let Some(node) = reader.image_containing_address(pc) else {
            trace!(pc, "no image covers the address");
            return Ok(None);
        };
        let image = node.value();

        match self.try_compact_unwind(image, pc) {
            Ok(CompactOutcome::State(state)) => return Ok(Some(state)),
            Ok(CompactOutcome::NoInfo) => {
                trace!(pc, "function has no unwind information");
                return Ok(None);
            }
            Ok(CompactOutcome::Defer) | Ok(CompactOutcome::Absent) => {}
            Err(err) => {
                trace!(%err, pc, "compact unwind failed, falling back to DWARF");
            }
        }

        self.try_dwarf(image, pc).map(Some)
    }

    fn try_compact_unwind(&self, image: &MachImage, pc: u64) -> Result<CompactOutcome> {
        let mobj = match image.map_section(self.task, SEG_TEXT, SECT_UNWIND_INFO) {
            Ok(mobj) => mobj,
            Err(err) if err.is_not_found() => return Ok(CompactOutcome::Absent),
            Err(err) => return Err(err),
        };

        let reader = CfeReader::new(&mobj, image.arch()?)?;
        let pc_offset = pc
            .checked_sub(image.header_address())
            .ok_or(Error::Invalid("address precedes the image base"))?;
        let (function_base, encoding) = match reader.find_entry(pc_offset) {
            Ok(found) => found,
            Err(err) if err.is_not_found() => return Ok(CompactOutcome::Absent),
            Err(err) => return Err(err),
        };

        let entry = CfeEntry::decode(image.arch()?, encoding)?;
        match entry.kind() {
            CfeEntryKind::None => Ok(CompactOutcome::NoInfo),
            CfeEntryKind::Dwarf => Ok(CompactOutcome::Defer),
            _ => {
                let function_address = image
                    .header_address()
                    .checked_add(function_base)
                    .ok_or(Error::Invalid("function address overflows"))?;
                let state = entry.apply(self.task, function_address, &self.frame)?;
                Ok(CompactOutcome::State(state))
            }
        }
    }

    fn try_dwarf(&self, image: &MachImage, pc: u64) -> Result<RegisterState> {
        let mobj = image.map_section(self.task, SEG_TEXT, SECT_EH_FRAME)?;
        let endian = image.endian();
        let reader = FrameReader::new(&mobj, endian, false);
        let fde = reader.find_fde(pc)?;

        let mut state = CfaState::new();
        let (cie_addr, cie_len) = fde.cie.initial_instructions;
        state.eval_program(
            &mobj,
            0,
            fde.initial_location,
            &fde.cie,
            endian,
            cie_addr,
            0,
            cie_len,
        )?;
        let (fde_addr, fde_len) = fde.instructions;
        state.eval_program(
            &mobj,
            pc,
            fde.initial_location,
            &fde.cie,
            endian,
            fde_addr,
            0,
            fde_len,
        )?;
        state.apply(self.task, &fde.cie, &self.frame)
    }
}
