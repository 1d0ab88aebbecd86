//! arm64 compact unwind encoding bit layout.

use arrayvec::ArrayVec;

use super::{extract, CfeEntry, CfeEntryKind};
use crate::arch::{arm64 as regs, Arch};
use crate::error::{Error, Result};

pub const UNWIND_ARM64_MODE_MASK: u32 = 0x0f00_0000;
pub const UNWIND_ARM64_MODE_FRAMELESS: u32 = 0x0200_0000;
pub const UNWIND_ARM64_MODE_DWARF: u32 = 0x0300_0000;
pub const UNWIND_ARM64_MODE_FRAME: u32 = 0x0400_0000;

pub const UNWIND_ARM64_FRAME_X19_X20_PAIR: u32 = 0x0000_0001;
pub const UNWIND_ARM64_FRAME_X21_X22_PAIR: u32 = 0x0000_0002;
pub const UNWIND_ARM64_FRAME_X23_X24_PAIR: u32 = 0x0000_0004;
pub const UNWIND_ARM64_FRAME_X25_X26_PAIR: u32 = 0x0000_0008;
pub const UNWIND_ARM64_FRAME_X27_X28_PAIR: u32 = 0x0000_0010;

pub const UNWIND_ARM64_FRAMELESS_STACK_SIZE_MASK: u32 = 0x00ff_f000;
pub const UNWIND_ARM64_DWARF_SECTION_OFFSET: u32 = 0x00ff_ffff;

/// The saved general-purpose register pairs, in the order they sit below
/// the frame record (the x27/x28 pair is stored lowest). Floating-point
/// pairs cannot be represented in the restored thread state and are
/// skipped.
const PAIRS: [(u32, u16, u16); 5] = [
    (UNWIND_ARM64_FRAME_X27_X28_PAIR, regs::x(28), regs::x(27)),
    (UNWIND_ARM64_FRAME_X25_X26_PAIR, regs::x(26), regs::x(25)),
    (UNWIND_ARM64_FRAME_X23_X24_PAIR, regs::x(24), regs::x(23)),
    (UNWIND_ARM64_FRAME_X21_X22_PAIR, regs::x(22), regs::x(21)),
    (UNWIND_ARM64_FRAME_X19_X20_PAIR, regs::x(20), regs::x(19)),
];

pub(super) fn decode(encoding: u32) -> Result<CfeEntry> {
    let mut entry = CfeEntry {
        arch: Arch::Arm64,
        kind: CfeEntryKind::None,
        stack_offset: 0,
        stack_adjust: 0,
        return_address_reg: None,
        registers: ArrayVec::new(),
    };

    match encoding & UNWIND_ARM64_MODE_MASK {
        mode @ (UNWIND_ARM64_MODE_FRAME | UNWIND_ARM64_MODE_FRAMELESS) => {
            if mode == UNWIND_ARM64_MODE_FRAME {
                entry.kind = CfeEntryKind::FramePtr;
            } else {
                // Frameless entries encode the stack size in units of 16
                // bytes (registers are stored in pairs), and the return
                // address stays live in the link register.
                entry.kind = CfeEntryKind::FramelessImmediate;
                entry.stack_offset =
                    (extract(encoding, UNWIND_ARM64_FRAMELESS_STACK_SIZE_MASK) as i64) * 16;
                entry.return_address_reg = Some(regs::LR);
            }

            for &(bit, first, second) in &PAIRS {
                if encoding & bit != 0 {
                    entry.registers.push(Some(first));
                    entry.registers.push(Some(second));
                }
            }

            // For frame entries the saved pairs sit immediately below the
            // frame record.
            if mode == UNWIND_ARM64_MODE_FRAME {
                entry.stack_offset = -((entry.registers.len() as i64) * 8);
            }
            Ok(entry)
        }

        UNWIND_ARM64_MODE_DWARF => {
            entry.kind = CfeEntryKind::Dwarf;
            entry.stack_offset = extract(encoding, UNWIND_ARM64_DWARF_SECTION_OFFSET) as i64;
            Ok(entry)
        }

        0 => Ok(entry),

        _ => Err(Error::NotSupported("unrecognized arm64 compact unwind mode")),
    }
}
