//! Async-signal-safe stack unwinding and symbolication for crash
//! reporting.
//!
//! Given a suspended thread's register state and the set of Mach-O
//! images loaded in a target task, this crate reconstructs the caller
//! chain one frame at a time — consulting the compact unwind encoding
//! side table first and falling back to DWARF call frame information —
//! and best-effort resolves return addresses to symbol names.
//!
//! The crate is built to run where crash reporters run: inside a signal
//! handler or against a suspended (possibly remote) task, over binary
//! data that may be corrupt or hostile. Every access to target memory
//! goes through a bounds-checked [`Mapping`]; every table walk is
//! bounded by validated lengths; and nothing here panics on untrusted
//! input — every fallible operation returns a [`Result`] with the
//! four-way [`Error`] taxonomy.
//!
//! The moving parts:
//!
//! - [`TaskMemory`] is the seam onto the target task ([`SliceMemory`]
//!   for in-memory data, `ProcessMemory` on Linux for live processes).
//! - [`ImageList`] tracks loaded images: writers lock, readers iterate
//!   lock-free under a reader bracket, safe from signal context.
//! - [`MachImage`] parses headers, segments, sections, and symbol
//!   tables out of task memory.
//! - [`CfeReader`]/[`CfeEntry`] look up and decode compact unwind
//!   entries; the [`dwarf`] module evaluates CFA programs and
//!   expressions.
//! - [`FrameCursor`] orchestrates a walk; [`find_symbol`] names the
//!   resulting addresses.

mod arch;
pub mod compact_unwind;
mod cursor;
pub mod dwarf;
mod error;
mod list;
pub mod macho;
mod mem;
mod regs;
mod string;
mod symbols;
#[cfg(test)]
pub(crate) mod testutil;

pub use arch::{arm64, x86_64, Arch, CPU_TYPE_ARM64, CPU_TYPE_X86_64};
pub use compact_unwind::{CfeEntry, CfeEntryKind, CfeReader};
pub use cursor::{CursorState, FrameCursor, MAX_FRAMES};
pub use error::{Error, Result};
pub use list::{AsyncList, ImageList, ListIter, ListReader, Node};
pub use macho::symtab::{SymtabEntry, SymtabReader};
pub use macho::MachImage;
pub use mem::{Mapping, SliceMemory, TaskMemory, PAGE_SIZE};
pub use regs::{RegisterState, MAX_REGS};
pub use string::TaskString;
pub use symbols::{find_symbol, RuntimeSymbols, Symbol, SymbolStrategy};

#[cfg(target_os = "linux")]
pub use mem::ProcessMemory;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// The architecture this process itself runs on.
        pub const ARCH_NATIVE: Arch = Arch::Arm64;
    } else if #[cfg(target_arch = "x86_64")] {
        /// The architecture this process itself runs on.
        pub const ARCH_NATIVE: Arch = Arch::X86_64;
    }
}
