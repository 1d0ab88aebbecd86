//! The call-frame-instruction state machine: executes a CFA program into
//! a per-register rule set plus one canonical-frame-address rule, and
//! applies the result to a register state.

use arrayvec::ArrayVec;
use gimli::{DwCfa, RunTimeEndian};
use tracing::trace;

use super::{expression, read_encoded_pointer, CieInfo, Opstream};
use crate::error::{Error, Result};
use crate::mem::{apply_offset, read_task_u64, Mapping, TaskMemory};
use crate::regs::RegisterState;

/// Depth of the `remember_state`/`restore_state` snapshot stack.
/// Exceeding it is a hard failure, not silent truncation.
pub const CFA_STACK_DEPTH: usize = 6;

/// Largest DWARF register number a rule may target.
pub const CFA_REGISTER_MAX: u16 = 63;

const RULE_SLOTS: usize = CFA_REGISTER_MAX as usize + 1;

/// How to recover one register, relative to the resolved CFA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegRule {
    /// Saved at CFA + offset.
    Offset(i64),
    /// The value *is* CFA + offset.
    ValOffset(i64),
    /// Copied from another register of the previous frame.
    Register(u16),
    /// Saved at the address computed by the expression.
    Expression { address: u64, length: u64 },
    /// The value computed by the expression.
    ValExpression { address: u64, length: u64 },
    /// Unchanged from the previous frame.
    SameValue,
}

/// How to compute the canonical frame address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaRule {
    Undefined,
    RegisterOffset { register: u16, offset: i64 },
    Expression { address: u64, length: u64 },
}

#[derive(Clone, Copy, Debug)]
struct Snapshot {
    cfa: CfaRule,
    rules: [Option<RegRule>; RULE_SLOTS],
}

impl Snapshot {
    fn empty() -> Snapshot {
        Snapshot {
            cfa: CfaRule::Undefined,
            rules: [None; RULE_SLOTS],
        }
    }
}

/// The mutable evaluation state for one unwind step. Build it empty, run
/// the CIE's initial instructions and then the FDE's program, then
/// [`CfaState::apply`] the result.
#[derive(Debug)]
pub struct CfaState {
    cur: Snapshot,
    stack: ArrayVec<Snapshot, CFA_STACK_DEPTH>,
}

impl Default for CfaState {
    fn default() -> Self {
        Self::new()
    }
}

impl CfaState {
    pub fn new() -> CfaState {
        CfaState {
            cur: Snapshot::empty(),
            stack: ArrayVec::new(),
        }
    }

    pub fn cfa_rule(&self) -> CfaRule {
        self.cur.cfa
    }

    pub fn register_rule(&self, reg: u16) -> Option<RegRule> {
        self.cur.rules.get(reg as usize).copied().flatten()
    }

    fn set_register(&mut self, reg: u16, rule: RegRule) {
        self.cur.rules[reg as usize] = Some(rule);
    }

    fn remove_register(&mut self, reg: u16) {
        self.cur.rules[reg as usize] = None;
    }

    /// Execute the CFA program at `address + offset` (length `length`)
    /// within `mobj`.
    ///
    /// `initial_location` seeds the implicit location counter (the FDE's
    /// first covered address). A nonzero `pc` is a ceiling: evaluation
    /// stops once the location advances beyond it; zero runs the program
    /// to completion (used for CIE initial instructions).
    #[allow(clippy::too_many_arguments)]
    pub fn eval_program(
        &mut self,
        mobj: &Mapping,
        pc: u64,
        initial_location: u64,
        cie: &CieInfo,
        endian: RunTimeEndian,
        address: u64,
        offset: i64,
        length: u64,
    ) -> Result<()> {
        let mut stream = Opstream::new(mobj, endian, address, offset, length)?;
        let mut location = initial_location;

        // Needed by DW_CFA_restore: the rule a register had when this
        // program started.
        let initial_state = self.cur;

        let read_regnum = |s: &mut Opstream| -> Result<u16> {
            let v = s.read_uleb128()?;
            if v > CFA_REGISTER_MAX as u64 {
                return Err(Error::NotSupported("register number exceeds the rule table"));
            }
            Ok(v as u16)
        };
        let factored = |v: u64, cie: &CieInfo| -> Result<i64> {
            i64::try_from(v)
                .ok()
                .and_then(|v| v.checked_mul(cie.data_alignment_factor))
                .ok_or(Error::Invalid("factored offset overflows"))
        };
        let factored_s = |v: i64, cie: &CieInfo| -> Result<i64> {
            v.checked_mul(cie.data_alignment_factor)
                .ok_or(Error::Invalid("factored offset overflows"))
        };
        let advance = |location: &mut u64, delta: u64, cie: &CieInfo| -> Result<()> {
            let delta = delta
                .checked_mul(cie.code_alignment_factor)
                .ok_or(Error::Invalid("location advance overflows"))?;
            *location = location
                .checked_add(delta)
                .ok_or(Error::Invalid("location advance overflows"))?;
            Ok(())
        };

        while (pc == 0 || location <= pc) && !stream.is_empty() {
            let opcode = stream.read_u8()?;

            // The three primary opcodes carry their operand in the low
            // six bits.
            if opcode & 0xc0 != 0 {
                let operand = opcode & 0x3f;
                match DwCfa(opcode & 0xc0) {
                    gimli::DW_CFA_advance_loc => {
                        advance(&mut location, operand as u64, cie)?;
                    }
                    gimli::DW_CFA_offset => {
                        let off = factored(stream.read_uleb128()?, cie)?;
                        self.set_register(operand as u16, RegRule::Offset(off));
                    }
                    gimli::DW_CFA_restore => {
                        match initial_state.rules[operand as usize] {
                            Some(rule) => self.set_register(operand as u16, rule),
                            None => self.remove_register(operand as u16),
                        }
                    }
                    _ => unreachable!(),
                }
                continue;
            }

            match DwCfa(opcode) {
                gimli::DW_CFA_nop => {}

                gimli::DW_CFA_set_loc => {
                    if cie.segment_size != 0 {
                        return Err(Error::NotSupported("segment-qualified locations"));
                    }
                    let encoding = if cie.has_eh_augmentation {
                        cie.pointer_encoding
                    } else {
                        gimli::DW_EH_PE_absptr.0
                    };
                    location = read_encoded_pointer(&mut stream, encoding)?;
                }
                gimli::DW_CFA_advance_loc1 => {
                    let d = stream.read_u8()? as u64;
                    advance(&mut location, d, cie)?;
                }
                gimli::DW_CFA_advance_loc2 => {
                    let d = stream.read_u16()? as u64;
                    advance(&mut location, d, cie)?;
                }
                gimli::DW_CFA_advance_loc4 => {
                    let d = stream.read_u32()? as u64;
                    advance(&mut location, d, cie)?;
                }

                gimli::DW_CFA_def_cfa => {
                    let register = read_regnum(&mut stream)?;
                    let offset = i64::try_from(stream.read_uleb128()?)
                        .map_err(|_| Error::Invalid("CFA offset overflows"))?;
                    self.cur.cfa = CfaRule::RegisterOffset { register, offset };
                }
                gimli::DW_CFA_def_cfa_sf => {
                    let register = read_regnum(&mut stream)?;
                    let offset = factored_s(stream.read_sleb128()?, cie)?;
                    self.cur.cfa = CfaRule::RegisterOffset { register, offset };
                }
                gimli::DW_CFA_def_cfa_register => {
                    let register = read_regnum(&mut stream)?;
                    match self.cur.cfa {
                        CfaRule::RegisterOffset { offset, .. } => {
                            self.cur.cfa = CfaRule::RegisterOffset { register, offset };
                        }
                        _ => {
                            return Err(Error::Invalid(
                                "DW_CFA_def_cfa_register without a register CFA rule",
                            ))
                        }
                    }
                }
                gimli::DW_CFA_def_cfa_offset => {
                    let offset = i64::try_from(stream.read_uleb128()?)
                        .map_err(|_| Error::Invalid("CFA offset overflows"))?;
                    match self.cur.cfa {
                        CfaRule::RegisterOffset { register, .. } => {
                            self.cur.cfa = CfaRule::RegisterOffset { register, offset };
                        }
                        _ => {
                            return Err(Error::Invalid(
                                "DW_CFA_def_cfa_offset without a register CFA rule",
                            ))
                        }
                    }
                }
                gimli::DW_CFA_def_cfa_offset_sf => {
                    let offset = factored_s(stream.read_sleb128()?, cie)?;
                    match self.cur.cfa {
                        CfaRule::RegisterOffset { register, .. } => {
                            self.cur.cfa = CfaRule::RegisterOffset { register, offset };
                        }
                        _ => {
                            return Err(Error::Invalid(
                                "DW_CFA_def_cfa_offset without a register CFA rule",
                            ))
                        }
                    }
                }
                gimli::DW_CFA_def_cfa_expression => {
                    let length = stream.read_uleb128()?;
                    let address = stream.target_address();
                    self.cur.cfa = CfaRule::Expression { address, length };
                    stream.skip(
                        i64::try_from(length)
                            .map_err(|_| Error::Invalid("expression length overflows"))?,
                    )?;
                }

                gimli::DW_CFA_undefined => {
                    let reg = read_regnum(&mut stream)?;
                    self.remove_register(reg);
                }
                gimli::DW_CFA_same_value => {
                    let reg = read_regnum(&mut stream)?;
                    self.set_register(reg, RegRule::SameValue);
                }
                gimli::DW_CFA_offset_extended => {
                    let reg = read_regnum(&mut stream)?;
                    let off = factored(stream.read_uleb128()?, cie)?;
                    self.set_register(reg, RegRule::Offset(off));
                }
                gimli::DW_CFA_offset_extended_sf => {
                    let reg = read_regnum(&mut stream)?;
                    let off = factored_s(stream.read_sleb128()?, cie)?;
                    self.set_register(reg, RegRule::Offset(off));
                }
                gimli::DW_CFA_val_offset => {
                    let reg = read_regnum(&mut stream)?;
                    let off = factored(stream.read_uleb128()?, cie)?;
                    self.set_register(reg, RegRule::ValOffset(off));
                }
                gimli::DW_CFA_val_offset_sf => {
                    let reg = read_regnum(&mut stream)?;
                    let off = factored_s(stream.read_sleb128()?, cie)?;
                    self.set_register(reg, RegRule::ValOffset(off));
                }
                gimli::DW_CFA_register => {
                    let reg = read_regnum(&mut stream)?;
                    let src = read_regnum(&mut stream)?;
                    self.set_register(reg, RegRule::Register(src));
                }
                gimli::DW_CFA_expression | gimli::DW_CFA_val_expression => {
                    let reg = read_regnum(&mut stream)?;
                    let length = stream.read_uleb128()?;
                    let address = stream.target_address();
                    let rule = if DwCfa(opcode) == gimli::DW_CFA_expression {
                        RegRule::Expression { address, length }
                    } else {
                        RegRule::ValExpression { address, length }
                    };
                    self.set_register(reg, rule);
                    stream.skip(
                        i64::try_from(length)
                            .map_err(|_| Error::Invalid("expression length overflows"))?,
                    )?;
                }
                gimli::DW_CFA_restore_extended => {
                    let reg = read_regnum(&mut stream)?;
                    match initial_state.rules[reg as usize] {
                        Some(rule) => self.set_register(reg, rule),
                        None => self.remove_register(reg),
                    }
                }

                gimli::DW_CFA_remember_state => {
                    if self.stack.try_push(self.cur).is_err() {
                        return Err(Error::Invalid(
                            "DW_CFA_remember_state exceeded the save stack",
                        ));
                    }
                }
                gimli::DW_CFA_restore_state => {
                    self.cur = self
                        .stack
                        .pop()
                        .ok_or(Error::Invalid("DW_CFA_restore_state on an empty save stack"))?;
                }

                _ => {
                    trace!(opcode, "unsupported call frame opcode");
                    return Err(Error::NotSupported("unsupported call frame opcode"));
                }
            }
        }

        Ok(())
    }

    /// Apply the evaluated rules to `old`, producing the caller's
    /// register state: resolve the CFA first (it becomes the new stack
    /// pointer), then each register rule relative to it, and finally the
    /// instruction pointer via the CIE's return-address register.
    pub fn apply<T: TaskMemory>(
        &self,
        task: &T,
        cie: &CieInfo,
        old: &RegisterState,
    ) -> Result<RegisterState> {
        let arch = old.arch();
        let endian = arch.endian();
        let mut new = old.clone();
        new.clear_volatile();

        let cfa = match self.cur.cfa {
            CfaRule::Undefined => {
                return Err(Error::Invalid("no canonical frame address rule"))
            }
            CfaRule::RegisterOffset { register, offset } => {
                let slot = arch
                    .dwarf_to_slot(register as u64)
                    .ok_or(Error::NotSupported("CFA rule references an unsupported register"))?;
                let base = old
                    .reg(slot)
                    .ok_or(Error::NotFound("CFA register is not available"))?;
                apply_offset(base, offset)?
            }
            CfaRule::Expression { address, length } => {
                let mobj = Mapping::new(task, address, length, true)?;
                expression::eval(&mobj, task, old, endian, address, 0, length, &[])?
            }
        };
        new.set_sp(cfa);

        for regnum in 0..RULE_SLOTS as u16 {
            let Some(rule) = self.cur.rules[regnum as usize] else {
                continue;
            };

            // Some ABIs name the return address with a pseudo-register
            // that has no slot of its own; route it at the instruction
            // pointer.
            let slot = match arch.dwarf_to_slot(regnum as u64) {
                Some(slot) => slot,
                None if cie.return_address_register == regnum as u64 => arch.ip_reg(),
                None => {
                    return Err(Error::Invalid(
                        "register rule references an unsupported register",
                    ))
                }
            };

            self.apply_register(task, endian, old, &mut new, cfa, slot, rule)?;

            // A rule for the return-address register also produces the
            // caller's instruction pointer.
            if cie.return_address_register == regnum as u64 && slot != arch.ip_reg() {
                if let Some(v) = new.reg(slot) {
                    new.set_ip(v);
                }
            }
        }

        // Leaf frames on link-register ABIs: nothing restored the
        // instruction pointer, but the return-address register is still
        // live in the previous state.
        if new.ip().is_none() {
            let slot = arch
                .dwarf_to_slot(cie.return_address_register)
                .ok_or(Error::Invalid("unsupported return address register"))?;
            let v = old
                .reg(slot)
                .ok_or(Error::Invalid("return address register is not available"))?;
            new.set_ip(v);
        }

        Ok(new)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_register<T: TaskMemory>(
        &self,
        task: &T,
        endian: RunTimeEndian,
        old: &RegisterState,
        new: &mut RegisterState,
        cfa: u64,
        slot: u16,
        rule: RegRule,
    ) -> Result<()> {
        let arch = old.arch();
        match rule {
            RegRule::Offset(off) => {
                let addr = apply_offset(cfa, off)?;
                new.set_reg(slot, read_task_u64(task, endian, addr, 0)?);
            }
            RegRule::ValOffset(off) => {
                new.set_reg(slot, apply_offset(cfa, off)?);
            }
            RegRule::Register(src) => {
                let src_slot = arch
                    .dwarf_to_slot(src as u64)
                    .ok_or(Error::Invalid("register rule references an unsupported register"))?;
                let v = old
                    .reg(src_slot)
                    .ok_or(Error::NotFound("source register is not available"))?;
                new.set_reg(slot, v);
            }
            RegRule::Expression { address, length } | RegRule::ValExpression { address, length } => {
                let mobj = Mapping::new(task, address, length, true)?;
                let mut value =
                    expression::eval(&mobj, task, old, endian, address, 0, length, &[cfa])?;
                if matches!(rule, RegRule::Expression { .. }) {
                    value = read_task_u64(task, endian, value, 0)?;
                }
                new.set_reg(slot, value);
            }
            RegRule::SameValue => {
                let v = old
                    .reg(slot)
                    .ok_or(Error::NotFound("same-value register is not available"))?;
                new.set_reg(slot, v);
            }
        }
        Ok(())
    }
}
