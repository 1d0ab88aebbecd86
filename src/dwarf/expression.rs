//! The DWARF expression stack machine, limited to what call-frame
//! evaluation requires.

use arrayvec::ArrayVec;
use gimli::{DwOp, Endianity, RunTimeEndian};
use tracing::trace;

use super::Opstream;
use crate::error::{Error, Result};
use crate::mem::{read_task_u64, Mapping, TaskMemory};
use crate::regs::RegisterState;

/// Fixed evaluation stack depth.
pub const EXPRESSION_STACK_DEPTH: usize = 100;

/// Upper bound on executed operations, so that adversarial backward
/// branches terminate instead of spinning.
const MAX_STEPS: u32 = 65536;

fn read_sized<T: TaskMemory>(task: &T, endian: RunTimeEndian, addr: u64, size: u8) -> Result<u64> {
    let mut buf = [0u8; 8];
    let b = &mut buf[..size as usize];
    task.read_bytes(addr, b)?;
    Ok(match size {
        1 => b[0] as u64,
        2 => endian.read_u16(b) as u64,
        4 => endian.read_u32(b) as u64,
        8 => endian.read_u64(b),
        _ => return Err(Error::Invalid("unsupported dereference size")),
    })
}

/// Evaluate the expression bytecode at `address + offset` (length
/// `length`) within `mobj`, with `initial` pre-pushed onto the value
/// stack in order. The result is the value left on top of the stack.
///
/// Memory dereferences go to `task`; register references resolve against
/// `regs`. Unknown opcodes are `NotSupported`; division by zero,
/// out-of-range stack access, and out-of-range branch targets are hard
/// failures.
pub fn eval<T: TaskMemory>(
    mobj: &Mapping,
    task: &T,
    regs: &RegisterState,
    endian: RunTimeEndian,
    address: u64,
    offset: i64,
    length: u64,
    initial: &[u64],
) -> Result<u64> {
    let mut stream = Opstream::new(mobj, endian, address, offset, length)?;
    let mut stack: ArrayVec<u64, EXPRESSION_STACK_DEPTH> = ArrayVec::new();

    macro_rules! push {
        ($v:expr) => {
            if stack.try_push($v).is_err() {
                return Err(Error::Internal("expression stack overflow"));
            }
        };
    }
    macro_rules! pop {
        () => {
            match stack.pop() {
                Some(v) => v,
                None => return Err(Error::Internal("expression stack underflow")),
            }
        };
    }

    let regval = |regnum: u64| -> Result<u64> {
        let slot = regs
            .arch()
            .dwarf_to_slot(regnum)
            .ok_or(Error::NotSupported("expression references an unsupported register"))?;
        regs.reg(slot)
            .ok_or(Error::NotFound("register value unavailable in the current frame"))
    };

    for v in initial {
        push!(*v);
    }

    let mut steps = 0u32;
    while !stream.is_empty() {
        steps += 1;
        if steps > MAX_STEPS {
            return Err(Error::Invalid("expression exceeded its evaluation budget"));
        }

        let opcode = stream.read_u8()?;
        match opcode {
            // DW_OP_lit0 ..= DW_OP_lit31
            0x30..=0x4f => push!((opcode - 0x30) as u64),

            // DW_OP_breg0 ..= DW_OP_breg31
            0x70..=0x8f => {
                let base = regval((opcode - 0x70) as u64)?;
                let off = stream.read_sleb128()?;
                push!(base.wrapping_add(off as u64));
            }

            _ => match DwOp(opcode) {
                gimli::DW_OP_const1u => push!(stream.read_u8()? as u64),
                gimli::DW_OP_const1s => push!(stream.read_u8()? as i8 as i64 as u64),
                gimli::DW_OP_const2u => push!(stream.read_u16()? as u64),
                gimli::DW_OP_const2s => push!(stream.read_u16()? as i16 as i64 as u64),
                gimli::DW_OP_const4u => push!(stream.read_u32()? as u64),
                gimli::DW_OP_const4s => push!(stream.read_u32()? as i32 as i64 as u64),
                gimli::DW_OP_const8u | gimli::DW_OP_const8s => push!(stream.read_u64()?),
                gimli::DW_OP_constu => push!(stream.read_uleb128()?),
                gimli::DW_OP_consts => push!(stream.read_sleb128()? as u64),

                gimli::DW_OP_bregx => {
                    let regnum = stream.read_uleb128()?;
                    let off = stream.read_sleb128()?;
                    push!(regval(regnum)?.wrapping_add(off as u64));
                }

                gimli::DW_OP_dup => {
                    let top = *stack
                        .last()
                        .ok_or(Error::Invalid("DW_OP_dup on an empty stack"))?;
                    push!(top);
                }
                gimli::DW_OP_drop => {
                    stack
                        .pop()
                        .ok_or(Error::Invalid("DW_OP_drop on an empty stack"))?;
                }
                gimli::DW_OP_pick => {
                    let n = stream.read_u8()? as usize;
                    let idx = stack
                        .len()
                        .checked_sub(1 + n)
                        .ok_or(Error::Invalid("DW_OP_pick index out of range"))?;
                    let v = stack[idx];
                    push!(v);
                }
                gimli::DW_OP_over => {
                    let idx = stack
                        .len()
                        .checked_sub(2)
                        .ok_or(Error::Invalid("DW_OP_over on a stack with too few entries"))?;
                    let v = stack[idx];
                    push!(v);
                }
                gimli::DW_OP_swap => {
                    let len = stack.len();
                    if len < 2 {
                        return Err(Error::Invalid("DW_OP_swap on a stack with too few entries"));
                    }
                    stack.swap(len - 1, len - 2);
                }
                gimli::DW_OP_rot => {
                    let len = stack.len();
                    if len < 3 {
                        return Err(Error::Invalid("DW_OP_rot on a stack with too few entries"));
                    }
                    stack[len - 3..].rotate_right(1);
                }

                gimli::DW_OP_deref | gimli::DW_OP_xderef => {
                    if DwOp(opcode) == gimli::DW_OP_xderef {
                        // The address-space operand below the address is
                        // meaningless on single-address-space targets.
                        let len = stack.len();
                        if len < 2 {
                            return Err(Error::Invalid(
                                "DW_OP_xderef on a stack with too few entries",
                            ));
                        }
                        stack.remove(len - 2);
                    }
                    let addr = pop!();
                    push!(read_task_u64(task, endian, addr, 0)?);
                }
                gimli::DW_OP_deref_size | gimli::DW_OP_xderef_size => {
                    if DwOp(opcode) == gimli::DW_OP_xderef_size {
                        let len = stack.len();
                        if len < 2 {
                            return Err(Error::Invalid(
                                "DW_OP_xderef_size on a stack with too few entries",
                            ));
                        }
                        stack.remove(len - 2);
                    }
                    let size = stream.read_u8()?;
                    if !matches!(size, 1 | 2 | 4 | 8) {
                        return Err(Error::Invalid("unsupported dereference size"));
                    }
                    let addr = pop!();
                    push!(read_sized(task, endian, addr, size)?);
                }

                gimli::DW_OP_abs => {
                    let v = pop!() as i64;
                    push!(v.unsigned_abs());
                }
                gimli::DW_OP_and => {
                    let (a, b) = (pop!(), pop!());
                    push!(a & b);
                }
                gimli::DW_OP_div => {
                    let divisor = pop!() as i64;
                    let dividend = pop!() as i64;
                    if divisor == 0 {
                        return Err(Error::Invalid("DW_OP_div divides by zero"));
                    }
                    push!(dividend.wrapping_div(divisor) as u64);
                }
                gimli::DW_OP_minus => {
                    let subtrahend = pop!();
                    let minuend = pop!();
                    push!(minuend.wrapping_sub(subtrahend));
                }
                gimli::DW_OP_mod => {
                    let divisor = pop!();
                    let dividend = pop!();
                    if divisor == 0 {
                        return Err(Error::Invalid("DW_OP_mod divides by zero"));
                    }
                    push!(dividend % divisor);
                }
                gimli::DW_OP_mul => {
                    let (a, b) = (pop!(), pop!());
                    push!(a.wrapping_mul(b));
                }
                gimli::DW_OP_neg => {
                    let v = pop!() as i64;
                    push!(v.wrapping_neg() as u64);
                }
                gimli::DW_OP_not => {
                    let v = pop!();
                    push!(!v);
                }
                gimli::DW_OP_or => {
                    let (a, b) = (pop!(), pop!());
                    push!(a | b);
                }
                gimli::DW_OP_plus => {
                    let (a, b) = (pop!(), pop!());
                    push!(a.wrapping_add(b));
                }
                gimli::DW_OP_plus_uconst => {
                    let c = stream.read_uleb128()?;
                    let v = pop!();
                    push!(v.wrapping_add(c));
                }
                gimli::DW_OP_xor => {
                    let (a, b) = (pop!(), pop!());
                    push!(a ^ b);
                }

                gimli::DW_OP_shl => {
                    let shift = pop!();
                    let v = pop!();
                    push!(if shift >= 64 { 0 } else { v << shift });
                }
                gimli::DW_OP_shr => {
                    let shift = pop!();
                    let v = pop!();
                    push!(if shift >= 64 { 0 } else { v >> shift });
                }
                gimli::DW_OP_shra => {
                    let shift = pop!();
                    let v = pop!() as i64;
                    push!(if shift >= 64 {
                        if v < 0 {
                            u64::MAX
                        } else {
                            0
                        }
                    } else {
                        (v >> shift) as u64
                    });
                }

                gimli::DW_OP_le => {
                    let (v1, v2) = (pop!(), pop!());
                    push!((v2 <= v1) as u64);
                }
                gimli::DW_OP_ge => {
                    let (v1, v2) = (pop!(), pop!());
                    push!((v2 >= v1) as u64);
                }
                gimli::DW_OP_eq => {
                    let (v1, v2) = (pop!(), pop!());
                    push!((v2 == v1) as u64);
                }
                gimli::DW_OP_lt => {
                    let (v1, v2) = (pop!(), pop!());
                    push!((v2 < v1) as u64);
                }
                gimli::DW_OP_gt => {
                    let (v1, v2) = (pop!(), pop!());
                    push!((v2 > v1) as u64);
                }
                gimli::DW_OP_ne => {
                    let (v1, v2) = (pop!(), pop!());
                    push!((v2 != v1) as u64);
                }

                gimli::DW_OP_skip => {
                    let off = stream.read_u16()? as i16;
                    stream.skip(off as i64)?;
                }
                gimli::DW_OP_bra => {
                    let off = stream.read_u16()? as i16;
                    let cond = pop!();
                    if cond != 0 {
                        stream.skip(off as i64)?;
                    }
                }

                gimli::DW_OP_nop => {}

                // Not meaningful in call-frame expressions: there is no
                // compilation-unit context, object, or (non-circular) CFA
                // to reference.
                gimli::DW_OP_fbreg
                | gimli::DW_OP_call2
                | gimli::DW_OP_call4
                | gimli::DW_OP_call_ref
                | gimli::DW_OP_push_object_address
                | gimli::DW_OP_form_tls_address
                | gimli::DW_OP_call_frame_cfa => {
                    return Err(Error::NotSupported(
                        "opcode is not meaningful in call frame expressions",
                    ))
                }

                _ => {
                    trace!(opcode, "unsupported DWARF expression opcode");
                    return Err(Error::NotSupported("unsupported DWARF expression opcode"));
                }
            },
        }
    }

    stack
        .pop()
        .ok_or(Error::Invalid("expression produced no result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{x86_64, Arch};
    use crate::mem::SliceMemory;
    use crate::testutil::sleb;

    fn run(bytecode: &[u8], regs: &RegisterState, initial: &[u64]) -> Result<u64> {
        let task = SliceMemory::new(0x1_0000, bytecode);
        let mobj = Mapping::new(&task, 0x1_0000, bytecode.len() as u64, true).unwrap();
        eval(
            &mobj,
            &task,
            regs,
            RunTimeEndian::Little,
            0x1_0000,
            0,
            bytecode.len() as u64,
            initial,
        )
    }

    fn x86_regs() -> RegisterState {
        RegisterState::with_frame(Arch::X86_64, 0x100, 0x8000, 0x9000)
    }

    #[test]
    fn literals_and_arithmetic() {
        // lit5 lit3 plus => 8
        assert_eq!(run(&[0x35, 0x33, 0x22], &x86_regs(), &[]).unwrap(), 8);
        // const2u 0x1000, lit8, minus => 0xff8
        assert_eq!(
            run(&[0x0a, 0x00, 0x10, 0x38, 0x1c], &x86_regs(), &[]).unwrap(),
            0xff8
        );
        // const1s -1 => sign extended
        assert_eq!(run(&[0x09, 0xff], &x86_regs(), &[]).unwrap(), u64::MAX);
    }

    #[test]
    fn register_relative_pushes() {
        // breg7 (rsp) + 0x10
        let mut code = vec![0x70 + x86_64::RSP as u8];
        code.extend_from_slice(&sleb(0x10));
        assert_eq!(run(&code, &x86_regs(), &[]).unwrap(), 0x8010);

        // bregx rbp - 8
        let mut code = vec![0x92];
        code.extend_from_slice(&[x86_64::RBP as u8]);
        code.extend_from_slice(&sleb(-8));
        assert_eq!(run(&code, &x86_regs(), &[]).unwrap(), 0x8ff8);
    }

    #[test]
    fn unavailable_register_is_reported() {
        let mut code = vec![0x70]; // breg0 = rax, not populated
        code.extend_from_slice(&sleb(0));
        assert!(run(&code, &x86_regs(), &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn stack_manipulation() {
        // lit1 lit2 lit3 rot: top 3 (1,2,3 with 3 on top) -> top=2
        assert_eq!(
            run(&[0x31, 0x32, 0x33, 0x17], &x86_regs(), &[]).unwrap(),
            2
        );
        // lit7 dup plus => 14
        assert_eq!(run(&[0x37, 0x12, 0x22], &x86_regs(), &[]).unwrap(), 14);
        // lit1 lit2 swap => 1 on top
        assert_eq!(run(&[0x31, 0x32, 0x16], &x86_regs(), &[]).unwrap(), 1);
        // lit9 lit0 pick(1) => 9
        assert_eq!(
            run(&[0x39, 0x30, 0x15, 0x01], &x86_regs(), &[]).unwrap(),
            9
        );
        // pick out of range
        assert!(matches!(
            run(&[0x31, 0x15, 0x07], &x86_regs(), &[]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn dereference_reads_task_memory() {
        // The bytecode doubles as the readable task memory region; read
        // the first 8 bytes of it.
        let mut code = Vec::new();
        code.extend_from_slice(&[0x10]); // constu
        code.extend_from_slice(&crate::testutil::uleb(0x1_0000));
        code.push(0x06); // deref
        // Pad so the deref'd bytes are deterministic.
        while code.len() < 8 {
            code.push(0x96); // nop
        }
        let expected = u64::from_le_bytes(code[..8].try_into().unwrap());
        assert_eq!(run(&code, &x86_regs(), &[]).unwrap(), expected);
    }

    #[test]
    fn division_by_zero_fails() {
        // lit4 lit0 div
        assert!(matches!(
            run(&[0x34, 0x30, 0x1b], &x86_regs(), &[]),
            Err(Error::Invalid(_))
        ));
        // lit4 lit0 mod
        assert!(matches!(
            run(&[0x34, 0x30, 0x1d], &x86_regs(), &[]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn conditional_branch() {
        // lit1 bra +1 (skip the lit2's opcode? no: skip 1 byte => skips
        // lit0), then lit3. Stack: [3].
        let code = [0x31, 0x28, 0x01, 0x00, 0x30, 0x33];
        assert_eq!(run(&code, &x86_regs(), &[]).unwrap(), 3);
        // lit0 bra (not taken) lit0 lit3 => 3 on top.
        let code = [0x30, 0x28, 0x01, 0x00, 0x30, 0x33];
        assert_eq!(run(&code, &x86_regs(), &[]).unwrap(), 3);
        // Branch target outside the stream is a hard failure.
        let code = [0x31, 0x28, 0x40, 0x00];
        assert!(matches!(run(&code, &x86_regs(), &[]), Err(Error::Invalid(_))));
    }

    #[test]
    fn backward_branch_loops_are_bounded() {
        // skip -3: jumps back onto itself forever.
        let code = [0x2f, 0xfd, 0xff];
        assert!(matches!(run(&code, &x86_regs(), &[]), Err(Error::Invalid(_))));
    }

    #[test]
    fn unknown_opcode_is_not_supported() {
        assert!(matches!(
            run(&[0x30, 0xe0], &x86_regs(), &[]),
            Err(Error::NotSupported(_))
        ));
        // DW_OP_call_frame_cfa is recognized but meaningless here.
        assert!(matches!(
            run(&[0x9c], &x86_regs(), &[]),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn initial_stack_is_used() {
        // plus_uconst 6 over the initial value.
        let mut code = vec![0x23];
        code.extend_from_slice(&crate::testutil::uleb(6));
        assert_eq!(run(&code, &x86_regs(), &[0x100]).unwrap(), 0x106);
    }

    #[test]
    fn empty_expression_has_no_result() {
        assert!(matches!(
            run(&[], &x86_regs(), &[]),
            Err(Error::Invalid("expression produced no result"))
        ));
    }
}
