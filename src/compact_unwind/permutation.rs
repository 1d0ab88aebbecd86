//! The 10-bit register-list permutation codec used by the frameless
//! compact unwind modes.
//!
//! An ordered list of up to six distinct register numbers drawn from 1–6
//! is packed into a factorial-number-system value: each element is first
//! renumbered to its rank among the values not yet used, then the ranks
//! are mixed into sub-ranges sized by how many choices remain at each
//! position.

use arrayvec::ArrayVec;

use crate::error::{Error, Result};

/// Maximum number of registers the permutation encoding can carry.
pub const PERMUTATION_REGISTER_MAX: usize = 6;

fn factors(count: usize) -> [u32; PERMUTATION_REGISTER_MAX] {
    // factor[i] is the product of the number of choices remaining at each
    // later position; the last position always has factor 1.
    let mut f = [1u32; PERMUTATION_REGISTER_MAX];
    let mut i = count;
    while i > 1 {
        i -= 1;
        f[i - 1] = f[i] * (PERMUTATION_REGISTER_MAX - i) as u32;
    }
    f
}

/// Encode an ordered list of distinct CFE register numbers (1–6) into the
/// 10-bit permutation value. Returns `None` for lists that have no
/// encoding (too long, out-of-range values, repeats).
pub fn encode(registers: &[u32]) -> Option<u32> {
    let count = registers.len();
    if count > PERMUTATION_REGISTER_MAX {
        return None;
    }
    for (i, &r) in registers.iter().enumerate() {
        if !(1..=PERMUTATION_REGISTER_MAX as u32).contains(&r) {
            return None;
        }
        if registers[..i].contains(&r) {
            return None;
        }
    }

    let f = factors(count);
    let mut permutation = 0u32;
    for i in 0..count {
        let countless = registers[..i].iter().filter(|&&r| r < registers[i]).count() as u32;
        let renumbered = registers[i] - countless - 1;
        permutation += renumbered * f[i];
    }
    debug_assert!(permutation & 0x3ff == permutation);
    Some(permutation)
}

/// Decode `count` register numbers out of the 10-bit permutation value.
/// The returned values are CFE register numbers (1–6), in restoration
/// order.
pub fn decode(mut permutation: u32, count: u32) -> Result<ArrayVec<u32, PERMUTATION_REGISTER_MAX>> {
    let count = count as usize;
    if count > PERMUTATION_REGISTER_MAX {
        return Err(Error::Invalid("register count exceeds the permutation limit"));
    }

    let f = factors(count);
    let mut ranks = [0u32; PERMUTATION_REGISTER_MAX];
    for i in 0..count {
        ranks[i] = permutation / f[i];
        permutation -= ranks[i] * f[i];
    }

    // Recompute the actual register values from the position-relative
    // ranks. A rank that exceeds the values still unused means the
    // permutation value itself is out of range for this count.
    let mut used = [false; PERMUTATION_REGISTER_MAX + 1];
    let mut registers = ArrayVec::new();
    for &rank in ranks.iter().take(count) {
        let mut remaining = rank;
        let mut found = None;
        for candidate in 1..=PERMUTATION_REGISTER_MAX as u32 {
            if used[candidate as usize] {
                continue;
            }
            if remaining == 0 {
                found = Some(candidate);
                break;
            }
            remaining -= 1;
        }
        let value = found.ok_or(Error::Invalid("register permutation value out of range"))?;
        used[value as usize] = true;
        registers.push(value);
    }
    Ok(registers)
}
