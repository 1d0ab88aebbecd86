//! DWARF call-frame-information machinery: CIE/FDE reading, the CFA rule
//! state machine, and the expression stack machine.
//!
//! The interpreters here run against bounds-checked [`Mapping`]s of a
//! possibly hostile task's sections, so every operand read is validated
//! and every walk is bounded by declared-and-verified lengths. Opcode and
//! pointer-encoding constants come from `gimli`.

pub mod cfa;
pub mod expression;
pub mod frame;

use gimli::{DwEhPe, EndianSlice, Reader, RunTimeEndian};

use crate::error::{Error, Result};
use crate::mem::{apply_offset, Mapping};

/// A bounded cursor over an opcode stream inside a mapping.
///
/// Wraps a validated byte range; all reads are position-advancing, and
/// [`Opstream::skip`] repositions relative to the current offset with
/// bounds checking (forward and backward, for `DW_OP_skip`/`DW_OP_bra`).
pub(crate) struct Opstream<'a> {
    base: EndianSlice<'a, RunTimeEndian>,
    cur: EndianSlice<'a, RunTimeEndian>,
    start_address: u64,
}

impl<'a> Opstream<'a> {
    pub fn new(
        mobj: &'a Mapping,
        endian: RunTimeEndian,
        address: u64,
        offset: i64,
        length: u64,
    ) -> Result<Opstream<'a>> {
        let bytes = mobj.remap(address, offset, length)?;
        let slice = EndianSlice::new(bytes, endian);
        Ok(Opstream {
            base: slice,
            cur: slice,
            start_address: apply_offset(address, offset)?,
        })
    }

    /// Offset of the read position from the start of the stream.
    pub fn position(&self) -> u64 {
        (self.base.len() - self.cur.len()) as u64
    }

    /// Task-relative address of the read position.
    pub fn target_address(&self) -> u64 {
        self.start_address + self.position()
    }

    pub fn is_empty(&self) -> bool {
        self.cur.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.cur
            .read_u8()
            .map_err(|_| Error::Invalid("opcode stream ends mid-operand"))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.cur
            .read_u16()
            .map_err(|_| Error::Invalid("opcode stream ends mid-operand"))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.cur
            .read_u32()
            .map_err(|_| Error::Invalid("opcode stream ends mid-operand"))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.cur
            .read_u64()
            .map_err(|_| Error::Invalid("opcode stream ends mid-operand"))
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        self.cur
            .read_uleb128()
            .map_err(|_| Error::Invalid("malformed ULEB128 value"))
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        self.cur
            .read_sleb128()
            .map_err(|_| Error::Invalid("malformed SLEB128 value"))
    }

    /// Reposition by a signed offset relative to the current position.
    pub fn skip(&mut self, rel: i64) -> Result<()> {
        let pos = (self.position() as i64)
            .checked_add(rel)
            .ok_or(Error::Invalid("skip target overflows"))?;
        if pos < 0 || pos as usize > self.base.len() {
            return Err(Error::Invalid("skip target outside the opcode range"));
        }
        self.cur = self.base.range_from(pos as usize..);
        Ok(())
    }
}

/// Decode a GNU eh-frame encoded pointer at the stream's position.
///
/// Only the absolute and pc-relative application modes occur in the
/// unwind sections this crate reads; the other bases (textrel, datarel,
/// funcrel, aligned) and indirection are `NotSupported`, never guessed.
pub(crate) fn read_encoded_pointer(stream: &mut Opstream, encoding: u8) -> Result<u64> {
    if DwEhPe(encoding) == gimli::DW_EH_PE_omit {
        return Err(Error::NotFound("pointer value omitted"));
    }
    if encoding & 0x80 != 0 {
        return Err(Error::NotSupported("indirect pointer encoding"));
    }

    // The pc-relative base is the address of the encoded field itself.
    let base = match DwEhPe(encoding & 0x70) {
        gimli::DW_EH_PE_absptr => 0u64,
        gimli::DW_EH_PE_pcrel => stream.target_address(),
        _ => return Err(Error::NotSupported("unsupported pointer encoding base")),
    };

    let value = match DwEhPe(encoding & 0x0f) {
        gimli::DW_EH_PE_absptr | gimli::DW_EH_PE_udata8 | gimli::DW_EH_PE_sdata8 => {
            stream.read_u64()?
        }
        gimli::DW_EH_PE_uleb128 => stream.read_uleb128()?,
        gimli::DW_EH_PE_udata2 => stream.read_u16()? as u64,
        gimli::DW_EH_PE_udata4 => stream.read_u32()? as u64,
        gimli::DW_EH_PE_sleb128 => stream.read_sleb128()? as u64,
        gimli::DW_EH_PE_sdata2 => stream.read_u16()? as i16 as i64 as u64,
        gimli::DW_EH_PE_sdata4 => stream.read_u32()? as i32 as i64 as u64,
        _ => return Err(Error::NotSupported("unsupported pointer encoding format")),
    };

    Ok(base.wrapping_add(value))
}

/// Parsed common-information-entry data needed to run and apply a CFA
/// program.
#[derive(Clone, Debug)]
pub struct CieInfo {
    /// Task-relative address of the CIE's initial length field; used to
    /// match FDE back-references.
    pub address: u64,
    pub version: u8,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u64,
    pub segment_size: u8,
    /// The CIE carried a GNU `z` augmentation.
    pub has_eh_augmentation: bool,
    /// Pointer encoding for FDE addresses (`R` augmentation), defaulting
    /// to an absolute machine word.
    pub pointer_encoding: u8,
    pub lsda_encoding: Option<u8>,
    /// Task-relative address and length of the CIE's initial CFA
    /// instructions.
    pub initial_instructions: (u64, u64),
}

/// Parse the CIE whose initial length field is at `address`.
pub fn parse_cie(mobj: &Mapping, endian: RunTimeEndian, address: u64) -> Result<CieInfo> {
    let length32 = mobj.read_u32(endian, address, 0)?;
    let (entry_len, len_size, m64) = if length32 == u32::MAX {
        (mobj.read_u64(endian, address, 4)?, 12i64, true)
    } else {
        (length32 as u64, 4i64, false)
    };

    let mut stream = Opstream::new(mobj, endian, address, len_size, entry_len)?;

    // The id distinguishes CIEs from FDEs: 0 in eh_frame, all-ones in
    // debug_frame.
    let id = if m64 {
        stream.read_u64()?
    } else {
        stream.read_u32()? as u64
    };
    let cie_id_64 = if m64 { u64::MAX } else { u32::MAX as u64 };
    if id != 0 && id != cie_id_64 {
        return Err(Error::Invalid("entry is not a CIE"));
    }

    let version = stream.read_u8()?;
    if version != 1 && version != 3 && version != 4 {
        return Err(Error::Invalid("unrecognized CIE version"));
    }

    // Augmentation string. Only the GNU 'z' family (or an empty string)
    // is parsable; an unknown prefix makes the rest of the CIE layout
    // unknowable.
    let mut augmentation = arrayvec::ArrayVec::<u8, 15>::new();
    loop {
        let b = stream.read_u8()?;
        if b == 0 {
            break;
        }
        if augmentation.is_empty() && b != b'z' {
            return Err(Error::NotSupported("unknown augmentation string prefix"));
        }
        augmentation
            .try_push(b)
            .map_err(|_| Error::Invalid("augmentation string is too long"))?;
    }
    let has_eh_augmentation = augmentation.first() == Some(&b'z');

    let mut segment_size = 0u8;
    if version == 4 {
        let address_size = stream.read_u8()?;
        if address_size != 8 {
            return Err(Error::NotSupported("unsupported CIE address size"));
        }
        segment_size = stream.read_u8()?;
    }

    let code_alignment_factor = stream.read_uleb128()?;
    let data_alignment_factor = stream.read_sleb128()?;
    let return_address_register = stream.read_uleb128()?;

    let mut pointer_encoding = gimli::DW_EH_PE_absptr.0;
    let mut lsda_encoding = None;
    if has_eh_augmentation {
        let aug_len = stream.read_uleb128()?;
        let aug_end = stream
            .position()
            .checked_add(aug_len)
            .ok_or(Error::Invalid("augmentation data length overflows"))?;

        'aug: for &flag in augmentation.iter().skip(1) {
            match flag {
                b'L' => lsda_encoding = Some(stream.read_u8()?),
                b'P' => {
                    // Personality routine pointer; decoded only to step
                    // over it.
                    let enc = stream.read_u8()?;
                    read_encoded_pointer(&mut stream, enc)?;
                }
                b'R' => pointer_encoding = stream.read_u8()?,
                b'S' => {} // signal frame marker, no data
                _ => break 'aug,
            }
        }

        // Skip whatever augmentation data we did not interpret.
        let pos = stream.position();
        if pos > aug_end {
            return Err(Error::Invalid("augmentation data overran its length"));
        }
        stream.skip((aug_end - pos) as i64)?;
    }

    let initial_addr = stream.target_address();
    let initial_len = entry_len
        .checked_sub(stream.position())
        .ok_or(Error::Invalid("CIE instructions overrun the entry"))?;

    Ok(CieInfo {
        address,
        version,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        segment_size,
        has_eh_augmentation,
        pointer_encoding,
        lsda_encoding,
        initial_instructions: (initial_addr, initial_len),
    })
}
