//! Self-delimiting numeric values (RFC 6256): big-endian groups of 7 bits, every byte except the
//!  last having its high bit set.
//!
//! ```ascii
//! 0      -> 00
//! 127    -> 7f
//! 128    -> 81 00
//! 0x4234 -> 81 84 34
//! ```

use anyhow::bail;
use bytes::{Buf, BufMut};

const CONTINUATION: u8 = 0x80;
const GROUP_MASK: u8 = 0x7f;

pub fn encoded_len(value: u64) -> usize {
    let significant_bits = 64 - value.leading_zeros() as usize;
    significant_bits.div_ceil(7).max(1)
}

pub fn put_sdnv(buf: &mut impl BufMut, value: u64) {
    let len = encoded_len(value);
    for group in (0..len).rev() {
        let bits = ((value >> (7 * group)) as u8) & GROUP_MASK;
        if group == 0 {
            buf.put_u8(bits);
        }
        else {
            buf.put_u8(bits | CONTINUATION);
        }
    }
}

pub fn try_get_sdnv(buf: &mut impl Buf) -> anyhow::Result<u64> {
    let mut value: u64 = 0;
    loop {
        if !buf.has_remaining() {
            bail!("truncated SDNV");
        }
        if value > (u64::MAX >> 7) {
            bail!("SDNV exceeds 64 bits");
        }

        let b = buf.get_u8();
        value = (value << 7) | (b & GROUP_MASK) as u64;
        if b & CONTINUATION == 0 {
            return Ok(value);
        }
    }
}

pub fn try_get_sdnv_u32(buf: &mut impl Buf) -> anyhow::Result<u32> {
    let value = try_get_sdnv(buf)?;
    match u32::try_from(value) {
        Ok(v) => Ok(v),
        Err(_) => bail!("SDNV value {} exceeds 32 bits", value),
    }
}
