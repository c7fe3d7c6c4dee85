use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntResult, VarIntSupport, VarIntSupportMut};

macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow");
            }
            Ok(self.$getter())
        }
    }
}

/// Read helpers for the durable record format. Wire-level PDU fields use SDNV instead, see
///  [crate::pdu::sdnv].
pub trait BufExt: Buf + VarIntSupport {
    fn checked_get_u64_varint(&mut self) -> anyhow::Result<u64> {
        self.get_u64_varint().a()
    }
    fn checked_get_u32_varint(&mut self) -> anyhow::Result<u32> {
        Ok(u32::try_from(self.get_u64_varint().a()?)?)
    }
    fn checked_get_usize_varint(&mut self) -> anyhow::Result<usize> {
        Ok(usize::try_from(self.get_u64_varint().a()?)?)
    }

    checked_get_impl!(checked_get_u8, u8, get_u8);

    fn checked_get_bool(&mut self) -> anyhow::Result<bool> {
        match self.checked_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(anyhow!("invalid boolean marker {}", other)),
        }
    }

    fn checked_get_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.checked_get_usize_varint()?;
        if self.remaining() < len {
            bail!("declared length {} exceeds remaining {} bytes", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn checked_get_string(&mut self) -> anyhow::Result<String> {
        let raw = self.checked_get_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

pub trait BufMutExt: BufMut + VarIntSupportMut {
    fn put_len_varint(&mut self, v: usize) {
        self.put_u64_varint(v as u64);
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(if v { 1 } else { 0 });
    }

    fn put_bytes_with_len(&mut self, b: &[u8]) {
        self.put_len_varint(b.len());
        self.put_slice(b);
    }

    fn put_string(&mut self, s: &str) {
        self.put_bytes_with_len(s.as_bytes());
    }
}

trait VarIntErrorAdapter<T> {
    fn a(self) -> anyhow::Result<T>;
}
impl <T> VarIntErrorAdapter<T> for VarIntResult<T> {
    fn a(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow!("VarInt error: {:?}", e))
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
