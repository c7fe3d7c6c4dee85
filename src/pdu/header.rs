use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::pdu::sdnv::{put_sdnv, try_get_sdnv, try_get_sdnv_u32};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PduType {
    Data = 0,
    Ack = 1,
}

/// The fields at the start of every PDU, data and ACK alike:
///
/// ```ascii
/// 0: flags: VV RRRRR T    (V: version, R: reserved, T: type - 0 data, 1 ACK)
/// *: profile id (SDNV)
/// *: payload sequence number (SDNV) - 0 for unsequenced PDUs
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PduHeader {
    pub pdu_type: PduType,
    pub profile_id: u32,
    pub seq_ctr: u64,
}

impl PduHeader {
    pub const VERSION: u8 = 0;
    const VERSION_MASK: u8 = 0xc0;
    const VERSION_SHIFT: u8 = 6;
    const TYPE_MASK: u8 = 0x01;

    pub fn data(profile_id: u32, seq_ctr: u64) -> PduHeader {
        PduHeader { pdu_type: PduType::Data, profile_id, seq_ctr }
    }

    pub fn ack(profile_id: u32, seq_ctr: u64) -> PduHeader {
        PduHeader { pdu_type: PduType::Ack, profile_id, seq_ctr }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let pdu_type: u8 = self.pdu_type.into();
        buf.put_u8((Self::VERSION << Self::VERSION_SHIFT) | pdu_type);
        put_sdnv(buf, self.profile_id.into());
        put_sdnv(buf, self.seq_ctr);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PduHeader> {
        if !buf.has_remaining() {
            bail!("zero length payload");
        }
        let flags = buf.get_u8();

        let version = (flags & Self::VERSION_MASK) >> Self::VERSION_SHIFT;
        if version != Self::VERSION {
            bail!("unsupported DTPC version {}", version);
        }
        //NB: reserved bits are not checked
        let pdu_type = if flags & Self::TYPE_MASK == 0 { PduType::Data } else { PduType::Ack };

        let profile_id = try_get_sdnv_u32(buf)
            .map_err(|e| e.context("invalid profile id"))?;
        let seq_ctr = try_get_sdnv(buf)
            .map_err(|e| e.context("invalid payload sequence number"))?;

        Ok(PduHeader { pdu_type, profile_id, seq_ctr })
    }
}
