//! Protocol data units: the wire format of aggregated payloads and their acknowledgements.
//!
//! A data PDU is a [header::PduHeader] followed by zero or more [topic_block::TopicBlock]s. An
//!  ACK PDU is a header with the type bit set and nothing after it. All integers on the wire are
//!  [sdnv]s.

pub mod header;
pub mod sdnv;
pub mod topic_block;

use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use crate::endpoint::{AggregationKey, EndpointId};
use crate::pdu::header::{PduHeader, PduType};
use crate::pdu::topic_block::TopicBlock;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::clock::DtnTime;

/// Key of a sequenced PDU, unique per remote endpoint, profile and sequence number
pub fn pdu_key(remote: &EndpointId, profile_id: u32, seq_ctr: u64) -> String {
    format!("{}~{}~{}", remote, profile_id, seq_ctr)
}

/// A PDU on either side of the link. On the send side `remote_eid` is the destination, on the
///  receive side it is the source.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolDataUnit {
    pub remote_eid: EndpointId,
    pub profile_id: u32,
    pub seq_ctr: u64,
    pub creation_ts: DtnTime,
    pub expiration_ts: DtnTime,
    pub retransmit_count: u32,
    /// receive side: the sender expects an ACK for this PDU
    pub app_ack: bool,
    /// the complete payload including the header
    pub payload: Bytes,
    /// offset of the first topic block in `payload`
    pub body_offset: usize,
}

impl ProtocolDataUnit {
    pub fn key(&self) -> String {
        pdu_key(&self.remote_eid, self.profile_id, self.seq_ctr)
    }

    pub fn collector_key(&self) -> AggregationKey {
        AggregationKey::new(self.remote_eid.clone(), self.profile_id)
    }

    /// Some peers send ACKs from their transmit service rather than the receive service we
    ///  addressed the PDU to. For an ACK received from an `ipn` endpoint other than the receive
    ///  service, this is the key the original PDU was registered under.
    pub fn ion_alt_key(&self, ipn_receive_service_number: u64) -> Option<String> {
        let (node, service) = self.remote_eid.ipn_parts()?;
        if service == ipn_receive_service_number {
            return None;
        }
        Some(pdu_key(&EndpointId::ipn(node, ipn_receive_service_number), self.profile_id, self.seq_ctr))
    }

    pub fn topic_blocks(&self) -> anyhow::Result<Vec<TopicBlock>> {
        TopicBlock::deser_all(self.payload.slice(self.body_offset..))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.remote_eid.ser(buf);
        buf.put_u64_varint(self.profile_id.into());
        buf.put_u64_varint(self.seq_ctr);
        buf.put_u64_varint(self.creation_ts);
        buf.put_u64_varint(self.expiration_ts);
        buf.put_u64_varint(self.retransmit_count.into());
        buf.put_bool(self.app_ack);
        buf.put_bytes_with_len(&self.payload);
        buf.put_len_varint(self.body_offset);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ProtocolDataUnit> {
        let pdu = ProtocolDataUnit {
            remote_eid: EndpointId::deser(buf)?,
            profile_id: buf.checked_get_u32_varint()?,
            seq_ctr: buf.checked_get_u64_varint()?,
            creation_ts: buf.checked_get_u64_varint()?,
            expiration_ts: buf.checked_get_u64_varint()?,
            retransmit_count: buf.checked_get_u32_varint()?,
            app_ack: buf.checked_get_bool()?,
            payload: buf.checked_get_bytes()?,
            body_offset: buf.checked_get_usize_varint()?,
        };
        if pdu.body_offset > pdu.payload.len() {
            bail!("body offset {} exceeds payload length {}", pdu.body_offset, pdu.payload.len());
        }
        Ok(pdu)
    }
}

/// A bundle payload that passed validation
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReceivedPdu {
    Data(ProtocolDataUnit),
    Ack(ProtocolDataUnit),
}

impl ReceivedPdu {
    /// Validates a complete bundle payload: header, and then either the absence of anything
    ///  following it (ACK) or a sequence of well-formed topic blocks (data). Any violation
    ///  rejects the whole payload.
    pub fn decode(source: EndpointId, payload: Bytes, creation_ts: DtnTime, expiration_secs: u64) -> anyhow::Result<ReceivedPdu> {
        let mut buf = payload.clone();
        let header = PduHeader::deser(&mut buf)?;
        let body_offset = payload.len() - buf.remaining();

        let pdu = ProtocolDataUnit {
            remote_eid: source,
            profile_id: header.profile_id,
            seq_ctr: header.seq_ctr,
            creation_ts,
            expiration_ts: creation_ts.saturating_add(expiration_secs),
            retransmit_count: 0,
            app_ack: header.seq_ctr > 0,
            payload,
            body_offset,
        };

        match header.pdu_type {
            PduType::Ack => {
                if buf.has_remaining() {
                    bail!("ACK PDU with {} trailing bytes", buf.remaining());
                }
                Ok(ReceivedPdu::Ack(pdu))
            }
            PduType::Data => {
                TopicBlock::deser_all(buf)?;
                Ok(ReceivedPdu::Data(pdu))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::ipn_transmit_service("ipn:4.128", Some("ipn:4.129~9~3"))]
    #[case::ipn_other_service("ipn:4.7", Some("ipn:4.129~9~3"))]
    #[case::ipn_receive_service("ipn:4.129", None)]
    #[case::dtn("dtn://node-b/dtpc", None)]
    fn test_ion_alt_key(#[case] remote: &str, #[case] expected: Option<&str>) {
        let pdu = ProtocolDataUnit {
            remote_eid: EndpointId::new(remote),
            profile_id: 9,
            seq_ctr: 3,
            creation_ts: 0,
            expiration_ts: 0,
            retransmit_count: 0,
            app_ack: false,
            payload: Bytes::new(),
            body_offset: 0,
        };
        assert_eq!(pdu.ion_alt_key(129), expected.map(|s| s.to_string()));
    }

    #[test]
    fn test_decode_data() {
        let payload = Bytes::from_static(&[0x00, 0x05, 0x02, 7, 1, 2, b'h', b'i']);
        let decoded = ReceivedPdu::decode(EndpointId::ipn(2, 129), payload.clone(), 1000, 60).unwrap();

        let ReceivedPdu::Data(pdu) = decoded else { panic!("expected data PDU") };
        assert_eq!(pdu.key(), "ipn:2.129~5~2");
        assert_eq!(pdu.expiration_ts, 1060);
        assert!(pdu.app_ack);
        assert_eq!(pdu.body_offset, 3);
        assert_eq!(pdu.topic_blocks().unwrap(), vec![
            TopicBlock { topic_id: 7, records: vec![Bytes::from_static(b"hi")] },
        ]);
    }

    #[test]
    fn test_decode_unsequenced_data_without_ack() {
        let payload = Bytes::from_static(&[0x00, 0x05, 0x00, 7, 1, 0]);
        let ReceivedPdu::Data(pdu) = ReceivedPdu::decode(EndpointId::ipn(2, 129), payload, 0, 0).unwrap() else { panic!() };
        assert!(!pdu.app_ack);
    }

    #[test]
    fn test_decode_ack() {
        let payload = Bytes::from_static(&[0x01, 0x05, 0x02]);
        let decoded = ReceivedPdu::decode(EndpointId::ipn(2, 128), payload, 0, 0).unwrap();
        assert!(matches!(decoded, ReceivedPdu::Ack(pdu) if pdu.key() == "ipn:2.128~5~2"));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::ack_trailing_bytes(vec![0x01, 0x05, 0x02, 0x00])]
    #[case::bad_version(vec![0x80, 0x05, 0x02])]
    #[case::zero_record_block(vec![0x00, 0x05, 0x02, 7, 0])]
    #[case::truncated_record(vec![0x00, 0x05, 0x02, 7, 1, 3, b'a'])]
    fn test_decode_invalid(#[case] raw: Vec<u8>) {
        assert!(ReceivedPdu::decode(EndpointId::ipn(2, 129), Bytes::from(raw), 0, 0).is_err());
    }

    #[test]
    fn test_durable_ser_deser() {
        let pdu = ProtocolDataUnit {
            remote_eid: EndpointId::new("dtn://node-b/dtpc"),
            profile_id: 3,
            seq_ctr: 12,
            creation_ts: 5000,
            expiration_ts: 5060,
            retransmit_count: 1,
            app_ack: true,
            payload: Bytes::from_static(&[0x00, 0x03, 0x0c, 1, 1, 1, b'x']),
            body_offset: 3,
        };
        let mut buf = BytesMut::new();
        pdu.ser(&mut buf);
        let mut b: &[u8] = &buf;
        assert_eq!(ProtocolDataUnit::deser(&mut b).unwrap(), pdu);
    }
}
