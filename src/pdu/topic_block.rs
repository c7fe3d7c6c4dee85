use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use crate::pdu::sdnv::{encoded_len, put_sdnv, try_get_sdnv, try_get_sdnv_u32};

/// One topic's share of a data PDU.
///
/// ```ascii
/// *: topic id (SDNV)
/// *: record count (SDNV) - never 0
/// per record:
///   *: record length (SDNV)
///   *: record bytes
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicBlock {
    pub topic_id: u32,
    pub records: Vec<Bytes>,
}

impl TopicBlock {
    /// Writes a block for `records`, which must not be empty
    pub fn ser<'a>(topic_id: u32, records: impl ExactSizeIterator<Item = &'a Bytes>, buf: &mut BytesMut) {
        debug_assert!(records.len() > 0);

        put_sdnv(buf, topic_id.into());
        put_sdnv(buf, records.len() as u64);
        for record in records {
            put_sdnv(buf, record.len() as u64);
            buf.extend_from_slice(record);
        }
    }

    pub fn serialized_len(topic_id: u32, records: &[Bytes]) -> usize {
        encoded_len(topic_id.into())
            + encoded_len(records.len() as u64)
            + records.iter()
                .map(|r| encoded_len(r.len() as u64) + r.len())
                .sum::<usize>()
    }

    pub fn deser(buf: &mut Bytes) -> anyhow::Result<TopicBlock> {
        let topic_id = try_get_sdnv_u32(buf)
            .map_err(|e| e.context("invalid topic id"))?;
        let record_count = try_get_sdnv(buf)
            .map_err(|e| e.context("invalid record count"))?;
        if record_count == 0 {
            bail!("topic block {} has a record count of zero", topic_id);
        }

        // every record needs at least its length byte, so this bounds the allocation
        if record_count > buf.remaining() as u64 {
            bail!("topic block {} declares {} records with only {} bytes remaining", topic_id, record_count, buf.remaining());
        }

        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            let len = try_get_sdnv(buf)
                .map_err(|e| e.context("invalid record length"))?;
            if len > buf.remaining() as u64 {
                bail!("record length {} exceeds remaining {} bytes in topic block {}", len, buf.remaining(), topic_id);
            }
            records.push(buf.split_to(len as usize));
        }

        Ok(TopicBlock { topic_id, records })
    }

    /// Decodes all blocks until the buffer is exhausted. A single malformed block invalidates
    ///  the whole sequence.
    pub fn deser_all(mut buf: Bytes) -> anyhow::Result<Vec<TopicBlock>> {
        let mut result = Vec::new();
        while buf.has_remaining() {
            result.push(Self::deser(&mut buf)?);
        }
        Ok(result)
    }
}
