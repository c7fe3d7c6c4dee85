use std::collections::VecDeque;
use bytes::{Buf, BytesMut};
use bytes_varint::VarIntSupportMut;
use crate::pdu::topic_block::TopicBlock;
use crate::topic::DataItem;
use crate::util::buf_ext::{BufExt, BufMutExt};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Enqueued {
    /// the item was added, changing the queued size by this many bytes
    Sized(u64),
    /// the item was added, but its size only counts once the elision function responded
    PendingElision,
}

/// Outgoing data items for one topic within one payload aggregator
#[derive(Debug)]
pub struct TopicAggregator {
    topic_id: u32,
    items: VecDeque<DataItem>,
    size: u64,
    /// NB: only meaningful while an elision response is pending
    pending_size_delta: u64,
}

impl TopicAggregator {
    pub fn new(topic_id: u32) -> TopicAggregator {
        TopicAggregator {
            topic_id,
            items: VecDeque::new(),
            size: 0,
            pending_size_delta: 0,
        }
    }

    pub fn topic_id(&self) -> u32 {
        self.topic_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn enqueue(&mut self, item: DataItem, await_elision: bool) -> Enqueued {
        let item_size = item.size() as u64;
        self.items.push_back(item);

        if await_elision {
            self.pending_size_delta = item_size;
            Enqueued::PendingElision
        }
        else {
            self.size += item_size;
            Enqueued::Sized(item_size)
        }
    }

    pub fn items(&self) -> Vec<DataItem> {
        self.items.iter().cloned().collect()
    }

    /// Applies an elision function's response, returning the signed change of the queued size.
    ///  A modified response replaces the entire queue.
    pub fn apply_elision_response(&mut self, modified: bool, new_items: Vec<DataItem>) -> i64 {
        let delta = if modified {
            let new_size: u64 = new_items.iter()
                .map(|i| i.size() as u64)
                .sum();
            self.items = new_items.into();
            new_size as i64 - self.size as i64
        }
        else {
            self.pending_size_delta as i64
        };

        self.pending_size_delta = 0;
        self.size = self.size.saturating_add_signed(delta);
        delta
    }

    /// Writes this topic's block (if there are queued items) and clears the queue. Returns the
    ///  number of bytes written.
    pub fn load(&mut self, buf: &mut BytesMut) -> usize {
        let len_before = buf.len();
        if !self.items.is_empty() {
            let records = self.items.iter()
                .map(|i| &i.data)
                .collect::<Vec<_>>();
            TopicBlock::ser(self.topic_id, records.into_iter(), buf);
        }
        self.items.clear();
        self.size = 0;
        buf.len() - len_before
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_varint(self.topic_id.into());
        buf.put_len_varint(self.items.len());
        for item in &self.items {
            item.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<TopicAggregator> {
        let mut result = TopicAggregator::new(buf.checked_get_u32_varint()?);
        let num_items = buf.checked_get_usize_varint()?;
        for _ in 0..num_items {
            result.enqueue(DataItem::deser(buf)?, false);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use crate::endpoint::EndpointId;
    use super::*;

    fn item(data: &'static [u8]) -> DataItem {
        DataItem::new(EndpointId::ipn(2, 129), 7, Bytes::from_static(data))
    }

    #[test]
    fn test_enqueue_and_load() {
        let mut agg = TopicAggregator::new(7);
        assert_eq!(agg.enqueue(item(b"abc"), false), Enqueued::Sized(3));
        assert_eq!(agg.enqueue(item(b"de"), false), Enqueued::Sized(2));
        assert_eq!(agg.size(), 5);

        let mut buf = BytesMut::new();
        assert_eq!(agg.load(&mut buf), 9);
        assert_eq!(buf.as_ref(), &[7, 2, 3, b'a', b'b', b'c', 2, b'd', b'e']);
        assert_eq!(agg.size(), 0);
        assert_eq!(agg.item_count(), 0);
    }

    #[test]
    fn test_load_empty_writes_nothing() {
        let mut agg = TopicAggregator::new(7);
        let mut buf = BytesMut::new();
        assert_eq!(agg.load(&mut buf), 0);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::unmodified(false, vec![], 3, 5, 2)]
    #[case::merged(true, vec![&b"xyzxyz"[..]], 4, 6, 1)]
    #[case::dropped_all(true, vec![], -2, 0, 0)]
    fn test_elision_response(#[case] modified: bool, #[case] new_items: Vec<&'static [u8]>, #[case] expected_delta: i64, #[case] expected_size: u64, #[case] expected_count: usize) {
        let mut agg = TopicAggregator::new(7);
        agg.enqueue(item(b"ab"), false);
        assert_eq!(agg.enqueue(item(b"cde"), true), Enqueued::PendingElision);
        assert_eq!(agg.size(), 2);

        let new_items = new_items.into_iter().map(item).collect();
        assert_eq!(agg.apply_elision_response(modified, new_items), expected_delta);
        assert_eq!(agg.size(), expected_size);
        assert_eq!(agg.item_count(), expected_count);
    }

    #[test]
    fn test_ser_deser_recomputes_size() {
        let mut agg = TopicAggregator::new(7);
        agg.enqueue(item(b"ab"), false);
        agg.enqueue(item(b"cde"), true);

        let mut buf = BytesMut::new();
        agg.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let restored = TopicAggregator::deser(&mut b).unwrap();
        assert_eq!(restored.topic_id(), 7);
        assert_eq!(restored.size(), 5);
        assert_eq!(restored.items(), agg.items());
    }
}
