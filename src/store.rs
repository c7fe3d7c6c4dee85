//! Durable state. Every record is the owner's binary serialization followed by a CRC-64
//!  checksum:
//!
//! ```ascii
//! 0: record body (owner specific, varint framed)
//! *: CRC-64 of the body (u64 BE)
//! ```

use std::collections::BTreeMap;
use std::sync::RwLock;
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use crc::Crc;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StoreTable {
    Profiles,
    Topics,
    PayloadAggregators,
    DataPduCollectors,
}

/// Persistent storage for the engine's state, keyed by table and durable key
#[cfg_attr(test, automock)]
pub trait DurableStore: Send + Sync + 'static {
    /// adds or replaces a record
    fn put(&self, table: StoreTable, key: &str, record: Bytes) -> anyhow::Result<()>;

    fn delete(&self, table: StoreTable, key: &str) -> anyhow::Result<()>;

    fn load_all(&self, table: StoreTable) -> anyhow::Result<Vec<(String, Bytes)>>;
}

const CHECKSUM_LEN: usize = std::mem::size_of::<u64>();

fn checksum(body: &[u8]) -> u64 {
    Crc::<u64>::new(&crc::CRC_64_REDIS).checksum(body)
}

pub fn frame_record(ser: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::new();
    ser(&mut buf);
    let crc = checksum(&buf);
    buf.put_u64(crc);
    buf.freeze()
}

/// Verifies the checksum and returns the record body
pub fn unframe_record(record: &Bytes) -> anyhow::Result<Bytes> {
    if record.len() < CHECKSUM_LEN {
        bail!("record too short for checksum: {} bytes", record.len());
    }
    let body_len = record.len() - CHECKSUM_LEN;
    let body = record.slice(..body_len);

    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(&record[body_len..]);
    if u64::from_be_bytes(expected) != checksum(&body) {
        bail!("record checksum mismatch");
    }
    Ok(body)
}

/// An in-process [DurableStore]. State survives daemon restarts as long as the store instance
///  is shared.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<FxHashMap<StoreTable, BTreeMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self, table: StoreTable) -> usize {
        self.tables.read()
            .map(|t| t.get(&table).map(|records| records.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, table: StoreTable, key: &str, record: Bytes) -> anyhow::Result<()> {
        trace!("store: put {:?} {} ({} bytes)", table, key, record.len());
        self.tables.write()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .entry(table)
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    fn delete(&self, table: StoreTable, key: &str) -> anyhow::Result<()> {
        trace!("store: delete {:?} {}", table, key);
        if let Some(records) = self.tables.write()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .get_mut(&table)
        {
            records.remove(key);
        }
        Ok(())
    }

    fn load_all(&self, table: StoreTable) -> anyhow::Result<Vec<(String, Bytes)>> {
        Ok(self.tables.read()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .get(&table)
            .map(|records| records.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
            .unwrap_or_default())
    }
}
