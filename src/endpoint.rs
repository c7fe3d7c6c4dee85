use std::fmt::{Debug, Display, Formatter};
use bytes::{Buf, BytesMut};
use crate::util::buf_ext::{BufExt, BufMutExt};

/// Name of a bundle endpoint, e.g. `dtn://node-a/app` or `ipn:17.129`.
///
/// The engine treats endpoint names as opaque apart from the `ipn` scheme's node / service
///  numbers, which matter for ACK addressing.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointId(String);

impl EndpointId {
    pub const NULL: &'static str = "dtn:none";

    pub fn new(s: impl Into<String>) -> EndpointId {
        EndpointId(s.into())
    }

    pub fn ipn(node: u64, service: u64) -> EndpointId {
        EndpointId(format!("ipn:{}.{}", node, service))
    }

    pub fn null() -> EndpointId {
        EndpointId(Self::NULL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL
    }

    /// `(node, service)` for well-formed `ipn:` endpoints, `None` for everything else
    pub fn ipn_parts(&self) -> Option<(u64, u64)> {
        let ssp = self.0.strip_prefix("ipn:")?;
        let (node, service) = ssp.split_once('.')?;
        Some((node.parse().ok()?, service.parse().ok()?))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_string(&self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<EndpointId> {
        Ok(EndpointId(buf.checked_get_string()?))
    }
}

impl Debug for EndpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        EndpointId::new(value)
    }
}

/// `(remote endpoint, profile id)` - identifies one payload aggregator on the send side and one
///  data PDU collector on the receive side.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AggregationKey {
    pub remote: EndpointId,
    pub profile_id: u32,
}

impl AggregationKey {
    pub fn new(remote: EndpointId, profile_id: u32) -> AggregationKey {
        AggregationKey { remote, profile_id }
    }

    /// The key under which state for this aggregation key is persisted
    pub fn durable_key(&self) -> String {
        self.to_string()
    }
}

impl Display for AggregationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}~{}", self.remote, self.profile_id)
    }
}
