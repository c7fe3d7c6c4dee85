use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use crate::endpoint::EndpointId;
use crate::profile::{Priority, Profile, ReportFlags};
use crate::util::clock::DtnTime;

/// A bundle handed to the bundle layer for delivery
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutboundBundle {
    pub source: EndpointId,
    pub dest: EndpointId,
    pub reply_to: EndpointId,
    pub priority: Priority,
    pub ecos_ordinal: u8,
    pub custody_requested: bool,
    pub report: ReportFlags,
    pub creation_ts: DtnTime,
    pub expiration_secs: u64,
    pub payload: Bytes,
}

impl OutboundBundle {
    /// A bundle with all delivery options taken from a transmission profile, and the profile's
    ///  full expiration
    pub fn for_profile(profile: &Profile, source: EndpointId, dest: EndpointId, creation_ts: DtnTime, payload: Bytes) -> OutboundBundle {
        OutboundBundle {
            source,
            dest,
            reply_to: profile.reply_to.clone(),
            priority: profile.priority,
            ecos_ordinal: profile.ecos_ordinal,
            custody_requested: profile.custody_transfer,
            report: profile.report,
            creation_ts,
            expiration_secs: profile.expiration,
            payload,
        }
    }

    /// An ACK goes back with default delivery options: there is no profile for the reverse
    ///  direction
    pub fn ack(source: EndpointId, dest: EndpointId, creation_ts: DtnTime, expiration_secs: u64, payload: Bytes) -> OutboundBundle {
        OutboundBundle {
            source,
            dest,
            reply_to: EndpointId::null(),
            priority: Priority::Normal,
            ecos_ordinal: 0,
            custody_requested: false,
            report: ReportFlags::default(),
            creation_ts,
            expiration_secs,
            payload,
        }
    }
}

/// A bundle the bundle layer received for the DTPC service
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedBundle {
    pub source: EndpointId,
    pub creation_ts: DtnTime,
    pub expiration_secs: u64,
    pub payload: Bytes,
}

/// The bundle layer's send side. Delivery is fire-and-forget once a bundle is accepted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleTransport: Send + Sync + 'static {
    async fn submit_for_delivery(&self, bundle: OutboundBundle) -> anyhow::Result<()>;
}
