//! Delay-Tolerant Payload Conditioning: aggregation of small application data items into bundle
//!  payloads on the sending node, and in-order reassembly on the receiving node.
//!
//! Applications send data items for numbered topics to a destination endpoint under a
//!  transmission profile. Items for the same destination and profile are aggregated into one
//!  protocol data unit (PDU), which goes out as a single bundle once the profile's size or time
//!  limit is reached. Profiles with a retransmission limit get sequenced, acknowledged and
//!  retransmitted PDUs, and the receiver delivers their data items in order.
//!
//! ```ascii
//!  sender                                                   receiver
//!  app -> DtpcHandle -> PayloadAggregator --PDU bundle-->   DataPduCollector -> Topic -> app
//!                       (dest, profile)    <--ACK bundle--  (source, profile)
//! ```
//!
//! [daemon::DtpcDaemon::start] is the entry point. The bundle layer is plugged in through
//!  [transport::BundleTransport] and [daemon::DtpcHandle::bundle_received], persistence through
//!  [store::DurableStore].

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod pdu;
pub mod profile;
pub mod retransmit;
pub mod store;
pub mod topic;
pub mod transport;
pub mod util;
pub mod test_util;
