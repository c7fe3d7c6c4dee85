//! Bookkeeping for sequenced PDUs that were sent and not yet acknowledged. Each entry owns a
//!  timer; when it fires, the PDU is handed back to its payload aggregator which decides whether
//!  to resend it or give up (see [decide_retransmit]).

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};
use crate::daemon::DaemonEvent;
use crate::pdu::ProtocolDataUnit;
use crate::profile::Profile;
use crate::util::clock::DtnTime;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetransmitDecision {
    Resend { expiration_remaining: u64 },
    GiveUp(&'static str),
}

/// A PDU is resent with its remaining lifetime as the bundle's expiration. It is abandoned once
///  the retransmission limit is reached, or when it would expire before the next retransmit
///  interval passes.
pub fn decide_retransmit(pdu: &ProtocolDataUnit, profile: &Profile, now: DtnTime) -> RetransmitDecision {
    if pdu.retransmit_count >= profile.retransmission_limit {
        return RetransmitDecision::GiveUp("retransmission limit reached");
    }

    let expiration_remaining = pdu.expiration_ts.saturating_sub(now);
    if expiration_remaining == 0 {
        return RetransmitDecision::GiveUp("expired");
    }
    if expiration_remaining < profile.retransmit_interval().as_secs() {
        return RetransmitDecision::GiveUp("expires before the next retransmission");
    }
    RetransmitDecision::Resend { expiration_remaining }
}

struct UnackedPdu {
    pdu: ProtocolDataUnit,
    timer: JoinHandle<()>,
}

/// Sent sequenced PDUs awaiting acknowledgement, by their PDU key
pub struct UnackedPduTable {
    entries: FxHashMap<String, UnackedPdu>,
    daemon_events: mpsc::UnboundedSender<DaemonEvent>,
}

impl UnackedPduTable {
    pub fn new(daemon_events: mpsc::UnboundedSender<DaemonEvent>) -> UnackedPduTable {
        UnackedPduTable {
            entries: FxHashMap::default(),
            daemon_events,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Registers a PDU that was just sent or resent, (re-)arming its retransmit timer
    pub fn on_transmitted(&mut self, pdu: ProtocolDataUnit, profile: &Profile) {
        let key = pdu.key();
        let previous = self.entries.remove(&key);
        if let Some(previous) = &previous {
            previous.timer.abort();
        }
        else if pdu.retransmit_count > 0 {
            // acknowledged while the retransmission was in flight
            debug!("PDU {} was acknowledged during retransmission - not tracking it again", key);
            return;
        }

        let retransmit_count = pdu.retransmit_count;
        let interval = profile.retransmit_interval();
        let events = self.daemon_events.clone();
        let timer_key = key.clone();
        trace!("arming retransmit timer for PDU {} in {:?}", key, interval);
        let timer = tokio::spawn(async move {
            time::sleep(interval).await;
            let _ = events.send(DaemonEvent::RetransmitTimerExpired { key: timer_key, retransmit_count });
        });

        self.entries.insert(key, UnackedPdu { pdu, timer });
    }

    /// Returns the PDU for a retransmit timer event. It stays in the table until it is
    ///  acknowledged or abandoned. Timer events that were overtaken by an acknowledgement or a
    ///  later retransmission are ignored.
    pub fn pdu_for_retransmit(&self, key: &str, retransmit_count: u32) -> Option<ProtocolDataUnit> {
        match self.entries.get(key) {
            Some(entry) if entry.pdu.retransmit_count == retransmit_count => Some(entry.pdu.clone()),
            Some(_) => {
                trace!("stale retransmit timer for PDU {} - ignoring", key);
                None
            }
            None => None,
        }
    }

    /// Handles an acknowledgement, also trying the alternative key under which some peers
    ///  acknowledge. Returns `true` if a PDU was acknowledged.
    pub fn on_ack(&mut self, key: &str, alt_key: Option<&str>) -> bool {
        let found = self.remove(key)
            || alt_key.map(|k| self.remove(k)).unwrap_or(false);
        if !found {
            debug!("ACK for unknown PDU {} - ignoring", key);
        }
        found
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }
}

impl Drop for UnackedPduTable {
    fn drop(&mut self) {
        self.abort_all();
    }
}
