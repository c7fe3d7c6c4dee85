use std::time::Duration;
use anyhow::bail;
use crate::endpoint::EndpointId;

pub struct DtpcConfig {
    /// Source endpoint of all bundles the engine sends, both data PDUs and ACKs
    pub local_eid: EndpointId,

    /// If set, topic ids must be defined up front (see `DtpcHandle::add_topic`). Sends,
    ///  registrations and received data items for unknown topics are rejected. Otherwise unknown
    ///  topics are created on the fly.
    pub require_predefined_topics: bool,

    /// If set, data items can only be sent for topics with an active registration
    pub restrict_send_to_registered_client: bool,

    /// Some peers send DTPC bundles from service `ipn_transmit_service_number` but expect them
    ///  (and ACKs) on `ipn_receive_service_number`. These two numbers drive the compensation for
    ///  that asymmetry, and they are only ever applied to `ipn:` endpoints.
    pub ipn_receive_service_number: u64,
    pub ipn_transmit_service_number: u64,

    /// Interval of the periodic sweep that drops expired data items from topic queues
    pub topic_expiration_check_interval: Duration,

    pub event_queue_capacity: usize,
}

impl DtpcConfig {
    pub fn new(local_eid: EndpointId) -> DtpcConfig {
        DtpcConfig {
            local_eid,
            require_predefined_topics: false,
            restrict_send_to_registered_client: false,
            ipn_receive_service_number: 129,
            ipn_transmit_service_number: 128,
            topic_expiration_check_interval: Duration::from_secs(5),
            event_queue_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_eid.is_null() {
            bail!("local endpoint must not be {}", EndpointId::NULL);
        }
        if self.ipn_receive_service_number == self.ipn_transmit_service_number {
            bail!("ipn receive and transmit service numbers must differ");
        }
        if self.topic_expiration_check_interval.is_zero() {
            bail!("topic expiration check interval must be positive");
        }
        if self.event_queue_capacity == 0 {
            bail!("event queue capacity must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::default(|_c: &mut DtpcConfig| {}, true)]
    #[case::null_eid(|c: &mut DtpcConfig| c.local_eid = EndpointId::null(), false)]
    #[case::same_service(|c: &mut DtpcConfig| c.ipn_transmit_service_number = 129, false)]
    #[case::zero_interval(|c: &mut DtpcConfig| c.topic_expiration_check_interval = Duration::ZERO, false)]
    #[case::zero_capacity(|c: &mut DtpcConfig| c.event_queue_capacity = 0, false)]
    fn test_validate(#[case] modifier: fn(&mut DtpcConfig), #[case] expected_ok: bool) {
        let mut config = DtpcConfig::new(EndpointId::ipn(1, 129));
        modifier(&mut config);
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
