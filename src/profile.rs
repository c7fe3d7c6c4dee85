use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use crate::endpoint::EndpointId;
use crate::error::{DtpcError, DtpcResult};
use crate::util::buf_ext::{BufExt, BufMutExt};

/// Bundle class of service, in the numbering used by transmission profiles
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum Priority {
    #[default]
    Bulk = 0,
    Normal = 1,
    Expedited = 2,
    Reserved = 3,
}

/// Status reports requested for bundles sent under a profile
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ReportFlags {
    pub reception: bool,
    pub acceptance: bool,
    pub forward: bool,
    pub delivery: bool,
    pub deletion: bool,
}

impl ReportFlags {
    fn to_bits(self) -> u8 {
        (self.reception as u8)
            | (self.acceptance as u8) << 1
            | (self.forward as u8) << 2
            | (self.delivery as u8) << 3
            | (self.deletion as u8) << 4
    }

    fn from_bits(bits: u8) -> ReportFlags {
        ReportFlags {
            reception: bits & 1 != 0,
            acceptance: bits & 2 != 0,
            forward: bits & 4 != 0,
            delivery: bits & 8 != 0,
            deletion: bits & 16 != 0,
        }
    }
}

/// A transmission profile: the transport and QoS parameters for all PDUs sent to one destination
///  under this profile id. Profiles are configuration and never modified by the engine.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Profile {
    pub profile_id: u32,
    pub custody_transfer: bool,
    /// bundle lifetime in seconds
    pub expiration: u64,
    pub reply_to: EndpointId,
    pub priority: Priority,
    pub ecos_ordinal: u8,
    pub report: ReportFlags,
    /// 0 means best effort: PDUs are unsequenced and never acknowledged
    pub retransmission_limit: u32,
    /// bytes
    pub aggregation_size_limit: u64,
    /// seconds
    pub aggregation_time_limit: u64,
}

impl Profile {
    /// A best-effort profile that sends every data item in a PDU of its own
    pub fn new(profile_id: u32, expiration: u64) -> Profile {
        Profile {
            profile_id,
            custody_transfer: false,
            expiration,
            reply_to: EndpointId::null(),
            priority: Priority::Normal,
            ecos_ordinal: 0,
            report: ReportFlags::default(),
            retransmission_limit: 0,
            aggregation_size_limit: 0,
            aggregation_time_limit: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if (self.aggregation_size_limit == 0) != (self.aggregation_time_limit == 0) {
            bail!("aggregation size and time limits must both be zero or both be non-zero (profile {})", self.profile_id);
        }
        if self.retransmission_limit > 0 && self.expiration == 0 {
            bail!("a profile with retransmissions requires a non-zero expiration (profile {})", self.profile_id);
        }
        Ok(())
    }

    /// PDUs are sequenced, acknowledged and retransmitted
    pub fn transport_service(&self) -> bool {
        self.retransmission_limit > 0
    }

    /// Lifetime is split evenly between the first transmission and each retransmission
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_secs(self.expiration) / (self.retransmission_limit + 1)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_varint(self.profile_id.into());
        buf.put_bool(self.custody_transfer);
        buf.put_u64_varint(self.expiration);
        self.reply_to.ser(buf);
        buf.put_u8(self.priority.into());
        buf.put_u8(self.ecos_ordinal);
        buf.put_u8(self.report.to_bits());
        buf.put_u64_varint(self.retransmission_limit.into());
        buf.put_u64_varint(self.aggregation_size_limit);
        buf.put_u64_varint(self.aggregation_time_limit);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Profile> {
        let profile_id = buf.checked_get_u32_varint()?;
        let custody_transfer = buf.checked_get_bool()?;
        let expiration = buf.checked_get_u64_varint()?;
        let reply_to = EndpointId::deser(buf)?;
        let priority = buf.checked_get_u8()?;
        let priority = Priority::try_from(priority)
            .map_err(|_| anyhow!("invalid priority {}", priority))?;
        let ecos_ordinal = buf.checked_get_u8()?;
        let report = ReportFlags::from_bits(buf.checked_get_u8()?);

        Ok(Profile {
            profile_id,
            custody_transfer,
            expiration,
            reply_to,
            priority,
            ecos_ordinal,
            report,
            retransmission_limit: buf.checked_get_u32_varint()?,
            aggregation_size_limit: buf.checked_get_u64_varint()?,
            aggregation_time_limit: buf.checked_get_u64_varint()?,
        })
    }
}

#[derive(Default)]
pub struct ProfileTable {
    profiles: FxHashMap<u32, Arc<Profile>>,
}

impl ProfileTable {
    pub fn add(&mut self, profile: Profile) -> DtpcResult<Arc<Profile>> {
        profile.validate()
            .map_err(|e| DtpcError::InvalidProfile(e.to_string()))?;
        if self.profiles.contains_key(&profile.profile_id) {
            return Err(DtpcError::AlreadyExists(format!("profile {}", profile.profile_id)));
        }
        let profile = Arc::new(profile);
        self.profiles.insert(profile.profile_id, profile.clone());
        Ok(profile)
    }

    pub fn get(&self, profile_id: u32) -> Option<Arc<Profile>> {
        self.profiles.get(&profile_id).cloned()
    }

    pub fn del(&mut self, profile_id: u32) -> DtpcResult<()> {
        self.profiles.remove(&profile_id)
            .map(|_| ())
            .ok_or_else(|| DtpcError::NotFound(format!("profile {}", profile_id)))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
