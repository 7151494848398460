//! Domain payload types carried over the filtering protocol.
//!
//! These are plain data: scalars, strings, optionals, and sequences encoded
//! through the wire codec in a fixed field order that both ends of the
//! connection rely on.

use serde::{Deserialize, Serialize};

use crate::codec::{Decode, Decoder, Encode, Encoder, Plain};
use crate::error::DecodeError;

/// Verdict attached to a rule or an access-check reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Permission {
    Allow = 0,
    Deny = 1,
}

impl Permission {
    pub fn from_raw(value: i32) -> Option<Permission> {
        match value {
            0 => Some(Permission::Allow),
            1 => Some(Permission::Deny),
            _ => None,
        }
    }
}

impl Encode for Permission {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_i32(*self as i32);
    }
}

impl Decode for Permission {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Permission::from_raw(decoder.decode_i32()?).ok_or(DecodeError::InvalidValue("permission"))
    }
}

/// Global behavior of the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum FilterMode {
    /// Allow everything.
    AllAllow = 0,
    /// Deny everything.
    AllDeny = 1,
    /// Allow applications without a rule.
    UnknownAllow = 2,
    /// Deny applications without a rule.
    UnknownDeny = 3,
    /// Hold traffic from applications without a rule and ask.
    Wait = 4,
}

impl FilterMode {
    pub fn from_raw(value: i32) -> Option<FilterMode> {
        match value {
            0 => Some(FilterMode::AllAllow),
            1 => Some(FilterMode::AllDeny),
            2 => Some(FilterMode::UnknownAllow),
            3 => Some(FilterMode::UnknownDeny),
            4 => Some(FilterMode::Wait),
            _ => None,
        }
    }

    /// The permission a freshly created rule inherits under this mode.
    pub fn default_permission(self) -> Permission {
        match self {
            FilterMode::AllAllow | FilterMode::UnknownAllow | FilterMode::Wait => {
                Permission::Allow
            }
            FilterMode::AllDeny | FilterMode::UnknownDeny => Permission::Deny,
        }
    }
}

impl Encode for FilterMode {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_i32(*self as i32);
    }
}

impl Decode for FilterMode {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        FilterMode::from_raw(decoder.decode_i32()?).ok_or(DecodeError::InvalidValue("filter mode"))
    }
}

/// An application identified by its executable path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Application {
    pub path: String,
}

impl Application {
    pub fn new(path: impl Into<String>) -> Application {
        Application { path: path.into() }
    }
}

impl Encode for Application {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_str(&self.path);
    }
}

impl Decode for Application {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Application {
            path: decoder.decode_str()?,
        })
    }
}

/// A filtering rule for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Service-assigned identifier; zero marks a rule not yet installed.
    pub id: u64,
    pub permission: Permission,
    pub application: Application,
    /// Unix timestamp of the last matching access, when any.
    pub last_access: Option<i64>,
    pub access_count: u64,
}

impl Encode for Rule {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_plain(self.id);
        self.permission.encode(encoder);
        self.application.encode(encoder);
        encoder.encode_optional(&self.last_access);
        encoder.encode_plain(self.access_count);
    }
}

impl Decode for Rule {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Rule {
            id: decoder.decode_plain()?,
            permission: Permission::decode(decoder)?,
            application: Application::decode(decoder)?,
            last_access: decoder.decode_optional()?,
            access_count: decoder.decode_plain()?,
        })
    }
}

/// A change notification the service pushes to its listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RulesUpdate {
    /// The complete rule set.
    Full(Vec<Rule>),
    /// Incremental change: rules added or modified, and removed rule ids.
    Partial {
        updated: Vec<Rule>,
        removed: Vec<u64>,
    },
}

impl RulesUpdate {
    pub fn is_full(&self) -> bool {
        matches!(self, RulesUpdate::Full(_))
    }
}

impl Encode for RulesUpdate {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            RulesUpdate::Full(rules) => {
                encoder.encode_i32(1);
                encoder.encode_slice(rules);
                encoder.encode_slice::<u64>(&[]);
            }
            RulesUpdate::Partial { updated, removed } => {
                encoder.encode_i32(0);
                encoder.encode_slice(updated);
                encoder.encode_slice(removed);
            }
        }
    }
}

impl Decode for RulesUpdate {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let is_full = decoder.decode_i32()? != 0;
        let updated = decoder.decode_vec::<Rule>()?;
        let removed = decoder.decode_vec::<u64>()?;

        if is_full {
            Ok(RulesUpdate::Full(updated))
        } else {
            Ok(RulesUpdate::Partial { updated, removed })
        }
    }
}

pub const DIRECTION_INCOMING: i32 = 0;
pub const DIRECTION_OUTGOING: i32 = 1;

/// One observed packet, carried verbatim inside statistics batches.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct PacketInfo {
    pub size: u32,
    pub direction: i32,
    pub timestamp: i64,
}

// SAFETY: #[repr(C)] struct of scalars with no padding between fields and
// every bit pattern valid.
unsafe impl Plain for PacketInfo {}

/// Per-application packet runs pushed over the statistics stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketBatch {
    pub entries: Vec<(Application, Vec<PacketInfo>)>,
}

impl PacketBatch {
    pub fn packet_count(&self) -> usize {
        self.entries.iter().map(|(_, packets)| packets.len()).sum()
    }
}

impl Encode for PacketBatch {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_i32(self.entries.len() as i32);
        for (application, packets) in &self.entries {
            application.encode(encoder);
            encoder.encode_i32(packets.len() as i32);
            for packet in packets {
                encoder.encode_plain(*packet);
            }
        }
    }
}

impl Decode for PacketBatch {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = decoder.decode_i32()? as usize;
        let mut entries = Vec::with_capacity(count.min(decoder.remaining()));
        for _ in 0..count {
            let application = Application::decode(decoder)?;
            let packet_count = decoder.decode_i32()? as usize;
            let mut packets = Vec::with_capacity(packet_count.min(decoder.remaining()));
            for _ in 0..packet_count {
                packets.push(decoder.decode_plain::<PacketInfo>()?);
            }
            entries.push((application, packets));
        }
        Ok(PacketBatch { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_value, encode_value};

    #[test]
    fn rule_round_trips_with_absent_last_access() {
        let rule = Rule {
            id: 7,
            permission: Permission::Allow,
            application: Application::new("/bin/ls"),
            last_access: None,
            access_count: 0,
        };

        let decoded = decode_value::<Rule>(&encode_value(&rule)).unwrap();
        assert_eq!(decoded, rule);
        assert_eq!(decoded.last_access, None);
    }

    #[test]
    fn rule_round_trips_with_present_last_access() {
        let rule = Rule {
            id: u64::MAX,
            permission: Permission::Deny,
            application: Application::new("/usr/bin/curl"),
            last_access: Some(1_700_000_000),
            access_count: 41,
        };
        assert_eq!(decode_value::<Rule>(&encode_value(&rule)).unwrap(), rule);
    }

    #[test]
    fn rules_update_round_trips_both_shapes() {
        let rule = Rule {
            id: 3,
            permission: Permission::Allow,
            application: Application::new("/opt/tool"),
            last_access: Some(12),
            access_count: 2,
        };

        let full = RulesUpdate::Full(vec![rule.clone()]);
        assert_eq!(
            decode_value::<RulesUpdate>(&encode_value(&full)).unwrap(),
            full
        );

        let partial = RulesUpdate::Partial {
            updated: vec![rule],
            removed: vec![9, 11],
        };
        assert_eq!(
            decode_value::<RulesUpdate>(&encode_value(&partial)).unwrap(),
            partial
        );
    }

    #[test]
    fn invalid_permission_value_is_rejected() {
        let data = encode_value(&5_i32);
        assert_eq!(
            decode_value::<Permission>(&data),
            Err(DecodeError::InvalidValue("permission"))
        );
    }

    #[test]
    fn packet_batch_round_trips() {
        let batch = PacketBatch {
            entries: vec![
                (
                    Application::new("/bin/ls"),
                    vec![
                        PacketInfo {
                            size: 120,
                            direction: DIRECTION_OUTGOING,
                            timestamp: 1_700_000_001,
                        },
                        PacketInfo {
                            size: 64,
                            direction: DIRECTION_INCOMING,
                            timestamp: 1_700_000_002,
                        },
                    ],
                ),
                (Application::new("/usr/bin/ssh"), Vec::new()),
            ],
        };

        let decoded = decode_value::<PacketBatch>(&encode_value(&batch)).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.packet_count(), 2);
    }

    #[test]
    fn default_permission_follows_the_mode() {
        assert_eq!(FilterMode::AllAllow.default_permission(), Permission::Allow);
        assert_eq!(FilterMode::UnknownDeny.default_permission(), Permission::Deny);
        assert_eq!(FilterMode::Wait.default_permission(), Permission::Allow);
    }
}
