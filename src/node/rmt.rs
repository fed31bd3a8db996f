use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The first byte of every payload on the bus identifies the kind of message. The set of tags is
///  part of the wire protocol: new values require a protocol version bump.
///
/// Routing only looks at [RmtTag::Notify] and [RmtTag::NegativeAck]; everything else is opaque
///  to the node and interpreted by the code publishing / subscribing to channels.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RmtTag {
    Ping = 0,
    EventOutput = 1,
    EventInput = 2,
    EventInputResponse = 3,
    LogTarget = 4,
    BooleanInput = 5,
    BooleanInputResponse = 6,
    BooleanOutput = 7,
    FloatInput = 8,
    FloatInputResponse = 9,
    FloatOutput = 10,
    OutputStream = 11,
    Notify = 12,
    Invoke = 13,
    InvokeReply = 14,
    NegativeAck = 15,
    LegacyEventInputUnsub = 16,
    LegacyBooleanInputUnsub = 17,
    LegacyFloatInputUnsub = 18,
}

impl RmtTag {
    pub fn name(self) -> &'static str {
        match self {
            RmtTag::Ping => "Ping",
            RmtTag::EventOutput => "EventOutput",
            RmtTag::EventInput => "EventInput",
            RmtTag::EventInputResponse => "EventInputResponse",
            RmtTag::LogTarget => "LogTarget",
            RmtTag::BooleanInput => "BooleanInput",
            RmtTag::BooleanInputResponse => "BooleanInputResponse",
            RmtTag::BooleanOutput => "BooleanOutput",
            RmtTag::FloatInput => "FloatInput",
            RmtTag::FloatInputResponse => "FloatInputResponse",
            RmtTag::FloatOutput => "FloatOutput",
            RmtTag::OutputStream => "OutputStream",
            RmtTag::Notify => "Notify",
            RmtTag::Invoke => "RemoteProcedure",
            RmtTag::InvokeReply => "RemoteProcedureReply",
            RmtTag::NegativeAck => "NonexistenceNotification",
            RmtTag::LegacyEventInputUnsub => "LEGACY_EventInputUnsubscription",
            RmtTag::LegacyBooleanInputUnsub => "LEGACY_BooleanInputUnsubscription",
            RmtTag::LegacyFloatInputUnsub => "LEGACY_FloatInputUnsubscription",
        }
    }

    /// The tag of a payload, or `None` for an empty payload or an unknown tag byte
    pub fn of(payload: &[u8]) -> Option<RmtTag> {
        payload.first()
            .and_then(|&b| RmtTag::try_from(b).ok())
    }

    /// human-readable name of a raw tag byte, for diagnostics
    pub fn describe(raw: u8) -> String {
        match RmtTag::try_from(raw) {
            Ok(tag) => tag.name().to_string(),
            Err(_) => format!("Unknown #{}", raw),
        }
    }

    pub fn is_negative_ack(payload: &[u8]) -> bool {
        payload.first() == Some(&u8::from(RmtTag::NegativeAck))
    }
}
