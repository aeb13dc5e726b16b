use std::fmt;

use serde::{Deserialize, Serialize};

use crate::var::VariableId;

/// Protocol version announced in `BeginSession`.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Subscription handle assigned by the serving peer.
pub type SubscriptionId = u32;

/// Wire discriminant of a [`Message`]. The on-wire code is `discriminant + 0x700`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    BeginSession = 0,
    EndSession = 1,
    SubscriptionRequest = 2,
    SubscriptionReply = 3,
    UnsubscriptionRequest = 4,
    UnsubscriptionReply = 5,
    VarUpdate = 6,
}

impl MessageType {
    pub const CODE_OFFSET: u16 = 0x700;

    pub fn code(self) -> u16 {
        self as u16 + Self::CODE_OFFSET
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let disc = code.checked_sub(Self::CODE_OFFSET)?;
        Some(match disc {
            0 => Self::BeginSession,
            1 => Self::EndSession,
            2 => Self::SubscriptionRequest,
            3 => Self::SubscriptionReply,
            4 => Self::UnsubscriptionRequest,
            5 => Self::UnsubscriptionReply,
            6 => Self::VarUpdate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubscriptionStatus {
    Subscribed = 0,
    Unsubscribed = 1,
    NoSuchVar = 2,
    NoSuchSubscription = 3,
    VarAlreadySubscribed = 4,
    Unknown = 5,
}

impl SubscriptionStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Codes this side does not know about collapse into `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Subscribed,
            1 => Self::Unsubscribed,
            2 => Self::NoSuchVar,
            3 => Self::NoSuchSubscription,
            4 => Self::VarAlreadySubscribed,
            _ => Self::Unknown,
        }
    }
}

/// Value carried by a variable update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum VariableValue {
    Boolean(bool),
    Byte(u8),
    Word(u16),
    Dword(u32),
    Float(f64),
}

impl VariableValue {
    pub fn type_code(&self) -> u8 {
        match self {
            VariableValue::Boolean(_) => 0,
            VariableValue::Byte(_) => 1,
            VariableValue::Word(_) => 2,
            VariableValue::Dword(_) => 3,
            VariableValue::Float(_) => 4,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            VariableValue::Boolean(_) => "boolean",
            VariableValue::Byte(_) => "byte",
            VariableValue::Word(_) => "word",
            VariableValue::Dword(_) => "dword",
            VariableValue::Float(_) => "float",
        }
    }

    /// Parses `value` as the variable type named by `type_name`
    /// (`boolean`, `byte`, `word`, `dword` or `float`).
    pub fn parse_typed(type_name: &str, value: &str) -> Option<Self> {
        let value = value.trim();
        match type_name.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => match value.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(VariableValue::Boolean(true)),
                "false" | "off" | "0" => Some(VariableValue::Boolean(false)),
                _ => None,
            },
            "byte" => parse_uint(value).and_then(|v| u8::try_from(v).ok()).map(VariableValue::Byte),
            "word" => parse_uint(value).and_then(|v| u16::try_from(v).ok()).map(VariableValue::Word),
            "dword" => parse_uint(value).and_then(|v| u32::try_from(v).ok()).map(VariableValue::Dword),
            "float" => value.parse().ok().map(VariableValue::Float),
            _ => None,
        }
    }
}

// accepts decimal or 0x-prefixed hex
fn parse_uint(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Boolean(v) => write!(f, "{}", v),
            VariableValue::Byte(v) => write!(f, "{}", v),
            VariableValue::Word(v) => write!(f, "{}", v),
            VariableValue::Dword(v) => write!(f, "{}", v),
            VariableValue::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    BeginSession {
        peer_name: String,
        protocol_version: u16,
    },
    EndSession {
        cause: String,
    },
    SubscriptionRequest {
        var_group: String,
        var_name: String,
    },
    SubscriptionReply {
        status: SubscriptionStatus,
        var_group: String,
        var_name: String,
        subscription_id: SubscriptionId,
        cause: String,
    },
    UnsubscriptionRequest {
        subscription_id: SubscriptionId,
    },
    UnsubscriptionReply {
        status: SubscriptionStatus,
        subscription_id: SubscriptionId,
        cause: String,
    },
    VarUpdate {
        subscription_id: SubscriptionId,
        value: VariableValue,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::BeginSession { .. } => MessageType::BeginSession,
            Message::EndSession { .. } => MessageType::EndSession,
            Message::SubscriptionRequest { .. } => MessageType::SubscriptionRequest,
            Message::SubscriptionReply { .. } => MessageType::SubscriptionReply,
            Message::UnsubscriptionRequest { .. } => MessageType::UnsubscriptionRequest,
            Message::UnsubscriptionReply { .. } => MessageType::UnsubscriptionReply,
            Message::VarUpdate { .. } => MessageType::VarUpdate,
        }
    }

    pub fn subscription_request(var: &VariableId) -> Self {
        Message::SubscriptionRequest {
            var_group: var.group().to_string(),
            var_name: var.name().to_string(),
        }
    }

    pub fn subscription_reply(
        status: SubscriptionStatus,
        var: &VariableId,
        subscription_id: SubscriptionId,
        cause: impl Into<String>,
    ) -> Self {
        Message::SubscriptionReply {
            status,
            var_group: var.group().to_string(),
            var_name: var.name().to_string(),
            subscription_id,
            cause: cause.into(),
        }
    }
}
