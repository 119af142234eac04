//! Signal types and decoding of raw store notifications.

use std::fmt;

use serde::Deserialize;
use uuid::Uuid;

/// Channel names used on the store's publish/subscribe primitive.
pub mod channel_names {
    /// A fact was inserted.
    pub const FACT_INSERT: &str = "fact_insert";
    /// The blacklist table changed.
    pub const BLACKLIST_CHANGE: &str = "blacklist_change";
    /// A schema was added or replaced.
    pub const SCHEMA_CHANGE: &str = "schemastore_change";
    /// A transformation step was added or replaced.
    pub const TRANSFORMATION_CHANGE: &str = "transformationstore_change";
    /// The fact table was truncated.
    pub const FACT_TRUNCATE: &str = "fact_truncate";
    /// A single fact was updated in place.
    pub const FACT_UPDATE: &str = "fact_update";
    /// Health-check probe echoed back by the store.
    pub const ROUNDTRIP: &str = "roundtrip";

    /// Every channel the notification channel listens on.
    pub const ALL: [&str; 7] = [
        FACT_INSERT,
        BLACKLIST_CHANGE,
        SCHEMA_CHANGE,
        TRANSFORMATION_CHANGE,
        FACT_TRUNCATE,
        FACT_UPDATE,
        ROUNDTRIP,
    ];
}

// ---------------------------------------------------------------------------
// RawNotification
// ---------------------------------------------------------------------------

/// A notification as delivered by the publish/subscribe primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Channel the notification was published on.
    pub channel: String,
    /// Optional payload text (JSON for coordinate-carrying channels).
    pub payload: Option<String>,
}

impl RawNotification {
    /// Creates a notification without payload.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: None,
        }
    }

    /// Creates a notification with a payload.
    #[must_use]
    pub fn with_payload(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: Some(payload.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// SignalKind
// ---------------------------------------------------------------------------

/// Payload-free discriminant of [`ChangeSignal`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// See [`ChangeSignal::FactInserted`].
    FactInserted,
    /// See [`ChangeSignal::BlacklistChanged`].
    BlacklistChanged,
    /// See [`ChangeSignal::SchemaChanged`].
    SchemaChanged,
    /// See [`ChangeSignal::TransformationSetChanged`].
    TransformationSetChanged,
    /// See [`ChangeSignal::Truncated`].
    Truncated,
    /// See [`ChangeSignal::Updated`].
    Updated,
    /// See [`ChangeSignal::RoundTrip`].
    RoundTrip,
}

// ---------------------------------------------------------------------------
// ChangeSignal
// ---------------------------------------------------------------------------

/// A typed change signal republished on the [`ChangeBus`](super::ChangeBus).
///
/// Coordinates are optional: signals synthesized after a reconnect do not
/// identify any particular fact or schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeSignal {
    /// New facts may exist.
    FactInserted {
        /// Namespace of the inserted fact.
        ns: Option<String>,
        /// Type of the inserted fact.
        type_: Option<String>,
    },
    /// The set of blocked fact ids may have changed.
    BlacklistChanged,
    /// A schema may have changed.
    SchemaChanged {
        /// Namespace.
        ns: Option<String>,
        /// Type.
        type_: Option<String>,
        /// Schema version.
        version: Option<u32>,
    },
    /// The transformation steps for a key changed.
    TransformationSetChanged {
        /// Namespace.
        ns: String,
        /// Type.
        type_: String,
    },
    /// The fact store was truncated.
    Truncated,
    /// A single fact was updated in place.
    Updated {
        /// The updated fact.
        fact_id: Uuid,
    },
    /// Health-check echo.
    RoundTrip,
}

#[derive(Deserialize)]
struct CoordinatePayload {
    ns: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    version: Option<u32>,
}

#[derive(Deserialize)]
struct IdPayload {
    id: Uuid,
}

impl ChangeSignal {
    /// Synthetic "catch up" nudge that identifies no fact.
    #[must_use]
    pub fn catch_up() -> Self {
        Self::FactInserted {
            ns: None,
            type_: None,
        }
    }

    /// Synthetic schema signal that identifies no schema.
    #[must_use]
    pub fn any_schema_changed() -> Self {
        Self::SchemaChanged {
            ns: None,
            type_: None,
            version: None,
        }
    }

    /// Returns the discriminant of this signal.
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::FactInserted { .. } => SignalKind::FactInserted,
            Self::BlacklistChanged => SignalKind::BlacklistChanged,
            Self::SchemaChanged { .. } => SignalKind::SchemaChanged,
            Self::TransformationSetChanged { .. } => SignalKind::TransformationSetChanged,
            Self::Truncated => SignalKind::Truncated,
            Self::Updated { .. } => SignalKind::Updated,
            Self::RoundTrip => SignalKind::RoundTrip,
        }
    }

    /// Decodes a raw store notification.
    ///
    /// Returns `None` for unknown channels and for payloads that are
    /// required but missing or malformed.
    #[must_use]
    pub fn from_notification(raw: &RawNotification) -> Option<Self> {
        let payload = raw.payload.as_deref().filter(|p| !p.trim().is_empty());

        match raw.channel.as_str() {
            channel_names::FACT_INSERT => {
                let coords = payload.and_then(parse_coordinates);
                Some(Self::FactInserted {
                    ns: coords.as_ref().and_then(|c| c.ns.clone()),
                    type_: coords.and_then(|c| c.type_),
                })
            }
            channel_names::BLACKLIST_CHANGE => Some(Self::BlacklistChanged),
            channel_names::SCHEMA_CHANGE => {
                let coords = payload.and_then(parse_coordinates);
                Some(match coords {
                    Some(c) => Self::SchemaChanged {
                        ns: c.ns,
                        type_: c.type_,
                        version: c.version,
                    },
                    None => Self::any_schema_changed(),
                })
            }
            channel_names::TRANSFORMATION_CHANGE => {
                let c = parse_coordinates(payload?)?;
                Some(Self::TransformationSetChanged {
                    ns: c.ns?,
                    type_: c.type_?,
                })
            }
            channel_names::FACT_TRUNCATE => Some(Self::Truncated),
            channel_names::FACT_UPDATE => {
                let parsed: IdPayload = serde_json::from_str(payload?).ok()?;
                Some(Self::Updated { fact_id: parsed.id })
            }
            channel_names::ROUNDTRIP => Some(Self::RoundTrip),
            _ => None,
        }
    }
}

fn parse_coordinates(payload: &str) -> Option<CoordinatePayload> {
    serde_json::from_str(payload).ok()
}

impl fmt::Display for ChangeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".to_string());
        match self {
            Self::FactInserted { ns, type_ } => {
                write!(f, "FactInserted({}/{})", opt(ns), opt(type_))
            }
            Self::BlacklistChanged => write!(f, "BlacklistChanged"),
            Self::SchemaChanged { ns, type_, version } => write!(
                f,
                "SchemaChanged({}/{}/{})",
                opt(ns),
                opt(type_),
                version.map_or_else(|| "*".to_string(), |v| v.to_string())
            ),
            Self::TransformationSetChanged { ns, type_ } => {
                write!(f, "TransformationSetChanged({ns}/{type_})")
            }
            Self::Truncated => write!(f, "Truncated"),
            Self::Updated { fact_id } => write!(f, "Updated({fact_id})"),
            Self::RoundTrip => write!(f, "RoundTrip"),
        }
    }
}
