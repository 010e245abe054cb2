//! Domain events and the append-only log contract.
//!
//! Every state change in the system is recorded as an [`Event`] keyed by
//! `(aggregate_id, version)`. The log itself never interprets payloads; it
//! stores them as self-describing JSON tagged by [`EventKind`]. Current state
//! anywhere in the system is derived by replaying an aggregate's stream in
//! ascending version order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::store::{PlayerId, StoreError, UserId};

/// Identifies an event kind. The string form is the `type` column of the
/// event log and must never change once events are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "player.registered")]
    PlayerRegistered,
    #[serde(rename = "dkp.awarded")]
    DkpAwarded,
    #[serde(rename = "dkp.deducted")]
    DkpDeducted,
    #[serde(rename = "auction.started")]
    AuctionStarted,
    #[serde(rename = "auction.bid_placed")]
    AuctionBidPlaced,
    #[serde(rename = "auction.closed")]
    AuctionClosed,
    #[serde(rename = "auction.cancelled")]
    AuctionCancelled,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlayerRegistered => "player.registered",
            Self::DkpAwarded => "dkp.awarded",
            Self::DkpDeducted => "dkp.deducted",
            Self::AuctionStarted => "auction.started",
            Self::AuctionBidPlaced => "auction.bid_placed",
            Self::AuctionClosed => "auction.closed",
            Self::AuctionCancelled => "auction.cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player.registered" => Ok(Self::PlayerRegistered),
            "dkp.awarded" => Ok(Self::DkpAwarded),
            "dkp.deducted" => Ok(Self::DkpDeducted),
            "auction.started" => Ok(Self::AuctionStarted),
            "auction.bid_placed" => Ok(Self::AuctionBidPlaced),
            "auction.closed" => Ok(Self::AuctionClosed),
            "auction.cancelled" => Ok(Self::AuctionCancelled),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// A single persisted domain event.
///
/// `id` and `created_at` are assigned by the writer so that a loaded stream
/// replays bit-for-bit without depending on database defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub aggregate_id: String,
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Records a new event carrying the given payload.
    pub(crate) fn record<T: Serialize>(
        aggregate_id: String,
        kind: EventKind,
        payload: &T,
        version: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            kind,
            data: to_json(payload),
            version,
            created_at,
        }
    }

    /// Decodes the payload as the given type.
    pub(crate) fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Serializes an event payload to its JSON wire form. Payloads are flat
/// structs of strings and integers, for which serialization cannot fail.
pub(crate) fn to_json<T: Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload).expect("event payloads contain only JSON-representable fields")
}

/// Payload of [`EventKind::AuctionStarted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionStartedData {
    pub item_name: String,
    pub started_by: UserId,
    pub min_bid: i32,
    pub duration_secs: u64,
}

/// Payload of [`EventKind::AuctionBidPlaced`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidPlacedData {
    pub player_id: PlayerId,
    pub amount: i32,
}

/// Payload of [`EventKind::AuctionClosed`]. Both fields are absent when the
/// auction closed without bids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionClosedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i32>,
}

/// Payload of [`EventKind::AuctionCancelled`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionCancelledData {}

/// Payload of [`EventKind::DkpAwarded`] and [`EventKind::DkpDeducted`].
/// `amount` is the signed balance delta, so deductions carry a negative
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkpChangeData {
    pub player_id: PlayerId,
    pub amount: i32,
    pub reason: String,
}

/// Payload of [`EventKind::PlayerRegistered`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRegisteredData {
    pub external_user_id: UserId,
    pub character_name: String,
}

/// Append-only event log.
///
/// The `(aggregate_id, version)` uniqueness constraint is the sole
/// concurrency arbiter: a writer appending a stale version observes
/// [`StoreError::VersionConflict`] and must reload before retrying.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists a batch of events in a single transaction. Either all events
    /// become durable or none do. An empty batch is a no-op.
    async fn append(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Loads an aggregate's stream ordered by version ascending. Returns an
    /// empty vec for unknown aggregates.
    async fn load(&self, aggregate_id: &str) -> Result<Vec<Event>, StoreError>;

    /// Loads all events of one kind ordered by creation time ascending.
    async fn load_by_kind(&self, kind: EventKind) -> Result<Vec<Event>, StoreError>;
}
