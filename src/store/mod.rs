//! Repository contracts and the named-driver registry.
//!
//! The core depends only on the traits in this module. Concrete drivers are
//! selected by the `database.driver` config value through a [`Registry`]
//! constructed at the composition root, so adding a driver never touches the
//! domain code.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::auction::{AuctionId, AuctionStatus, UnknownStatus};
use crate::config::DatabaseConfig;
use crate::event::{Event, EventKind, EventStore, UnknownEventKind};

/// Server-assigned player identifier. This is the aggregate id of the
/// player's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Chat-platform user identifier, unique per player.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered player with a running DKP balance.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: PlayerId,
    pub external_user_id: UserId,
    pub character_name: String,
    pub dkp: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a player about to be registered. Timestamps are assigned by the
/// store at insert time.
#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub id: PlayerId,
    pub external_user_id: UserId,
    pub character_name: String,
}

/// The listing view of an auction. Derived state: the event stream is the
/// source of truth, this row exists for queries.
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionRecord {
    pub id: AuctionId,
    pub item_name: String,
    pub started_by: UserId,
    pub min_bid: i32,
    pub status: AuctionStatus,
    pub winner_id: Option<PlayerId>,
    pub win_amount: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event {aggregate_id}/{version} already exists")]
    VersionConflict { aggregate_id: String, version: i32 },
    #[error("user {0} is already registered")]
    AlreadyRegistered(UserId),
    #[error("player {0} not found")]
    PlayerNotFound(PlayerId),
    #[error("auction {0} not found")]
    AuctionNotFound(AuctionId),
    #[error("unknown store driver {driver:?} (registered: {registered:?})")]
    UnknownDriver {
        driver: String,
        registered: Vec<&'static str>,
    },
    #[error(transparent)]
    UnknownEventKind(#[from] UnknownEventKind),
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Player persistence. Every mutation writes the player row and its domain
/// event in one transaction; there is no window in which the balance and the
/// event stream disagree.
#[async_trait]
pub trait PlayerStore: Send + Sync {
    /// Inserts the player row together with its `player.registered` event
    /// (version 1). Fails with [`StoreError::AlreadyRegistered`] when the
    /// external user id exists.
    async fn create(&self, new: &NewPlayer, event: &Event) -> Result<Player, StoreError>;

    /// Applies a balance delta and appends the corresponding event at the
    /// player's next stream version, atomically. The row lock taken by the
    /// balance update serializes mutations per player.
    async fn adjust_dkp(
        &self,
        id: &PlayerId,
        delta: i32,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<Player, StoreError>;

    async fn get(&self, id: &PlayerId) -> Result<Option<Player>, StoreError>;

    async fn get_by_user(&self, user: &UserId) -> Result<Option<Player>, StoreError>;

    /// All players ordered by balance descending.
    async fn list(&self) -> Result<Vec<Player>, StoreError>;
}

/// Persistence for the auction listing view.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn create(&self, record: &AuctionRecord) -> Result<(), StoreError>;

    async fn mark_closed(
        &self,
        id: &AuctionId,
        winner: Option<(PlayerId, i32)>,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_cancelled(
        &self,
        id: &AuctionId,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &AuctionId) -> Result<Option<AuctionRecord>, StoreError>;

    /// Open auctions ordered by creation time ascending.
    async fn list_open(&self) -> Result<Vec<AuctionRecord>, StoreError>;
}

/// Connection health probe for readiness checks.
#[async_trait]
pub trait Ping: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;
}

/// The repository bundle a driver hands to the composition root.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub players: Arc<dyn PlayerStore>,
    pub auctions: Arc<dyn AuctionStore>,
    pub ping: Arc<dyn Ping>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Opens a connection and returns the repository bundle.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self, cfg: &DatabaseConfig) -> Result<Stores, StoreError>;
}

/// Maps driver names to factories. Built once in the binary and passed down;
/// nothing in the crate holds process-wide mutable state.
pub struct Registry {
    drivers: BTreeMap<&'static str, Box<dyn Driver>>,
}

impl Registry {
    /// Registry with the built-in drivers: `sqlx` (Postgres) and `memory`.
    pub fn builtin() -> Self {
        let mut registry = Self {
            drivers: BTreeMap::new(),
        };
        registry.register("sqlx", Box::new(postgres::PostgresDriver));
        registry.register("memory", Box::new(memory::MemoryDriver));
        registry
    }

    pub fn register(&mut self, name: &'static str, driver: Box<dyn Driver>) {
        self.drivers.insert(name, driver);
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.keys().copied().collect()
    }

    /// Opens the driver named by `cfg.driver`.
    pub async fn open(&self, cfg: &DatabaseConfig) -> Result<Stores, StoreError> {
        let driver = self
            .drivers
            .get(cfg.driver.as_str())
            .ok_or_else(|| StoreError::UnknownDriver {
                driver: cfg.driver.clone(),
                registered: self.driver_names(),
            })?;
        driver.open(cfg).await
    }
}
