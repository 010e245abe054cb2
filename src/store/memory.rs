//! In-process store driver.
//!
//! Registered as driver `memory`. Implements the same contracts as the
//! Postgres driver behind one mutex, including the error mapping and
//! ordering guarantees, which also makes it the store used by unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AuctionRecord, Driver, NewPlayer, Ping, Player, PlayerId, PlayerStore, StoreError, Stores,
    UserId,
};
use crate::auction::{AuctionId, AuctionStatus};
use crate::config::DatabaseConfig;
use crate::event::{Event, EventKind, EventStore};
use crate::store::AuctionStore;

pub struct MemoryDriver;

#[async_trait]
impl Driver for MemoryDriver {
    async fn open(&self, _cfg: &DatabaseConfig) -> Result<Stores, StoreError> {
        Ok(MemoryStore::stores())
    }
}

#[derive(Default)]
struct State {
    players: HashMap<PlayerId, Player>,
    user_index: HashMap<UserId, PlayerId>,
    events: Vec<Event>,
    auctions: HashMap<AuctionId, AuctionRecord>,
}

impl State {
    fn versions(&self) -> HashSet<(&str, i32)> {
        self.events
            .iter()
            .map(|e| (e.aggregate_id.as_str(), e.version))
            .collect()
    }

    fn next_version(&self, aggregate_id: &str) -> i32 {
        self.events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// All repositories backed by one in-memory state.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A [`Stores`] bundle where every repository shares this state.
    pub fn stores() -> Stores {
        let store = Self::new();
        Stores {
            events: store.clone(),
            players: store.clone(),
            auctions: store.clone(),
            ping: store,
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        // Validate the whole batch before touching the log so a conflict
        // leaves nothing behind.
        let mut existing = state.versions();
        for event in events {
            if !existing.insert((event.aggregate_id.as_str(), event.version)) {
                return Err(StoreError::VersionConflict {
                    aggregate_id: event.aggregate_id.clone(),
                    version: event.version,
                });
            }
        }
        drop(existing);

        state.events.extend(events.iter().cloned());
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn load_by_kind(&self, kind: EventKind) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

#[async_trait]
impl PlayerStore for MemoryStore {
    async fn create(&self, new: &NewPlayer, event: &Event) -> Result<Player, StoreError> {
        let mut state = self.state.lock().await;

        if state.user_index.contains_key(&new.external_user_id) {
            return Err(StoreError::AlreadyRegistered(new.external_user_id.clone()));
        }

        let now = Utc::now();
        let player = Player {
            id: new.id.clone(),
            external_user_id: new.external_user_id.clone(),
            character_name: new.character_name.clone(),
            dkp: 0,
            created_at: now,
            updated_at: now,
        };

        state
            .user_index
            .insert(player.external_user_id.clone(), player.id.clone());
        state.players.insert(player.id.clone(), player.clone());
        state.events.push(event.clone());
        Ok(player)
    }

    async fn adjust_dkp(
        &self,
        id: &PlayerId,
        delta: i32,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<Player, StoreError> {
        let mut state = self.state.lock().await;

        let version = state.next_version(&id.to_string());
        let player = state
            .players
            .get_mut(id)
            .ok_or_else(|| StoreError::PlayerNotFound(id.clone()))?;

        let now = Utc::now();
        player.dkp += delta;
        player.updated_at = now;
        let updated = player.clone();

        state.events.push(Event {
            id: Uuid::new_v4(),
            aggregate_id: id.to_string(),
            kind,
            data,
            version,
            created_at: now,
        });
        Ok(updated)
    }

    async fn get(&self, id: &PlayerId) -> Result<Option<Player>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.players.get(id).cloned())
    }

    async fn get_by_user(&self, user: &UserId) -> Result<Option<Player>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .user_index
            .get(user)
            .and_then(|id| state.players.get(id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Player>, StoreError> {
        let state = self.state.lock().await;
        let mut players: Vec<Player> = state.players.values().cloned().collect();
        players.sort_by(|a, b| b.dkp.cmp(&a.dkp));
        Ok(players)
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn create(&self, record: &AuctionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.auctions.insert(record.id, record.clone());
        Ok(())
    }

    async fn mark_closed(
        &self,
        id: &AuctionId,
        winner: Option<(PlayerId, i32)>,
        closed_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .auctions
            .get_mut(id)
            .filter(|record| record.status == AuctionStatus::Open)
            .ok_or(StoreError::AuctionNotFound(*id))?;

        record.status = AuctionStatus::Closed;
        record.closed_at = Some(closed_at);
        if let Some((winner_id, amount)) = winner {
            record.winner_id = Some(winner_id);
            record.win_amount = Some(amount);
        }
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        id: &AuctionId,
        closed_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .auctions
            .get_mut(id)
            .filter(|record| record.status == AuctionStatus::Open)
            .ok_or(StoreError::AuctionNotFound(*id))?;

        record.status = AuctionStatus::Cancelled;
        record.closed_at = Some(closed_at);
        Ok(())
    }

    async fn get(&self, id: &AuctionId) -> Result<Option<AuctionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.auctions.get(id).cloned())
    }

    async fn list_open(&self) -> Result<Vec<AuctionRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut open: Vec<AuctionRecord> = state
            .auctions
            .values()
            .filter(|record| record.status == AuctionStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|record| record.created_at);
        Ok(open)
    }
}

#[async_trait]
impl Ping for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
