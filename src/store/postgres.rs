//! Postgres store driver backed by sqlx.
//!
//! Registered as driver `sqlx`. Runs the crate's migrations on open, and maps
//! unique-constraint violations onto the domain conflict errors so callers
//! never see raw database errors for expected races.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{
    AuctionRecord, AuctionStore, Driver, NewPlayer, Ping, Player, PlayerId, PlayerStore,
    StoreError, Stores, UserId,
};
use crate::auction::AuctionId;
use crate::config::DatabaseConfig;
use crate::event::{Event, EventKind, EventStore};

pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    async fn open(&self, cfg: &DatabaseConfig) -> Result<Stores, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(cfg.connect_options()?)
            .await?;
        sqlx::migrate!().run(&pool).await?;
        info!(host = %cfg.host, dbname = %cfg.dbname, "connected to postgres");

        Ok(PostgresStore::stores(pool))
    }
}

/// All repositories backed by one connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// A [`Stores`] bundle where every repository shares this pool.
    pub fn stores(pool: PgPool) -> Stores {
        let store = Self::new(pool);
        Stores {
            events: store.clone(),
            players: store.clone(),
            auctions: store.clone(),
            ping: store,
        }
    }
}

const INSERT_EVENT: &str = "\
    INSERT INTO events (id, aggregate_id, type, data, version, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6)";

const SELECT_EVENT: &str =
    "SELECT id, aggregate_id, type, data, version, created_at FROM events";

const SELECT_PLAYER: &str = "\
    SELECT id, external_user_id, character_name, dkp, created_at, updated_at FROM players";

const SELECT_AUCTION: &str = "\
    SELECT id, item_name, started_by, min_bid, status, winner_id, win_amount, \
           created_at, closed_at \
    FROM auctions";

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    aggregate_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    data: serde_json::Value,
    version: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let kind: EventKind = row.kind.parse()?;
        Ok(Event {
            id: row.id,
            aggregate_id: row.aggregate_id,
            kind,
            data: row.data,
            version: row.version,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlayerRow {
    id: Uuid,
    external_user_id: String,
    character_name: String,
    dkp: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PlayerRow> for Player {
    fn from(row: PlayerRow) -> Self {
        Player {
            id: PlayerId(row.id),
            external_user_id: UserId::new(row.external_user_id),
            character_name: row.character_name,
            dkp: row.dkp,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuctionRow {
    id: Uuid,
    item_name: String,
    started_by: String,
    min_bid: i32,
    status: String,
    winner_id: Option<Uuid>,
    win_amount: Option<i32>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AuctionRow> for AuctionRecord {
    type Error = StoreError;

    fn try_from(row: AuctionRow) -> Result<Self, Self::Error> {
        Ok(AuctionRecord {
            id: AuctionId(row.id),
            item_name: row.item_name,
            started_by: UserId::new(row.started_by),
            min_bid: row.min_bid,
            status: row.status.parse()?,
            winner_id: row.winner_id.map(PlayerId),
            win_amount: row.win_amount,
            created_at: row.created_at,
            closed_at: row.closed_at,
        })
    }
}

fn event_conflict(err: sqlx::Error, event: &Event) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::VersionConflict {
            aggregate_id: event.aggregate_id.clone(),
            version: event.version,
        },
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(INSERT_EVENT)
                .bind(event.id)
                .bind(&event.aggregate_id)
                .bind(event.kind.as_str())
                .bind(&event.data)
                .bind(event.version)
                .bind(event.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|err| event_conflict(err, event))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT} WHERE aggregate_id = $1 ORDER BY version ASC"
        ))
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    async fn load_by_kind(&self, kind: EventKind) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT} WHERE type = $1 ORDER BY created_at ASC"
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }
}

#[async_trait]
impl PlayerStore for PostgresStore {
    async fn create(&self, new: &NewPlayer, event: &Event) -> Result<Player, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row: PlayerRow = sqlx::query_as(
            "INSERT INTO players (id, external_user_id, character_name, dkp, created_at, updated_at) \
             VALUES ($1, $2, $3, 0, $4, $4) \
             RETURNING id, external_user_id, character_name, dkp, created_at, updated_at",
        )
        .bind(new.id.0)
        .bind(new.external_user_id.as_str())
        .bind(&new.character_name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::AlreadyRegistered(new.external_user_id.clone())
            }
            _ => StoreError::Database(err),
        })?;

        sqlx::query(INSERT_EVENT)
            .bind(event.id)
            .bind(&event.aggregate_id)
            .bind(event.kind.as_str())
            .bind(&event.data)
            .bind(event.version)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|err| event_conflict(err, event))?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn adjust_dkp(
        &self,
        id: &PlayerId,
        delta: i32,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<Player, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // The UPDATE's row lock serializes concurrent adjustments for the
        // same player, which makes the MAX(version)+1 below safe.
        let row: Option<PlayerRow> = sqlx::query_as(
            "UPDATE players SET dkp = dkp + $1, updated_at = $2 WHERE id = $3 \
             RETURNING id, external_user_id, character_name, dkp, created_at, updated_at",
        )
        .bind(delta)
        .bind(now)
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::PlayerNotFound(id.clone()));
        };

        sqlx::query(
            "INSERT INTO events (id, aggregate_id, type, data, version, created_at) \
             VALUES ($1, $2, $3, $4, \
                     (SELECT COALESCE(MAX(version), 0) + 1 FROM events WHERE aggregate_id = $2), \
                     $5)",
        )
        .bind(Uuid::new_v4())
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(&data)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn get(&self, id: &PlayerId) -> Result<Option<Player>, StoreError> {
        let row: Option<PlayerRow> =
            sqlx::query_as(&format!("{SELECT_PLAYER} WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Player::from))
    }

    async fn get_by_user(&self, user: &UserId) -> Result<Option<Player>, StoreError> {
        let row: Option<PlayerRow> =
            sqlx::query_as(&format!("{SELECT_PLAYER} WHERE external_user_id = $1"))
                .bind(user.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Player::from))
    }

    async fn list(&self) -> Result<Vec<Player>, StoreError> {
        let rows: Vec<PlayerRow> =
            sqlx::query_as(&format!("{SELECT_PLAYER} ORDER BY dkp DESC"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Player::from).collect())
    }
}

#[async_trait]
impl AuctionStore for PostgresStore {
    async fn create(&self, record: &AuctionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auctions (id, item_name, started_by, min_bid, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id.0)
        .bind(&record.item_name)
        .bind(record.started_by.as_str())
        .bind(record.min_bid)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_closed(
        &self,
        id: &AuctionId,
        winner: Option<(PlayerId, i32)>,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (winner_id, win_amount) = match winner {
            Some((player_id, amount)) => (Some(player_id.0), Some(amount)),
            None => (None, None),
        };

        let result = sqlx::query(
            "UPDATE auctions \
             SET status = 'closed', winner_id = $2, win_amount = $3, closed_at = $4 \
             WHERE id = $1 AND status = 'open'",
        )
        .bind(id.0)
        .bind(winner_id)
        .bind(win_amount)
        .bind(closed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AuctionNotFound(*id));
        }
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        id: &AuctionId,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE auctions SET status = 'cancelled', closed_at = $2 \
             WHERE id = $1 AND status = 'open'",
        )
        .bind(id.0)
        .bind(closed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AuctionNotFound(*id));
        }
        Ok(())
    }

    async fn get(&self, id: &AuctionId) -> Result<Option<AuctionRecord>, StoreError> {
        let row: Option<AuctionRow> =
            sqlx::query_as(&format!("{SELECT_AUCTION} WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(AuctionRecord::try_from).transpose()
    }

    async fn list_open(&self) -> Result<Vec<AuctionRecord>, StoreError> {
        let rows: Vec<AuctionRow> = sqlx::query_as(&format!(
            "{SELECT_AUCTION} WHERE status = 'open' ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AuctionRecord::try_from).collect()
    }
}

#[async_trait]
impl Ping for PostgresStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// These tests need a Postgres instance; run them with DATABASE_URL set and
// `cargo test -- --ignored`. sqlx provisions an isolated schema per test
// and applies the migrations.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::AuctionStatus;
    use crate::event::PlayerRegisteredData;

    fn bid_event(aggregate_id: &str, version: i32, amount: i32) -> Event {
        Event::record(
            aggregate_id.to_string(),
            EventKind::AuctionBidPlaced,
            &crate::event::BidPlacedData {
                player_id: PlayerId::generate(),
                amount,
            },
            version,
            Utc::now(),
        )
    }

    fn registration(user: &str, character: &str) -> (NewPlayer, Event) {
        let new = NewPlayer {
            id: PlayerId::generate(),
            external_user_id: UserId::new(user),
            character_name: character.to_string(),
        };
        let event = Event::record(
            new.id.to_string(),
            EventKind::PlayerRegistered,
            &PlayerRegisteredData {
                external_user_id: new.external_user_id.clone(),
                character_name: new.character_name.clone(),
            },
            1,
            Utc::now(),
        );
        (new, event)
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn append_and_load_round_trip(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let aggregate = AuctionId::generate().to_string();

        let events = vec![bid_event(&aggregate, 1, 10), bid_event(&aggregate, 2, 20)];
        stores.events.append(&events).await.unwrap();

        // Timestamps lose sub-microsecond precision in timestamptz, so the
        // comparison stops at the identifying fields and payload.
        let loaded = stores.events.load(&aggregate).await.unwrap();
        assert_eq!(loaded.len(), 2);
        for (stored, original) in loaded.iter().zip(&events) {
            assert_eq!(stored.id, original.id);
            assert_eq!(stored.aggregate_id, original.aggregate_id);
            assert_eq!(stored.kind, original.kind);
            assert_eq!(stored.data, original.data);
            assert_eq!(stored.version, original.version);
        }
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn stale_version_conflicts_atomically(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let aggregate = AuctionId::generate().to_string();
        stores
            .events
            .append(&[bid_event(&aggregate, 1, 10)])
            .await
            .unwrap();

        let err = stores
            .events
            .append(&[bid_event(&aggregate, 2, 20), bid_event(&aggregate, 1, 30)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { version: 1, .. }
        ));

        // The transaction rolled back: version 2 must not exist.
        assert_eq!(stores.events.load(&aggregate).await.unwrap().len(), 1);
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn load_by_kind_spans_aggregates(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let first = AuctionId::generate().to_string();
        let second = AuctionId::generate().to_string();
        stores
            .events
            .append(&[bid_event(&first, 1, 10), bid_event(&second, 1, 20)])
            .await
            .unwrap();

        let events = stores
            .events
            .load_by_kind(EventKind::AuctionBidPlaced)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn create_player_writes_row_and_event(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let (new, event) = registration("user-1", "Thrall");
        let player = stores.players.create(&new, &event).await.unwrap();

        assert_eq!(player.dkp, 0);
        assert_eq!(player.character_name, "Thrall");

        let stream = stores.events.load(&player.id.to_string()).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].kind, EventKind::PlayerRegistered);
        assert_eq!(stream[0].version, 1);
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn duplicate_registration_is_rejected(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let (new, event) = registration("user-1", "Thrall");
        stores.players.create(&new, &event).await.unwrap();

        let (dup, dup_event) = registration("user-1", "Jaina");
        let err = stores.players.create(&dup, &dup_event).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyRegistered(_)));

        // The rejected registration must not have appended an event either.
        assert!(stores.events.load(&dup.id.to_string()).await.unwrap().is_empty());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn adjust_dkp_is_atomic_and_versioned(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let (new, event) = registration("user-1", "Thrall");
        let player = stores.players.create(&new, &event).await.unwrap();

        for delta in [25, -10] {
            let kind = if delta > 0 {
                EventKind::DkpAwarded
            } else {
                EventKind::DkpDeducted
            };
            stores
                .players
                .adjust_dkp(&player.id, delta, kind, serde_json::json!({"amount": delta}))
                .await
                .unwrap();
        }

        let updated = stores.players.get(&player.id).await.unwrap().unwrap();
        assert_eq!(updated.dkp, 15);

        let versions: Vec<i32> = stores
            .events
            .load(&player.id.to_string())
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn adjust_dkp_unknown_player_fails(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let err = stores
            .players
            .adjust_dkp(
                &PlayerId::generate(),
                5,
                EventKind::DkpAwarded,
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PlayerNotFound(_)));
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn list_orders_by_balance_descending(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        for (user, character, dkp) in [("u1", "Low", 5), ("u2", "High", 50)] {
            let (new, event) = registration(user, character);
            let player = stores.players.create(&new, &event).await.unwrap();
            stores
                .players
                .adjust_dkp(&player.id, dkp, EventKind::DkpAwarded, serde_json::json!({}))
                .await
                .unwrap();
        }

        let players = stores.players.list().await.unwrap();
        let names: Vec<&str> = players.iter().map(|p| p.character_name.as_str()).collect();
        assert_eq!(names, vec!["High", "Low"]);
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn auction_view_lifecycle(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let id = AuctionId::generate();
        let record = AuctionRecord {
            id,
            item_name: "Sword".to_string(),
            started_by: UserId::new("starter"),
            min_bid: 10,
            status: AuctionStatus::Open,
            winner_id: None,
            win_amount: None,
            created_at: Utc::now(),
            closed_at: None,
        };
        stores.auctions.create(&record).await.unwrap();

        let open = stores.auctions.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);

        let (new, event) = registration("winner", "Thrall");
        let winner = stores.players.create(&new, &event).await.unwrap();
        stores
            .auctions
            .mark_closed(&id, Some((winner.id.clone(), 75)), Utc::now())
            .await
            .unwrap();

        let closed = stores.auctions.get(&id).await.unwrap().unwrap();
        assert_eq!(closed.status, AuctionStatus::Closed);
        assert_eq!(closed.winner_id, Some(winner.id));
        assert_eq!(closed.win_amount, Some(75));
        assert!(stores.auctions.list_open().await.unwrap().is_empty());

        // Closing again must not find an open row.
        let err = stores
            .auctions
            .mark_closed(&id, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AuctionNotFound(_)));
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn cancel_marks_row_cancelled(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        let id = AuctionId::generate();
        let record = AuctionRecord {
            id,
            item_name: "Shield".to_string(),
            started_by: UserId::new("starter"),
            min_bid: 0,
            status: AuctionStatus::Open,
            winner_id: None,
            win_amount: None,
            created_at: Utc::now(),
            closed_at: None,
        };
        stores.auctions.create(&record).await.unwrap();
        stores.auctions.mark_cancelled(&id, Utc::now()).await.unwrap();

        let cancelled = stores.auctions.get(&id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, AuctionStatus::Cancelled);
        assert!(cancelled.closed_at.is_some());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn ping_answers_on_a_live_pool(pool: PgPool) {
        let stores = PostgresStore::stores(pool);
        stores.ping.ping().await.unwrap();
    }
}
