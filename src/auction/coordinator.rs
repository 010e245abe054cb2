//! Auction coordinator: owns the live-auction table, routes commands to
//! aggregates, persists their events, and rebuilds in-flight auctions from
//! the log after failover.
//!
//! Locking discipline: the table lock is only held for lookups, inserts and
//! removals, never while an aggregate lock is taken. Each aggregate's mutex
//! is held across the stage, append, commit sequence, so bids on one auction
//! serialize behind persistence latency while other auctions proceed
//! independently.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::{Auction, AuctionId, AuctionStatus, Bid, BidError, ReplayError};
use crate::dkp::{DkpError, DkpManager};
use crate::event::{EventKind, EventStore};
use crate::store::{AuctionStore, Player, PlayerStore, StoreError, Stores, UserId};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("auction {0} not found")]
    AuctionNotFound(AuctionId),
    #[error("player {0} is not registered")]
    PlayerNotRegistered(UserId),
    #[error(transparent)]
    Bid(#[from] BidError),
    #[error("replaying auction: {0}")]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("auction {auction_id} closed but settlement failed: {source}")]
    Settlement {
        auction_id: AuctionId,
        #[source]
        source: DkpError,
    },
}

/// Outcome of closing an auction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedAuction {
    pub id: AuctionId,
    pub item_name: String,
    pub winner: Option<Bid>,
}

pub struct Coordinator {
    live: RwLock<HashMap<AuctionId, Arc<Mutex<Auction>>>>,
    events: Arc<dyn EventStore>,
    players: Arc<dyn PlayerStore>,
    auctions: Arc<dyn AuctionStore>,
    dkp: Arc<DkpManager>,
}

impl Coordinator {
    pub fn new(stores: &Stores, dkp: Arc<DkpManager>) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            events: stores.events.clone(),
            players: stores.players.clone(),
            auctions: stores.auctions.clone(),
            dkp,
        }
    }

    /// Starts a new auction and registers it in the live table. The genesis
    /// event is durable before the auction becomes biddable.
    #[tracing::instrument(skip(self, started_by))]
    pub async fn start_auction(
        &self,
        item_name: &str,
        started_by: UserId,
        min_bid: i32,
        duration: Duration,
    ) -> Result<Auction, CoordinatorError> {
        let id = AuctionId::generate();
        let now = Utc::now();
        let (auction, event) = Auction::open(id, item_name, started_by, min_bid, duration, now)?;

        self.events.append(std::slice::from_ref(&event)).await?;

        // The view row is derived state; the event append above is the
        // source of truth.
        if let Err(err) = self.auctions.create(&auction.record(now)).await {
            error!(auction_id = %id, error = %err, "failed to write auction view row");
        }

        self.live
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(auction.clone())));

        info!(auction_id = %id, item = item_name, min_bid, "auction started");
        Ok(auction)
    }

    /// Places a bid for the given chat user. On a version conflict the
    /// aggregate is reloaded from the log and the bid retried exactly once.
    #[tracing::instrument(skip(self))]
    pub async fn place_bid(
        &self,
        auction_id: &AuctionId,
        user: &UserId,
        amount: i32,
    ) -> Result<Bid, CoordinatorError> {
        let aggregate = self.lookup(auction_id).await?;
        let player = self.registered(user).await?;

        let mut auction = aggregate.lock().await;
        match self.try_bid(&mut auction, &player, amount).await {
            Err(CoordinatorError::Store(StoreError::VersionConflict { .. })) => {
                warn!(%auction_id, "version conflict on bid, reloading aggregate");
                let stream = self.events.load(&auction_id.to_string()).await?;
                *auction = Auction::replay(&stream)?;
                let player = self.registered(user).await?;
                self.try_bid(&mut auction, &player, amount).await
            }
            other => other,
        }
    }

    async fn try_bid(
        &self,
        auction: &mut Auction,
        player: &Player,
        amount: i32,
    ) -> Result<Bid, CoordinatorError> {
        let event = auction.stage_bid(&player.id, amount, player.dkp, Utc::now())?;
        self.events.append(std::slice::from_ref(&event)).await?;
        auction.commit(&event)?;

        info!(
            auction_id = %auction.id(),
            player_id = %player.id,
            amount,
            "bid placed"
        );
        Ok(Bid {
            player_id: player.id.clone(),
            amount,
            time: event.created_at,
        })
    }

    /// Closes an auction, settling the win against the winner's balance.
    /// The close event is durable before settlement runs; a settlement
    /// failure is surfaced but cannot reopen the auction.
    #[tracing::instrument(skip(self))]
    pub async fn close_auction(
        &self,
        auction_id: &AuctionId,
    ) -> Result<ClosedAuction, CoordinatorError> {
        let aggregate = self.lookup(auction_id).await?;

        let outcome = {
            let mut auction = aggregate.lock().await;
            let event = auction.stage_close(Utc::now())?;
            self.events.append(std::slice::from_ref(&event)).await?;
            auction.commit(&event)?;

            let winner = auction.winner().cloned();
            if let Err(err) = self
                .auctions
                .mark_closed(
                    auction_id,
                    winner.as_ref().map(|bid| (bid.player_id.clone(), bid.amount)),
                    event.created_at,
                )
                .await
            {
                error!(%auction_id, error = %err, "failed to update auction view row");
            }

            ClosedAuction {
                id: *auction_id,
                item_name: auction.item_name().to_string(),
                winner,
            }
        };

        self.live.write().await.remove(auction_id);

        if let Some(bid) = &outcome.winner {
            let reason = format!("auction:{auction_id}");
            if let Err(source) = self.dkp.deduct(&bid.player_id, bid.amount, &reason).await {
                error!(%auction_id, player_id = %bid.player_id, error = %source, "settlement failed");
                return Err(CoordinatorError::Settlement {
                    auction_id: *auction_id,
                    source,
                });
            }
        }

        info!(
            %auction_id,
            winner = ?outcome.winner.as_ref().map(|bid| bid.player_id.to_string()),
            "auction closed"
        );
        Ok(outcome)
    }

    /// Cancels an auction. No settlement; nobody pays.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_auction(&self, auction_id: &AuctionId) -> Result<(), CoordinatorError> {
        let aggregate = self.lookup(auction_id).await?;

        {
            let mut auction = aggregate.lock().await;
            let event = auction.stage_cancel(Utc::now())?;
            self.events.append(std::slice::from_ref(&event)).await?;
            auction.commit(&event)?;

            if let Err(err) = self
                .auctions
                .mark_cancelled(auction_id, event.created_at)
                .await
            {
                error!(%auction_id, error = %err, "failed to update auction view row");
            }
        }

        self.live.write().await.remove(auction_id);
        info!(%auction_id, "auction cancelled");
        Ok(())
    }

    /// Hydrates an auction purely from its event stream, without touching
    /// the live table.
    pub async fn replay(&self, auction_id: &AuctionId) -> Result<Auction, CoordinatorError> {
        let stream = self.events.load(&auction_id.to_string()).await?;
        if stream.is_empty() {
            return Err(CoordinatorError::AuctionNotFound(*auction_id));
        }
        Ok(Auction::replay(&stream)?)
    }

    /// Rebuilds the live table from the event log: every aggregate with an
    /// `auction.started` event is replayed and retained if still open.
    /// Called on leadership acquisition before any command is accepted;
    /// rebuilding wholesale makes the operation idempotent.
    pub async fn recover_open(&self) -> Result<usize, CoordinatorError> {
        let started = self.events.load_by_kind(EventKind::AuctionStarted).await?;

        let mut live = HashMap::new();
        for genesis in &started {
            let Ok(id) = genesis.aggregate_id.parse::<AuctionId>() else {
                warn!(aggregate_id = %genesis.aggregate_id, "skipping non-auction aggregate id");
                continue;
            };
            if live.contains_key(&id) {
                continue;
            }

            let stream = self.events.load(&genesis.aggregate_id).await?;
            match Auction::replay(&stream) {
                Ok(auction) if auction.status() == AuctionStatus::Open => {
                    live.insert(id, Arc::new(Mutex::new(auction)));
                }
                Ok(_) => {}
                // One corrupt stream must not block failover.
                Err(err) => {
                    error!(aggregate_id = %genesis.aggregate_id, error = %err, "skipping unreplayable auction stream");
                }
            }
        }

        let count = live.len();
        *self.live.write().await = live;
        info!(count, "recovered open auctions");
        Ok(count)
    }

    /// Ids of auctions currently accepting bids.
    pub async fn live_ids(&self) -> Vec<AuctionId> {
        self.live.read().await.keys().copied().collect()
    }

    async fn lookup(&self, id: &AuctionId) -> Result<Arc<Mutex<Auction>>, CoordinatorError> {
        self.live
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(CoordinatorError::AuctionNotFound(*id))
    }

    async fn registered(&self, user: &UserId) -> Result<Player, CoordinatorError> {
        self.players
            .get_by_user(user)
            .await?
            .ok_or_else(|| CoordinatorError::PlayerNotRegistered(user.clone()))
    }
}
