//! Auction aggregate: the sole enforcer of bidding invariants.
//!
//! An [`Auction`] is a pure in-memory state machine. Commands do not mutate
//! state directly; they *stage* an event, which the caller persists and then
//! commits back through [`Auction::commit`]. Commit and replay share the same
//! apply path, so live state is always exactly what replaying the stream
//! would produce, and a failed persist leaves the aggregate untouched.

pub mod coordinator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::event::{
    AuctionCancelledData, AuctionClosedData, AuctionStartedData, BidPlacedData, Event, EventKind,
};
use crate::store::{AuctionRecord, PlayerId, UserId};

/// Auction identifier; doubles as the aggregate id of the auction's event
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionId(pub Uuid);

impl AuctionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for AuctionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionStatus {
    Open,
    Closed,
    Cancelled,
}

impl AuctionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown auction status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for AuctionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A single accepted bid. Amounts in an auction's bid sequence strictly
/// increase, so the last bid is always the highest.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub player_id: PlayerId,
    pub amount: i32,
    pub time: DateTime<Utc>,
}

/// Rejections surfaced to bidders. The `Display` strings are the
/// user-visible wording.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BidError {
    #[error("auction is no longer open")]
    Terminal,
    #[error("bid is below the minimum of {min_bid}")]
    BelowMinimum { min_bid: i32 },
    #[error("insufficient DKP: your balance is {balance}")]
    InsufficientDkp { balance: i32 },
    #[error("you are already the highest bidder")]
    SelfOutbid,
    #[error("bid must beat the current highest of {highest}")]
    NotOutbidding { highest: i32 },
}

/// Failures while reconstructing an auction from its stream. These only
/// occur on corrupt or foreign streams; a log written through this module
/// always replays cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("no events to replay")]
    Empty,
    #[error("stream does not begin with an auction.started event (got {0})")]
    Genesis(EventKind),
    #[error("aggregate id {0:?} is not an auction id")]
    AggregateId(String),
    #[error("event version {actual} does not follow {current}")]
    VersionGap { current: i32, actual: i32 },
    #[error("event {0} arrived after a terminal event")]
    Terminal(EventKind),
    #[error("event {0} cannot apply to an auction aggregate")]
    Foreign(EventKind),
    #[error("decoding event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// In-memory aggregate for a single item auction.
#[derive(Debug, Clone, PartialEq)]
pub struct Auction {
    id: AuctionId,
    item_name: String,
    started_by: UserId,
    min_bid: i32,
    duration: Duration,
    status: AuctionStatus,
    bids: Vec<Bid>,
    version: i32,
    closed_at: Option<DateTime<Utc>>,
}

impl Auction {
    /// Opens a new auction, returning the aggregate and its genesis event.
    /// The aggregate is originated *from* the event, never built alongside
    /// it, so the two cannot drift.
    pub fn open(
        id: AuctionId,
        item_name: impl Into<String>,
        started_by: UserId,
        min_bid: i32,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<(Self, Event), ReplayError> {
        let event = Event::record(
            id.to_string(),
            EventKind::AuctionStarted,
            &AuctionStartedData {
                item_name: item_name.into(),
                started_by,
                min_bid,
                duration_secs: duration.as_secs(),
            },
            1,
            now,
        );
        let auction = Self::originate(&event)?;
        Ok((auction, event))
    }

    /// Creates initial state from a genesis event.
    pub fn originate(event: &Event) -> Result<Self, ReplayError> {
        if event.kind != EventKind::AuctionStarted {
            return Err(ReplayError::Genesis(event.kind));
        }
        if event.version != 1 {
            return Err(ReplayError::VersionGap {
                current: 0,
                actual: event.version,
            });
        }

        let id = event
            .aggregate_id
            .parse()
            .map_err(|_| ReplayError::AggregateId(event.aggregate_id.clone()))?;
        let data: AuctionStartedData = event.payload()?;

        Ok(Self {
            id,
            item_name: data.item_name,
            started_by: data.started_by,
            min_bid: data.min_bid,
            duration: Duration::from_secs(data.duration_secs),
            status: AuctionStatus::Open,
            bids: Vec::new(),
            version: event.version,
            closed_at: None,
        })
    }

    /// Derives new state from an event applied to existing state. Enforces
    /// version contiguity and terminal closure.
    pub fn evolve(&mut self, event: &Event) -> Result<(), ReplayError> {
        if self.status.is_terminal() {
            return Err(ReplayError::Terminal(event.kind));
        }
        if event.version != self.version + 1 {
            return Err(ReplayError::VersionGap {
                current: self.version,
                actual: event.version,
            });
        }

        match event.kind {
            EventKind::AuctionBidPlaced => {
                let data: BidPlacedData = event.payload()?;
                self.bids.push(Bid {
                    player_id: data.player_id,
                    amount: data.amount,
                    time: event.created_at,
                });
            }
            EventKind::AuctionClosed => {
                self.status = AuctionStatus::Closed;
                self.closed_at = Some(event.created_at);
            }
            EventKind::AuctionCancelled => {
                self.status = AuctionStatus::Cancelled;
                self.closed_at = Some(event.created_at);
            }
            other => return Err(ReplayError::Foreign(other)),
        }

        self.version = event.version;
        Ok(())
    }

    /// Reconstructs an auction from its full stream in version order.
    pub fn replay(events: &[Event]) -> Result<Self, ReplayError> {
        let (genesis, rest) = events.split_first().ok_or(ReplayError::Empty)?;
        let mut auction = Self::originate(genesis)?;
        for event in rest {
            auction.evolve(event)?;
        }
        Ok(auction)
    }

    /// Validates a bid against the aggregate's invariants and stages its
    /// event. State is untouched until [`commit`](Self::commit).
    pub fn stage_bid(
        &self,
        player_id: &PlayerId,
        amount: i32,
        balance: i32,
        now: DateTime<Utc>,
    ) -> Result<Event, BidError> {
        if self.status.is_terminal() {
            return Err(BidError::Terminal);
        }
        if amount < self.min_bid {
            return Err(BidError::BelowMinimum {
                min_bid: self.min_bid,
            });
        }
        if amount > balance {
            return Err(BidError::InsufficientDkp { balance });
        }
        if let Some(highest) = self.highest_bid() {
            if highest.player_id == *player_id {
                return Err(BidError::SelfOutbid);
            }
            if amount <= highest.amount {
                return Err(BidError::NotOutbidding {
                    highest: highest.amount,
                });
            }
        }

        Ok(Event::record(
            self.id.to_string(),
            EventKind::AuctionBidPlaced,
            &BidPlacedData {
                player_id: player_id.clone(),
                amount,
            },
            self.version + 1,
            now,
        ))
    }

    /// Stages the closing event. The winner recorded in the payload is the
    /// highest bid at staging time, if any.
    pub fn stage_close(&self, now: DateTime<Utc>) -> Result<Event, BidError> {
        if self.status.is_terminal() {
            return Err(BidError::Terminal);
        }

        let data = match self.highest_bid() {
            Some(bid) => AuctionClosedData {
                winner_id: Some(bid.player_id.clone()),
                amount: Some(bid.amount),
            },
            None => AuctionClosedData {
                winner_id: None,
                amount: None,
            },
        };

        Ok(Event::record(
            self.id.to_string(),
            EventKind::AuctionClosed,
            &data,
            self.version + 1,
            now,
        ))
    }

    /// Stages the cancellation event.
    pub fn stage_cancel(&self, now: DateTime<Utc>) -> Result<Event, BidError> {
        if self.status.is_terminal() {
            return Err(BidError::Terminal);
        }

        Ok(Event::record(
            self.id.to_string(),
            EventKind::AuctionCancelled,
            &AuctionCancelledData {},
            self.version + 1,
            now,
        ))
    }

    /// Applies a staged event after it has been made durable.
    pub fn commit(&mut self, event: &Event) -> Result<(), ReplayError> {
        self.evolve(event)
    }

    pub fn id(&self) -> AuctionId {
        self.id
    }

    pub fn item_name(&self) -> &str {
        &self.item_name
    }

    pub fn started_by(&self) -> &UserId {
        &self.started_by
    }

    pub fn min_bid(&self) -> i32 {
        self.min_bid
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn status(&self) -> AuctionStatus {
        self.status
    }

    pub fn bids(&self) -> &[Bid] {
        &self.bids
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn highest_bid(&self) -> Option<&Bid> {
        self.bids.last()
    }

    /// The winning bid of a closed auction, if it had any bids.
    pub fn winner(&self) -> Option<&Bid> {
        match self.status {
            AuctionStatus::Closed => self.bids.last(),
            _ => None,
        }
    }

    /// Snapshot for the listing view.
    pub(crate) fn record(&self, created_at: DateTime<Utc>) -> AuctionRecord {
        let winner = self.winner();
        AuctionRecord {
            id: self.id,
            item_name: self.item_name.clone(),
            started_by: self.started_by.clone(),
            min_bid: self.min_bid,
            status: self.status,
            winner_id: winner.map(|bid| bid.player_id.clone()),
            win_amount: winner.map(|bid| bid.amount),
            created_at,
            closed_at: self.closed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> PlayerId {
        PlayerId::generate()
    }

    fn open_auction(min_bid: i32) -> (Auction, Vec<Event>) {
        let (auction, event) = Auction::open(
            AuctionId::generate(),
            "Sword",
            UserId::new("starter"),
            min_bid,
            Duration::from_secs(300),
            Utc::now(),
        )
        .unwrap();
        (auction, vec![event])
    }

    /// Commits a staged event and tracks it alongside the stream.
    fn apply(auction: &mut Auction, events: &mut Vec<Event>, event: Event) {
        auction.commit(&event).unwrap();
        events.push(event);
    }

    #[test]
    fn first_bid_is_accepted() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();

        let staged = auction.stage_bid(&alice, 50, 100, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let highest = auction.highest_bid().unwrap();
        assert_eq!(highest.player_id, alice);
        assert_eq!(highest.amount, 50);
        assert_eq!(
            events.iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![EventKind::AuctionStarted, EventKind::AuctionBidPlaced],
        );
        assert_eq!(events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn self_outbid_is_rejected() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();

        let staged = auction.stage_bid(&alice, 50, 100, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let err = auction.stage_bid(&alice, 60, 100, Utc::now()).unwrap_err();
        assert_eq!(err, BidError::SelfOutbid);
        assert_eq!(auction.version(), 2);
        assert_eq!(auction.bids().len(), 1);
    }

    #[test]
    fn outbid_must_exceed_highest() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();
        let bob = player();

        let staged = auction.stage_bid(&alice, 50, 100, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let staged = auction.stage_bid(&bob, 75, 200, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);
        assert_eq!(auction.highest_bid().unwrap().player_id, bob);
        assert_eq!(auction.highest_bid().unwrap().amount, 75);

        let err = auction.stage_bid(&alice, 60, 100, Utc::now()).unwrap_err();
        assert_eq!(err, BidError::NotOutbidding { highest: 75 });
    }

    #[test]
    fn bid_below_minimum_is_rejected() {
        let (auction, _) = open_auction(10);
        let err = auction.stage_bid(&player(), 5, 100, Utc::now()).unwrap_err();
        assert_eq!(err, BidError::BelowMinimum { min_bid: 10 });
    }

    #[test]
    fn bid_above_balance_is_rejected() {
        let (auction, _) = open_auction(10);
        let err = auction.stage_bid(&player(), 150, 100, Utc::now()).unwrap_err();
        assert_eq!(err, BidError::InsufficientDkp { balance: 100 });
    }

    #[test]
    fn close_awards_last_bid() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();
        let bob = player();

        let staged = auction.stage_bid(&alice, 50, 100, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);
        let staged = auction.stage_bid(&bob, 75, 200, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let staged = auction.stage_close(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        assert_eq!(auction.status(), AuctionStatus::Closed);
        let winner = auction.winner().unwrap();
        assert_eq!(winner.player_id, bob);
        assert_eq!(winner.amount, 75);

        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::AuctionClosed);
        let data: AuctionClosedData = last.payload().unwrap();
        assert_eq!(data.winner_id, Some(bob));
        assert_eq!(data.amount, Some(75));
    }

    #[test]
    fn close_without_bids_has_no_winner() {
        let (mut auction, mut events) = open_auction(0);
        let staged = auction.stage_close(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        assert_eq!(auction.status(), AuctionStatus::Closed);
        assert!(auction.winner().is_none());
        let data: AuctionClosedData = events.last().unwrap().payload().unwrap();
        assert_eq!(data.winner_id, None);
    }

    #[test]
    fn cancelled_auction_has_no_winner() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();
        let staged = auction.stage_bid(&alice, 50, 100, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let staged = auction.stage_cancel(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        assert_eq!(auction.status(), AuctionStatus::Cancelled);
        assert!(auction.winner().is_none());
    }

    #[test]
    fn every_command_fails_after_terminal_event() {
        let (mut auction, mut events) = open_auction(10);
        let staged = auction.stage_close(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let now = Utc::now();
        assert_eq!(
            auction.stage_bid(&player(), 50, 100, now).unwrap_err(),
            BidError::Terminal,
        );
        assert_eq!(auction.stage_close(now).unwrap_err(), BidError::Terminal);
        assert_eq!(auction.stage_cancel(now).unwrap_err(), BidError::Terminal);
    }

    #[test]
    fn staging_does_not_mutate_state() {
        let (auction, _) = open_auction(10);
        let before = auction.clone();

        auction.stage_bid(&player(), 50, 100, Utc::now()).unwrap();

        assert_eq!(auction, before);
    }

    #[test]
    fn replay_reproduces_live_state() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();
        let bob = player();

        for (bidder, amount) in [(&alice, 20), (&bob, 40), (&alice, 60)] {
            let staged = auction.stage_bid(bidder, amount, 1000, Utc::now()).unwrap();
            apply(&mut auction, &mut events, staged);
        }
        let staged = auction.stage_close(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let replayed = Auction::replay(&events).unwrap();
        assert_eq!(replayed, auction);
    }

    #[test]
    fn staged_versions_are_contiguous() {
        let (mut auction, mut events) = open_auction(0);
        for amount in [10, 20, 30] {
            let staged = auction.stage_bid(&player(), amount, 1000, Utc::now()).unwrap();
            apply(&mut auction, &mut events, staged);
        }

        let versions: Vec<i32> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn bid_amounts_strictly_increase_in_stream() {
        let (mut auction, mut events) = open_auction(0);
        for amount in [5, 17, 18, 90] {
            let staged = auction.stage_bid(&player(), amount, 1000, Utc::now()).unwrap();
            apply(&mut auction, &mut events, staged);
        }

        let amounts: Vec<i32> = events
            .iter()
            .filter(|e| e.kind == EventKind::AuctionBidPlaced)
            .map(|e| e.payload::<BidPlacedData>().unwrap().amount)
            .collect();
        assert!(amounts.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn replay_rejects_empty_stream() {
        assert!(matches!(Auction::replay(&[]), Err(ReplayError::Empty)));
    }

    #[test]
    fn replay_rejects_missing_genesis() {
        let event = Event::record(
            AuctionId::generate().to_string(),
            EventKind::AuctionBidPlaced,
            &BidPlacedData {
                player_id: player(),
                amount: 10,
            },
            1,
            Utc::now(),
        );
        assert!(matches!(
            Auction::replay(&[event]),
            Err(ReplayError::Genesis(EventKind::AuctionBidPlaced)),
        ));
    }

    #[test]
    fn replay_rejects_version_gap() {
        let (_, mut events) = open_auction(0);
        events.push(Event::record(
            events[0].aggregate_id.clone(),
            EventKind::AuctionBidPlaced,
            &BidPlacedData {
                player_id: player(),
                amount: 10,
            },
            3,
            Utc::now(),
        ));

        assert!(matches!(
            Auction::replay(&events),
            Err(ReplayError::VersionGap {
                current: 1,
                actual: 3,
            }),
        ));
    }

    #[test]
    fn replay_rejects_events_after_terminal() {
        let (mut auction, mut events) = open_auction(0);
        let staged = auction.stage_close(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        events.push(Event::record(
            events[0].aggregate_id.clone(),
            EventKind::AuctionBidPlaced,
            &BidPlacedData {
                player_id: player(),
                amount: 10,
            },
            3,
            Utc::now(),
        ));

        assert!(matches!(
            Auction::replay(&events),
            Err(ReplayError::Terminal(EventKind::AuctionBidPlaced)),
        ));
    }

    #[test]
    fn record_snapshot_carries_winner_after_close() {
        let (mut auction, mut events) = open_auction(10);
        let alice = player();
        let staged = auction.stage_bid(&alice, 50, 100, Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);
        let staged = auction.stage_close(Utc::now()).unwrap();
        apply(&mut auction, &mut events, staged);

        let record = auction.record(events[0].created_at);
        assert_eq!(record.status, AuctionStatus::Closed);
        assert_eq!(record.winner_id, Some(alice));
        assert_eq!(record.win_amount, Some(50));
        assert!(record.closed_at.is_some());
    }
}
