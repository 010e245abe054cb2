//! DKP balance management: registration, awards, deductions.
//!
//! Every mutation emits its domain event in the same transaction as the
//! balance write, so the sum of all balances always equals the net of the
//! `dkp.awarded` and `dkp.deducted` streams.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::event::{self, DkpChangeData, Event, EventKind, PlayerRegisteredData};
use crate::store::{NewPlayer, Player, PlayerId, PlayerStore, StoreError, UserId};

#[derive(Debug, thiserror::Error)]
pub enum DkpError {
    #[error("user {0} is already registered")]
    AlreadyRegistered(UserId),
    #[error("user {0} is not registered")]
    NotRegistered(UserId),
    #[error("amount must be positive (got {0})")]
    NonPositiveAmount(i32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DkpManager {
    players: Arc<dyn PlayerStore>,
}

impl DkpManager {
    pub fn new(players: Arc<dyn PlayerStore>) -> Self {
        Self { players }
    }

    /// Registers a new player character with a zero balance.
    #[tracing::instrument(skip(self))]
    pub async fn register(
        &self,
        user: &UserId,
        character_name: &str,
    ) -> Result<Player, DkpError> {
        let new = NewPlayer {
            id: PlayerId::generate(),
            external_user_id: user.clone(),
            character_name: character_name.to_string(),
        };
        let event = Event::record(
            new.id.to_string(),
            EventKind::PlayerRegistered,
            &PlayerRegisteredData {
                external_user_id: user.clone(),
                character_name: character_name.to_string(),
            },
            1,
            Utc::now(),
        );

        let player = match self.players.create(&new, &event).await {
            Err(StoreError::AlreadyRegistered(user)) => {
                return Err(DkpError::AlreadyRegistered(user));
            }
            other => other?,
        };

        info!(player_id = %player.id, character = character_name, "player registered");
        Ok(player)
    }

    /// Adds DKP to a player's balance.
    #[tracing::instrument(skip(self))]
    pub async fn award(
        &self,
        player_id: &PlayerId,
        amount: i32,
        reason: &str,
    ) -> Result<Player, DkpError> {
        if amount <= 0 {
            return Err(DkpError::NonPositiveAmount(amount));
        }

        let data = event::to_json(&DkpChangeData {
            player_id: player_id.clone(),
            amount,
            reason: reason.to_string(),
        });
        let player = self
            .players
            .adjust_dkp(player_id, amount, EventKind::DkpAwarded, data)
            .await?;

        info!(%player_id, amount, reason, balance = player.dkp, "DKP awarded");
        Ok(player)
    }

    /// Removes DKP from a player's balance. Deductions are not guarded
    /// against underflow; balances may go negative.
    #[tracing::instrument(skip(self))]
    pub async fn deduct(
        &self,
        player_id: &PlayerId,
        amount: i32,
        reason: &str,
    ) -> Result<Player, DkpError> {
        if amount <= 0 {
            return Err(DkpError::NonPositiveAmount(amount));
        }

        let data = event::to_json(&DkpChangeData {
            player_id: player_id.clone(),
            amount: -amount,
            reason: reason.to_string(),
        });
        let player = self
            .players
            .adjust_dkp(player_id, -amount, EventKind::DkpDeducted, data)
            .await?;

        info!(%player_id, amount, reason, balance = player.dkp, "DKP deducted");
        Ok(player)
    }

    /// Looks up a player by chat-platform user id.
    pub async fn get(&self, user: &UserId) -> Result<Player, DkpError> {
        self.players
            .get_by_user(user)
            .await?
            .ok_or_else(|| DkpError::NotRegistered(user.clone()))
    }

    /// All players ordered by balance descending.
    pub async fn list(&self) -> Result<Vec<Player>, DkpError> {
        Ok(self.players.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Stores;

    fn manager() -> (Stores, DkpManager) {
        let stores = MemoryStore::stores();
        let manager = DkpManager::new(stores.players.clone());
        (stores, manager)
    }

    #[tokio::test]
    async fn register_creates_player_with_zero_balance() {
        let (stores, manager) = manager();
        let player = manager
            .register(&UserId::new("user-1"), "Thrall")
            .await
            .unwrap();

        assert_eq!(player.dkp, 0);
        assert_eq!(player.character_name, "Thrall");

        let stream = stores.events.load(&player.id.to_string()).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].kind, EventKind::PlayerRegistered);
        assert_eq!(stream[0].version, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let (_, manager) = manager();
        let user = UserId::new("user-1");
        manager.register(&user, "Thrall").await.unwrap();

        let err = manager.register(&user, "Jaina").await.unwrap_err();
        assert!(matches!(err, DkpError::AlreadyRegistered(u) if u == user));
    }

    #[tokio::test]
    async fn award_and_deduct_update_balance_and_stream() {
        let (stores, manager) = manager();
        let player = manager
            .register(&UserId::new("user-1"), "Thrall")
            .await
            .unwrap();

        manager.award(&player.id, 100, "raid").await.unwrap();
        let after = manager.deduct(&player.id, 30, "wipe tax").await.unwrap();
        assert_eq!(after.dkp, 70);

        let stream = stores.events.load(&player.id.to_string()).await.unwrap();
        let kinds: Vec<EventKind> = stream.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::PlayerRegistered,
                EventKind::DkpAwarded,
                EventKind::DkpDeducted,
            ],
        );
        let versions: Vec<i32> = stream.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let deducted: DkpChangeData = stream[2].payload().unwrap();
        assert_eq!(deducted.amount, -30);
        assert_eq!(deducted.reason, "wipe tax");
    }

    #[tokio::test]
    async fn deduction_may_go_negative() {
        let (_, manager) = manager();
        let player = manager
            .register(&UserId::new("user-1"), "Thrall")
            .await
            .unwrap();

        let after = manager.deduct(&player.id, 25, "penalty").await.unwrap();
        assert_eq!(after.dkp, -25);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (_, manager) = manager();
        let player = manager
            .register(&UserId::new("user-1"), "Thrall")
            .await
            .unwrap();

        assert!(matches!(
            manager.award(&player.id, 0, "nothing").await.unwrap_err(),
            DkpError::NonPositiveAmount(0),
        ));
        assert!(matches!(
            manager.deduct(&player.id, -5, "nothing").await.unwrap_err(),
            DkpError::NonPositiveAmount(-5),
        ));
    }

    #[tokio::test]
    async fn get_unknown_user_fails() {
        let (_, manager) = manager();
        let err = manager.get(&UserId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, DkpError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn balances_equal_net_of_event_stream() {
        let (stores, manager) = manager();
        let mut ids = Vec::new();
        for (user, character) in [("u1", "Thrall"), ("u2", "Jaina"), ("u3", "Rexxar")] {
            ids.push(manager.register(&UserId::new(user), character).await.unwrap().id);
        }

        manager.award(&ids[0], 100, "raid").await.unwrap();
        manager.award(&ids[1], 40, "raid").await.unwrap();
        manager.deduct(&ids[0], 25, "auction:loot").await.unwrap();
        manager.award(&ids[2], 5, "attendance").await.unwrap();
        manager.deduct(&ids[2], 10, "penalty").await.unwrap();

        let balances: i64 = manager
            .list()
            .await
            .unwrap()
            .iter()
            .map(|p| i64::from(p.dkp))
            .sum();

        let mut net: i64 = 0;
        for kind in [EventKind::DkpAwarded, EventKind::DkpDeducted] {
            for event in stores.events.load_by_kind(kind).await.unwrap() {
                let change: DkpChangeData = event.payload().unwrap();
                net += i64::from(change.amount);
            }
        }
        assert_eq!(balances, net);
    }
}
