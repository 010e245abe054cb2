//! Single-writer leader election over a shared database lease.
//!
//! Replicas compete for one row in the `leases` table, keyed by
//! `(name, namespace)`. A single upsert takes the row iff it is unheld,
//! expired, or already ours, so acquisition and renewal are one atomic
//! statement and the database serializes racing replicas. The holder renews
//! every `retry_period`; if no renewal lands within `renew_deadline` the
//! replica demotes itself and the process exits, leaving the row to expire
//! for the next standby.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::{DatabaseConfig, LeaderElectionConfig};

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("lease could not be renewed within the renew deadline")]
    LeaseLost,
    #[error("lease database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Takes the lease when it is ours, unheld, or expired. `rows_affected`
/// is the verdict: zero means another live holder kept it.
const ACQUIRE_LEASE: &str = "\
    INSERT INTO leases (name, namespace, holder_identity, acquired_at, renewed_at, lease_duration_ms) \
    VALUES ($1, $2, $3, now(), now(), $4) \
    ON CONFLICT (name, namespace) DO UPDATE \
    SET holder_identity = EXCLUDED.holder_identity, \
        renewed_at = now(), \
        acquired_at = CASE \
            WHEN leases.holder_identity = EXCLUDED.holder_identity THEN leases.acquired_at \
            ELSE now() \
        END, \
        lease_duration_ms = EXCLUDED.lease_duration_ms \
    WHERE leases.holder_identity = EXCLUDED.holder_identity \
       OR leases.renewed_at + (leases.lease_duration_ms * interval '1 millisecond') < now()";

const RELEASE_LEASE: &str =
    "DELETE FROM leases WHERE name = $1 AND namespace = $2 AND holder_identity = $3";

pub struct LeaderElector {
    pool: PgPool,
    cfg: LeaderElectionConfig,
    identity: String,
}

impl LeaderElector {
    /// Opens a dedicated small pool for lease traffic so election never
    /// starves behind command persistence.
    pub async fn connect(
        db: &DatabaseConfig,
        cfg: LeaderElectionConfig,
    ) -> Result<Self, ElectionError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(db.connect_options()?)
            .await?;
        Ok(Self::with_pool(pool, cfg, identity()))
    }

    pub fn with_pool(pool: PgPool, cfg: LeaderElectionConfig, identity: String) -> Self {
        Self {
            pool,
            cfg,
            identity,
        }
    }

    /// Blocks until leadership is acquired or `shutdown` fires, then runs
    /// `on_acquired` with a signal that flips when leadership is lost or the
    /// process is shutting down. The lease is released on the way out.
    pub async fn run<F, Fut>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        on_acquired: F,
    ) -> Result<(), ElectionError>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(
            identity = %self.identity,
            lease = %self.cfg.lease_name,
            namespace = %self.cfg.lease_namespace,
            "starting leader election"
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "lease acquisition attempt failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.retry_period()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
        info!(identity = %self.identity, "acquired leadership");

        let (lost_tx, mut lost_rx) = watch::channel(false);
        let renewer = tokio::spawn(renew_loop(
            self.pool.clone(),
            self.cfg.clone(),
            self.identity.clone(),
            lost_tx,
            shutdown.clone(),
        ));

        // The callback observes a single stop signal fed by both shutdown
        // and lease loss.
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut lost_watch = lost_rx.clone();
        let mut shutdown_watch = shutdown.clone();
        let merger = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_watch.changed() => {}
                _ = lost_watch.changed() => {}
            }
            let _ = stop_tx.send(true);
        });

        on_acquired(stop_rx).await;

        merger.abort();
        renewer.abort();
        self.release().await;

        let lost = *lost_rx.borrow_and_update();
        if lost {
            info!(identity = %self.identity, "lost leadership");
            return Err(ElectionError::LeaseLost);
        }
        Ok(())
    }

    async fn try_acquire(&self) -> Result<bool, ElectionError> {
        let result = sqlx::query(ACQUIRE_LEASE)
            .bind(&self.cfg.lease_name)
            .bind(&self.cfg.lease_namespace)
            .bind(&self.identity)
            .bind(lease_duration_ms(&self.cfg))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self) {
        let result = sqlx::query(RELEASE_LEASE)
            .bind(&self.cfg.lease_name)
            .bind(&self.cfg.lease_namespace)
            .bind(&self.identity)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) if done.rows_affected() > 0 => {
                info!(identity = %self.identity, "released lease");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to release lease"),
        }
    }
}

fn lease_duration_ms(cfg: &LeaderElectionConfig) -> i64 {
    i64::try_from(cfg.lease_duration().as_millis()).unwrap_or(i64::MAX)
}

/// Renews the lease every `retry_period`. Gives up leadership when the
/// lease is taken over or when no renewal lands within `renew_deadline`.
async fn renew_loop(
    pool: PgPool,
    cfg: LeaderElectionConfig,
    identity: String,
    lost: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_renewal = Instant::now();
    let mut ticker = tokio::time::interval(cfg.retry_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        let result = sqlx::query(ACQUIRE_LEASE)
            .bind(&cfg.lease_name)
            .bind(&cfg.lease_namespace)
            .bind(&identity)
            .bind(lease_duration_ms(&cfg))
            .execute(&pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => {
                last_renewal = Instant::now();
            }
            Ok(_) => {
                // Another replica holds a live lease under our name; the
                // single-writer guarantee is gone right now, not at the
                // deadline.
                error!(identity = %identity, "lease is held by another replica, demoting");
                let _ = lost.send(true);
                return;
            }
            Err(err) => {
                warn!(error = %err, "lease renewal attempt failed");
                if last_renewal.elapsed() >= cfg.renew_deadline() {
                    error!(identity = %identity, "could not renew lease within deadline, demoting");
                    let _ = lost.send(true);
                    return;
                }
            }
        }
    }
}

/// Unique identity for this replica: the pod name when running in a
/// cluster, else the hostname.
fn identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

// These tests need a Postgres instance; run them with DATABASE_URL set and
// `cargo test -- --ignored`. sqlx provisions an isolated schema per test
// and applies the migrations.
#[cfg(test)]
mod tests {
    use super::*;

    fn elector(pool: &PgPool, identity: &str) -> LeaderElector {
        LeaderElector::with_pool(
            pool.clone(),
            LeaderElectionConfig::default(),
            identity.to_string(),
        )
    }

    async fn backdate_renewal(pool: &PgPool, cfg: &LeaderElectionConfig, secs: i64) {
        sqlx::query(
            "UPDATE leases SET renewed_at = now() - ($3 * interval '1 second') \
             WHERE name = $1 AND namespace = $2",
        )
        .bind(&cfg.lease_name)
        .bind(&cfg.lease_namespace)
        .bind(secs)
        .execute(pool)
        .await
        .unwrap();
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn first_replica_acquires_the_lease(pool: PgPool) {
        let leader = elector(&pool, "replica-a");
        assert!(leader.try_acquire().await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn second_replica_is_held_off(pool: PgPool) {
        let leader = elector(&pool, "replica-a");
        let standby = elector(&pool, "replica-b");

        assert!(leader.try_acquire().await.unwrap());
        assert!(!standby.try_acquire().await.unwrap());

        // The holder keeps renewing its own lease.
        assert!(leader.try_acquire().await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn expired_lease_is_taken_over(pool: PgPool) {
        let cfg = LeaderElectionConfig::default();
        let leader = elector(&pool, "replica-a");
        assert!(leader.try_acquire().await.unwrap());

        backdate_renewal(&pool, &cfg, i64::try_from(cfg.lease_duration + 1).unwrap()).await;

        let standby = elector(&pool, "replica-b");
        assert!(standby.try_acquire().await.unwrap());

        // The previous holder must now be locked out.
        assert!(!leader.try_acquire().await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn release_frees_the_lease(pool: PgPool) {
        let leader = elector(&pool, "replica-a");
        let standby = elector(&pool, "replica-b");

        assert!(leader.try_acquire().await.unwrap());
        leader.release().await;
        assert!(standby.try_acquire().await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn release_does_not_free_someone_elses_lease(pool: PgPool) {
        let leader = elector(&pool, "replica-a");
        let standby = elector(&pool, "replica-b");

        assert!(leader.try_acquire().await.unwrap());
        standby.release().await;
        assert!(!standby.try_acquire().await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn run_serves_and_releases_on_shutdown(pool: PgPool) {
        let leader = elector(&pool, "replica-a");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let served = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let served_in_cb = served.clone();
        let result = leader
            .run(shutdown_rx, |mut stop| async move {
                served_in_cb.store(true, std::sync::atomic::Ordering::SeqCst);
                shutdown_tx.send(true).unwrap();
                let _ = stop.changed().await;
            })
            .await;

        assert!(result.is_ok());
        assert!(served.load(std::sync::atomic::Ordering::SeqCst));

        // The lease row is gone, so a standby acquires immediately.
        let standby = elector(&pool, "replica-b");
        assert!(standby.try_acquire().await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres test database"]
    async fn only_one_replica_wins_a_simultaneous_race(pool: PgPool) {
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let pool = pool.clone();
            tasks.spawn(async move {
                elector(&pool, &format!("replica-{i}"))
                    .try_acquire()
                    .await
                    .unwrap()
            });
        }

        let mut winners = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
