//! Liveness and readiness endpoints, served on every replica.
//!
//! `/healthz` answers 200 whenever the process is alive. `/readyz` answers
//! 200 only when this replica is actively serving (leader-ready) and every
//! registered checker passes; standbys and replicas with a failing
//! dependency answer 503 so traffic and gateway duties stay on the leader.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, routes, Route, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::store::{Ping, StoreError};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A named readiness check.
#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Readiness check against the store connection.
pub struct DatabaseChecker {
    ping: Arc<dyn Ping>,
}

impl DatabaseChecker {
    pub fn new(ping: Arc<dyn Ping>) -> Self {
        Self { ping }
    }
}

#[async_trait]
impl Checker for DatabaseChecker {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.ping.ping().await.map_err(|err: StoreError| err.into())
    }
}

pub struct Health {
    ready: AtomicBool,
    checkers: Vec<Box<dyn Checker>>,
}

impl Health {
    pub fn new(checkers: Vec<Box<dyn Checker>>) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            checkers,
        })
    }

    /// Marks this replica as ready (or not) to receive traffic.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn run_checks(&self) -> (bool, BTreeMap<String, String>) {
        let mut all_ok = true;
        let mut results = BTreeMap::new();
        for checker in &self.checkers {
            let outcome = match tokio::time::timeout(CHECK_TIMEOUT, checker.check()).await {
                Ok(Ok(())) => "ok".to_string(),
                Ok(Err(err)) => {
                    all_ok = false;
                    err.to_string()
                }
                Err(_) => {
                    all_ok = false;
                    "check timed out".to_string()
                }
            };
            results.insert(checker.name().to_string(), outcome);
        }
        (all_ok, results)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<BTreeMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

#[get("/healthz")]
fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        checks: None,
        timestamp: Utc::now(),
    })
}

#[get("/readyz")]
async fn readyz(health: &State<Arc<Health>>) -> (Status, Json<HealthResponse>) {
    if !health.ready() {
        return (
            Status::ServiceUnavailable,
            Json(HealthResponse {
                status: "not_ready".to_string(),
                checks: None,
                timestamp: Utc::now(),
            }),
        );
    }

    let (all_ok, checks) = health.run_checks().await;
    let (status, code) = if all_ok {
        ("ready", Status::Ok)
    } else {
        ("not_ready", Status::ServiceUnavailable)
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            checks: Some(checks),
            timestamp: Utc::now(),
        }),
    )
}

pub fn routes() -> Vec<Route> {
    routes![healthz, readyz]
}
