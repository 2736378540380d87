//! Per-source admission control.
//!
//! A single tokio task owns every source's token bucket, active-task counter
//! and proxy pool. Dispatch loops and workers reach it only through a
//! [`GateHandle`], so the `active <= max_concurrent` check and the increment
//! happen in one place with no lock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::AppError;
use crate::proxy_pool::{Pick, ProxyHealth, ProxyPool, ProxyPoolConfig};
use crate::rate_limit::TokenBucket;
use crate::source::{RateLimitPolicy, Source};

const COMMAND_BUFFER: usize = 256;

/// Admission for one task against one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    pub source_id: Uuid,
    pub proxy_id: Option<Uuid>,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    ConcurrencyCap,
    RateLimited { retry_after: Duration },
    /// The source has proxies and every one of them is excluded.
    ProxyPoolExhausted,
    /// The gate task is gone.
    Unavailable,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::ConcurrencyCap => write!(f, "concurrency cap reached"),
            Denial::RateLimited { retry_after } => {
                write!(f, "rate limited, next token in {}ms", retry_after.as_millis())
            }
            Denial::ProxyPoolExhausted => write!(f, "all proxies excluded"),
            Denial::Unavailable => write!(f, "gate unavailable"),
        }
    }
}

/// How the proxy fared, reported when a permit is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Failure,
    /// The attempt said nothing about the proxy (cancelled job, parse error).
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceGateSnapshot {
    pub source_id: Uuid,
    pub active: u32,
    pub max_concurrent: u32,
    pub tokens: f64,
    pub proxies: Vec<ProxyHealth>,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub proxy_failure_threshold: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            proxy_failure_threshold: 3,
        }
    }
}

/// What the gate needs to know about a source.
#[derive(Debug, Clone)]
struct SourceLimits {
    source_id: Uuid,
    policy: RateLimitPolicy,
    proxy_ids: Vec<Uuid>,
}

impl SourceLimits {
    fn from_source(source: &Source) -> Self {
        Self {
            source_id: source.id,
            policy: source.rate_limit,
            proxy_ids: source.active_proxies().map(|p| p.id).collect(),
        }
    }
}

enum Command {
    Acquire {
        limits: SourceLimits,
        reply: oneshot::Sender<Result<Permit, Denial>>,
    },
    Release {
        permit: Permit,
        outcome: ProxyOutcome,
        reply: oneshot::Sender<bool>,
    },
    Configure {
        limits: SourceLimits,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SourceGateSnapshot>>,
    },
}

struct SourceGate {
    bucket: TokenBucket,
    active: u32,
    policy: RateLimitPolicy,
    pool: ProxyPool,
}

struct GateActor {
    clock: SharedClock,
    config: GateConfig,
    sources: HashMap<Uuid, SourceGate>,
}

impl GateActor {
    fn pool_config(&self, policy: &RateLimitPolicy) -> ProxyPoolConfig {
        ProxyPoolConfig {
            failure_threshold: self.config.proxy_failure_threshold,
            cooldown: TimeDelta::seconds(policy.cooldown_seconds as i64),
        }
    }

    fn configure(&mut self, limits: &SourceLimits, now: DateTime<Utc>) -> &mut SourceGate {
        let pool_config = self.pool_config(&limits.policy);
        let gate = self
            .sources
            .entry(limits.source_id)
            .or_insert_with(|| SourceGate {
                bucket: TokenBucket::new(&limits.policy, now),
                active: 0,
                policy: limits.policy,
                pool: ProxyPool::new(&limits.proxy_ids, pool_config.clone()),
            });
        if gate.policy != limits.policy {
            gate.bucket.reconfigure(&limits.policy, now);
            gate.policy = limits.policy;
            gate.pool.set_config(pool_config);
        }
        gate.pool.sync(&limits.proxy_ids);
        gate
    }

    fn acquire(&mut self, limits: SourceLimits) -> Result<Permit, Denial> {
        let now = self.clock.now();
        let gate = self.configure(&limits, now);

        if gate.active >= gate.policy.max_concurrent {
            return Err(Denial::ConcurrencyCap);
        }
        if !gate.bucket.has_token(now) {
            return Err(Denial::RateLimited {
                retry_after: gate.bucket.time_until_token(now),
            });
        }
        let proxy_id = match gate.pool.next(now) {
            Pick::Direct => None,
            Pick::Proxy(id) => Some(id),
            Pick::Exhausted => return Err(Denial::ProxyPoolExhausted),
        };
        gate.bucket.try_take(now);
        gate.active += 1;

        Ok(Permit {
            source_id: limits.source_id,
            proxy_id,
            acquired_at: now,
        })
    }

    /// Returns true if the release excluded the permit's proxy.
    fn release(&mut self, permit: Permit, outcome: ProxyOutcome) -> bool {
        let now = self.clock.now();
        let Some(gate) = self.sources.get_mut(&permit.source_id) else {
            tracing::warn!(source_id = %permit.source_id, "Release for unknown source");
            return false;
        };
        gate.active = gate.active.saturating_sub(1);

        let Some(proxy_id) = permit.proxy_id else {
            return false;
        };
        match outcome {
            ProxyOutcome::Success => {
                gate.pool.record_success(proxy_id);
                false
            }
            ProxyOutcome::Failure => gate.pool.record_failure(proxy_id, now),
            ProxyOutcome::Neutral => false,
        }
    }

    fn snapshot(&mut self) -> Vec<SourceGateSnapshot> {
        let now = self.clock.now();
        let mut out: Vec<SourceGateSnapshot> = self
            .sources
            .iter_mut()
            .map(|(id, gate)| SourceGateSnapshot {
                source_id: *id,
                active: gate.active,
                max_concurrent: gate.policy.max_concurrent,
                tokens: gate.bucket.available(now),
                proxies: gate.pool.health(now),
            })
            .collect();
        out.sort_by_key(|s| s.source_id);
        out
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Acquire { limits, reply } => {
                    let _ = reply.send(self.acquire(limits));
                }
                Command::Release {
                    permit,
                    outcome,
                    reply,
                } => {
                    let _ = reply.send(self.release(permit, outcome));
                }
                Command::Configure { limits } => {
                    let now = self.clock.now();
                    self.configure(&limits, now);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        tracing::debug!("Gate stopped");
    }
}

/// Cloneable handle to the gate task.
#[derive(Clone)]
pub struct GateHandle {
    tx: mpsc::Sender<Command>,
}

/// Start the gate task. It stops once every handle is dropped.
pub fn spawn_gate(clock: SharedClock, config: GateConfig) -> GateHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = GateActor {
        clock,
        config,
        sources: HashMap::new(),
    };
    tokio::spawn(actor.run(rx));
    GateHandle { tx }
}

impl GateHandle {
    pub async fn try_acquire(&self, source: &Source) -> Result<Permit, Denial> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Acquire {
            limits: SourceLimits::from_source(source),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Err(Denial::Unavailable);
        }
        rx.await.unwrap_or(Err(Denial::Unavailable))
    }

    /// Give a permit back. Returns true if this excluded the permit's proxy.
    pub async fn release(&self, permit: Permit, outcome: ProxyOutcome) -> Result<bool, AppError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Release {
            permit,
            outcome,
            reply,
        };
        self.tx.send(command).await.map_err(|_| gate_closed())?;
        rx.await.map_err(|_| gate_closed())
    }

    /// Push a source's changed limits or proxy list ahead of the next acquire.
    pub async fn configure(&self, source: &Source) -> Result<(), AppError> {
        let command = Command::Configure {
            limits: SourceLimits::from_source(source),
        };
        self.tx.send(command).await.map_err(|_| gate_closed())
    }

    pub async fn snapshot(&self) -> Result<Vec<SourceGateSnapshot>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| gate_closed())?;
        rx.await.map_err(|_| gate_closed())
    }
}

fn gate_closed() -> AppError {
    AppError::Generic("Gate task is not running".into())
}
