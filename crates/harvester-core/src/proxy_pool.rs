//! Round-robin proxy rotation with per-proxy exclusion.
//!
//! # Proxy States
//!
//! ```text
//! AVAILABLE --[N consecutive failures]--> EXCLUDED --[cooldown]--> PROBATION
//!                                                                      |
//!                                      <--[failure]--                  |
//!                                                                      |
//! AVAILABLE <--------------------------[success]-----------------------+
//! ```
//!
//! A pool is owned by the gate actor, so it needs no locking.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    /// In rotation.
    Available,
    /// Out of rotation until the cooldown elapses.
    Excluded,
    /// Cooldown elapsed; back in rotation, one failure re-excludes it.
    Probation,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyState::Available => write!(f, "available"),
            ProxyState::Excluded => write!(f, "excluded"),
            ProxyState::Probation => write!(f, "probation"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures before a proxy is excluded.
    pub failure_threshold: u32,
    pub cooldown: TimeDelta,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: TimeDelta::seconds(300),
        }
    }
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    id: Uuid,
    state: ProxyState,
    consecutive_failures: u32,
    excluded_until: Option<DateTime<Utc>>,
}

impl ProxyEntry {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            state: ProxyState::Available,
            consecutive_failures: 0,
            excluded_until: None,
        }
    }

    fn maybe_enter_probation(&mut self, now: DateTime<Utc>) {
        if self.state == ProxyState::Excluded
            && let Some(until) = self.excluded_until
            && now >= until
        {
            tracing::info!(proxy_id = %self.id, "Proxy cooldown elapsed, entering probation");
            self.state = ProxyState::Probation;
            self.excluded_until = None;
        }
    }
}

/// Result of asking the pool for the next proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// The source has no proxies configured; fetch directly.
    Direct,
    Proxy(Uuid),
    /// Every configured proxy is excluded.
    Exhausted,
}

/// Proxy health for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyHealth {
    pub proxy_id: Uuid,
    pub state: ProxyState,
    pub consecutive_failures: u32,
    pub excluded_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProxyPool {
    entries: Vec<ProxyEntry>,
    cursor: usize,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    pub fn new(proxy_ids: &[Uuid], config: ProxyPoolConfig) -> Self {
        Self {
            entries: proxy_ids.iter().copied().map(ProxyEntry::new).collect(),
            cursor: 0,
            config,
        }
    }

    pub fn set_config(&mut self, config: ProxyPoolConfig) {
        self.config = config;
    }

    /// Align with the configured proxy list, keeping health of proxies that remain.
    pub fn sync(&mut self, proxy_ids: &[Uuid]) {
        let same = self.entries.len() == proxy_ids.len()
            && self.entries.iter().zip(proxy_ids).all(|(e, id)| e.id == *id);
        if same {
            return;
        }
        let mut next = Vec::with_capacity(proxy_ids.len());
        for id in proxy_ids {
            match self.entries.iter().find(|e| e.id == *id) {
                Some(existing) => next.push(existing.clone()),
                None => next.push(ProxyEntry::new(*id)),
            }
        }
        self.entries = next;
        self.cursor = 0;
    }

    /// Next proxy in rotation, skipping excluded ones.
    pub fn next(&mut self, now: DateTime<Utc>) -> Pick {
        if self.entries.is_empty() {
            return Pick::Direct;
        }
        let len = self.entries.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            let entry = &mut self.entries[idx];
            entry.maybe_enter_probation(now);
            if entry.state != ProxyState::Excluded {
                self.cursor = (idx + 1) % len;
                return Pick::Proxy(entry.id);
            }
        }
        Pick::Exhausted
    }

    pub fn record_success(&mut self, proxy_id: Uuid) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == proxy_id) else {
            return;
        };
        if entry.state == ProxyState::Probation {
            tracing::info!(%proxy_id, "Proxy recovered, back in rotation");
        }
        entry.state = ProxyState::Available;
        entry.consecutive_failures = 0;
    }

    /// Returns true if this failure took the proxy out of rotation.
    pub fn record_failure(&mut self, proxy_id: Uuid, now: DateTime<Utc>) -> bool {
        let threshold = self.config.failure_threshold.max(1);
        let cooldown = self.config.cooldown;
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == proxy_id) else {
            return false;
        };
        entry.consecutive_failures += 1;

        let exclude = match entry.state {
            ProxyState::Available => entry.consecutive_failures >= threshold,
            ProxyState::Probation => true,
            ProxyState::Excluded => false,
        };
        if exclude {
            tracing::warn!(
                %proxy_id,
                failures = entry.consecutive_failures,
                "Proxy excluded from rotation"
            );
            entry.state = ProxyState::Excluded;
            entry.excluded_until = Some(now + cooldown);
        }
        exclude
    }

    pub fn health(&mut self, now: DateTime<Utc>) -> Vec<ProxyHealth> {
        self.entries
            .iter_mut()
            .map(|e| {
                e.maybe_enter_probation(now);
                ProxyHealth {
                    proxy_id: e.id,
                    state: e.state,
                    consecutive_failures: e.consecutive_failures,
                    excluded_until: e.excluded_until,
                }
            })
            .collect()
    }
}
