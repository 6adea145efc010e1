//! Provider bookkeeping: availability cache, health and selection order.
//!
//! Every configured adapter sits in a [`ProviderSlot`]. Slots are ordered by
//! priority rank, then by recent success rate, then by registration order.
//! Availability probes run concurrently and are cached for a short TTL; a
//! probe that errors or does not finish in time counts as unavailable.

use crate::api::provider::{ProviderAdapter, ProviderError};
use crate::api::retry::BackoffConfig;
use futures::future::join_all;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Attempt outcomes kept per provider for the success rate.
const HEALTH_WINDOW: usize = 10;

/// Health of one provider for the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderHealth {
    pub successes: u32,
    pub failures: u32,
    /// Set after an authentication failure; never cleared.
    pub disabled: bool,
    /// Not offered a turn before this instant.
    pub rate_limited_until: Option<Instant>,
    pub consecutive_rate_limits: u32,
    /// Failed during the current turn.
    pub degraded: bool,
    pub last_error: Option<String>,
    recent: VecDeque<bool>,
}

impl ProviderHealth {
    /// Share of successes among the last few attempts. 1.0 before any.
    pub fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        self.recent.iter().filter(|ok| **ok).count() as f64 / self.recent.len() as f64
    }

    fn push_outcome(&mut self, ok: bool) {
        if self.recent.len() == HEALTH_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(ok);
    }
}

/// Why a slot is not offered the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    RateLimited,
    Unavailable,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled after an authentication failure"),
            SkipReason::RateLimited => write!(f, "cooling down after a rate limit"),
            SkipReason::Unavailable => write!(f, "availability probe failed"),
        }
    }
}

/// One provider and everything known about it.
pub struct ProviderSlot {
    adapter: Box<dyn ProviderAdapter>,
    rank: usize,
    /// Cached probe result and its expiry.
    availability: Option<(bool, Instant)>,
    health: ProviderHealth,
}

impl ProviderSlot {
    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn adapter(&self) -> &dyn ProviderAdapter {
        self.adapter.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn health(&self) -> &ProviderHealth {
        &self.health
    }

    /// Cached availability, if still fresh at `now`.
    pub fn cached_availability(&self, now: Instant) -> Option<bool> {
        self.availability
            .and_then(|(ok, expires)| (now < expires).then_some(ok))
    }

    /// Result of the most recent probe, however old.
    pub fn last_probe(&self) -> Option<bool> {
        self.availability.map(|(ok, _)| ok)
    }

    /// `None` if the slot may be attempted at `now`.
    ///
    /// Availability is judged on the last probe result, not on its expiry:
    /// callers refresh once before walking the slots, and a slow attempt on
    /// one slot must not age out the results of the others.
    pub fn skip_reason(&self, now: Instant) -> Option<SkipReason> {
        if self.health.disabled {
            return Some(SkipReason::Disabled);
        }
        if self.health.rate_limited_until.is_some_and(|until| now < until) {
            return Some(SkipReason::RateLimited);
        }
        match self.last_probe() {
            Some(true) => None,
            _ => Some(SkipReason::Unavailable),
        }
    }
}

/// The ordered set of provider slots.
pub struct ProviderRegistry {
    slots: Vec<ProviderSlot>,
    availability_ttl: Duration,
    probe_timeout: Duration,
    backoff: BackoffConfig,
}

impl ProviderRegistry {
    /// Build from `(rank, adapter)` pairs. Registration order breaks ties.
    pub fn new(
        adapters: Vec<(usize, Box<dyn ProviderAdapter>)>,
        availability_ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let slots = adapters
            .into_iter()
            .map(|(rank, adapter)| ProviderSlot {
                adapter,
                rank,
                availability: None,
                health: ProviderHealth::default(),
            })
            .collect();
        Self {
            slots,
            availability_ttl,
            probe_timeout,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> &ProviderSlot {
        &self.slots[index]
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(ProviderSlot::name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name() == name)
    }

    /// Slot indices in selection order. `preferred` goes first when set.
    pub fn ordered(&self, preferred: Option<&str>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by(|&a, &b| {
            let (sa, sb) = (&self.slots[a], &self.slots[b]);
            let pa = preferred.is_some_and(|p| sa.name() == p);
            let pb = preferred.is_some_and(|p| sb.name() == p);
            pb.cmp(&pa)
                .then(sa.rank.cmp(&sb.rank))
                .then(
                    sb.health
                        .success_rate()
                        .total_cmp(&sa.health.success_rate()),
                )
                .then(a.cmp(&b))
        });
        order
    }

    /// Probe every enabled slot whose cached result has expired, or every
    /// enabled slot when `force` is set. A zero TTL re-probes on every call. All probes run concurrently and
    /// each is bounded by the probe timeout.
    pub async fn refresh_availability(&mut self, force: bool) {
        let now = Instant::now();
        let due: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.health.disabled)
            .filter(|(_, s)| force || s.cached_availability(now).is_none())
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return;
        }

        let timeout = self.probe_timeout;
        let results = {
            let probes = due.iter().map(|&i| {
                let adapter = self.slots[i].adapter.as_ref();
                async move {
                    match tokio::time::timeout(timeout, adapter.probe()).await {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            debug!("Probe of {} failed: {e}", adapter.name());
                            false
                        }
                        Err(_) => {
                            debug!(
                                "Probe of {} timed out after {}ms",
                                adapter.name(),
                                timeout.as_millis()
                            );
                            false
                        }
                    }
                }
            });
            join_all(probes).await
        };

        let expires = Instant::now() + self.availability_ttl;
        for (i, ok) in due.into_iter().zip(results) {
            self.slots[i].availability = Some((ok, expires));
        }
    }

    /// Availability of every slot, probing afresh. Disabled slots report
    /// `false`.
    pub async fn check_availability(&mut self) -> Vec<(String, bool)> {
        self.refresh_availability(true).await;
        self.slots
            .iter()
            .map(|s| {
                let ok = !s.health.disabled && s.last_probe().unwrap_or(false);
                (s.name().to_string(), ok)
            })
            .collect()
    }

    /// Clear the per-turn degraded marks.
    pub fn begin_turn(&mut self) {
        for slot in &mut self.slots {
            slot.health.degraded = false;
        }
    }

    pub fn record_success(&mut self, index: usize) {
        let health = &mut self.slots[index].health;
        health.successes += 1;
        health.consecutive_rate_limits = 0;
        health.rate_limited_until = None;
        health.push_outcome(true);
    }

    /// Update health after a failed attempt.
    pub fn record_failure(&mut self, index: usize, error: &ProviderError) {
        let now = Instant::now();
        let slot = &mut self.slots[index];
        let name = slot.adapter.name().to_string();
        let health = &mut slot.health;
        health.failures += 1;
        health.degraded = true;
        health.last_error = Some(error.to_string());
        health.push_outcome(false);

        match error {
            ProviderError::Auth(_) => {
                warn!("Disabling {name} for this session: {error}");
                health.disabled = true;
            }
            ProviderError::RateLimited { retry_after } => {
                let delay = retry_after.unwrap_or_else(|| {
                    self.backoff.delay_for_attempt(health.consecutive_rate_limits)
                });
                health.consecutive_rate_limits += 1;
                health.rate_limited_until = Some(now + delay);
                info!("{name} rate limited, skipping it for {:.1}s", delay.as_secs_f64());
            }
            ProviderError::Unavailable(_) => {
                // Re-probe before the next turn.
                slot.availability = None;
            }
            ProviderError::Timeout(_) => {}
        }
    }
}
