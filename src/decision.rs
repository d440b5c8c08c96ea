//! The access-decision engine: given a validated card read, walks the
//! master → DB → cache precedence ladder of spec.md §4.6 and produces a
//! `Grant`/`Deny` plus the log entry that must always be written.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};

use crate::formats::CardRead;
use crate::remote::RemoteStore;
use crate::storage::{AccessCache, CachedCard, MasterCards};

/// `db_connected` / `last_attempt`: the one state lock every worker reads
/// and only Synchronizer, DecisionEngine, and Heartbeat mutate (spec.md §5).
pub struct ConnState {
    pub db_connected: bool,
    pub last_attempt: Instant,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState {
            db_connected: false,
            last_attempt: Instant::now() - RATE_LIMIT,
        }
    }
}

pub type ConnStateHandle = Arc<Mutex<ConnState>>;
pub type AccessCacheHandle = Arc<RwLock<AccessCache>>;
pub type MasterCardsHandle = Arc<RwLock<MasterCards>>;

/// On-demand probes must not retry more than once per 30s after a failure
/// (spec.md §4.5 rate-limiter / §4.6 Step 2).
const RATE_LIMIT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MASTER_VERIFY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Grant { name: String },
    Deny { reason: String },
}

pub struct DecisionEngine {
    zone: String,
    remote: Arc<dyn RemoteStore>,
    conn_state: ConnStateHandle,
    cache: AccessCacheHandle,
    master: MasterCardsHandle,
}

impl DecisionEngine {
    pub fn new(
        zone: String,
        remote: Arc<dyn RemoteStore>,
        conn_state: ConnStateHandle,
        cache: AccessCacheHandle,
        master: MasterCardsHandle,
    ) -> Self {
        DecisionEngine {
            zone,
            remote,
            conn_state,
            cache,
            master,
        }
    }

    fn remote_reachable(&self) -> bool {
        let state = self.conn_state.lock().unwrap();
        state.db_connected || state.last_attempt.elapsed() >= RATE_LIMIT
    }

    fn mark_unreachable(&self) {
        let mut state = self.conn_state.lock().unwrap();
        state.db_connected = false;
        state.last_attempt = Instant::now();
    }

    fn mark_reachable(&self) {
        let mut state = self.conn_state.lock().unwrap();
        state.db_connected = true;
    }

    /// Decide access for `read` at the current time.
    pub fn decide(&self, read: &CardRead) -> Decision {
        self.decide_at(read, Utc::now())
    }

    /// Same as `decide`, but with an explicit `now` so schedule/holiday
    /// behavior is reproducible in tests.
    pub fn decide_at(&self, read: &CardRead, now: chrono::DateTime<Utc>) -> Decision {
        let card_key = format!("{},{}", read.facility, read.user_id);

        // Step 1: master card, fail-open.
        let is_master = self.master.read().unwrap().cards.contains_key(&card_key);
        if is_master {
            if self.remote_reachable() {
                match self.remote.verify_master_card(&card_key, MASTER_VERIFY_TIMEOUT) {
                    Ok(true) => {
                        self.mark_reachable();
                        return Decision::Grant { name: "Master".into() };
                    }
                    Ok(false) => {
                        self.mark_reachable();
                        self.master.write().unwrap().cards.remove(&card_key);
                        log::info!("master card revoked: {}", card_key);
                        return Decision::Deny { reason: "Master card revoked".into() };
                    }
                    Err(_) => {
                        self.mark_unreachable();
                        return Decision::Grant { name: "Master".into() };
                    }
                }
            }
            return Decision::Grant { name: "Master".into() };
        }

        // Step 2: authoritative probe.
        if self.remote_reachable() {
            match self.remote.lookup_card(&card_key, PROBE_TIMEOUT) {
                Ok(Some(card)) => {
                    self.mark_reachable();
                    return self.apply_precedence(&card, &read.user_id, now);
                }
                Ok(None) => {
                    self.mark_reachable();
                    return Decision::Deny { reason: "Card not in cache".into() };
                }
                Err(_) => {
                    self.mark_unreachable();
                }
            }
        }

        // Step 3: cache fallback.
        let cache = self.cache.read().unwrap();
        let fresh = cache_is_fresh(&cache, now);
        if fresh {
            match cache.cards.get(&card_key) {
                Some(card) => self.apply_precedence(card, &read.user_id, now),
                None => Decision::Deny { reason: "Card not in cache".into() },
            }
        } else {
            Decision::Deny { reason: "System offline - no cached access data".into() }
        }
    }

    /// Step 4: the precedence ladder, identical whether the row came from
    /// the live database or the cache.
    fn apply_precedence(&self, card: &CachedCard, user_id: &str, now: chrono::DateTime<Utc>) -> Decision {
        if !card.active {
            return Decision::Deny { reason: "Card inactive".into() };
        }
        if !crate::remote::door_list_contains(&card.doors, &self.zone) {
            return Decision::Deny { reason: "No access to this door".into() };
        }
        let today = now.date_naive();
        if let Some(valid_from) = card.valid_from {
            if today < valid_from {
                return Decision::Deny { reason: "Card not yet valid".into() };
            }
        }
        if let Some(valid_until) = card.valid_until {
            if today > valid_until {
                return Decision::Deny { reason: "Card expired".into() };
            }
        }
        if let Some(schedule_id) = card.schedule_id {
            let cache = self.cache.read().unwrap();
            match cache.schedules.get(&schedule_id.to_string()) {
                None => return Decision::Deny { reason: "Outside scheduled hours".into() },
                Some(schedule) => {
                    if !schedule.is_24_7 {
                        let window = schedule.window_for(now.weekday());
                        match (window.start, window.end) {
                            (Some(start), Some(end)) => {
                                let t = now.time();
                                if !(start <= t && t <= end) {
                                    return Decision::Deny { reason: "Outside scheduled hours".into() };
                                }
                            }
                            _ => return Decision::Deny { reason: "Outside scheduled hours".into() },
                        }
                    }
                }
            }
        }
        {
            let cache = self.cache.read().unwrap();
            if cache.holidays.iter().any(|h| h.access_denied && h.matches(today)) {
                return Decision::Deny { reason: "Access denied on holiday".into() };
            }
        }

        Decision::Grant { name: card.display_name(user_id) }
    }
}

fn cache_is_fresh(cache: &AccessCache, now: chrono::DateTime<Utc>) -> bool {
    let age = now.timestamp() - cache.sync_time;
    age >= 0 && Duration::from_secs(age as u64) < Duration::from_secs(86_400)
}
