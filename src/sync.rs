//! Periodically pulls the authoritative dataset into `CacheStore` and
//! reconciles the master-card table, per spec.md §4.5.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::decision::{AccessCacheHandle, ConnStateHandle, MasterCardsHandle};
use crate::remote::RemoteStore;
use crate::storage::{AccessCache, CacheStore, MasterCards};

const SYNC_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Synchronizer {
    zone: String,
    remote: Arc<dyn RemoteStore>,
    store: Arc<CacheStore>,
    conn_state: ConnStateHandle,
    cache: AccessCacheHandle,
    master: MasterCardsHandle,
    interval: Duration,
    stop: Arc<AtomicBool>,
    trigger: Arc<(Mutex<bool>, std::sync::Condvar)>,
}

impl Synchronizer {
    pub fn new(
        zone: String,
        remote: Arc<dyn RemoteStore>,
        store: Arc<CacheStore>,
        conn_state: ConnStateHandle,
        cache: AccessCacheHandle,
        master: MasterCardsHandle,
        interval: Duration,
    ) -> Self {
        Synchronizer {
            zone,
            remote,
            store,
            conn_state,
            cache,
            master,
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new((Mutex::new(false), std::sync::Condvar::new())),
        }
    }

    /// Ask the running loop to sync immediately (config reload), without
    /// waiting for the next timer tick.
    pub fn trigger_now(&self) {
        let (lock, cvar) = &*self.trigger;
        *lock.lock().unwrap() = true;
        cvar.notify_one();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.trigger_now();
    }

    /// Run the sync loop: once at startup, then on the timer or an explicit
    /// trigger, until `stop()` is called. Intended to run on its own thread.
    pub fn run(&self) {
        self.sync_once();
        while !self.stop.load(Ordering::Acquire) {
            let (lock, cvar) = &*self.trigger;
            let mut triggered = lock.lock().unwrap();
            let (guard, _) = cvar
                .wait_timeout_while(triggered, self.interval, |t| !*t)
                .unwrap();
            triggered = guard;
            *triggered = false;
            drop(triggered);

            if self.stop.load(Ordering::Acquire) {
                return;
            }
            self.sync_once();
        }
    }

    fn rate_limited(&self) -> bool {
        let state = self.conn_state.lock().unwrap();
        !state.db_connected && state.last_attempt.elapsed() < Duration::from_secs(30)
    }

    pub fn sync_once(&self) {
        if self.rate_limited() {
            log::debug!("sync: skipping, rate-limited after recent failure");
            return;
        }

        // Step 1: cards.
        let cards = match self.remote.fetch_cards_for_zone(&self.zone, SYNC_CONNECT_TIMEOUT) {
            Ok(cards) => cards,
            Err(e) => {
                self.mark_unreachable();
                log::warn!("sync: failed to reach remote store: {}", e);
                return;
            }
        };
        self.mark_reachable();

        // Step 3 (schedules/holidays); fetched before the master
        // reconciliation so a single remote hiccup doesn't leave us with
        // half-applied state.
        let schedules = self
            .remote
            .fetch_schedules(SYNC_CONNECT_TIMEOUT)
            .unwrap_or_default();
        let holidays = self
            .remote
            .fetch_holidays(SYNC_CONNECT_TIMEOUT)
            .unwrap_or_default();

        // Step 4: master-card reconciliation.
        if let Ok(remote_master) = self.remote.fetch_master_cards(SYNC_CONNECT_TIMEOUT) {
            self.reconcile_master(remote_master);
        }

        // Step 5: publish a fresh snapshot atomically.
        let snapshot = AccessCache {
            zone: self.zone.clone(),
            sync_time: Utc::now().timestamp(),
            cards: cards.into_iter().collect(),
            schedules: schedules.into_iter().collect(),
            holidays,
            door_settings: Default::default(),
        };
        if let Err(e) = self.store.save_access_cache(&snapshot) {
            log::warn!("sync: failed to persist access cache: {}", e);
        }
        *self.cache.write().unwrap() = snapshot;
        log::info!("sync: access cache refreshed for zone {}", self.zone);
    }

    fn reconcile_master(&self, remote_master: Vec<(String, crate::storage::MasterCard)>) {
        let remote_keys: HashMap<String, crate::storage::MasterCard> = remote_master.into_iter().collect();
        let mut master = self.master.write().unwrap();

        for (key, card) in &remote_keys {
            if !master.cards.contains_key(key) {
                log::info!("master card added: {}", key);
            }
            master.cards.insert(key.clone(), card.clone());
        }

        let revoked: Vec<String> = master
            .cards
            .keys()
            .filter(|k| !remote_keys.contains_key(*k))
            .cloned()
            .collect();
        for key in &revoked {
            log::info!("master card revoked: {}", key);
            master.cards.remove(key);
        }

        master.last_sync = Utc::now().timestamp();
        if let Err(e) = self.store.save_master_cards(&master) {
            log::warn!("sync: failed to persist master cards: {}", e);
        }
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
}
