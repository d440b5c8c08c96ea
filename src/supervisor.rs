//! Lifecycle: `Init → Running → Stopping → Stopped` (spec.md §4.9). Signal
//! handlers only enqueue events onto a channel the Supervisor selects on;
//! per the design note, no work happens inside the handler itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::decision::{ConnState, Decision, DecisionEngine};
use crate::events::{AccessLogEntry, DoorEventEntry, DoorEventType};
use crate::formats::FormatRegistry;
use crate::gpio::{DoorIO, NamedInput};
use crate::heartbeat::Heartbeat;
use crate::remote::RemoteStore;
use crate::storage::CacheStore;
use crate::swipe::{SwipeAction, SwipeStateMachine};
use crate::sync::Synchronizer;
use crate::wiegand::{self, WiegandDecoder};

/// Events a signal handler (or a test) may enqueue. The Supervisor's only
/// job on receipt is to change state or re-trigger work, never to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Shutdown,
    Reload,
    DebugToggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// One configured reader: its name and the two input lines to poll.
pub struct ReaderHandles {
    pub name: String,
    pub d0: NamedInput,
    pub d1: NamedInput,
}

/// Everything the Supervisor needs assembled before `run`: config, GPIO
/// lines (already claimed from whatever backend `main.rs` chose), and the
/// remote store. Kept hardware-agnostic so tests can pass test doubles.
pub struct Supervisor {
    zone: String,
    door: Arc<Mutex<DoorIO>>,
    decision: Arc<DecisionEngine>,
    swipe: Arc<Mutex<SwipeStateMachine>>,
    decoder: Arc<WiegandDecoder>,
    store: Arc<CacheStore>,
    synchronizer: Arc<Synchronizer>,
    heartbeat: Arc<Heartbeat>,
    readers: Mutex<Vec<ReaderHandles>>,
    door_sensor: Mutex<Option<NamedInput>>,
    rex: Mutex<Option<NamedInput>>,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn init(
        config: &Config,
        door: DoorIO,
        readers: Vec<ReaderHandles>,
        door_sensor: Option<NamedInput>,
        rex: Option<NamedInput>,
        remote: Arc<dyn RemoteStore>,
        sync_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        let zone = config.zone_name.clone();
        let store = Arc::new(
            CacheStore::new(config.cache_dir(), zone.clone()).expect("cache directory must be writable"),
        );

        let master_table = store.load_master_cards();
        let access_cache = store.load_access_cache();
        let cache = Arc::new(RwLock::new(access_cache));
        let master = Arc::new(RwLock::new(master_table));
        let conn_state = Arc::new(Mutex::new(ConnState::default()));

        let formats = FormatRegistry::with_custom_formats(&config.formats_path());
        let decoder = Arc::new(WiegandDecoder::new(formats));

        let decision = Arc::new(DecisionEngine::new(
            zone.clone(),
            remote.clone(),
            conn_state.clone(),
            cache.clone(),
            master.clone(),
        ));

        let synchronizer = Arc::new(Synchronizer::new(
            zone.clone(),
            remote.clone(),
            store.clone(),
            conn_state.clone(),
            cache.clone(),
            master.clone(),
            sync_interval,
        ));

        let heartbeat = Arc::new(Heartbeat::new(zone.clone(), remote, heartbeat_interval));

        log::info!("{} access control is initializing", zone);

        Supervisor {
            zone,
            door: Arc::new(Mutex::new(door)),
            decision,
            swipe: Arc::new(Mutex::new(SwipeStateMachine::new())),
            decoder,
            store,
            synchronizer,
            heartbeat,
            readers: Mutex::new(readers),
            door_sensor: Mutex::new(door_sensor),
            rex: Mutex::new(rex),
            state: Mutex::new(SupervisorState::Init),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    /// Run until a `Shutdown` event arrives. Spawns one thread per reader,
    /// the Synchronizer, the Heartbeat, and the door-sensor/REX poll loop,
    /// then blocks on `events`.
    pub fn run(&self, events: Receiver<SupervisorEvent>) {
        *self.state.lock().unwrap() = SupervisorState::Running;
        log::info!("{} access control is online", self.zone);

        let sync = self.synchronizer.clone();
        thread::spawn(move || sync.run());

        let heartbeat = self.heartbeat.clone();
        let persistent_unlocked = self.door.lock().unwrap().shared_persistent_unlocked();
        thread::spawn(move || heartbeat.run(|| persistent_unlocked.load(Ordering::Acquire)));

        for reader in std::mem::take(&mut *self.readers.lock().unwrap()) {
            let rx = wiegand::spawn_reader(reader.name, reader.d0, reader.d1);
            self.spawn_decision_loop(rx);
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let door_sensor = self.door_sensor.lock().unwrap().take();
        let rex = self.rex.lock().unwrap().take();
        self.spawn_sensor_poll(stop_flag.clone(), door_sensor, rex);

        for event in events {
            match event {
                SupervisorEvent::Shutdown => break,
                SupervisorEvent::Reload => {
                    log::info!("{}: reload requested, triggering resync", self.zone);
                    self.synchronizer.trigger_now();
                }
                SupervisorEvent::DebugToggle => {
                    toggle_debug_level();
                }
            }
        }

        self.shutdown(stop_flag);
    }

    fn shutdown(&self, stop_flag: Arc<AtomicBool>) {
        *self.state.lock().unwrap() = SupervisorState::Stopping;
        stop_flag.store(true, Ordering::Release);
        self.synchronizer.stop();
        self.heartbeat.stop();
        self.heartbeat.send_offline();
        *self.state.lock().unwrap() = SupervisorState::Stopped;
        log::info!("{} access control is offline", self.zone);
    }

    /// One reader's decode → decide → act → log pipeline, run on its own
    /// thread for the lifetime of the process.
    fn spawn_decision_loop(&self, rx: std::sync::mpsc::Receiver<wiegand::RawRead>) {
        let decoder = self.decoder.clone();
        let decision = self.decision.clone();
        let swipe = self.swipe.clone();
        let door = self.door.clone();
        let store = self.store.clone();
        let zone = self.zone.clone();

        thread::spawn(move || {
            for raw in rx {
                let Some(read) = decoder.decode(&raw) else {
                    continue;
                };

                let outcome = decision.decide(&read);
                let now = Utc::now();

                match &outcome {
                    Decision::Grant { name } => {
                        let action = swipe.lock().unwrap().on_grant(&read.user_id, now);
                        match action {
                            SwipeAction::UnlockBriefly => {
                                // Runs on its own worker so the open_delay sleep never
                                // holds the door lock on this decision-loop thread.
                                let door = door.clone();
                                thread::spawn(move || door.lock().unwrap().unlock_briefly());
                            }
                            SwipeAction::AlreadyUnlocked => {
                                log::info!("{} entered (already unlocked)", name);
                            }
                            SwipeAction::ToggleUnlock => {
                                door.lock().unwrap().set_persistent_unlocked(true);
                                log::info!("{} UNLOCKED permanently by {}", zone, name);
                            }
                            SwipeAction::ToggleLock => {
                                door.lock().unwrap().set_persistent_unlocked(false);
                                log::info!("LOCKED by {}", name);
                            }
                        }
                    }
                    Decision::Deny { .. } => {
                        swipe.lock().unwrap().on_deny();
                        door.lock().unwrap().flash_denied();
                    }
                }

                let (granted, reason) = match &outcome {
                    Decision::Grant { .. } => (true, String::new()),
                    Decision::Deny { reason } => (false, reason.clone()),
                };
                let log_entry = AccessLogEntry {
                    timestamp: now,
                    user_id: read.user_id.clone(),
                    card_id: read.card_id.clone(),
                    facility: read.facility.clone(),
                    granted,
                    reason,
                    zone: zone.clone(),
                    ip: String::new(),
                };
                if let Err(e) = store.append_access_log(log_entry) {
                    log::warn!("failed to append access log: {}", e);
                }
            }
        });
    }

    /// REX presses and door-sensor transitions bypass the swipe machine and
    /// decision engine entirely (spec.md §4.7, §4.12).
    fn spawn_sensor_poll(&self, stop: Arc<AtomicBool>, door_sensor: Option<NamedInput>, rex: Option<NamedInput>) {
        if door_sensor.is_none() && rex.is_none() {
            return;
        }
        let door = self.door.clone();
        let store = self.store.clone();
        let zone = self.zone.clone();

        thread::spawn(move || {
            let mut door_sensor = door_sensor;
            let mut rex = rex;
            let mut last_open = door_sensor.as_ref().map(|d| d.line.is_high());

            while !stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));

                if let Some(sensor) = door_sensor.as_mut() {
                    let open = sensor.line.is_high();
                    if Some(open) != last_open {
                        last_open = Some(open);
                        let event_type = if open { DoorEventType::DoorOpened } else { DoorEventType::DoorClosed };
                        let _ = store.append_door_event(DoorEventEntry {
                            timestamp: Utc::now(),
                            event_type,
                            details: String::new(),
                            zone: zone.clone(),
                        });
                    }
                }

                if let Some(rex) = rex.as_mut() {
                    if rex.line.is_high() {
                        let door = door.clone();
                        thread::spawn(move || door.lock().unwrap().unlock_briefly());
                        let _ = store.append_door_event(DoorEventEntry {
                            timestamp: Utc::now(),
                            event_type: DoorEventType::RexActivated,
                            details: String::new(),
                            zone: zone.clone(),
                        });
                    }
                }
            }
        });
    }
}

/// Flip the installed log level between `Info` and `Debug` (SIGWINCH, spec
/// §6's "debug-toggle"), mirroring the original's module-global flip.
fn toggle_debug_level() {
    let current = log::max_level();
    let next = if current == log::LevelFilter::Debug {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Debug
    };
    log::set_max_level(next);
    log::info!("debug mode: {:?}", next);
}

/// Forward OS signals into a `SupervisorEvent` channel. SIGINT/SIGTERM map to
/// `Shutdown`; SIGHUP/SIGUSR2 (both "reload") map to `Reload`; SIGWINCH maps
/// to `DebugToggle`. Spawns its own thread and returns immediately.
#[cfg(unix)]
pub fn spawn_signal_forwarder(tx: Sender<SupervisorEvent>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR2, SIGWINCH};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGUSR2, SIGWINCH])?;
    thread::spawn(move || {
        for signal in signals.forever() {
            let event = match signal {
                SIGINT | SIGTERM => SupervisorEvent::Shutdown,
                SIGHUP | SIGUSR2 => SupervisorEvent::Reload,
                SIGWINCH => SupervisorEvent::DebugToggle,
                _ => continue,
            };
            if tx.send(event).is_err() {
                return;
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;
    use crate::gpio::TestLine;
    use crate::remote::FakeStore;
    use std::collections::HashMap;
    use std::sync::mpsc;

    fn zone_config() -> ZoneConfig {
        ZoneConfig {
            latch_gpio: 1,
            unlock_value: 1,
            open_delay: 0,
            door_sensor_gpio: None,
            rex_gpio: None,
            sqladdr: String::new(),
            sqluser: String::new(),
            sqlpass: String::new(),
            sqldb: String::new(),
            readers: HashMap::new(),
        }
    }

    #[test]
    fn reload_event_triggers_synchronizer_and_shutdown_parks_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            zone_name: "front".into(),
            zone: zone_config(),
            conf_dir: dir.path().to_path_buf(),
        };
        let door = DoorIO::new(
            Box::new(TestLine::new(false)),
            Box::new(TestLine::new(false)),
            Box::new(TestLine::new(false)),
            &config.zone,
        );
        let remote: Arc<dyn RemoteStore> = Arc::new(FakeStore::default());
        let supervisor = Supervisor::init(
            &config,
            door,
            Vec::new(),
            None,
            None,
            remote,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );

        let (tx, rx) = mpsc::channel();
        tx.send(SupervisorEvent::Reload).unwrap();
        tx.send(SupervisorEvent::Shutdown).unwrap();
        supervisor.run(rx);

        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }
}
