//! Periodically advertises liveness and lock state to the remote store
//! (spec.md §4.8). Failures are silent; a heartbeat must never interfere
//! with the decision path.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::remote::RemoteStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Heartbeat {
    zone: String,
    remote: Arc<dyn RemoteStore>,
    interval: Duration,
    stop: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn new(zone: String, remote: Arc<dyn RemoteStore>, interval: Duration) -> Self {
        Heartbeat {
            zone,
            remote,
            interval,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Run forever until `stop()`, sending one heartbeat per tick.
    /// `locked` reads the latch's current persistent-unlock flag.
    pub fn run(&self, locked: impl Fn() -> bool) {
        while !self.stop.load(Ordering::Acquire) {
            self.beat(locked(), HEARTBEAT_TIMEOUT);
            std::thread::sleep(self.interval);
        }
    }

    fn beat(&self, unlocked_persistent: bool, timeout: Duration) {
        let ip = local_ip();
        let result = self.remote.update_door_heartbeat(&self.zone, "online", &ip, !unlocked_persistent, timeout);
        if let Err(e) = result {
            log::debug!("heartbeat: failed to reach remote store: {}", e);
        }
    }

    /// One final `offline` update on clean shutdown; failure is swallowed.
    pub fn send_offline(&self) {
        let ip = local_ip();
        let _ = self
            .remote
            .update_door_heartbeat(&self.zone, "offline", &ip, true, SHUTDOWN_TIMEOUT);
    }
}

/// Best-effort local IP discovery: open a UDP "connection" to a well-known
/// address without sending anything, then read back the assigned source
/// address. Falls back to loopback if there's no route.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("1.1.1.1:53")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
