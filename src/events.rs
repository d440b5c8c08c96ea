//! Log entry types persisted by `CacheStore::append_access_log` /
//! `append_door_event`, matching the on-disk schemas of spec.md §6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One access-attempt record, appended on every grant or deny.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub card_id: String,
    pub facility: String,
    pub granted: bool,
    pub reason: String,
    pub zone: String,
    pub ip: String,
}

/// Door-related events that aren't card decisions: sensor transitions, REX
/// presses, and the persistent lock/unlock toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorEventType {
    DoorOpened,
    DoorClosed,
    RexActivated,
    Lock,
    Unlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorEventEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: DoorEventType,
    pub details: String,
    pub zone: String,
}

/// Append `entry` to `ring`, dropping the oldest entries past `cap`.
pub fn ring_push<T>(ring: &mut Vec<T>, entry: T, cap: usize) {
    ring.push(entry);
    if ring.len() > cap {
        let drop = ring.len() - cap;
        ring.drain(0..drop);
    }
}
