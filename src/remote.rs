//! The remote relational store, accessed through a narrow trait. Its own
//! schema and implementation are out of scope (spec.md §1); this module only
//! defines the contract the core consumes and a `mysql`-backed client.

use std::time::Duration;

use crate::config::ZoneConfig;
use crate::error::RemoteError;
use crate::storage::{CachedCard, DayWindow, Holiday, MasterCard, Schedule};
use crate::events::AccessLogEntry;

/// Everything the controller needs from the remote relational store,
/// matching the query families of spec.md §6. Every method takes an
/// explicit timeout so no card read can block indefinitely on the network.
pub trait RemoteStore: Send + Sync {
    fn fetch_cards_for_zone(&self, zone: &str, timeout: Duration) -> Result<Vec<(String, CachedCard)>, RemoteError>;
    fn fetch_schedules(&self, timeout: Duration) -> Result<Vec<(String, Schedule)>, RemoteError>;
    fn fetch_holidays(&self, timeout: Duration) -> Result<Vec<Holiday>, RemoteError>;
    fn fetch_master_cards(&self, timeout: Duration) -> Result<Vec<(String, MasterCard)>, RemoteError>;

    /// Single-card verification for the fail-open master path (spec.md
    /// §4.6 Step 1). `Ok(true)` means still active, `Ok(false)` revoked.
    fn verify_master_card(&self, card_key: &str, timeout: Duration) -> Result<bool, RemoteError>;

    /// Full lookup for the authoritative probe (spec.md §4.6 Step 2).
    fn lookup_card(&self, card_key: &str, timeout: Duration) -> Result<Option<CachedCard>, RemoteError>;

    fn push_access_log(&self, entry: &AccessLogEntry, timeout: Duration) -> Result<(), RemoteError>;

    fn update_door_heartbeat(
        &self,
        zone: &str,
        status: &str,
        ip: &str,
        locked: bool,
        timeout: Duration,
    ) -> Result<(), RemoteError>;
}

/// Opens a short-lived connection per call, mirroring the original
/// `pymysql.connect(...)` done inline in `lookup_card` rather than pooling.
/// Calls are already rate-limited by `Synchronizer`/`DecisionEngine`.
pub struct MysqlStore {
    opts: mysql::Opts,
}

impl MysqlStore {
    pub fn new(zone: &ZoneConfig) -> Self {
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(zone.sqladdr.clone()))
            .user(Some(zone.sqluser.clone()))
            .pass(Some(zone.sqlpass.clone()))
            .db_name(Some(zone.sqldb.clone()));
        MysqlStore { opts: opts.into() }
    }

    fn connect(&self, timeout: Duration) -> Result<mysql::Conn, RemoteError> {
        let mut opts = mysql::OptsBuilder::from_opts(self.opts.clone());
        opts = opts.tcp_connect_timeout(Some(timeout));
        mysql::Conn::new(opts).map_err(|e| RemoteError::Connection(e.to_string()))
    }
}

impl RemoteStore for MysqlStore {
    fn fetch_cards_for_zone(&self, zone: &str, timeout: Duration) -> Result<Vec<(String, CachedCard)>, RemoteError> {
        use mysql::prelude::Queryable;
        let mut conn = self.connect(timeout)?;
        let rows: Vec<(String, String, String, Option<String>, Option<String>, String, Option<i64>, Option<String>, Option<String>, Option<i64>)> = conn
            .query(
                "SELECT card_id, user_id, facility, firstname, lastname, doors, schedule_id, valid_from, valid_until, group_id \
                 FROM cards WHERE active = 1",
            )
            .map_err(|e| RemoteError::Query(e.to_string()))?;

        let mut result = Vec::new();
        for (card_id, user_id, facility, firstname, lastname, doors, schedule_id, valid_from, valid_until, group_id) in rows {
            if !door_list_contains(&doors, zone) {
                continue;
            }
            let key = format!("{},{}", facility, user_id);
            let card = CachedCard {
                card_id,
                firstname,
                lastname,
                doors,
                active: true,
                schedule_id,
                valid_from: valid_from.and_then(|s| s.parse().ok()),
                valid_until: valid_until.and_then(|s| s.parse().ok()),
                group_id,
            };
            result.push((key, card));
        }
        Ok(result)
    }

    fn fetch_schedules(&self, timeout: Duration) -> Result<Vec<(String, Schedule)>, RemoteError> {
        use mysql::prelude::Queryable;
        let mut conn = self.connect(timeout)?;
        type Row = (
            i64,
            bool,
            Option<String>, Option<String>,
            Option<String>, Option<String>,
            Option<String>, Option<String>,
            Option<String>, Option<String>,
            Option<String>, Option<String>,
            Option<String>, Option<String>,
            Option<String>, Option<String>,
        );
        let rows: Vec<Row> = conn
            .query(
                "SELECT id, is_24_7, \
                 monday_start, monday_end, tuesday_start, tuesday_end, \
                 wednesday_start, wednesday_end, thursday_start, thursday_end, \
                 friday_start, friday_end, saturday_start, saturday_end, \
                 sunday_start, sunday_end FROM access_schedules",
            )
            .map_err(|e| RemoteError::Query(e.to_string()))?;

        fn window(start: Option<String>, end: Option<String>) -> DayWindow {
            DayWindow {
                start: start.and_then(|s| s.parse().ok()),
                end: end.and_then(|s| s.parse().ok()),
            }
        }

        Ok(rows
            .into_iter()
            .map(|(id, is_24_7, mo_s, mo_e, tu_s, tu_e, we_s, we_e, th_s, th_e, fr_s, fr_e, sa_s, sa_e, su_s, su_e)| {
                let schedule = Schedule {
                    is_24_7,
                    monday: window(mo_s, mo_e),
                    tuesday: window(tu_s, tu_e),
                    wednesday: window(we_s, we_e),
                    thursday: window(th_s, th_e),
                    friday: window(fr_s, fr_e),
                    saturday: window(sa_s, sa_e),
                    sunday: window(su_s, su_e),
                };
                (id.to_string(), schedule)
            })
            .collect())
    }

    fn fetch_holidays(&self, timeout: Duration) -> Result<Vec<Holiday>, RemoteError> {
        use mysql::prelude::Queryable;
        let mut conn = self.connect(timeout)?;
        let rows: Vec<(String, String, bool, bool)> = conn
            .query("SELECT date, name, access_denied, recurring FROM holidays")
            .map_err(|e| RemoteError::Query(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|(date, name, access_denied, recurring)| {
                date.parse().ok().map(|date| Holiday {
                    date,
                    recurring,
                    access_denied,
                    name,
                })
            })
            .collect())
    }

    fn fetch_master_cards(&self, timeout: Duration) -> Result<Vec<(String, MasterCard)>, RemoteError> {
        use mysql::prelude::Queryable;
        let mut conn = self.connect(timeout)?;
        let rows: Vec<(String, String, String, String, bool)> = conn
            .query("SELECT card_id, user_id, facility, description, active FROM master_cards")
            .map_err(|e| RemoteError::Query(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter(|(_, _, _, _, active)| *active)
            .map(|(card_id, user_id, facility, description, _)| {
                let key = format!("{},{}", facility, user_id);
                (
                    key,
                    MasterCard {
                        card_id,
                        facility,
                        user_id,
                        description,
                    },
                )
            })
            .collect())
    }

    fn verify_master_card(&self, card_key: &str, timeout: Duration) -> Result<bool, RemoteError> {
        use mysql::prelude::Queryable;
        let (facility, user_id) = split_card_key(card_key)?;
        let mut conn = self.connect(timeout)?;
        let active: Option<bool> = conn
            .exec_first(
                "SELECT active FROM master_cards WHERE facility = ? AND user_id = ?",
                (facility, user_id),
            )
            .map_err(|e| RemoteError::Query(e.to_string()))?;
        Ok(active.unwrap_or(false))
    }

    fn lookup_card(&self, card_key: &str, timeout: Duration) -> Result<Option<CachedCard>, RemoteError> {
        use mysql::prelude::Queryable;
        let (facility, user_id) = split_card_key(card_key)?;
        let mut conn = self.connect(timeout)?;
        let row: Option<(String, Option<String>, Option<String>, String, bool, Option<i64>, Option<String>, Option<String>, Option<i64>)> = conn
            .exec_first(
                "SELECT card_id, firstname, lastname, doors, active, schedule_id, valid_from, valid_until, group_id \
                 FROM cards WHERE facility = ? AND user_id = ?",
                (facility, user_id),
            )
            .map_err(|e| RemoteError::Query(e.to_string()))?;
        Ok(row.map(
            |(card_id, firstname, lastname, doors, active, schedule_id, valid_from, valid_until, group_id)| CachedCard {
                card_id,
                firstname,
                lastname,
                doors,
                active,
                schedule_id,
                valid_from: valid_from.and_then(|s| s.parse().ok()),
                valid_until: valid_until.and_then(|s| s.parse().ok()),
                group_id,
            },
        ))
    }

    fn push_access_log(&self, entry: &AccessLogEntry, timeout: Duration) -> Result<(), RemoteError> {
        use mysql::prelude::Queryable;
        let mut conn = self.connect(timeout)?;
        conn.exec_drop(
            "INSERT INTO logs (user_id, Date, Granted, Location, doorip) VALUES (?, ?, ?, ?, ?)",
            (&entry.user_id, entry.timestamp.to_rfc3339(), entry.granted, &entry.zone, &entry.ip),
        )
        .map_err(|e| RemoteError::Query(e.to_string()))
    }

    fn update_door_heartbeat(
        &self,
        zone: &str,
        status: &str,
        ip: &str,
        locked: bool,
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        use mysql::prelude::Queryable;
        let mut conn = self.connect(timeout)?;
        conn.exec_drop(
            "UPDATE doors SET status = ?, last_seen = NOW(), ip_address = ?, locked = ? WHERE name = ?",
            (status, ip, locked, zone),
        )
        .map_err(|e| RemoteError::Query(e.to_string()))
    }
}

fn split_card_key(card_key: &str) -> Result<(String, String), RemoteError> {
    let mut parts = card_key.splitn(2, ',');
    let facility = parts.next().ok_or_else(|| RemoteError::Query("malformed card key".into()))?;
    let user_id = parts.next().ok_or_else(|| RemoteError::Query("malformed card key".into()))?;
    Ok((facility.to_string(), user_id.to_string()))
}

/// Strict comma-delimited membership: `"main"` must not match
/// `"maintenance"` (spec.md §4.5 step 2 / Testable Property 3).
pub fn door_list_contains(doors: &str, zone: &str) -> bool {
    doors == "*" || doors.split(',').any(|token| token == zone)
}

/// In-memory double used by `DecisionEngine`/`Synchronizer`/`Heartbeat`
/// tests. `unreachable` simulates a down remote store without any network.
#[derive(Default)]
pub struct FakeStore {
    pub unreachable: std::sync::atomic::AtomicBool,
    pub cards: std::sync::Mutex<std::collections::HashMap<String, CachedCard>>,
    pub schedules: std::sync::Mutex<std::collections::HashMap<String, Schedule>>,
    pub holidays: std::sync::Mutex<Vec<Holiday>>,
    pub master_cards: std::sync::Mutex<std::collections::HashMap<String, MasterCard>>,
    pub pushed_logs: std::sync::Mutex<Vec<AccessLogEntry>>,
    pub heartbeats: std::sync::Mutex<Vec<(String, bool)>>,
}

impl FakeStore {
    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(std::sync::atomic::Ordering::Acquire) {
            Err(RemoteError::Connection("fake store marked unreachable".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteStore for FakeStore {
    fn fetch_cards_for_zone(&self, zone: &str, _timeout: Duration) -> Result<Vec<(String, CachedCard)>, RemoteError> {
        self.check_reachable()?;
        Ok(self
            .cards
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, card)| card.active && door_list_contains(&card.doors, zone))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn fetch_schedules(&self, _timeout: Duration) -> Result<Vec<(String, Schedule)>, RemoteError> {
        self.check_reachable()?;
        Ok(self.schedules.lock().unwrap().clone().into_iter().collect())
    }

    fn fetch_holidays(&self, _timeout: Duration) -> Result<Vec<Holiday>, RemoteError> {
        self.check_reachable()?;
        Ok(self.holidays.lock().unwrap().clone())
    }

    fn fetch_master_cards(&self, _timeout: Duration) -> Result<Vec<(String, MasterCard)>, RemoteError> {
        self.check_reachable()?;
        Ok(self.master_cards.lock().unwrap().clone().into_iter().collect())
    }

    fn verify_master_card(&self, card_key: &str, _timeout: Duration) -> Result<bool, RemoteError> {
        self.check_reachable()?;
        Ok(self.master_cards.lock().unwrap().contains_key(card_key))
    }

    fn lookup_card(&self, card_key: &str, _timeout: Duration) -> Result<Option<CachedCard>, RemoteError> {
        self.check_reachable()?;
        Ok(self.cards.lock().unwrap().get(card_key).cloned())
    }

    fn push_access_log(&self, entry: &AccessLogEntry, _timeout: Duration) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.pushed_logs.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn update_door_heartbeat(
        &self,
        _zone: &str,
        status: &str,
        _ip: &str,
        locked: bool,
        _timeout: Duration,
    ) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.heartbeats.lock().unwrap().push((status.to_string(), locked));
        Ok(())
    }
}
