//! Startup configuration: `zone.json` + `config.json`, loaded once and
//! handed to every component. A parse failure here is fatal (spec.md §7).

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// `zone.json`: just names which key of `config.json` applies to this box.
#[derive(Debug, Deserialize)]
struct ZoneFile {
    zone: String,
}

/// A single Wiegand reader's two GPIO lines, keyed by its name in
/// `config.json` (any object with `d0`/`d1` fields counts as a reader).
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    pub d0: u8,
    pub d1: u8,
}

/// The zone-specific block of `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub latch_gpio: u8,
    pub unlock_value: u8,
    pub open_delay: u64,
    pub door_sensor_gpio: Option<u8>,
    pub rex_gpio: Option<u8>,
    pub sqladdr: String,
    pub sqluser: String,
    pub sqlpass: String,
    pub sqldb: String,
    #[serde(flatten)]
    pub readers: HashMap<String, ReaderConfig>,
}

impl ZoneConfig {
    pub fn open_delay(&self) -> Duration {
        Duration::from_secs(self.open_delay)
    }
}

/// Fields `flatten`ed alongside readers that are not themselves readers;
/// `serde(flatten)` would otherwise try to parse these as a `ReaderConfig`.
/// Kept explicit above instead of relying on `deny_unknown_fields` tricks.
#[derive(Debug, Deserialize)]
struct ConfigFile(HashMap<String, ZoneConfig>);

/// Fully loaded configuration for this controller instance.
pub struct Config {
    pub zone_name: String,
    pub zone: ZoneConfig,
    pub conf_dir: PathBuf,
}

impl Config {
    /// Load `zone.json` and `config.json` from `conf_dir`. Any I/O or parse
    /// error, or a zone name absent from `config.json`, is returned.
    /// Callers at the top (main.rs) treat this as fatal per spec.md §7.
    pub fn load(conf_dir: &Path) -> Result<Self, ConfigError> {
        let zone_file: ZoneFile = read_json(&conf_dir.join("zone.json"))?;
        let mut config_file: ConfigFile = read_json(&conf_dir.join("config.json"))?;

        let zone = config_file
            .0
            .remove(&zone_file.zone)
            .ok_or_else(|| ConfigError::UnknownZone(zone_file.zone.clone()))?;

        Ok(Config {
            zone_name: zone_file.zone,
            zone,
            conf_dir: conf_dir.to_path_buf(),
        })
    }

    pub fn formats_path(&self) -> PathBuf {
        self.conf_dir.join("formats.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.conf_dir.join("cache")
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn loads_zone_matching_config_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zone.json", r#"{"zone": "front"}"#);
        write(
            dir.path(),
            "config.json",
            r#"{
                "front": {
                    "latch_gpio": 17,
                    "unlock_value": 1,
                    "open_delay": 5,
                    "sqladdr": "db.local",
                    "sqluser": "u",
                    "sqlpass": "p",
                    "sqldb": "doors",
                    "main_reader": {"d0": 23, "d1": 24}
                }
            }"#,
        );

        let cfg = Config::load(dir.path()).expect("should load");
        assert_eq!(cfg.zone_name, "front");
        assert_eq!(cfg.zone.latch_gpio, 17);
        assert_eq!(cfg.zone.readers["main_reader"].d0, 23);
        assert_eq!(cfg.zone.open_delay(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_zone_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zone.json", r#"{"zone": "back"}"#);
        write(dir.path(), "config.json", r#"{"front": {}}"#);

        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownZone(z) if z == "back"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zone.json", "not json");
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
