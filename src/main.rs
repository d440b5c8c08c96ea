//! Access controller binary entry point: load configuration, claim GPIO
//! lines, and hand off to the `Supervisor` until a shutdown signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use access_controller::config::Config;
use access_controller::error::StartupError;
use access_controller::gpio::{DoorIO, NamedInput};
use access_controller::remote::{MysqlStore, RemoteStore};
use access_controller::supervisor::{self, ReaderHandles, Supervisor, SupervisorEvent};

/// The two status-indicator lines are fixed per controller, not configured
/// per zone (spec.md §6); mirrors the original's single fixed relay pin,
/// generalized to the pair this design needs.
const GRANTED_INDICATOR_GPIO: u8 = 5;
const DENIED_INDICATOR_GPIO: u8 = 6;

fn main() -> ExitCode {
    init_logging();

    let conf_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/access-controller"));

    match run(&conf_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal startup error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(conf_dir: &std::path::Path) -> Result<(), StartupError> {
    let config = Config::load(conf_dir)?;
    log::info!("loaded configuration for zone '{}'", config.zone_name);

    let (latch, granted, denied, readers, door_sensor, rex) = claim_gpio(&config)?;
    let door = DoorIO::new(latch, granted, denied, &config.zone);

    let remote: Arc<dyn RemoteStore> = Arc::new(MysqlStore::new(&config.zone));

    let sup = Supervisor::init(
        &config,
        door,
        readers,
        door_sensor,
        rex,
        remote,
        Duration::from_secs(3600),
        Duration::from_secs(60),
    );

    let (tx, rx) = mpsc::channel();
    if let Err(e) = supervisor::spawn_signal_forwarder(tx) {
        log::warn!("failed to install signal handlers: {}", e);
    }

    sup.run(rx);
    Ok(())
}

#[cfg(feature = "raspberry-pi")]
fn claim_gpio(
    config: &Config,
) -> Result<
    (
        Box<dyn access_controller::gpio::GpioOutput>,
        Box<dyn access_controller::gpio::GpioOutput>,
        Box<dyn access_controller::gpio::GpioOutput>,
        Vec<ReaderHandles>,
        Option<NamedInput>,
        Option<NamedInput>,
    ),
    StartupError,
> {
    use access_controller::gpio::rpi::{RpiInput, RpiOutput};

    let latch = RpiOutput::claim(config.zone.latch_gpio)?;
    let granted = RpiOutput::claim(GRANTED_INDICATOR_GPIO)?;
    let denied = RpiOutput::claim(DENIED_INDICATOR_GPIO)?;

    let mut readers = Vec::new();
    for (name, reader) in &config.zone.readers {
        let d0 = RpiInput::claim(reader.d0)?;
        let d1 = RpiInput::claim(reader.d1)?;
        readers.push(ReaderHandles {
            name: name.clone(),
            d0: NamedInput { name: format!("{name}-d0"), line: Box::new(d0) },
            d1: NamedInput { name: format!("{name}-d1"), line: Box::new(d1) },
        });
    }

    let door_sensor = config
        .zone
        .door_sensor_gpio
        .map(RpiInput::claim)
        .transpose()?
        .map(|line| NamedInput { name: "door-sensor".into(), line: Box::new(line) });
    let rex = config
        .zone
        .rex_gpio
        .map(RpiInput::claim)
        .transpose()?
        .map(|line| NamedInput { name: "rex".into(), line: Box::new(line) });

    Ok((Box::new(latch), Box::new(granted), Box::new(denied), readers, door_sensor, rex))
}

/// Without the `raspberry-pi` feature there is no real hardware backend;
/// refusing to start is the spec's fatal-on-GPIO-unavailable path (§7).
#[cfg(not(feature = "raspberry-pi"))]
fn claim_gpio(
    _config: &Config,
) -> Result<
    (
        Box<dyn access_controller::gpio::GpioOutput>,
        Box<dyn access_controller::gpio::GpioOutput>,
        Box<dyn access_controller::gpio::GpioOutput>,
        Vec<ReaderHandles>,
        Option<NamedInput>,
        Option<NamedInput>,
    ),
    StartupError,
> {
    Err(StartupError::Gpio(access_controller::error::GpioError::Claim {
        line: 0,
        reason: "built without the 'raspberry-pi' feature; no GPIO backend available".into(),
    }))
}

fn init_logging() {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_AUTH,
        hostname: None,
        process: "access-controller".into(),
        pid: std::process::id(),
    };
    match syslog::unix(formatter) {
        Ok(writer) => {
            let logger = syslog::BasicLogger::new(writer);
            if log::set_boxed_logger(Box::new(logger)).is_ok() {
                log::set_max_level(log::LevelFilter::Info);
                return;
            }
        }
        Err(e) => {
            eprintln!("syslog unavailable ({}), logging to stderr", e);
        }
    }
    env_logger_fallback();
}

/// Minimal stderr fallback when `/dev/log` isn't reachable (e.g. running
/// outside a real deployment); never block startup on the logging backend.
fn env_logger_fallback() {
    struct StderrLogger;
    impl log::Log for StderrLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }
        fn log(&self, record: &log::Record) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
        fn flush(&self) {}
    }
    if log::set_boxed_logger(Box::new(StderrLogger)).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}
