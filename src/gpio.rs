//! GPIO seam: input/output line traits, a Raspberry Pi backend, and an
//! in-memory test double. Mirrors the teacher's `esp_hal::gpio::{Input,
//! Output}` polymorphism, generalized to a trait so tests never touch real
//! hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::ZoneConfig;
use crate::error::GpioError;

/// A single output line: latch relay or status LED.
pub trait GpioOutput: Send {
    fn set_high(&mut self);
    fn set_low(&mut self);
}

/// A single input line: Wiegand D0/D1, door sensor, REX button.
pub trait GpioInput: Send {
    fn is_high(&self) -> bool;
}

/// Active-low/active-high polarity, resolved once at startup from
/// `unlock_value` the way the original `active()` helper reads it per-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    fn from_unlock_value(unlock_value: u8) -> Self {
        if unlock_value == 0 {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        }
    }

    fn locked_level(self) -> bool {
        matches!(self, Polarity::ActiveLow)
    }

    fn unlocked_level(self) -> bool {
        !self.locked_level()
    }
}

/// Drives the latch relay plus the granted/denied indicator lines for one
/// zone. `unlocked_persistent` is advisory state the DecisionEngine and
/// Heartbeat read directly (spec.md §4.4).
pub struct DoorIO {
    latch: Box<dyn GpioOutput>,
    granted_indicator: Box<dyn GpioOutput>,
    denied_indicator: Box<dyn GpioOutput>,
    polarity: Polarity,
    open_delay: Duration,
    persistent_unlocked: Arc<AtomicBool>,
}

impl DoorIO {
    pub fn new(
        latch: Box<dyn GpioOutput>,
        granted_indicator: Box<dyn GpioOutput>,
        denied_indicator: Box<dyn GpioOutput>,
        zone: &ZoneConfig,
    ) -> Self {
        let polarity = Polarity::from_unlock_value(zone.unlock_value);
        let mut io = DoorIO {
            latch,
            granted_indicator,
            denied_indicator,
            polarity,
            open_delay: zone.open_delay(),
            persistent_unlocked: Arc::new(AtomicBool::new(false)),
        };
        io.lock();
        io
    }

    /// Latch to `unlock_value XOR 1`, granted indicator off, denied on.
    /// A no-op while persistently unlocked; the triple-swipe toggle owns
    /// the latch state until toggled back.
    pub fn lock(&mut self) {
        if self.persistent_unlocked.load(Ordering::Acquire) {
            return;
        }
        self.drive_locked();
    }

    fn drive_locked(&mut self) {
        self.drive_latch(self.polarity.locked_level());
        self.granted_indicator.set_low();
        self.denied_indicator.set_high();
    }

    fn drive_unlocked(&mut self) {
        self.drive_latch(self.polarity.unlocked_level());
        self.granted_indicator.set_high();
        self.denied_indicator.set_low();
    }

    fn drive_latch(&mut self, high: bool) {
        if high {
            self.latch.set_high();
        } else {
            self.latch.set_low();
        }
    }

    /// Unconditional unlock (the complement of `lock`); used for the "Master"
    /// grant path and when toggling into persistent-unlock.
    pub fn unlock(&mut self) {
        self.drive_unlocked();
    }

    /// Unlock for `open_delay`, then relock, unless persistent-unlock mode
    /// was engaged or disengaged while waiting, in which case the final
    /// state reflects that instead of blindly relocking. Intended to run on
    /// its own worker thread so it never blocks the decision path.
    pub fn unlock_briefly(&mut self) {
        self.drive_unlocked();
        thread::sleep(self.open_delay);
        self.lock();
    }

    /// A clone of the persistent-unlock flag that callers can poll without
    /// taking the `DoorIO` lock, so a reader like Heartbeat never blocks for
    /// the duration of an `unlock_briefly` sleep held by another thread.
    pub fn shared_persistent_unlocked(&self) -> Arc<AtomicBool> {
        self.persistent_unlocked.clone()
    }

    /// Pulse the denied indicator three times at ~10 Hz.
    pub fn flash_denied(&mut self) {
        for _ in 0..3 {
            self.denied_indicator.set_low();
            thread::sleep(Duration::from_millis(50));
            self.denied_indicator.set_high();
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Flip persistent-unlock mode (the repeat-swipe toggle). When entering
    /// persistent mode the latch is driven unlocked immediately; leaving it
    /// relocks immediately.
    pub fn set_persistent_unlocked(&mut self, unlocked: bool) {
        self.persistent_unlocked.store(unlocked, Ordering::Release);
        if unlocked {
            self.drive_unlocked();
        } else {
            self.drive_locked();
        }
    }

    pub fn is_persistent_unlocked(&self) -> bool {
        self.persistent_unlocked.load(Ordering::Acquire)
    }
}

/// An input line paired with a name, for logging.
pub struct NamedInput {
    pub name: String,
    pub line: Box<dyn GpioInput>,
}

#[cfg(feature = "raspberry-pi")]
pub mod rpi {
    use super::{GpioError, GpioInput, GpioOutput};
    use rppal::gpio::{Gpio, InputPin, Level, OutputPin};

    pub struct RpiOutput(OutputPin);

    impl RpiOutput {
        pub fn claim(line: u8) -> Result<Self, GpioError> {
            let pin = Gpio::new()
                .map_err(|e| GpioError::Claim { line, reason: e.to_string() })?
                .get(line)
                .map_err(|e| GpioError::Claim { line, reason: e.to_string() })?
                .into_output();
            Ok(RpiOutput(pin))
        }
    }

    impl GpioOutput for RpiOutput {
        fn set_high(&mut self) {
            self.0.set_high();
        }
        fn set_low(&mut self) {
            self.0.set_low();
        }
    }

    pub struct RpiInput(InputPin);

    impl RpiInput {
        pub fn claim(line: u8) -> Result<Self, GpioError> {
            let pin = Gpio::new()
                .map_err(|e| GpioError::Claim { line, reason: e.to_string() })?
                .get(line)
                .map_err(|e| GpioError::Claim { line, reason: e.to_string() })?
                .into_input();
            Ok(RpiInput(pin))
        }
    }

    impl GpioInput for RpiInput {
        fn is_high(&self) -> bool {
            self.0.read() == Level::High
        }
    }
}

/// In-memory test double for both directions, shared via `Arc` so tests can
/// observe what a thread drove onto the "pin".
#[derive(Clone, Default)]
pub struct TestLine {
    state: Arc<AtomicBool>,
}

impl TestLine {
    pub fn new(initial: bool) -> Self {
        TestLine {
            state: Arc::new(AtomicBool::new(initial)),
        }
    }

    pub fn get(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.state.store(value, Ordering::Release);
    }
}

impl GpioOutput for TestLine {
    fn set_high(&mut self) {
        self.state.store(true, Ordering::Release);
    }
    fn set_low(&mut self) {
        self.state.store(false, Ordering::Release);
    }
}

impl GpioInput for TestLine {
    fn is_high(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(unlock_value: u8) -> ZoneConfig {
        ZoneConfig {
            latch_gpio: 1,
            unlock_value,
            open_delay: 0,
            door_sensor_gpio: None,
            rex_gpio: None,
            sqladdr: String::new(),
            sqluser: String::new(),
            sqlpass: String::new(),
            sqldb: String::new(),
            readers: Default::default(),
        }
    }

    fn door(latch: TestLine, unlock_value: u8) -> (DoorIO, TestLine, TestLine) {
        let granted = TestLine::new(false);
        let denied = TestLine::new(false);
        let io = DoorIO::new(
            Box::new(latch),
            Box::new(granted.clone()),
            Box::new(denied.clone()),
            &zone(unlock_value),
        );
        (io, granted, denied)
    }

    #[test]
    fn active_high_starts_locked_low_with_denied_lit() {
        let line = TestLine::new(true);
        let (_door, granted, denied) = door(line.clone(), 1);
        assert!(!line.get());
        assert!(!granted.get());
        assert!(denied.get());
    }

    #[test]
    fn active_low_starts_locked_high() {
        let line = TestLine::new(false);
        let (_door, ..) = door(line.clone(), 0);
        assert!(line.get());
    }

    #[test]
    fn unlock_briefly_then_relocks() {
        let line = TestLine::new(false);
        let (mut door, granted, denied) = door(line.clone(), 1);
        door.unlock_briefly();
        assert!(!line.get());
        assert!(!granted.get());
        assert!(denied.get());
    }

    #[test]
    fn persistent_unlock_survives_lock_calls() {
        let line = TestLine::new(false);
        let (mut door, ..) = door(line.clone(), 1);
        door.set_persistent_unlocked(true);
        assert!(line.get());
        door.lock();
        assert!(line.get(), "lock() must not override persistent unlock");
        door.set_persistent_unlocked(false);
        assert!(!line.get());
    }

    #[test]
    fn flash_denied_ends_with_denied_indicator_lit() {
        let line = TestLine::new(false);
        let (mut door, _granted, denied) = door(line, 1);
        door.flash_denied();
        assert!(denied.get());
    }
}
