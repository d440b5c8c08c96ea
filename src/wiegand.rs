//! Wiegand bit accumulation: polls a reader's D0/D1 lines on a dedicated
//! thread, timing out the inter-bit gap, and hands the finished bitstring
//! off through a channel for format validation outside the hot loop.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::formats::{CardRead, FormatRegistry};
use crate::gpio::NamedInput;

/// Gap between bits that ends a read. 100ms is generous relative to the
/// microsecond-scale pulses a real reader emits, which is the point: any
/// longer idle means the card is done, not that the bus is slow.
const BIT_GAP_TIMEOUT: Duration = Duration::from_millis(100);

/// How often the poll loop samples the D0/D1 lines while idle.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// A completed read handed from the poll thread to the decoder.
#[derive(Debug, Clone)]
pub struct RawRead {
    pub reader_name: String,
    pub bitstring: String,
}

/// Accumulates bits for one reader. Runs on its own thread; never shares
/// state with other readers.
pub struct WiegandAccumulator {
    name: String,
    d0: Box<dyn FnMut() -> bool + Send>,
    d1: Box<dyn FnMut() -> bool + Send>,
}

impl WiegandAccumulator {
    pub fn new(name: String, d0: NamedInput, d1: NamedInput) -> Self {
        let mut d0 = d0.line;
        let mut d1 = d1.line;
        WiegandAccumulator {
            name,
            d0: Box::new(move || d0.is_high()),
            d1: Box::new(move || d1.is_high()),
        }
    }

    /// Run forever, sending each completed bitstring to `tx`. Call this on
    /// a spawned thread, one per reader.
    pub fn run(mut self, tx: Sender<RawRead>) {
        let mut bits = String::new();
        let mut last_bit_at = Instant::now();
        let mut prev_d0 = (self.d0)();
        let mut prev_d1 = (self.d1)();

        loop {
            thread::sleep(POLL_INTERVAL);
            let d0 = (self.d0)();
            let d1 = (self.d1)();

            // Idle-high bus; a falling edge on exactly one line is one bit.
            if prev_d0 && !d0 && d1 {
                bits.push('0');
                last_bit_at = Instant::now();
            } else if prev_d1 && !d1 && d0 {
                bits.push('1');
                last_bit_at = Instant::now();
            }
            prev_d0 = d0;
            prev_d1 = d1;

            if !bits.is_empty() && last_bit_at.elapsed() >= BIT_GAP_TIMEOUT {
                let read = RawRead {
                    reader_name: self.name.clone(),
                    bitstring: std::mem::take(&mut bits),
                };
                if tx.send(read).is_err() {
                    return;
                }
            }
        }
    }
}

/// Spawn one accumulator thread and return the receiver its reads arrive on.
pub fn spawn_reader(name: String, d0: NamedInput, d1: NamedInput) -> Receiver<RawRead> {
    let (tx, rx) = mpsc::channel();
    let acc = WiegandAccumulator::new(name, d0, d1);
    thread::Builder::new()
        .name(format!("wiegand-{}", acc.name))
        .spawn(move || acc.run(tx))
        .expect("failed to spawn wiegand accumulator thread");
    rx
}

/// Decodes raw bitstrings from any number of readers against the format
/// catalogue. Stateless beyond the catalogue itself, so it can live outside
/// any per-reader lock.
pub struct WiegandDecoder {
    formats: FormatRegistry,
}

impl WiegandDecoder {
    pub fn new(formats: FormatRegistry) -> Self {
        WiegandDecoder { formats }
    }

    /// Validate one raw read. Returns `None` (and logs at `debug`, per the
    /// original's noisy-reader handling) on bad parity, unknown length, or
    /// malformed bits. Never panics on reader noise.
    pub fn decode(&self, raw: &RawRead) -> Option<CardRead> {
        match self.formats.validate(&raw.bitstring, &raw.reader_name) {
            Some(read) => Some(read),
            None => {
                log::debug!(
                    "wiegand: unrecognized read on {} ({} bits)",
                    raw.reader_name,
                    raw.bitstring.len()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{NamedInput, TestLine};
    use std::sync::mpsc;

    /// Drives a pair of test lines through the falling-edge sequence for one
    /// bit, as `WiegandAccumulator::run` expects to observe it.
    fn pulse_bit(d0: &TestLine, d1: &TestLine, value: char) {
        d0.set(true);
        d1.set(true);
        thread::sleep(Duration::from_micros(200));
        if value == '0' {
            d0.set(false);
        } else {
            d1.set(false);
        }
        thread::sleep(Duration::from_micros(200));
        d0.set(true);
        d1.set(true);
    }

    #[test]
    fn accumulates_bits_until_gap_timeout() {
        let d0 = TestLine::new(true);
        let d1 = TestLine::new(true);
        let acc = WiegandAccumulator::new(
            "test".into(),
            NamedInput { name: "d0".into(), line: Box::new(d0.clone()) },
            NamedInput { name: "d1".into(), line: Box::new(d1.clone()) },
        );

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || acc.run(tx));

        for bit in "101".chars() {
            pulse_bit(&d0, &d1, bit);
            thread::sleep(Duration::from_millis(2));
        }

        let raw = rx.recv_timeout(Duration::from_millis(500)).expect("a read");
        assert_eq!(raw.bitstring, "101");
        assert_eq!(raw.reader_name, "test");
        drop(handle);
    }

    #[test]
    fn decoder_rejects_garbage_and_logs_rather_than_panics() {
        let decoder = WiegandDecoder::new(FormatRegistry::standard());
        let raw = RawRead {
            reader_name: "front-door".into(),
            bitstring: "101".into(),
        };
        assert!(decoder.decode(&raw).is_none());
    }
}
