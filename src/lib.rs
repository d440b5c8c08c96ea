//! Wiegand door access controller: decoding, the fail-secure/fail-open
//! decision engine, offline-capable synchronization, and the supervisor
//! that wires it all to hardware.

pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod formats;
pub mod gpio;
pub mod heartbeat;
pub mod remote;
pub mod storage;
pub mod supervisor;
pub mod swipe;
pub mod sync;
pub mod wiegand;
