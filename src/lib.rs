//! focusfield - Acoustic lens for conferencing
//!
//! Realtime sensor-fusion core: an in-process pub/sub bus, an SRP-PHAT
//! direction-of-arrival estimator, audio-visual association, a hysteretic
//! target-lock state machine, and a delay-and-sum beamformer, emitting one
//! enhanced monaural stream.

pub mod beamform;
pub mod bus;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod doa;
pub mod error;
pub mod fusion;
pub mod health;
pub mod messages;
pub mod runtime;
pub mod sink;
pub mod wire;

pub use config::Config;
pub use error::{FocusFieldError, Result};
pub use runtime::{Runtime, RuntimeHandle};
