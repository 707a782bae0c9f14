#![warn(clippy::pedantic)]
// Doc lints would require annotating most pub functions.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Timestamps, byte sizes and backoff math cast between widths on purpose.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod channels;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod debounce;
pub mod dedup;
pub(crate) mod delivery;
pub mod errors;
pub mod events;
pub mod gateway;
pub(crate) mod notify;
pub mod pipeline;
pub mod sequencer;
pub mod store;
pub mod tenant;
pub mod transcription;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
