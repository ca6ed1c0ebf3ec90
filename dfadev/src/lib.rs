//! A character-device style engine running a configurable DFA over a byte stream.
//!
//! The engine keeps one process-wide [`automaton::Automaton`]: control commands configure it,
//! writes advance it and reads report `Y`/`N` for the run so far. Its store survives a live
//! upgrade of the serving process through [`upgrade`].

pub mod automaton;
pub mod client;
pub mod command;
pub mod engine;
pub mod error;
pub mod http;
pub mod persist;
pub mod snapshot;
pub mod upgrade;

pub use client::Device;
pub use command::Command;
pub use engine::Engine;
pub use error::{Error, Result};
