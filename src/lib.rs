pub mod builder;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod feature;
pub mod index;
mod metrics;
pub mod sidecar;
pub mod state;
pub mod utils;
pub mod verify;
pub mod vlad;
pub mod vocab;

pub use config::Opts;
pub use engine::{Candidate, Engine, EngineBuilder, RebuildReport};
