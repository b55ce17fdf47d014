pub mod aggregator;
pub mod broadcast;
pub mod classifier;
pub mod client;
pub mod collector;
mod error;
pub mod settings;
pub mod types;

pub use error::{Error, Result, is_skipped_slot, with_fixed_retry};
