//! Storage layer for predictions, insights and votes.
//!
//! The traits define the abstract interface for storage backends; the
//! in-memory backend is the reference implementation.

mod memory;
mod traits;

pub use memory::{InMemoryInsightStore, InMemoryPredictionStore, InMemoryStores, InMemoryVoteStore};
pub use traits::{InsightStore, PredictionStore, StorageError, VoteStore};
