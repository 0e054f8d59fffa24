pub mod backfill;
pub mod catalog;
pub mod compactor;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod layout;
pub mod metadata;
pub mod options;
pub mod output;
pub mod planner;
pub mod storage;

pub use engine::{CompactOutcome, Engine, EngineSettings, QueryResponse};
pub use error::CellStoreError;
