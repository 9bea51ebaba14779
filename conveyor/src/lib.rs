//! # Conveyor
//!
//! A concurrent, stage-based pipeline engine for processing large streams of
//! records through a user-assembled graph of transformation stages.
//!
//! Each [`stage::Stage`] consumes elements of one type, transforms them, and
//! broadcasts the results to its downstream consumers. Stages run as
//! independent tasks; a [`manager::StageManager`] dispatches them and
//! detects when the whole graph has drained. Once a stage's producers
//! announce that no further input will arrive, it processes what is left in
//! its queue and reports a [`result::StageResult`].
//!
//! ## Quick Start
//!
//! ```
//! use conveyor::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let doubler: Stage<i32, i32> = Stage::from_fn("double", |n: i32| Ok(n * 2));
//! let feed = doubler.inlet();
//!
//! let mut manager = StageManager::new();
//! manager.register(doubler);
//! let run = tokio::spawn(manager.run());
//!
//! for n in [1, 2, 3] {
//!     feed.send(n).await.unwrap();
//! }
//! feed.close();
//!
//! let outcome = run.await.unwrap();
//! assert!(outcome.is_success());
//! assert_eq!(outcome.processed_total(), 3);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod errors;
pub mod manager;
pub mod observability;
pub mod queue;
pub mod result;
pub mod stage;


/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ManagerConfig, StageConfig};
    pub use crate::errors::PipelineError;
    pub use crate::manager::{RunOutcome, StageManager, StageOutcome};
    pub use crate::observability::init_tracing;
    pub use crate::queue::{OverflowPolicy, StageInlet};
    pub use crate::result::{ElementFailure, ProcessTally, StageResult};
    pub use crate::stage::{FnProcessor, Processor, Stage, StageHandle, StageId};
}
