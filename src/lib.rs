pub mod anchors;
pub mod classifier;
pub mod config;
pub mod constitutive;
pub mod constraints;
pub mod datatypes;
pub mod driver;
pub mod error;
pub mod input;
pub mod logger;
pub mod pipeline;
pub mod post_processor;
pub mod solver;
pub mod spatial;
pub mod stages;

pub use config::PipelineConfig;
pub use driver::{AnalysisReport, CancellationToken, StageSolver};
pub use error::{Result, RunFailure, StagingError, Warning, WarningSummary};
pub use pipeline::{prepare, run, Prepared};
