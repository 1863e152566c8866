pub mod engine;
pub mod policy;
pub mod worker;

pub use engine::{ExtractionEngine, ExtractionFailure, ProgressReporter};
pub use policy::{check_consistency, initial_state, next_state, QualityPolicy, TierEvent, TierState};
pub use worker::{recover_in_flight, Job, JobQueue, WorkerPool};
