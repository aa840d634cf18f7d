pub mod engine;
pub mod jobs;

pub use engine::{QueryContext, QueryEngine, QueryError, ResultSet, SqlBatch, SqlParam, SqlStatement};
pub use jobs::{DrainOutcome, Job, JobId, JobRegistry};
