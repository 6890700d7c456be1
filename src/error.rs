use thiserror::Error;

/// Failure taxonomy for the statistical pipeline. Orchestration code wraps
/// these in `anyhow` but callers can still downcast to decide whether an
/// assignment should be skipped (empty data) or the batch surfaced an actual
/// defect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    /// No similarity facts exist for the assignment, so population statistics
    /// are undefined.
    #[error("no similarity scores available to compute statistics")]
    EmptyPopulation,

    /// A per-student sample was empty, or the finite-population correction was
    /// requested with a population no larger than the sample.
    #[error("invalid sample size: n={n}, population={population}")]
    InvalidSampleSize { n: usize, population: usize },

    /// No professor could be resolved for an assignment, so flags would have
    /// no owner.
    #[error("no professor found to own flags for this assignment")]
    MissingProfessorContext,
}
