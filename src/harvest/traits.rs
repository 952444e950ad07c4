//! Stage abstraction shared by the CPU-bound steps of the pair pipeline.
//!
//! Extraction and consolidation run synchronously inside each pair task;
//! both implement [`HarvestStage`] so the coordinator can chain them and log
//! them uniformly.

// ============================================================================
// Pipeline Trait
// ============================================================================

/// Generic pipeline stage that transforms Input → Output.
///
/// # Idempotence
///
/// Implementations must be deterministic for a given input apart from
/// generated record identifiers: the coordinator relies on a re-run of the
/// same payload producing the same natural keys.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync`. Stages carry no state, so the
/// coordinator builds a fresh instance inside each pair task.
pub trait HarvestStage: Send + Sync {
    /// Input type consumed by this stage
    type Input;

    /// Output type produced by this stage
    type Output;

    /// Error type for stage failures
    type Error: std::error::Error + Send + Sync + 'static;

    /// Executes the stage.
    ///
    /// # Errors
    ///
    /// Returns `Err` only when the whole input is unusable. Partial damage
    /// (a bad series, a bad observation) is skipped, not reported.
    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;

    /// Returns a human-readable name for this stage, used in log fields.
    fn stage_name(&self) -> &'static str;
}
