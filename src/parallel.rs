//! Parallel Operation Combinator
//!
//! Runs a batch of endpoint operations concurrently and judges the batch
//! against a configurable success policy once every operation has settled.
//! Issued operations are always awaited to completion, never aborted early;
//! an archive must not be left at an indeterminate offset by a cancelled
//! write.

use futures::future::join_all;
use std::future::Future;

use crate::error::Result;

// =============================================================================
// Success Policies
// =============================================================================

/// How many of a batch of parallel operations must succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessPolicy {
    /// Every operation must succeed
    All,
    /// At least one operation must succeed
    Any,
    /// At least `n` operations must succeed
    AtLeast(usize),
}

impl SuccessPolicy {
    fn required(&self, total: usize) -> usize {
        match self {
            SuccessPolicy::All => total,
            SuccessPolicy::Any => 1.min(total),
            SuccessPolicy::AtLeast(n) => *n,
        }
    }
}

// =============================================================================
// Combinators
// =============================================================================

/// Run all operations concurrently and return their results in input order.
pub async fn run_all<T, F>(ops: Vec<F>) -> Vec<Result<T>>
where
    F: Future<Output = Result<T>>,
{
    join_all(ops).await
}

/// Run all operations concurrently and resolve once the policy is met.
///
/// Returns the per-operation results in input order, or the first failure
/// (in input order) when too few operations succeeded.
pub async fn run_with_policy<T, F>(ops: Vec<F>, policy: SuccessPolicy) -> Result<Vec<Result<T>>>
where
    F: Future<Output = Result<T>>,
{
    let total = ops.len();
    let results = run_all(ops).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    if succeeded >= policy.required(total) {
        return Ok(results);
    }
    match results.into_iter().find_map(|r| r.err()) {
        Some(first_err) => Err(first_err),
        // AtLeast(n) with n > total can go unmet without any failure
        None => Err(crate::error::Error::Internal(format!(
            "success policy {policy:?} unmet: {succeeded} of {total} succeeded"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
