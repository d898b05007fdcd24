//! Batch results: the handles that launched and one failure per request that
//! did not.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::error::{ErrorKind, TestbedError};
use crate::instance::Instance;

/// One request of a batch that failed to launch
#[derive(Debug, Clone, Error)]
#[error("request #{index} ({name}): {error}")]
pub struct LaunchFailure {
    /// Position of the request in the submitted batch
    pub index: usize,
    pub name: String,
    #[source]
    pub error: TestbedError,
}

impl LaunchFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Every failure of a batch, ordered by submission index.
///
/// Never empty: a batch without failures has no `BatchLaunchError` at all.
#[derive(Debug, Clone)]
pub struct BatchLaunchError {
    failures: Vec<LaunchFailure>,
    submitted: usize,
}

impl BatchLaunchError {
    /// `None` when there are no failures
    pub(crate) fn from_failures(mut failures: Vec<LaunchFailure>, submitted: usize) -> Option<Self> {
        if failures.is_empty() {
            return None;
        }
        failures.sort_by_key(|failure| failure.index);
        Some(Self {
            failures,
            submitted,
        })
    }

    pub fn failures(&self) -> &[LaunchFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Always false for an error returned by a batch
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of requests in the batch this error came from
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn failure_for(&self, index: usize) -> Option<&LaunchFailure> {
        self.failures.iter().find(|failure| failure.index == index)
    }

    pub fn failures_of_kind(&self, kind: ErrorKind) -> impl Iterator<Item = &LaunchFailure> {
        self.failures.iter().filter(move |failure| failure.kind() == kind)
    }

    pub fn count_by_kind(&self) -> HashMap<ErrorKind, usize> {
        let mut counts = HashMap::new();
        for failure in &self.failures {
            *counts.entry(failure.kind()).or_insert(0) += 1;
        }
        counts
    }

    pub fn into_failures(self) -> Vec<LaunchFailure> {
        self.failures
    }
}

impl fmt::Display for BatchLaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} launches failed",
            self.failures.len(),
            self.submitted
        )?;
        for failure in &self.failures {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchLaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| &failure.error as &(dyn std::error::Error + 'static))
    }
}

/// What `launch_all` produced.
///
/// `instances` holds the successful handles in submission order; the caller
/// owns them and must terminate them, including when `error` is set.
#[derive(Debug)]
pub struct BatchOutcome {
    pub instances: Vec<Instance>,
    pub error: Option<BatchLaunchError>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// `Ok` with every handle when nothing failed.
    ///
    /// On failure the successful handles are returned alongside the error so
    /// they can still be terminated.
    pub fn into_result(self) -> std::result::Result<Vec<Instance>, (Vec<Instance>, BatchLaunchError)> {
        match self.error {
            None => Ok(self.instances),
            Some(error) => Err((self.instances, error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecyclePhase;

    fn failure(index: usize, error: TestbedError) -> LaunchFailure {
        LaunchFailure {
            index,
            name: format!("req-{index}"),
            error,
        }
    }

    #[test]
    fn test_no_failures_is_none() {
        assert!(BatchLaunchError::from_failures(Vec::new(), 3).is_none());
    }

    #[test]
    fn test_failures_sorted_and_counted() {
        let error = BatchLaunchError::from_failures(
            vec![
                failure(4, TestbedError::hook(LifecyclePhase::PreStart, "boom")),
                failure(1, TestbedError::cancelled("wait")),
                failure(2, TestbedError::cancelled("wait")),
            ],
            5,
        )
        .unwrap();

        let indexes: Vec<usize> = error.failures().iter().map(|f| f.index).collect();
        assert_eq!(indexes, vec![1, 2, 4]);
        assert_eq!(error.len(), 3);
        assert_eq!(error.submitted(), 5);
        assert_eq!(error.failures_of_kind(ErrorKind::Cancelled).count(), 2);
        assert_eq!(error.count_by_kind().get(&ErrorKind::Hook), Some(&1));
        assert_eq!(error.failure_for(4).unwrap().name, "req-4");
        assert!(error.failure_for(0).is_none());
    }

    #[test]
    fn test_display_and_downcast() {
        let error = BatchLaunchError::from_failures(
            vec![failure(0, TestbedError::configuration("bad port"))],
            2,
        )
        .unwrap();

        let rendered = error.to_string();
        assert!(rendered.starts_with("1 of 2 launches failed"));
        assert!(rendered.contains("request #0 (req-0)"));

        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(error);
        let recovered = boxed.downcast_ref::<BatchLaunchError>().unwrap();
        assert_eq!(recovered.failures()[0].kind(), ErrorKind::Configuration);
    }
}
