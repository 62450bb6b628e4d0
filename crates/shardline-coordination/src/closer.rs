//! Runs every close step and reports all failures together.

use crate::error::{CoordinationError, Result};
use std::future::Future;
use tracing::warn;

#[derive(Default)]
pub struct Closer {
    errors: Vec<CoordinationError>,
}

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one close step. A failure is recorded and does not stop later steps.
    pub async fn close<F, E>(&mut self, resource: &str, step: F)
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: Into<CoordinationError>,
    {
        if let Err(e) = step.await {
            let e = e.into();
            warn!(resource, error = %e, "Failed to close resource");
            self.errors.push(e);
        }
    }

    pub fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CoordinationError::Shutdown(self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_metadata::MetadataError;

    #[tokio::test]
    async fn test_all_steps_run_and_all_errors_are_kept() {
        let mut ran = Vec::new();
        let mut closer = Closer::new();

        closer
            .close("first", async {
                ran.push("first");
                Err::<(), _>(MetadataError::Closed)
            })
            .await;
        closer
            .close("second", async {
                ran.push("second");
                Ok::<(), CoordinationError>(())
            })
            .await;
        closer
            .close("third", async {
                ran.push("third");
                Err::<(), _>(CoordinationError::SchedulerFull(1))
            })
            .await;

        assert_eq!(ran, vec!["first", "second", "third"]);
        match closer.finish() {
            Err(CoordinationError::Shutdown(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[0], CoordinationError::Metadata(MetadataError::Closed)));
                assert!(matches!(errors[1], CoordinationError::SchedulerFull(1)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_no_errors_is_ok() {
        assert!(Closer::new().finish().is_ok());
    }
}
