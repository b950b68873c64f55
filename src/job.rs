use crate::error::GalvoError;
use std::time::Duration;

/// A bounded hardware run that can succeed, fail, or time out
///
/// A raster scan is the main example: it owns the DAQ for its whole
/// duration and must leave the mirrors parked whichever way it ends.
pub trait Job {
    /// The type returned on successful completion
    type Output;

    /// Run the job, giving up with `GalvoError::Timeout` after `timeout`
    fn run(&mut self, timeout: Duration) -> Result<Self::Output, GalvoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountdownJob {
        steps: u32,
    }

    impl Job for CountdownJob {
        type Output = u32;

        fn run(&mut self, timeout: Duration) -> Result<Self::Output, GalvoError> {
            if timeout.is_zero() {
                return Err(GalvoError::Timeout);
            }
            let done = self.steps;
            self.steps = 0;
            Ok(done)
        }
    }

    #[test]
    fn test_job_success() {
        let mut job = CountdownJob { steps: 3 };
        assert_eq!(job.run(Duration::from_secs(1)).unwrap(), 3);
        assert_eq!(job.run(Duration::from_secs(1)).unwrap(), 0);
    }

    #[test]
    fn test_job_timeout() {
        let mut job = CountdownJob { steps: 3 };
        assert!(matches!(job.run(Duration::ZERO), Err(GalvoError::Timeout)));
    }
}
