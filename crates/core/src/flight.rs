use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, SweepError};

/// Admits one caller at a time; concurrent callers are turned away, not queued.
#[derive(Debug)]
pub struct SingleFlight {
    operation: &'static str,
    busy: AtomicBool,
}

impl SingleFlight {
    pub const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_begin(&self) -> Result<FlightGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SweepError::OperationInProgress {
                operation: self.operation,
            });
        }
        Ok(FlightGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the flight when dropped.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
