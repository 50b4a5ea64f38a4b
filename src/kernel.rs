use std::io;
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::GpioBackend;
use crate::config::{Direction, EdgeDetect};
use crate::error::AppError;
use crate::retry::{Clock, RetryPolicy};

/// Kernel-facing GPIO operations with the export-latency retry policy
/// applied on top of a [`GpioBackend`].
pub struct Kernel<B: GpioBackend> {
    backend: Arc<B>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

fn gpio_err(op: &str, gpio: u32, e: io::Error) -> AppError {
    AppError::Gpio(format!("{op} gpio {gpio}: {e}"))
}

impl<B: GpioBackend> Kernel<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            retry,
            clock,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Exports `gpio` unless its directory is already present. Returns
    /// whether this call performed the export.
    pub fn export(&self, gpio: u32) -> Result<bool, AppError> {
        if self.backend.is_exported(gpio) {
            return Ok(false);
        }
        self.backend
            .export(gpio)
            .map_err(|e| gpio_err("export", gpio, e))?;
        debug!("exported gpio {gpio}");
        Ok(true)
    }

    /// Best effort; a pin left exported is repaired by a later reset.
    pub fn unexport(&self, gpio: u32) {
        match self.backend.unexport(gpio) {
            Ok(()) => debug!("unexported gpio {gpio}"),
            Err(e) => warn!("unexport gpio {gpio} failed: {e}"),
        }
    }

    pub fn set_direction(&self, gpio: u32, direction: Direction) -> Result<(), AppError> {
        self.retry
            .run(self.clock(), "set direction", || {
                self.backend.write_direction(gpio, direction)
            })
            .map_err(|e| gpio_err("set direction", gpio, e))
    }

    pub fn set_edge(&self, gpio: u32, edge: EdgeDetect) -> Result<(), AppError> {
        self.retry
            .run(self.clock(), "set edge", || self.backend.write_edge(gpio, edge))
            .map_err(|e| gpio_err("set edge", gpio, e))
    }

    pub fn open_value_stream(&self, gpio: u32) -> Result<B::Stream, AppError> {
        self.backend
            .open_value(gpio)
            .map_err(|e| gpio_err("open value", gpio, e))
    }

    pub fn readiness_set(&self) -> Result<B::Readiness, AppError> {
        self.backend
            .readiness_set()
            .map_err(|e| AppError::Gpio(format!("create readiness set: {e}")))
    }

    /// Export followed by a direction write; an export made here is rolled
    /// back if the direction never takes. Returns whether this call exported.
    pub fn configure(&self, gpio: u32, direction: Direction) -> Result<bool, AppError> {
        let exported = self.export(gpio)?;
        if let Err(e) = self.set_direction(gpio, direction) {
            if exported {
                self.unexport(gpio);
            }
            return Err(e);
        }
        Ok(exported)
    }
}
