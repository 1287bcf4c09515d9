use std::time::Duration;

use crate::config::{Direction, EdgeDetect};
use crate::error::GpioError;
use crate::monitor::Canceller;

/// Open/closed state of a pin handle. Operations on a closed handle fail
/// with [`GpioError::Closed`].
#[derive(Debug)]
pub(crate) enum Lifecycle<T> {
    Open(T),
    Closed,
}

impl<T> Lifecycle<T> {
    pub(crate) fn get(&self, name: &str) -> Result<&T, GpioError> {
        match self {
            Lifecycle::Open(v) => Ok(v),
            Lifecycle::Closed => Err(GpioError::Closed(name.to_string())),
        }
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut T, GpioError> {
        match self {
            Lifecycle::Open(v) => Ok(v),
            Lifecycle::Closed => Err(GpioError::Closed(name.to_string())),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self, Lifecycle::Open(_))
    }
}

/// Operations shared by real and simulated pins.
pub trait GpioPin: Send + Sync {
    fn name(&self) -> String;
    fn direction(&self) -> Result<Direction, GpioError>;
    fn set_direction(&self, direction: Direction) -> Result<(), GpioError>;
    /// Read the logical state.
    fn state(&self) -> Result<bool, GpioError>;
    /// Drive the logical state. Fails with [`GpioError::Direction`] unless
    /// the pin is an output.
    fn set_state(&self, value: bool) -> Result<(), GpioError>;
    fn close(&self);
}

/// Outcome of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Ready,
    Timeout,
    Cancelled,
}

/// Releases a monitor reservation on drop.
pub struct Claim {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Claim {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A pin that can signal edge readiness to a monitor.
pub trait EdgeSource: GpioPin + 'static {
    fn edge(&self) -> Result<EdgeDetect, GpioError>;

    /// Reserve the pin for a single monitor. Fails with
    /// [`GpioError::Conflict`] while another reservation is alive.
    fn claim(&self) -> Result<Claim, GpioError>;

    /// Block until the pin reports an edge, the timeout elapses or `cancel`
    /// fires. `None` waits indefinitely. Readiness is cleared by
    /// [`GpioPin::state`].
    fn wait_edge(
        &self,
        cancel: &Canceller,
        timeout: Option<Duration>,
    ) -> Result<Wake, GpioError>;
}
