//! GPIO control through the Linux sysfs interface (`/sys/class/gpio`).
//!
//! Real pins are opened from a [`SysfsGpio`] control directory. [`SimPin`]s
//! are in-memory stand-ins that can be wired together for tests. Either kind
//! of input pin can be handed to [`attach`] to receive its edges as an
//! [`EdgeStream`].

mod backend;
mod config;
mod error;
mod gpio;
mod monitor;

pub use backend::{SimPin, SysfsGpio, SysfsPin};
pub use config::{Direction, EdgeDetect, GpioConfig, MonitorConfig, PinConfig, SYSFS_GPIO_ROOT};
pub use error::GpioError;
pub use gpio::{Claim, EdgeSource, GpioPin, Wake};
pub use monitor::{Canceller, EdgeStream, attach, attach_with};
