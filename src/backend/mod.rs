pub mod sim;
pub mod sysfs;

pub use sim::SimPin;
pub use sysfs::{SysfsGpio, SysfsPin};
