use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use nix::libc;
use nix::poll::PollFlags;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::{Direction, EdgeDetect, GpioConfig, PinConfig, SYSFS_GPIO_ROOT};
use crate::error::GpioError;
use crate::gpio::{Claim, EdgeSource, GpioPin, Lifecycle, Wake};
use crate::monitor::{Canceller, wait_ready};

const VALUE_READ_BUFFER: usize = 16;

/// The sysfs GPIO control directory. Pins opened from the same `SysfsGpio`
/// share its monitor registry.
pub struct SysfsGpio {
    root: PathBuf,
    monitored: Arc<Mutex<FxHashSet<u32>>>,
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::with_root(SYSFS_GPIO_ROOT)
    }
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            monitored: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    pub fn from_config(config: &GpioConfig) -> Self {
        Self::with_root(config.sysfs_root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pin_dir(&self, number: u32) -> PathBuf {
        self.root.join(format!("gpio{number}"))
    }

    pub fn is_exported(&self, number: u32) -> Result<bool, GpioError> {
        let dir = self.pin_dir(number);
        match fs::metadata(&dir) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GpioError::io(dir.display().to_string(), e)),
        }
    }

    /// Export `number`. Already exported pins are left alone.
    pub fn export(&self, number: u32) -> Result<(), GpioError> {
        if self.is_exported(number)? {
            debug!("gpio{number} already exported");
            return Ok(());
        }
        write_attribute(&self.root.join("export"), &number.to_string())?;
        info!("exported gpio{number}");
        Ok(())
    }

    /// Release `number` back to the kernel. Never done implicitly.
    pub fn unexport(&self, number: u32) -> Result<(), GpioError> {
        write_attribute(&self.root.join("unexport"), &number.to_string())?;
        info!("unexported gpio{number}");
        Ok(())
    }

    /// Export `number`, set its direction and open its value file.
    pub fn open(&self, number: u32, direction: Direction) -> Result<SysfsPin, GpioError> {
        self.export(number)?;

        let dir = self.pin_dir(number);
        write_attribute(&dir.join("direction"), direction.as_str())?;
        let value = open_value(&dir.join("value"))?;

        Ok(SysfsPin {
            number,
            dir,
            inner: Mutex::new(PinInner {
                value: Lifecycle::Open(value),
                direction,
            }),
            monitored: self.monitored.clone(),
        })
    }

    /// [`SysfsGpio::open`] followed by the polarity and edge settings of
    /// `config`.
    pub fn open_pin(&self, config: &PinConfig) -> Result<SysfsPin, GpioError> {
        let pin = self.open(config.number, config.direction)?;
        pin.write_active_low(config.active_low)?;
        pin.write_edge(config.edge)?;
        Ok(pin)
    }
}

/// A GPIO line controlled through its sysfs attribute files.
///
/// Closing the pin releases the value descriptor but leaves the pin
/// exported.
pub struct SysfsPin {
    number: u32,
    dir: PathBuf,
    inner: Mutex<PinInner>,
    monitored: Arc<Mutex<FxHashSet<u32>>>,
}

struct PinInner {
    value: Lifecycle<File>,
    direction: Direction,
}

impl SysfsPin {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn attribute_path(&self, attribute: &str) -> PathBuf {
        self.dir.join(attribute)
    }

    fn ensure_open(&self) -> Result<(), GpioError> {
        self.inner.lock().value.get(&self.name()).map(|_| ())
    }

    pub fn read_direction(&self) -> Result<Direction, GpioError> {
        self.ensure_open()?;
        let direction: Direction = read_attribute(&self.attribute_path("direction"))?.parse()?;
        self.inner.lock().direction = direction;
        Ok(direction)
    }

    pub fn write_direction(&self, direction: Direction) -> Result<(), GpioError> {
        self.ensure_open()?;
        write_attribute(&self.attribute_path("direction"), direction.as_str())?;
        self.inner.lock().direction = direction;
        Ok(())
    }

    pub fn read_edge(&self) -> Result<EdgeDetect, GpioError> {
        self.ensure_open()?;
        read_attribute(&self.attribute_path("edge"))?.parse()
    }

    pub fn write_edge(&self, edge: EdgeDetect) -> Result<(), GpioError> {
        self.ensure_open()?;
        write_attribute(&self.attribute_path("edge"), edge.as_str())
    }

    pub fn read_active_low(&self) -> Result<bool, GpioError> {
        self.ensure_open()?;
        parse_bit(&read_attribute(&self.attribute_path("active_low"))?, "active_low")
    }

    /// Invert the meaning of 0 and 1 in the value file.
    pub fn write_active_low(&self, active_low: bool) -> Result<(), GpioError> {
        self.ensure_open()?;
        write_attribute(
            &self.attribute_path("active_low"),
            if active_low { "1" } else { "0" },
        )
    }

    pub fn read_value(&self) -> Result<bool, GpioError> {
        let name = self.name();
        let inner = self.inner.lock();
        let mut file = inner.value.get(&name)?;

        file.seek(SeekFrom::Start(0))
            .map_err(|e| GpioError::io(format!("seek {name} value"), e))?;
        let mut buf = [0u8; VALUE_READ_BUFFER];
        let n = file
            .read(&mut buf)
            .map_err(|e| GpioError::io(format!("read {name} value"), e))?;

        let text = String::from_utf8_lossy(&buf[..n]);
        parse_bit(&text, "value")
    }

    pub fn write_value(&self, value: bool) -> Result<(), GpioError> {
        let name = self.name();
        let inner = self.inner.lock();
        let mut file = inner.value.get(&name)?;

        if inner.direction != Direction::Out {
            return Err(GpioError::Direction(format!(
                "{name} must be an output to set its value"
            )));
        }

        file.set_len(0)
            .map_err(|e| GpioError::io(format!("truncate {name} value"), e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| GpioError::io(format!("seek {name} value"), e))?;
        file.write_all(if value { b"1\n" } else { b"0\n" })
            .map_err(|e| GpioError::io(format!("write {name} value"), e))
    }

    /// Replace the value descriptor with a freshly opened one.
    pub fn reopen(&self) -> Result<(), GpioError> {
        let name = self.name();
        let mut inner = self.inner.lock();
        let file = inner.value.get_mut(&name)?;
        *file = open_value(&self.attribute_path("value"))?;
        Ok(())
    }
}

impl GpioPin for SysfsPin {
    fn name(&self) -> String {
        format!("gpio{}", self.number)
    }

    fn direction(&self) -> Result<Direction, GpioError> {
        self.read_direction()
    }

    fn set_direction(&self, direction: Direction) -> Result<(), GpioError> {
        self.write_direction(direction)
    }

    fn state(&self) -> Result<bool, GpioError> {
        self.read_value()
    }

    fn set_state(&self, value: bool) -> Result<(), GpioError> {
        self.write_value(value)
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.value.is_open() {
            inner.value = Lifecycle::Closed;
            debug!("closed gpio{}", self.number);
        }
    }
}

impl EdgeSource for SysfsPin {
    fn edge(&self) -> Result<EdgeDetect, GpioError> {
        self.read_edge()
    }

    fn claim(&self) -> Result<Claim, GpioError> {
        if !self.monitored.lock().insert(self.number) {
            return Err(GpioError::Conflict(format!(
                "gpio{} already has an edge monitor",
                self.number
            )));
        }
        let monitored = self.monitored.clone();
        let number = self.number;
        Ok(Claim::new(move || {
            monitored.lock().remove(&number);
        }))
    }

    fn wait_edge(
        &self,
        cancel: &Canceller,
        timeout: Option<Duration>,
    ) -> Result<Wake, GpioError> {
        let name = self.name();
        let inner = self.inner.lock();
        let file = inner.value.get(&name)?;
        wait_ready(file.as_fd(), PollFlags::POLLPRI, cancel, timeout, &name)
    }
}

fn open_value(path: &Path) -> Result<File, GpioError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| GpioError::io(path.display().to_string(), e))
}

fn read_attribute(path: &Path) -> Result<String, GpioError> {
    fs::read_to_string(path).map_err(|e| GpioError::io(path.display().to_string(), e))
}

fn write_attribute(path: &Path, value: &str) -> Result<(), GpioError> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| GpioError::io(path.display().to_string(), e))?;
    writeln!(file, "{value}").map_err(|e| GpioError::io(path.display().to_string(), e))
}

fn parse_bit(text: &str, attribute: &str) -> Result<bool, GpioError> {
    match text.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(GpioError::Format(format!(
            "{attribute} '{other}' is neither 0 nor 1"
        ))),
    }
}
