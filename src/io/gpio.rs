//! Digital pin and clock boundary
//!
//! The control core only needs "set output", "read input" and monotonic
//! time. Everything hardware-specific sits behind [`OutputPin`], [`InputPin`]
//! and [`Clock`]; the Linux sysfs backend below is the one used on the Pi.
//!
//! sysfs layout (per exported line N):
//! - `<root>/export` - write N to create `<root>/gpioN`
//! - `<root>/gpioN/direction` - "in" / "out"
//! - `<root>/gpioN/value` - "0" / "1"
//! - `<root>/unexport` - write N to release the line

use crate::domain::types::{Level, PinId};
use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Time for udev to apply permissions on a freshly exported line
const EXPORT_SETTLE: Duration = Duration::from_millis(50);

/// Output line (trigger, buzzers)
pub trait OutputPin: Send {
    fn id(&self) -> PinId;
    fn set(&mut self, level: Level) -> io::Result<()>;
}

/// Input line (echo)
pub trait InputPin: Send {
    fn id(&self) -> PinId;
    fn read(&mut self) -> io::Result<Level>;
}

/// Monotonic time source
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// System monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Handle to a sysfs GPIO directory
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    /// Open a line as output, driven low
    pub fn output(&self, id: PinId) -> anyhow::Result<SysfsPin> {
        let mut pin = self.open(id, Direction::Out)?;
        pin.write_level(Level::Low)
            .with_context(|| format!("Failed to drive GPIO {} low", id))?;
        Ok(pin)
    }

    /// Open a line as input
    pub fn input(&self, id: PinId) -> anyhow::Result<SysfsPin> {
        self.open(id, Direction::In)
    }

    fn open(&self, id: PinId, direction: Direction) -> anyhow::Result<SysfsPin> {
        let pin_dir = self.root.join(format!("gpio{}", id.0));
        let exported = if pin_dir.exists() {
            false
        } else {
            fs::write(self.root.join("export"), id.0.to_string())
                .with_context(|| format!("Failed to export GPIO {}", id))?;
            std::thread::sleep(EXPORT_SETTLE);
            true
        };

        fs::write(pin_dir.join("direction"), direction.as_str())
            .with_context(|| format!("Failed to set GPIO {} direction", id))?;

        let value_path = pin_dir.join("value");
        let value = OpenOptions::new()
            .read(true)
            .write(direction == Direction::Out)
            .open(&value_path)
            .with_context(|| format!("Failed to open {}", value_path.display()))?;

        info!(pin = %id, direction = direction.as_str(), exported = exported, "gpio_opened");

        Ok(SysfsPin { id, root: self.root.clone(), value, exported })
    }
}

/// One exported sysfs line; unexported on drop if this handle exported it
pub struct SysfsPin {
    id: PinId,
    root: PathBuf,
    value: File,
    exported: bool,
}

impl SysfsPin {
    fn write_level(&mut self, level: Level) -> io::Result<()> {
        self.value.seek(SeekFrom::Start(0))?;
        self.value.write_all(if level.is_high() { b"1" } else { b"0" })?;
        self.value.flush()
    }

    fn read_level(&mut self) -> io::Result<Level> {
        let mut buf = [0u8; 1];
        self.value.seek(SeekFrom::Start(0))?;
        let n = self.value.read(&mut buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty gpio value"));
        }
        Ok(Level::from(buf[0] == b'1'))
    }
}

impl OutputPin for SysfsPin {
    fn id(&self) -> PinId {
        self.id
    }

    fn set(&mut self, level: Level) -> io::Result<()> {
        self.write_level(level)
    }
}

impl InputPin for SysfsPin {
    fn id(&self) -> PinId {
        self.id
    }

    fn read(&mut self) -> io::Result<Level> {
        self.read_level()
    }
}

impl Drop for SysfsPin {
    fn drop(&mut self) {
        if !self.exported {
            return;
        }
        match fs::write(self.root.join("unexport"), self.id.0.to_string()) {
            Ok(()) => debug!(pin = %self.id, "gpio_unexported"),
            Err(e) => warn!(pin = %self.id, error = %e, "gpio_unexport_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Lay out a pre-exported line the way the kernel would
    fn fake_line(root: &Path, pin: u32, value: &str) {
        let dir = root.join(format!("gpio{}", pin));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in").unwrap();
        fs::write(dir.join("value"), value).unwrap();
    }

    #[test]
    fn test_output_drives_low_then_high() {
        let dir = tempdir().unwrap();
        fake_line(dir.path(), 22, "1");

        let gpio = SysfsGpio::new(dir.path());
        let mut pin = gpio.output(PinId(22)).unwrap();
        let value_path = dir.path().join("gpio22/value");

        assert_eq!(fs::read_to_string(dir.path().join("gpio22/direction")).unwrap(), "out");
        assert_eq!(fs::read_to_string(&value_path).unwrap(), "0");

        pin.set(Level::High).unwrap();
        assert_eq!(fs::read_to_string(&value_path).unwrap(), "1");
        assert_eq!(OutputPin::id(&pin), PinId(22));
    }

    #[test]
    fn test_input_reads_value() {
        let dir = tempdir().unwrap();
        fake_line(dir.path(), 27, "1\n");

        let gpio = SysfsGpio::new(dir.path());
        let mut pin = gpio.input(PinId(27)).unwrap();
        assert_eq!(pin.read().unwrap(), Level::High);

        fs::write(dir.path().join("gpio27/value"), "0\n").unwrap();
        assert_eq!(pin.read().unwrap(), Level::Low);
    }

    #[test]
    fn test_preexisting_line_is_not_unexported() {
        let dir = tempdir().unwrap();
        fake_line(dir.path(), 17, "0");

        let gpio = SysfsGpio::new(dir.path());
        drop(gpio.output(PinId(17)).unwrap());
        assert!(!dir.path().join("unexport").exists());
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = tempdir().unwrap();
        let gpio = SysfsGpio::new(dir.path().join("missing"));
        assert!(gpio.input(PinId(5)).is_err());
    }
}
