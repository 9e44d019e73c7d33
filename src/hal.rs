//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the Sense HAT sensors, the cpu thermal
//!     zone and the LED matrix. abstracts away the difference between running
//!     on a real Raspberry Pi (using `rppal`) and a development machine
//!     (simulated sensors, log-only display).
//!
//! design philosophy:
//!     - "Compile Anywhere": the agent builds on any linux/mac/windows box.
//!     - "Fail Per Field": every reading can fail on its own, the caller
//!       decides what a missing value means.
//!     - "Blocking Is Fine Here": callers move these calls onto
//!       spawn_blocking, implementations just do plain io.
//!
//! relationships:
//!     - used by: agent.rs (SensorSource, once per cycle)
//!     - used by: dispatch.rs (LedDisplay, config feedback + displayMessage)
//!     - uses: rppal (on feature="hardware")
//!     - uses: python3 + sense_hat (LED matrix, on feature="hardware")
//!
//! ==============================================================================

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::SimulationConfig;

pub const DEFAULT_CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Raw environmental readings, each independently fallible.
pub trait SensorSource: Send + Sync {
    fn humidity_temp(&self) -> Result<f64>;
    fn pressure_temp(&self) -> Result<f64>;
    fn pressure(&self) -> Result<f64>;
    fn humidity(&self) -> Result<f64>;
    /// Absent when the thermal zone cannot be read.
    fn cpu_temp(&self) -> Option<f64>;
}

/// The LED output device.
pub trait LedDisplay: Send + Sync {
    fn show_message(&self, text: &str) -> Result<()>;
    /// Flash the whole matrix `times` times (1s on, 1s off on real hardware).
    fn blink(&self, rgb: (u8, u8, u8), times: u8) -> Result<()>;
}

// ==============================================================================
// cpu temperature
// ==============================================================================

/// read raspberry pi cpu temperature in celsius
///
/// the thermal zone file holds millidegrees celsius (e.g., 45000 = 45.0°C)
pub fn read_cpu_temp(path: &Path) -> Result<f64> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let millis: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("unexpected thermal zone content {:?}", raw.trim()))?;
    Ok(millis / 1000.0)
}

/// Thermal zone reader that logs and swallows failures.
#[derive(Debug, Clone)]
pub struct CpuThermalZone {
    path: PathBuf,
}

impl CpuThermalZone {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Option<f64> {
        match read_cpu_temp(&self.path) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!("cpu temperature unavailable: {:#}", e);
                None
            }
        }
    }
}

// ==============================================================================================
// SIMULATED IMPLEMENTATION (For development machines)
// ==============================================================================================

/// Fixed base values with a slow deterministic wobble so smoothing has
/// something to do.
pub struct SimulatedSensors {
    base: SimulationConfig,
    cpu: Option<CpuThermalZone>,
    tick: AtomicU64,
}

impl SimulatedSensors {
    pub fn new(base: SimulationConfig) -> Self {
        tracing::info!("Using SIMULATED sensors (No hardware access)");
        Self {
            base,
            cpu: None,
            tick: AtomicU64::new(0),
        }
    }

    /// Read the real cpu temperature instead of the simulated one.
    pub fn with_cpu_zone(mut self, zone: CpuThermalZone) -> Self {
        self.cpu = Some(zone);
        self
    }

    fn wobble(&self, base: f64) -> f64 {
        let n = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
        base + self.base.jitter * (n / 7.0).sin()
    }
}

impl SensorSource for SimulatedSensors {
    fn humidity_temp(&self) -> Result<f64> {
        Ok(self.wobble(self.base.humidity_temp))
    }

    fn pressure_temp(&self) -> Result<f64> {
        Ok(self.wobble(self.base.pressure_temp))
    }

    fn pressure(&self) -> Result<f64> {
        Ok(self.wobble(self.base.pressure))
    }

    fn humidity(&self) -> Result<f64> {
        Ok(self.wobble(self.base.humidity))
    }

    fn cpu_temp(&self) -> Option<f64> {
        match &self.cpu {
            Some(zone) => zone.read(),
            None => Some(self.base.cpu_temp),
        }
    }
}

/// Display that only writes to the log.
pub struct LogDisplay;

impl LedDisplay for LogDisplay {
    fn show_message(&self, text: &str) -> Result<()> {
        tracing::info!("[DISPLAY] \"{}\"", text);
        Ok(())
    }

    fn blink(&self, rgb: (u8, u8, u8), times: u8) -> Result<()> {
        tracing::info!("[DISPLAY] blink RGB{:?} x{}", rgb, times);
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi + Sense HAT)
// ==============================================================================================

#[cfg(feature = "hardware")]
pub use sense_hat::{SenseHatDisplay, SenseHatSensors};

#[cfg(feature = "hardware")]
mod sense_hat {
    use super::{CpuThermalZone, LedDisplay, SensorSource};
    use anyhow::{anyhow, Context, Result};
    use rppal::i2c::I2c;
    use std::process::Command;
    use std::sync::Mutex;

    const HTS221_ADDR: u16 = 0x5F;
    const LPS25H_ADDR: u16 = 0x5C;
    const CTRL_REG1: u8 = 0x20;
    const HTS221_AV_CONF: u8 = 0x10;
    const OUT_START: u8 = 0x28;
    const HTS221_CALIB: u8 = 0x30;
    // multi-byte reads need the sub-address auto-increment bit
    const AUTO_INC: u8 = 0x80;

    /// HTS221 factory calibration (two-point linear interpolation).
    #[derive(Debug, Clone, Copy)]
    struct Hts221Calibration {
        h0_rh: f64,
        h1_rh: f64,
        t0_deg: f64,
        t1_deg: f64,
        h0_out: f64,
        h1_out: f64,
        t0_out: f64,
        t1_out: f64,
    }

    impl Hts221Calibration {
        fn from_registers(b: &[u8; 16]) -> Self {
            let i16_at = |i: usize| i16::from_le_bytes([b[i], b[i + 1]]) as f64;
            let msb = b[5];
            let t0_x8 = (((msb & 0x03) as u16) << 8) | b[2] as u16;
            let t1_x8 = (((msb & 0x0C) as u16) << 6) | b[3] as u16;
            Self {
                h0_rh: b[0] as f64 / 2.0,
                h1_rh: b[1] as f64 / 2.0,
                t0_deg: t0_x8 as f64 / 8.0,
                t1_deg: t1_x8 as f64 / 8.0,
                h0_out: i16_at(6),
                h1_out: i16_at(10),
                t0_out: i16_at(12),
                t1_out: i16_at(14),
            }
        }

        fn humidity(&self, raw: f64) -> f64 {
            self.h0_rh + (raw - self.h0_out) * (self.h1_rh - self.h0_rh) / (self.h1_out - self.h0_out)
        }

        fn temperature(&self, raw: f64) -> f64 {
            self.t0_deg + (raw - self.t0_out) * (self.t1_deg - self.t0_deg) / (self.t1_out - self.t0_out)
        }
    }

    pub struct SenseHatSensors {
        i2c: Mutex<I2c>,
        calibration: Hts221Calibration,
        cpu: CpuThermalZone,
    }

    impl SenseHatSensors {
        pub fn new(bus: u8, cpu: CpuThermalZone) -> Result<Self> {
            tracing::info!("Using REAL HARDWARE sensors (rppal, i2c bus {})", bus);
            let mut i2c = I2c::with_bus(bus).context("failed to open i2c bus")?;

            // hts221: power on, block data update, 12.5Hz; default averaging
            i2c.set_slave_address(HTS221_ADDR)?;
            i2c.smbus_write_byte(CTRL_REG1, 0x87)?;
            i2c.smbus_write_byte(HTS221_AV_CONF, 0x1B)?;
            let mut calib = [0u8; 16];
            i2c.write_read(&[HTS221_CALIB | AUTO_INC], &mut calib)?;

            // lps25h: power on, 12.5Hz, block data update
            i2c.set_slave_address(LPS25H_ADDR)?;
            i2c.smbus_write_byte(CTRL_REG1, 0xB4)?;

            Ok(Self {
                i2c: Mutex::new(i2c),
                calibration: Hts221Calibration::from_registers(&calib),
                cpu,
            })
        }

        fn read_block<const N: usize>(&self, addr: u16) -> Result<[u8; N]> {
            let mut i2c = self.i2c.lock().map_err(|_| anyhow!("i2c bus lock poisoned"))?;
            i2c.set_slave_address(addr)?;
            let mut buf = [0u8; N];
            i2c.write_read(&[OUT_START | AUTO_INC], &mut buf)?;
            Ok(buf)
        }

        /// (humidity %rH, temperature °C)
        fn hts221(&self) -> Result<(f64, f64)> {
            let b = self.read_block::<4>(HTS221_ADDR).context("hts221 read failed")?;
            let h = i16::from_le_bytes([b[0], b[1]]) as f64;
            let t = i16::from_le_bytes([b[2], b[3]]) as f64;
            Ok((self.calibration.humidity(h).clamp(0.0, 100.0), self.calibration.temperature(t)))
        }

        /// (pressure hPa, temperature °C)
        fn lps25h(&self) -> Result<(f64, f64)> {
            let b = self.read_block::<5>(LPS25H_ADDR).context("lps25h read failed")?;
            // 24-bit two's complement, sign-extended through the top byte
            let p = i32::from_le_bytes([b[0], b[1], b[2], if b[2] & 0x80 != 0 { 0xFF } else { 0 }]);
            let t = i16::from_le_bytes([b[3], b[4]]) as f64;
            Ok((p as f64 / 4096.0, 42.5 + t / 480.0))
        }
    }

    impl SensorSource for SenseHatSensors {
        fn humidity_temp(&self) -> Result<f64> {
            Ok(self.hts221()?.1)
        }

        fn pressure_temp(&self) -> Result<f64> {
            Ok(self.lps25h()?.1)
        }

        fn pressure(&self) -> Result<f64> {
            Ok(self.lps25h()?.0)
        }

        fn humidity(&self) -> Result<f64> {
            Ok(self.hts221()?.0)
        }

        fn cpu_temp(&self) -> Option<f64> {
            self.cpu.read()
        }
    }

    /// LED matrix through the python sense_hat library. The framebuffer
    /// font rendering lives there, we only drive it.
    pub struct SenseHatDisplay;

    impl SenseHatDisplay {
        fn run(script: &str, args: &[&str]) -> Result<()> {
            let output = Command::new("python3")
                .arg("-c")
                .arg(script)
                .args(args)
                .output()
                .map_err(|e| anyhow!("Failed to run python3: {}", e))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow!("sense_hat error: {}", stderr.trim()));
            }
            Ok(())
        }
    }

    impl LedDisplay for SenseHatDisplay {
        fn show_message(&self, text: &str) -> Result<()> {
            // text goes through argv, never into the script source
            Self::run(
                "import sys\nfrom sense_hat import SenseHat\nSenseHat().show_message(sys.argv[1])\n",
                &[text],
            )
        }

        fn blink(&self, rgb: (u8, u8, u8), times: u8) -> Result<()> {
            let script = format!(
                r#"
import time
from sense_hat import SenseHat
sense = SenseHat()
for _ in range({times}):
    sense.clear(({r}, {g}, {b}))
    time.sleep(1)
    sense.clear()
    time.sleep(1)
"#,
                times = times,
                r = rgb.0,
                g = rgb.1,
                b = rgb.2,
            );
            Self::run(&script, &[])
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn hts221_calibration_interpolates() {
            // h0=20%, h1=80%, t0=10.0, t1=30.0 (msb bits zero), outputs 0/1000
            let mut regs = [0u8; 16];
            regs[0] = 40;
            regs[1] = 160;
            regs[2] = 80;
            regs[3] = 240;
            regs[10..12].copy_from_slice(&1000i16.to_le_bytes());
            regs[14..16].copy_from_slice(&1000i16.to_le_bytes());
            let c = Hts221Calibration::from_registers(&regs);
            assert!((c.humidity(500.0) - 50.0).abs() < 1e-9);
            assert!((c.temperature(500.0) - 20.0).abs() < 1e-9);
        }
    }
}
