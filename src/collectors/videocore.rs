//! Raspberry Pi firmware readings via `vcgencmd`, plus board identity.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

use super::{CollectorError, MetricCollector, SampleMode, run_command};
use crate::snapshot::{ClockStats, FieldValue, GpuStats, HardwareStats, PowerStats, StatField};

lazy_static! {
    static ref TEMP_RE: Regex = Regex::new(r"temp=(\d+(?:\.\d+)?)").unwrap();
    static ref MEM_RE: Regex = Regex::new(r"(\d+)M").unwrap();
    static ref CLOCK_RE: Regex = Regex::new(r"=(\d+)").unwrap();
    static ref VOLT_RE: Regex = Regex::new(r"(\d+(?:\.\d+)?)V").unwrap();
    static ref THROTTLED_RE: Regex = Regex::new(r"0x([0-9a-fA-F]+)").unwrap();
}

const VCGENCMD: &str = "vcgencmd";

pub(crate) fn parse_temp(out: &str) -> Option<f32> {
    TEMP_RE.captures(out).and_then(|c| c[1].parse().ok())
}

// "gpu=76M" -> bytes
pub(crate) fn parse_mem_bytes(out: &str) -> Option<u64> {
    MEM_RE
        .captures(out)
        .and_then(|c| c[1].parse::<u64>().ok())
        .map(|mb| mb * 1024 * 1024)
}

// "frequency(48)=1500345728" -> Hz
pub(crate) fn parse_clock(out: &str) -> Option<u64> {
    CLOCK_RE.captures(out).and_then(|c| c[1].parse().ok())
}

pub(crate) fn parse_volts(out: &str) -> Option<f32> {
    VOLT_RE.captures(out).and_then(|c| c[1].parse().ok())
}

/// Decode the live bits of `get_throttled`: (under-voltage, frequency capped, throttled).
pub(crate) fn parse_throttled(out: &str) -> Option<(bool, bool, bool)> {
    let bits = THROTTLED_RE
        .captures(out)
        .and_then(|c| u32::from_str_radix(&c[1], 16).ok())?;
    Some((bits & 0x1 != 0, bits & 0x2 != 0, bits & 0x4 != 0))
}

/// Run one vcgencmd query, keeping the error for reporting.
async fn vcgencmd(args: &[&str], limit: Duration) -> Result<String, CollectorError> {
    run_command(VCGENCMD, args, limit).await
}

// Pick the parsed value, or remember why there isn't one
fn reading<T>(
    result: Result<String, CollectorError>,
    parse: impl Fn(&str) -> Option<T>,
    what: &'static str,
    errors: &mut Vec<CollectorError>,
) -> Option<T> {
    match result {
        Ok(out) => {
            let parsed = parse(&out);
            if parsed.is_none() {
                errors.push(CollectorError::Parse { what, input: out });
            }
            parsed
        }
        Err(e) => {
            errors.push(e);
            None
        }
    }
}

// A collector with nothing to show reports its first error
fn first_error(mut errors: Vec<CollectorError>, what: &str) -> CollectorError {
    if errors.is_empty() {
        CollectorError::Unavailable(format!("no {what} readings"))
    } else {
        errors.swap_remove(0)
    }
}

pub struct GpuCollector {
    command_timeout: Duration,
}

impl GpuCollector {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl MetricCollector for GpuCollector {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Gpu]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let limit = self.command_timeout;
        let (temp, mem, v3d) = tokio::join!(
            vcgencmd(&["measure_temp"], limit),
            vcgencmd(&["get_mem", "gpu"], limit),
            vcgencmd(&["measure_clock", "v3d"], limit),
        );

        let mut errors = Vec::new();
        let gpu = GpuStats {
            temperature: reading(temp, parse_temp, "gpu temperature", &mut errors),
            memory: reading(mem, parse_mem_bytes, "gpu memory split", &mut errors),
            v3d_clock: reading(v3d, parse_clock, "v3d clock", &mut errors),
        };

        if gpu == GpuStats::default() {
            return Err(first_error(errors, "gpu"));
        }
        Ok(vec![FieldValue::Gpu(gpu)])
    }
}

pub struct PowerCollector {
    command_timeout: Duration,
}

impl PowerCollector {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl MetricCollector for PowerCollector {
    fn name(&self) -> &'static str {
        "power"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Power]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let limit = self.command_timeout;
        let (volts, throttled) = tokio::join!(
            vcgencmd(&["measure_volts", "core"], limit),
            vcgencmd(&["get_throttled"], limit),
        );

        let mut errors = Vec::new();
        let core_voltage = reading(volts, parse_volts, "core voltage", &mut errors);
        let flags = reading(throttled, parse_throttled, "throttle flags", &mut errors);

        let power = PowerStats {
            core_voltage,
            under_voltage: flags.map(|f| f.0),
            freq_capped: flags.map(|f| f.1),
            throttled: flags.map(|f| f.2),
        };
        if power == PowerStats::default() {
            return Err(first_error(errors, "power"));
        }
        Ok(vec![FieldValue::Power(power)])
    }
}

pub struct ClockCollector {
    command_timeout: Duration,
}

impl ClockCollector {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl MetricCollector for ClockCollector {
    fn name(&self) -> &'static str {
        "clocks"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Clocks]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let limit = self.command_timeout;
        let (arm, core, sdram) = tokio::join!(
            vcgencmd(&["measure_clock", "arm"], limit),
            vcgencmd(&["measure_clock", "core"], limit),
            vcgencmd(&["measure_clock", "sdram"], limit),
        );

        let mut errors = Vec::new();
        let clocks = ClockStats {
            arm: reading(arm, parse_clock, "arm clock", &mut errors),
            core: reading(core, parse_clock, "core clock", &mut errors),
            sdram: reading(sdram, parse_clock, "sdram clock", &mut errors),
        };
        if clocks == ClockStats::default() {
            return Err(first_error(errors, "clock"));
        }
        Ok(vec![FieldValue::Clocks(clocks)])
    }
}

/// Board model, serial, firmware version and USB device count.
pub struct HardwareCollector {
    command_timeout: Duration,
}

impl HardwareCollector {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

pub(crate) fn parse_serial(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .find(|l| l.starts_with("Serial"))
        .and_then(|l| l.split(':').nth(1))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl MetricCollector for HardwareCollector {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Hardware]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let limit = self.command_timeout;
        let (model, cpuinfo, firmware, usb) = tokio::join!(
            tokio::fs::read_to_string("/proc/device-tree/model"),
            tokio::fs::read_to_string("/proc/cpuinfo"),
            vcgencmd(&["version"], limit),
            run_command("lsusb", &[], limit),
        );

        // device-tree strings are NUL terminated
        let hardware = HardwareStats {
            model: model
                .ok()
                .map(|m| m.trim_end_matches('\0').trim().to_string())
                .filter(|m| !m.is_empty()),
            serial: cpuinfo.ok().and_then(|c| parse_serial(&c)),
            firmware: firmware.ok().filter(|f| !f.is_empty()),
            usb_devices: usb.ok().map(|out| out.lines().count()),
        };

        if hardware == HardwareStats::default() {
            return Err(CollectorError::Unavailable("no hardware identity available".into()));
        }
        Ok(vec![FieldValue::Hardware(hardware)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcgencmd_outputs() {
        assert_eq!(parse_temp("temp=45.8'C"), Some(45.8));
        assert_eq!(parse_mem_bytes("gpu=76M"), Some(76 * 1024 * 1024));
        assert_eq!(parse_clock("frequency(48)=1500345728"), Some(1_500_345_728));
        assert_eq!(parse_volts("volt=1.3500V"), Some(1.35));
        assert_eq!(parse_temp("error=1 error_msg=\"Command not registered\""), None);
    }

    #[test]
    fn throttle_bits() {
        assert_eq!(parse_throttled("throttled=0x0"), Some((false, false, false)));
        assert_eq!(parse_throttled("throttled=0x50005"), Some((true, false, true)));
        assert_eq!(parse_throttled("throttled=0x2"), Some((false, true, false)));
        assert_eq!(parse_throttled("garbage"), None);
    }

    #[test]
    fn serial_from_cpuinfo() {
        let cpuinfo = "Hardware\t: BCM2835\nRevision\t: c03112\nSerial\t\t: 10000000abcdef\nModel\t\t: Raspberry Pi 4";
        assert_eq!(parse_serial(cpuinfo).as_deref(), Some("10000000abcdef"));
        assert_eq!(parse_serial("processor\t: 0"), None);
    }

    #[test]
    fn parse_failures_are_remembered() {
        let mut errors = Vec::new();
        let value = reading(Ok("nonsense".to_string()), parse_clock, "arm clock", &mut errors);
        assert_eq!(value, None);
        assert!(matches!(errors[0], CollectorError::Parse { what: "arm clock", .. }));
        assert!(matches!(
            first_error(errors, "clock"),
            CollectorError::Parse { .. }
        ));
    }
}
