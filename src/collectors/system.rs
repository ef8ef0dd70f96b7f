//! OS counters read through `sysinfo` and procfs.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Components, Disks, Networks, System};

use super::{BLOCKING_SAMPLE, CollectorError, MetricCollector, SampleMode, run_command};
use crate::snapshot::{
    DiskIoStats, DiskStats, FieldValue, InterfaceStats, MemoryStats, NetworkStats, StatField,
    SwapStats,
};

lazy_static! {
    static ref SIGNAL_RE: Regex = Regex::new(r"Signal level=(-?\d+) dBm").unwrap();
}

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const DISKSTATS: &str = "/proc/diskstats";
const SECTOR_SIZE: u64 = 512;

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 1000.0).round() / 10.0
    }
}

/// CPU utilization (overall and per core) plus current frequency.
///
/// Instant mode reports usage since the previous call on a shared sampler.
/// Blocking mode takes two fresh readings [`BLOCKING_SAMPLE`] apart.
pub struct CpuCollector {
    sampler: Mutex<System>,
}

impl CpuCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        // baseline so the first instant reading has something to diff against
        sys.refresh_cpu_usage();
        Self {
            sampler: Mutex::new(sys),
        }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn cpu_readings(sys: &System) -> Vec<FieldValue> {
    let per_cpu: Vec<f32> = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
    let mut values = vec![
        FieldValue::CpuUsage(sys.global_cpu_usage()),
        FieldValue::PerCpuUsage(per_cpu),
    ];
    if let Some(freq) = sys.cpus().first().map(|c| c.frequency()).filter(|f| *f > 0) {
        values.push(FieldValue::CpuFreq(freq));
    }
    values
}

#[async_trait]
impl MetricCollector for CpuCollector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::CpuUsage, StatField::PerCpuUsage, StatField::CpuFreq]
    }

    async fn collect(&self, mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        match mode {
            SampleMode::Instant => {
                let mut sys = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
                sys.refresh_cpu_usage();
                sys.refresh_cpu_frequency();
                Ok(cpu_readings(&sys))
            }
            SampleMode::Blocking => {
                // own sampler so the shared one is never held across the sleep
                let mut sys = System::new();
                sys.refresh_cpu_usage();
                tokio::time::sleep(BLOCKING_SAMPLE.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
                sys.refresh_cpu_usage();
                sys.refresh_cpu_frequency();
                Ok(cpu_readings(&sys))
            }
        }
    }
}

/// SoC temperature in Celsius.
pub struct TemperatureCollector;

#[async_trait]
impl MetricCollector for TemperatureCollector {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::CpuTemp]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        // sysfs reads block; keep them off the runtime so the collector timeout applies
        let from_sensors = tokio::task::spawn_blocking(|| {
            let components = Components::new_with_refreshed_list();
            let list = components.list();
            list.iter()
                .find(|c| c.label().contains("cpu_thermal"))
                .or_else(|| list.iter().find(|c| c.label().to_lowercase().contains("cpu")))
                .map(|c| c.temperature())
                .filter(|t| t.is_finite())
        })
        .await
        .map_err(|e| CollectorError::Aborted(e.to_string()))?;
        if let Some(temp) = from_sensors {
            return Ok(vec![FieldValue::CpuTemp(temp)]);
        }

        let raw = tokio::fs::read_to_string(THERMAL_ZONE).await?;
        let millidegrees: f32 = raw.trim().parse().map_err(|_| CollectorError::Parse {
            what: "thermal zone temperature",
            input: raw.trim().to_string(),
        })?;
        Ok(vec![FieldValue::CpuTemp(millidegrees / 1000.0)])
    }
}

pub struct MemoryCollector;

#[async_trait]
impl MetricCollector for MemoryCollector {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Memory, StatField::Swap]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return Err(CollectorError::Unavailable("memory totals not reported".into()));
        }
        let available = sys.available_memory();
        let used = total.saturating_sub(available);

        let swap_total = sys.total_swap();
        let swap_used = sys.used_swap();

        Ok(vec![
            FieldValue::Memory(MemoryStats {
                total,
                available,
                used,
                percent: percent(used, total),
            }),
            FieldValue::Swap(SwapStats {
                total: swap_total,
                used: swap_used,
                free: sys.free_swap(),
                percent: percent(swap_used, swap_total),
            }),
        ])
    }
}

/// Usage of the filesystem mounted at one path.
pub struct DiskCollector {
    mount_point: PathBuf,
}

impl DiskCollector {
    pub fn root() -> Self {
        Self {
            mount_point: PathBuf::from("/"),
        }
    }
}

#[async_trait]
impl MetricCollector for DiskCollector {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Disk]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        // statvfs on a hung mount never returns
        let mount_point = self.mount_point.clone();
        let space = tokio::task::spawn_blocking(move || {
            Disks::new_with_refreshed_list()
                .list()
                .iter()
                .find(|d| d.mount_point() == mount_point.as_path())
                .map(|d| (d.total_space(), d.available_space()))
        })
        .await
        .map_err(|e| CollectorError::Aborted(e.to_string()))?;

        let (total, free) = space.ok_or_else(|| {
            CollectorError::Unavailable(format!(
                "no filesystem mounted at {}",
                self.mount_point.display()
            ))
        })?;
        let used = total.saturating_sub(free);
        Ok(vec![FieldValue::Disk(DiskStats {
            total,
            used,
            free,
            percent: percent(used, total),
        })])
    }
}

/// Aggregate block-device I/O counters from `/proc/diskstats`.
pub struct DiskIoCollector;

fn is_physical_disk(name: &str) -> bool {
    !name.starts_with("loop")
        && !name.starts_with("ram")
        && Path::new("/sys/block").join(name).exists()
}

/// Sum the counters of every device `include` accepts.
///
/// Columns after major/minor/name: reads, reads merged, sectors read, ms reading,
/// writes, writes merged, sectors written, ms writing, ...
pub(crate) fn parse_diskstats(text: &str, include: impl Fn(&str) -> bool) -> Option<DiskIoStats> {
    let mut totals = DiskIoStats::default();
    let mut seen = false;

    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 11 || !include(cols[2]) {
            continue;
        }
        let num = |i: usize| cols[i].parse::<u64>().unwrap_or(0);
        totals.read_count += num(3);
        totals.read_bytes += num(5) * SECTOR_SIZE;
        totals.read_time += num(6);
        totals.write_count += num(7);
        totals.write_bytes += num(9) * SECTOR_SIZE;
        totals.write_time += num(10);
        seen = true;
    }

    seen.then_some(totals)
}

#[async_trait]
impl MetricCollector for DiskIoCollector {
    fn name(&self) -> &'static str {
        "disk_io"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::DiskIo]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let text = tokio::fs::read_to_string(DISKSTATS).await?;
        let stats = parse_diskstats(&text, is_physical_disk)
            .ok_or_else(|| CollectorError::Unavailable("no block devices in /proc/diskstats".into()))?;
        Ok(vec![FieldValue::DiskIo(stats)])
    }
}

/// Uptime and load averages.
pub struct HostCollector;

#[async_trait]
impl MetricCollector for HostCollector {
    fn name(&self) -> &'static str {
        "host"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Uptime, StatField::LoadAvg]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let load = System::load_average();
        Ok(vec![
            FieldValue::Uptime(System::uptime()),
            FieldValue::LoadAvg([load.one, load.five, load.fifteen]),
        ])
    }
}

/// Per-interface traffic counters, WiFi signal and open socket count.
pub struct NetworkCollector {
    command_timeout: Duration,
}

impl NetworkCollector {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

pub(crate) fn parse_signal_level(iwconfig: &str) -> Option<i32> {
    SIGNAL_RE
        .captures(iwconfig)
        .and_then(|c| c[1].parse().ok())
}

// Entries in a /proc/net socket table (first line is the header)
pub(crate) fn count_socket_entries(table: &str) -> usize {
    table.lines().skip(1).filter(|l| !l.trim().is_empty()).count()
}

async fn active_connections() -> Option<usize> {
    let mut total = 0;
    let mut any = false;
    for table in ["/proc/net/tcp", "/proc/net/tcp6", "/proc/net/udp", "/proc/net/udp6"] {
        if let Ok(text) = tokio::fs::read_to_string(table).await {
            total += count_socket_entries(&text);
            any = true;
        }
    }
    any.then_some(total)
}

#[async_trait]
impl MetricCollector for NetworkCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    fn fields(&self) -> &'static [StatField] {
        &[StatField::Network]
    }

    async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
        let interfaces: BTreeMap<String, InterfaceStats> = {
            let networks = Networks::new_with_refreshed_list();
            networks
                .list()
                .iter()
                .filter(|(name, _)| name.as_str() != "lo")
                .map(|(name, data)| {
                    (
                        name.clone(),
                        InterfaceStats {
                            bytes_sent: data.total_transmitted(),
                            bytes_recv: data.total_received(),
                            packets_sent: data.total_packets_transmitted(),
                            packets_recv: data.total_packets_received(),
                            errin: data.total_errors_on_received(),
                            errout: data.total_errors_on_transmitted(),
                            signal_strength: None,
                        },
                    )
                })
                .collect()
        };

        let mut stats = NetworkStats {
            interfaces,
            active_connections: active_connections().await,
        };

        for (name, iface) in stats.interfaces.iter_mut() {
            if !name.starts_with("wlan") {
                continue;
            }
            match run_command("iwconfig", &[name.as_str()], self.command_timeout).await {
                Ok(out) => iface.signal_strength = parse_signal_level(&out),
                Err(e) => tracing::debug!(interface = %name, error = %e, "no wifi signal reading"),
            }
        }

        if stats.interfaces.is_empty() && stats.active_connections.is_none() {
            return Err(CollectorError::Unavailable("no network interfaces found".into()));
        }
        Ok(vec![FieldValue::Network(stats)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISKSTATS_SAMPLE: &str = "\
 179       0 mmcblk0 12000 300 480000 9000 6000 700 240000 15000 0 20000 24000
 179       1 mmcblk0p1 100 0 4000 50 2 0 8 1 0 60 51
   7       0 loop0 50 0 400 10 0 0 0 0 0 10 10
   8       0 sda 345 10 2000 120 55 5 800 300 0 400 420
";

    #[test]
    fn diskstats_sums_selected_devices() {
        let stats = parse_diskstats(DISKSTATS_SAMPLE, |name| {
            name == "mmcblk0" || name == "sda"
        })
        .unwrap();

        assert_eq!(stats.read_count, 12345);
        assert_eq!(stats.write_count, 6055);
        assert_eq!(stats.read_bytes, 482000 * 512);
        assert_eq!(stats.write_bytes, 240800 * 512);
        assert_eq!(stats.read_time, 9120);
        assert_eq!(stats.write_time, 15300);
    }

    #[test]
    fn diskstats_without_matching_devices_is_none() {
        assert!(parse_diskstats(DISKSTATS_SAMPLE, |_| false).is_none());
        assert!(parse_diskstats("", |_| true).is_none());
    }

    #[test]
    fn iwconfig_signal_level() {
        let out = "wlan0  IEEE 802.11  ESSID:\"home\"\n          Link Quality=52/70  Signal level=-58 dBm";
        assert_eq!(parse_signal_level(out), Some(-58));
        assert_eq!(parse_signal_level("wlan0  no wireless extensions."), None);
    }

    #[test]
    fn socket_tables_skip_header() {
        let table = "  sl  local_address rem_address   st\n   0: 00000000:1F90 00000000:0000 0A\n   1: 0100007F:0277 00000000:0000 0A\n";
        assert_eq!(count_socket_entries(table), 2);
        assert_eq!(count_socket_entries("  sl  local_address\n"), 0);
    }

    #[test]
    fn percent_rounds_to_one_decimal_and_handles_zero() {
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(5, 0), 0.0);
    }

    #[tokio::test]
    async fn host_collector_reports_both_fields() {
        let values = HostCollector.collect(SampleMode::Instant).await.unwrap();
        let fields: Vec<StatField> = values.iter().map(|v| v.field()).collect();
        assert_eq!(fields, vec![StatField::Uptime, StatField::LoadAvg]);
    }

    #[tokio::test]
    async fn unmounted_path_is_unavailable() {
        let collector = DiskCollector {
            mount_point: PathBuf::from("/no/such/mount/point"),
        };
        let err = collector.collect(SampleMode::Instant).await.unwrap_err();
        assert!(matches!(err, CollectorError::Unavailable(msg) if msg.contains("/no/such/mount/point")));
    }
}
