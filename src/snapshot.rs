//! Typed model of one collected stats snapshot and its projections.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// A collected value, or the marker a failed collector leaves behind.
///
/// Serializes as the inner value, or as `null` when unavailable.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    Present(T),
    Unavailable,
}

impl<T> Reading<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Reading::Present(_))
    }
}

impl<T: Serialize> Serialize for Reading<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Present(v) => v.serialize(serializer),
            Reading::Unavailable => serializer.serialize_none(),
        }
    }
}

/// Top-level fields of a snapshot, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatField {
    CpuTemp,
    CpuFreq,
    CpuUsage,
    PerCpuUsage,
    Memory,
    Swap,
    Disk,
    DiskIo,
    Uptime,
    LoadAvg,
    Timestamp,
    Gpu,
    Power,
    Clocks,
    Network,
    Hardware,
}

impl StatField {
    pub const ALL: [StatField; 16] = [
        StatField::CpuTemp,
        StatField::CpuFreq,
        StatField::CpuUsage,
        StatField::PerCpuUsage,
        StatField::Memory,
        StatField::Swap,
        StatField::Disk,
        StatField::DiskIo,
        StatField::Uptime,
        StatField::LoadAvg,
        StatField::Timestamp,
        StatField::Gpu,
        StatField::Power,
        StatField::Clocks,
        StatField::Network,
        StatField::Hardware,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatField::CpuTemp => "cpu_temp",
            StatField::CpuFreq => "cpu_freq",
            StatField::CpuUsage => "cpu_usage",
            StatField::PerCpuUsage => "per_cpu_usage",
            StatField::Memory => "memory",
            StatField::Swap => "swap",
            StatField::Disk => "disk",
            StatField::DiskIo => "disk_io",
            StatField::Uptime => "uptime",
            StatField::LoadAvg => "load_avg",
            StatField::Timestamp => "timestamp",
            StatField::Gpu => "gpu",
            StatField::Power => "power",
            StatField::Clocks => "clocks",
            StatField::Network => "network",
            StatField::Hardware => "hardware",
        }
    }

    /// Parse a comma-separated field list.
    ///
    /// Names that are not snapshot fields are dropped; duplicates collapse.
    pub fn parse_list(csv: &str) -> Vec<StatField> {
        let mut fields: Vec<StatField> = csv
            .split(',')
            .filter_map(|name| name.trim().parse().ok())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownField(pub String);

impl FromStr for StatField {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownField(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DiskIoStats {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    // milliseconds spent on reads / writes
    pub read_time: u64,
    pub write_time: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GpuStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v3d_clock: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PowerStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub under_voltage: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_capped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<bool>,
}

// Clock frequencies in Hz
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ClockStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arm: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdram: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InterfaceStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

/// Per-interface counters keyed by interface name, plus a connection count
/// sharing the same JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NetworkStats {
    #[serde(flatten)]
    pub interfaces: BTreeMap<String, InterfaceStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_connections: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HardwareStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_devices: Option<usize>,
}

/// One value produced by a collector, tagged with the field it fills.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    CpuTemp(f32),
    // MHz
    CpuFreq(u64),
    CpuUsage(f32),
    PerCpuUsage(Vec<f32>),
    Memory(MemoryStats),
    Swap(SwapStats),
    Disk(DiskStats),
    DiskIo(DiskIoStats),
    // seconds
    Uptime(u64),
    LoadAvg([f64; 3]),
    Gpu(GpuStats),
    Power(PowerStats),
    Clocks(ClockStats),
    Network(NetworkStats),
    Hardware(HardwareStats),
}

impl FieldValue {
    pub fn field(&self) -> StatField {
        match self {
            FieldValue::CpuTemp(_) => StatField::CpuTemp,
            FieldValue::CpuFreq(_) => StatField::CpuFreq,
            FieldValue::CpuUsage(_) => StatField::CpuUsage,
            FieldValue::PerCpuUsage(_) => StatField::PerCpuUsage,
            FieldValue::Memory(_) => StatField::Memory,
            FieldValue::Swap(_) => StatField::Swap,
            FieldValue::Disk(_) => StatField::Disk,
            FieldValue::DiskIo(_) => StatField::DiskIo,
            FieldValue::Uptime(_) => StatField::Uptime,
            FieldValue::LoadAvg(_) => StatField::LoadAvg,
            FieldValue::Gpu(_) => StatField::Gpu,
            FieldValue::Power(_) => StatField::Power,
            FieldValue::Clocks(_) => StatField::Clocks,
            FieldValue::Network(_) => StatField::Network,
            FieldValue::Hardware(_) => StatField::Hardware,
        }
    }
}

/// A complete set of metric values captured together.
///
/// Built once per collection, then shared behind an `Arc` and never mutated.
/// Fields no collector filled stay [`Reading::Unavailable`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub cpu_temp: Reading<f32>,
    pub cpu_freq: Reading<u64>,
    pub cpu_usage: Reading<f32>,
    pub per_cpu_usage: Reading<Vec<f32>>,
    pub memory: Reading<MemoryStats>,
    pub swap: Reading<SwapStats>,
    pub disk: Reading<DiskStats>,
    pub disk_io: Reading<DiskIoStats>,
    pub uptime: Reading<u64>,
    pub load_avg: Reading<[f64; 3]>,
    /// Unix time of collection, in seconds.
    pub timestamp: f64,
    pub gpu: Reading<GpuStats>,
    pub power: Reading<PowerStats>,
    pub clocks: Reading<ClockStats>,
    pub network: Reading<NetworkStats>,
    pub hardware: Reading<HardwareStats>,
}

impl StatsSnapshot {
    pub fn new(timestamp: f64) -> Self {
        Self {
            cpu_temp: Reading::Unavailable,
            cpu_freq: Reading::Unavailable,
            cpu_usage: Reading::Unavailable,
            per_cpu_usage: Reading::Unavailable,
            memory: Reading::Unavailable,
            swap: Reading::Unavailable,
            disk: Reading::Unavailable,
            disk_io: Reading::Unavailable,
            uptime: Reading::Unavailable,
            load_avg: Reading::Unavailable,
            timestamp,
            gpu: Reading::Unavailable,
            power: Reading::Unavailable,
            clocks: Reading::Unavailable,
            network: Reading::Unavailable,
            hardware: Reading::Unavailable,
        }
    }

    pub fn apply(&mut self, value: FieldValue) {
        match value {
            FieldValue::CpuTemp(v) => self.cpu_temp = Reading::Present(v),
            FieldValue::CpuFreq(v) => self.cpu_freq = Reading::Present(v),
            FieldValue::CpuUsage(v) => self.cpu_usage = Reading::Present(v),
            FieldValue::PerCpuUsage(v) => self.per_cpu_usage = Reading::Present(v),
            FieldValue::Memory(v) => self.memory = Reading::Present(v),
            FieldValue::Swap(v) => self.swap = Reading::Present(v),
            FieldValue::Disk(v) => self.disk = Reading::Present(v),
            FieldValue::DiskIo(v) => self.disk_io = Reading::Present(v),
            FieldValue::Uptime(v) => self.uptime = Reading::Present(v),
            FieldValue::LoadAvg(v) => self.load_avg = Reading::Present(v),
            FieldValue::Gpu(v) => self.gpu = Reading::Present(v),
            FieldValue::Power(v) => self.power = Reading::Present(v),
            FieldValue::Clocks(v) => self.clocks = Reading::Present(v),
            FieldValue::Network(v) => self.network = Reading::Present(v),
            FieldValue::Hardware(v) => self.hardware = Reading::Present(v),
        }
    }

    /// JSON value of one top-level field.
    pub fn field_value(&self, field: StatField) -> Value {
        match field {
            StatField::CpuTemp => json(&self.cpu_temp),
            StatField::CpuFreq => json(&self.cpu_freq),
            StatField::CpuUsage => json(&self.cpu_usage),
            StatField::PerCpuUsage => json(&self.per_cpu_usage),
            StatField::Memory => json(&self.memory),
            StatField::Swap => json(&self.swap),
            StatField::Disk => json(&self.disk),
            StatField::DiskIo => json(&self.disk_io),
            StatField::Uptime => json(&self.uptime),
            StatField::LoadAvg => json(&self.load_avg),
            StatField::Timestamp => json(&self.timestamp),
            StatField::Gpu => json(&self.gpu),
            StatField::Power => json(&self.power),
            StatField::Clocks => json(&self.clocks),
            StatField::Network => json(&self.network),
            StatField::Hardware => json(&self.hardware),
        }
    }

    /// Keep only the requested top-level fields.
    pub fn project(&self, fields: &[StatField]) -> ProjectedResponse {
        let map = fields
            .iter()
            .map(|f| (f.as_str().to_string(), self.field_value(*f)))
            .collect();
        ProjectedResponse(map)
    }
}

fn json<T: Serialize>(value: &T) -> Value {
    // snapshot types only have string map keys, so this does not fail in practice
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// A per-request subset of a snapshot's top-level fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProjectedResponse(pub Map<String, Value>);

impl ProjectedResponse {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a stats request gets back: the shared full snapshot or a projection of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatsView {
    Full(Arc<StatsSnapshot>),
    Projected(ProjectedResponse),
}

impl StatsView {
    pub fn of(snapshot: Arc<StatsSnapshot>, fields: Option<&[StatField]>) -> Self {
        match fields {
            Some(fields) => StatsView::Projected(snapshot.project(fields)),
            None => StatsView::Full(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatsSnapshot {
        let mut snap = StatsSnapshot::new(1646092800.0);
        snap.apply(FieldValue::CpuUsage(12.5));
        snap.apply(FieldValue::Uptime(86400));
        snap.apply(FieldValue::LoadAvg([0.5, 0.7, 0.9]));
        snap
    }

    #[test]
    fn parse_list_drops_unknown_names() {
        let fields = StatField::parse_list("cpu_usage, bogus,memory,,cpu_usage");
        assert_eq!(fields, vec![StatField::CpuUsage, StatField::Memory]);
    }

    #[test]
    fn field_names_round_trip() {
        for field in StatField::ALL {
            assert_eq!(field.as_str().parse::<StatField>(), Ok(field));
        }
        assert!("CPU_USAGE".parse::<StatField>().is_err());
    }

    #[test]
    fn unavailable_serializes_as_null() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["cpu_usage"], serde_json::json!(12.5));
        assert_eq!(value["memory"], Value::Null);
        assert_eq!(value["load_avg"], serde_json::json!([0.5, 0.7, 0.9]));
        assert_eq!(value.as_object().unwrap().len(), StatField::ALL.len());
    }

    #[test]
    fn projection_keeps_requested_fields_only() {
        let projected = sample().project(&[StatField::CpuUsage, StatField::Uptime]);
        assert_eq!(projected.len(), 2);
        assert_eq!(projected.get("uptime"), Some(&serde_json::json!(86400)));
        assert!(projected.get("timestamp").is_none());
    }

    #[test]
    fn network_interfaces_flatten_next_to_connection_count() {
        let mut net = NetworkStats::default();
        net.interfaces.insert(
            "eth0".into(),
            InterfaceStats {
                bytes_sent: 10,
                bytes_recv: 20,
                ..Default::default()
            },
        );
        net.active_connections = Some(3);

        let value = serde_json::to_value(&net).unwrap();
        assert_eq!(value["eth0"]["bytes_recv"], serde_json::json!(20));
        assert_eq!(value["active_connections"], serde_json::json!(3));
        assert!(value["eth0"].get("signal_strength").is_none());
    }
}
