//! Derivation of client-facing metrics from the engine's raw stats samples.
//!
//! Only the fields read here are modelled. Every one of them is optional and
//! falls back as follows when absent or of an unexpected JSON type:
//!
//! | field | fallback |
//! |---|---|
//! | `cpu_stats.cpu_usage.total_usage` | 0 |
//! | `cpu_stats.system_cpu_usage` | 0 |
//! | `cpu_stats.online_cpus` | 1 |
//! | `memory_stats.usage` / `.limit` | 0 |
//! | `networks.*.rx_bytes` / `.tx_bytes` | 0 per interface, no interfaces = 0 |
//! | `blkio_stats.io_service_bytes_recursive` | empty (null is common on cgroup v2) |
//! | entry `op` / `value` | entry ignored / 0 |
//! | `pids_stats.current` | 0 |
//! | `read` | publish time |

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;

use crate::models::ContainerMetrics;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawStatsSample {
    #[serde(deserialize_with = "lenient::text")]
    pub read: Option<String>,
    #[serde(deserialize_with = "lenient::field")]
    pub cpu_stats: Option<CpuStats>,
    #[serde(deserialize_with = "lenient::field")]
    pub memory_stats: Option<MemoryStats>,
    #[serde(deserialize_with = "lenient::field")]
    pub networks: Option<HashMap<String, NetworkCounters>>,
    #[serde(deserialize_with = "lenient::field")]
    pub blkio_stats: Option<BlkioStats>,
    #[serde(deserialize_with = "lenient::field")]
    pub pids_stats: Option<PidsStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    #[serde(deserialize_with = "lenient::field")]
    pub cpu_usage: Option<CpuUsage>,
    #[serde(deserialize_with = "lenient::count")]
    pub system_cpu_usage: Option<u64>,
    #[serde(deserialize_with = "lenient::count")]
    pub online_cpus: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    #[serde(deserialize_with = "lenient::count")]
    pub total_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    #[serde(deserialize_with = "lenient::count")]
    pub usage: Option<u64>,
    #[serde(deserialize_with = "lenient::count")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkCounters {
    #[serde(deserialize_with = "lenient::count")]
    pub rx_bytes: Option<u64>,
    #[serde(deserialize_with = "lenient::count")]
    pub tx_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlkioStats {
    #[serde(deserialize_with = "lenient::field")]
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlkioEntry {
    #[serde(deserialize_with = "lenient::text")]
    pub op: Option<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub value: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    #[serde(deserialize_with = "lenient::count")]
    pub current: Option<u64>,
}

/// Field deserializers that read a value of the wrong JSON type as absent
/// instead of rejecting the whole sample.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn field<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(serde_json::from_value(value).ok())
    }

    /// Non-negative integer counters. Non-negative floats are truncated.
    pub fn count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(value.as_u64().or_else(|| {
            value
                .as_f64()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .map(|n| n as u64)
        }))
    }

    pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }
}

impl RawStatsSample {
    fn cpu_total(&self) -> u64 {
        self.cpu_stats
            .as_ref()
            .and_then(|cpu| cpu.cpu_usage.as_ref())
            .and_then(|usage| usage.total_usage)
            .unwrap_or(0)
    }

    fn system_cpu_total(&self) -> u64 {
        self.cpu_stats
            .as_ref()
            .and_then(|cpu| cpu.system_cpu_usage)
            .unwrap_or(0)
    }

    fn online_cpus(&self) -> u64 {
        self.cpu_stats
            .as_ref()
            .and_then(|cpu| cpu.online_cpus)
            .unwrap_or(1)
    }
}

/// Rounds half away from zero at two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// CPU share of the host consumed between two samples, in percent of one core.
///
/// Zero without a predecessor or when the system counter did not advance.
pub fn cpu_percent(previous: Option<&RawStatsSample>, current: &RawStatsSample) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };

    let cpu_delta = current.cpu_total() as f64 - previous.cpu_total() as f64;
    let system_delta = current.system_cpu_total() as f64 - previous.system_cpu_total() as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }

    cpu_delta / system_delta * current.online_cpus() as f64 * 100.0
}

fn network_totals(sample: &RawStatsSample) -> (u64, u64) {
    sample
        .networks
        .iter()
        .flat_map(|networks| networks.values())
        .fold((0u64, 0u64), |(rx, tx), iface| {
            (
                rx.saturating_add(iface.rx_bytes.unwrap_or(0)),
                tx.saturating_add(iface.tx_bytes.unwrap_or(0)),
            )
        })
}

fn block_io_totals(sample: &RawStatsSample) -> (u64, u64) {
    let entries = sample
        .blkio_stats
        .as_ref()
        .and_then(|blkio| blkio.io_service_bytes_recursive.as_deref())
        .unwrap_or_default();

    let mut read = 0u64;
    let mut write = 0u64;
    for entry in entries {
        let value = entry.value.unwrap_or(0);
        match entry.op.as_deref() {
            Some("read") | Some("Read") => read = read.saturating_add(value),
            Some("write") | Some("Write") => write = write.saturating_add(value),
            _ => {}
        }
    }
    (read, write)
}

/// Builds one metrics snapshot. `now` is only used when the sample carries no
/// timestamp of its own.
pub fn compute_metrics(
    previous: Option<&RawStatsSample>,
    current: &RawStatsSample,
    now: chrono::DateTime<Utc>,
) -> ContainerMetrics {
    let memory = current.memory_stats.clone().unwrap_or_default();
    let memory_usage = memory.usage.unwrap_or(0);
    let memory_limit = memory.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        memory_usage as f64 / memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (network_rx, network_tx) = network_totals(current);
    let (block_read, block_write) = block_io_totals(current);

    let timestamp = match current.read.as_deref() {
        Some(read) if !read.is_empty() => read.to_string(),
        _ => now.to_rfc3339_opts(SecondsFormat::Millis, true),
    };

    ContainerMetrics {
        cpu_percent: round2(cpu_percent(previous, current)),
        memory_usage,
        memory_limit,
        memory_percent: round2(memory_percent),
        network_rx,
        network_tx,
        block_read,
        block_write,
        pids: current
            .pids_stats
            .as_ref()
            .and_then(|pids| pids.current)
            .unwrap_or(0),
        timestamp,
    }
}

/// Keeps the previous sample of one stats session so each new sample can be
/// turned into a [`ContainerMetrics`].
#[derive(Debug, Default)]
pub struct StatsSampler {
    previous: Option<RawStatsSample>,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: RawStatsSample) -> ContainerMetrics {
        let metrics = compute_metrics(self.previous.as_ref(), &sample, Utc::now());
        self.previous = Some(sample);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(json: &str) -> RawStatsSample {
        serde_json::from_str(json).unwrap()
    }

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_first_sample_has_zero_cpu() {
        let current = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1500},"system_cpu_usage":10500,"online_cpus":2}}"#,
        );
        let metrics = compute_metrics(None, &current, fixed_now());
        assert_eq!(metrics.cpu_percent, 0.0);
    }

    #[test]
    fn test_cpu_percent_from_consecutive_samples() {
        let previous = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1000},"system_cpu_usage":10000,"online_cpus":2}}"#,
        );
        let current = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1500},"system_cpu_usage":10500,"online_cpus":2}}"#,
        );
        let metrics = compute_metrics(Some(&previous), &current, fixed_now());
        assert_eq!(metrics.cpu_percent, 200.0);
    }

    #[test]
    fn test_cpu_percent_rounds_to_two_decimals() {
        let previous = sample(r#"{"cpu_stats":{"cpu_usage":{"total_usage":0},"system_cpu_usage":0}}"#);
        let current =
            sample(r#"{"cpu_stats":{"cpu_usage":{"total_usage":1},"system_cpu_usage":3}}"#);
        let metrics = compute_metrics(Some(&previous), &current, fixed_now());
        assert_eq!(metrics.cpu_percent, 33.33);
    }

    #[test]
    fn test_stalled_system_counter_gives_zero_cpu() {
        let previous = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1000},"system_cpu_usage":10000}}"#,
        );
        let stalled = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":2000},"system_cpu_usage":10000}}"#,
        );
        let rewound = sample(r#"{"cpu_stats":{"cpu_usage":{"total_usage":10},"system_cpu_usage":50}}"#);

        assert_eq!(cpu_percent(Some(&previous), &stalled), 0.0);
        assert_eq!(cpu_percent(Some(&previous), &rewound), 0.0);
    }

    #[test]
    fn test_container_counter_reset_follows_formula() {
        let previous = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1000},"system_cpu_usage":10000,"online_cpus":2}}"#,
        );
        let current = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":500},"system_cpu_usage":11000,"online_cpus":2}}"#,
        );
        let metrics = compute_metrics(Some(&previous), &current, fixed_now());
        assert_eq!(metrics.cpu_percent, -100.0);
    }

    #[test]
    fn test_online_cpus_defaults_only_when_absent() {
        let previous = sample(r#"{"cpu_stats":{"cpu_usage":{"total_usage":0},"system_cpu_usage":0}}"#);
        let absent =
            sample(r#"{"cpu_stats":{"cpu_usage":{"total_usage":50},"system_cpu_usage":100}}"#);
        let zero = sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":50},"system_cpu_usage":100,"online_cpus":0}}"#,
        );

        assert_eq!(cpu_percent(Some(&previous), &absent), 50.0);
        assert_eq!(cpu_percent(Some(&previous), &zero), 0.0);
    }

    #[test]
    fn test_mistyped_fields_default_without_losing_sample() {
        let current = sample(
            r#"{
                "read": 17,
                "cpu_stats": {"cpu_usage": {"total_usage": "lots"}, "online_cpus": -2},
                "memory_stats": {"usage": 2048.0, "limit": -1},
                "networks": {"eth0": {"rx_bytes": 10, "tx_bytes": "n/a"}},
                "blkio_stats": {"io_service_bytes_recursive": [{"op": 5, "value": 1}, {"op": "Read", "value": 3}]},
                "pids_stats": []
            }"#,
        );
        let metrics = compute_metrics(None, &current, fixed_now());

        assert_eq!(metrics.memory_usage, 2048);
        assert_eq!(metrics.memory_limit, 0);
        assert_eq!((metrics.network_rx, metrics.network_tx), (10, 0));
        assert_eq!((metrics.block_read, metrics.block_write), (3, 0));
        assert_eq!(metrics.pids, 0);
        assert_eq!(metrics.timestamp, "2024-05-01T12:00:00.000Z");
        assert_eq!(current.online_cpus(), 1);
    }

    #[test]
    fn test_memory_percent_with_zero_limit() {
        let current = sample(r#"{"memory_stats":{"usage":123456,"limit":0}}"#);
        let metrics = compute_metrics(None, &current, fixed_now());
        assert_eq!(metrics.memory_usage, 123456);
        assert_eq!(metrics.memory_percent, 0.0);
    }

    #[test]
    fn test_memory_percent_rounding() {
        let current = sample(r#"{"memory_stats":{"usage":1,"limit":3}}"#);
        let metrics = compute_metrics(None, &current, fixed_now());
        assert_eq!(metrics.memory_percent, 33.33);
    }

    #[test]
    fn test_network_and_block_io_aggregation() {
        let current = sample(
            r#"{
                "networks": {
                    "eth0": {"rx_bytes": 100, "tx_bytes": 10},
                    "eth1": {"rx_bytes": 50, "tx_bytes": 5},
                    "lo": {}
                },
                "blkio_stats": {"io_service_bytes_recursive": [
                    {"major": 8, "minor": 0, "op": "Read", "value": 4096},
                    {"major": 8, "minor": 0, "op": "read", "value": 1024},
                    {"major": 8, "minor": 0, "op": "Write", "value": 512},
                    {"major": 8, "minor": 0, "op": "write", "value": 256},
                    {"major": 8, "minor": 0, "op": "Sync", "value": 9999},
                    {"major": 8, "minor": 0, "op": "Total", "value": 9999}
                ]},
                "pids_stats": {"current": 7}
            }"#,
        );
        let metrics = compute_metrics(None, &current, fixed_now());
        assert_eq!((metrics.network_rx, metrics.network_tx), (150, 15));
        assert_eq!((metrics.block_read, metrics.block_write), (5120, 768));
        assert_eq!(metrics.pids, 7);
    }

    #[test]
    fn test_empty_sample_defaults_everything() {
        let current = sample(r#"{"blkio_stats":{"io_service_bytes_recursive":null}}"#);
        let metrics = compute_metrics(None, &current, fixed_now());
        assert_eq!(
            metrics,
            ContainerMetrics {
                cpu_percent: 0.0,
                memory_usage: 0,
                memory_limit: 0,
                memory_percent: 0.0,
                network_rx: 0,
                network_tx: 0,
                block_read: 0,
                block_write: 0,
                pids: 0,
                timestamp: "2024-05-01T12:00:00.000Z".to_string(),
            }
        );
    }

    #[test]
    fn test_sample_timestamp_is_preserved() {
        let current = sample(r#"{"read":"2024-05-01T12:00:01.123456789Z"}"#);
        let metrics = compute_metrics(None, &current, fixed_now());
        assert_eq!(metrics.timestamp, "2024-05-01T12:00:01.123456789Z");
    }

    #[test]
    fn test_sampler_uses_previous_observation() {
        let mut sampler = StatsSampler::new();
        let first = sampler.observe(sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1000},"system_cpu_usage":10000,"online_cpus":4}}"#,
        ));
        let second = sampler.observe(sample(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":1100},"system_cpu_usage":11000,"online_cpus":4}}"#,
        ));
        assert_eq!(first.cpu_percent, 0.0);
        assert_eq!(second.cpu_percent, 40.0);
    }
}
