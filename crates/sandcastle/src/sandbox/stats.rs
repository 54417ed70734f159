//! Container resource sampling.
//!
//! Usage is read from inside the container: the cgroup v2 `cpu.stat` and
//! `memory.*` files describe the container itself, and `/proc/stat` gives
//! the host-wide CPU clock the container's usage is measured against.

use anyhow::{Context, Result};

/// Shell snippet printing one usage sample as labelled lines.
pub(crate) const USAGE_SCRIPT: &str = "grep '^usage_usec' /sys/fs/cgroup/cpu.stat; \
head -n 1 /proc/stat; \
echo \"memory_current $(cat /sys/fs/cgroup/memory.current)\"; \
echo \"memory_max $(cat /sys/fs/cgroup/memory.max)\"";

/// Kernel clock ticks per second for `/proc/stat` (USER_HZ).
const USER_HZ: u64 = 100;
const MICROS_PER_TICK: u64 = 1_000_000 / USER_HZ;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageSample {
    /// Cumulative container CPU time.
    pub cpu_usage_usec: u64,
    /// Cumulative host CPU time across all cores.
    pub system_usec: u64,
    pub memory_bytes: u64,
    /// `None` when the cgroup reports `max`.
    pub memory_limit_bytes: Option<u64>,
}

pub fn parse_usage_sample(contents: &str) -> Result<UsageSample> {
    let mut sample = UsageSample::default();
    let mut saw_cpu = false;
    let mut saw_system = false;

    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("usage_usec") => {
                sample.cpu_usage_usec = parts
                    .next()
                    .context("usage_usec line has no value")?
                    .parse()
                    .context("parsing usage_usec")?;
                saw_cpu = true;
            }
            Some("cpu") => {
                let ticks: Vec<u64> = parts
                    .map(|value| value.parse::<u64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context("parsing cpu times")?;
                if ticks.len() < 4 {
                    return Err(anyhow::anyhow!("cpu stats line missing expected fields"));
                }
                sample.system_usec = ticks.iter().sum::<u64>() * MICROS_PER_TICK;
                saw_system = true;
            }
            Some("memory_current") => {
                if let Some(value) = parts.next() {
                    sample.memory_bytes = value.parse().context("parsing memory.current")?;
                }
            }
            Some("memory_max") => {
                sample.memory_limit_bytes = parts.next().and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }

    if !saw_cpu {
        return Err(anyhow::anyhow!("missing usage_usec in cpu.stat"));
    }
    if !saw_system {
        return Err(anyhow::anyhow!("missing cpu line in /proc/stat"));
    }
    Ok(sample)
}

/// Container CPU share of the host clock between two samples, in percent.
pub fn compute_cpu_percent(prev: &UsageSample, current: &UsageSample) -> f64 {
    let cpu_delta = current.cpu_usage_usec.saturating_sub(prev.cpu_usage_usec);
    let system_delta = current.system_usec.saturating_sub(prev.system_usec);
    if system_delta == 0 {
        return 0.0;
    }
    round2(cpu_delta as f64 / system_delta as f64 * 100.0)
}

/// Memory in MiB and as a percentage of the cgroup limit.
pub fn memory_usage(sample: &UsageSample) -> (f64, f64) {
    let used_mb = round2(sample.memory_bytes as f64 / (1024.0 * 1024.0));
    let percent = match sample.memory_limit_bytes {
        Some(limit) if limit > 0 => round2(sample.memory_bytes as f64 / limit as f64 * 100.0),
        _ => 0.0,
    };
    (used_mb, percent)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "usage_usec 250000\n\
cpu  2255 34 2290 22625563 6290 127 456 0 0 0\n\
memory_current 134217728\n\
memory_max 536870912\n";

    #[test]
    fn test_parse_usage_sample() {
        let parsed = parse_usage_sample(SAMPLE).unwrap();
        assert_eq!(parsed.cpu_usage_usec, 250_000);
        assert!(parsed.system_usec > 0);
        assert_eq!(parsed.memory_limit_bytes, Some(536_870_912));
    }

    #[test]
    fn test_unlimited_memory_parses_as_none() {
        let parsed =
            parse_usage_sample("usage_usec 1\ncpu  1 1 1 1\nmemory_current 10\nmemory_max max\n")
                .unwrap();
        assert_eq!(parsed.memory_limit_bytes, None);
        assert_eq!(memory_usage(&parsed).1, 0.0);
    }

    #[test]
    fn test_missing_cpu_stat_is_error() {
        assert!(parse_usage_sample("cpu  1 1 1 1\n").is_err());
        assert!(parse_usage_sample("usage_usec 5\n").is_err());
    }

    #[test]
    fn test_compute_cpu_percent() {
        let prev = UsageSample {
            cpu_usage_usec: 0,
            system_usec: 0,
            ..Default::default()
        };
        let current = UsageSample {
            cpu_usage_usec: 50_000,
            system_usec: 300_000,
            ..Default::default()
        };
        assert_eq!(compute_cpu_percent(&prev, &current), 16.67);
    }

    #[test]
    fn test_compute_cpu_percent_zero_denominator() {
        let sample = UsageSample {
            cpu_usage_usec: 10,
            system_usec: 10,
            ..Default::default()
        };
        assert_eq!(compute_cpu_percent(&sample, &sample), 0.0);
    }

    #[test]
    fn test_memory_usage() {
        let parsed = parse_usage_sample(SAMPLE).unwrap();
        assert_eq!(memory_usage(&parsed), (128.0, 25.0));
    }
}
