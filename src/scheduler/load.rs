use std::time::Duration;

use async_trait::async_trait;

/// System utilization at one point in time, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[async_trait]
pub trait LoadMonitor: Send + Sync {
    /// `None` when load cannot be measured; callers treat that as idle.
    async fn sample(&self) -> Option<LoadSample>;
}

/// Reads `/proc/stat` and `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcLoadMonitor {
    /// Gap between the two CPU snapshots.
    pub window: Duration,
}

impl Default for ProcLoadMonitor {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl LoadMonitor for ProcLoadMonitor {
    async fn sample(&self) -> Option<LoadSample> {
        let before = parse_cpu_times(&tokio::fs::read_to_string("/proc/stat").await.ok()?)?;
        tokio::time::sleep(self.window).await;
        let after = parse_cpu_times(&tokio::fs::read_to_string("/proc/stat").await.ok()?)?;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        Some(LoadSample {
            cpu_percent: cpu_percent(before, after)?,
            memory_percent: memory_percent(&meminfo)?,
        })
    }
}

/// Always reports the same sample. Useful for tests and for forcing
/// throttling off (`None`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLoadMonitor(pub Option<LoadSample>);

#[async_trait]
impl LoadMonitor for FixedLoadMonitor {
    async fn sample(&self) -> Option<LoadSample> {
        self.0
    }
}

/// (busy, total) jiffies from the aggregate `cpu` line.
fn parse_cpu_times(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

fn cpu_percent(before: (u64, u64), after: (u64, u64)) -> Option<f64> {
    let total = after.1.checked_sub(before.1)?;
    if total == 0 {
        return None;
    }
    let busy = after.0.saturating_sub(before.0);
    Some(busy as f64 / total as f64 * 100.0)
}

fn memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        let line = meminfo.lines().find(|line| line.starts_with(name))?;
        line.split_whitespace().nth(1)?.parse().ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}
