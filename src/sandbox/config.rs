use serde::{Deserialize, Serialize};
use tumbler_common::{SandboxPhase, VerificationOverrides};

/// Limits and policy applied to every sandbox container (`[verification]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// When false every run degrades to a review-only result.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-command timeout for the install phase, in seconds.
    #[serde(default = "default_timeout_install")]
    pub timeout_install: u64,
    #[serde(default = "default_timeout_build")]
    pub timeout_build: u64,
    #[serde(default = "default_timeout_test")]
    pub timeout_test: u64,
    #[serde(default = "default_timeout_lint")]
    pub timeout_lint: u64,
    /// Docker-style size string, e.g. "2g" or "512m".
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Size of the `/tmp` tmpfs mount.
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    /// Allow outbound network during install.
    #[serde(default = "default_network_install")]
    pub network_install: bool,
    /// Allow outbound network during build, test and lint.
    #[serde(default)]
    pub network_verify: bool,
    /// Captured stdout/stderr is cut at this many characters.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_install() -> u64 {
    300
}

fn default_timeout_build() -> u64 {
    300
}

fn default_timeout_test() -> u64 {
    120
}

fn default_timeout_lint() -> u64 {
    60
}

fn default_memory_limit() -> String {
    "2g".to_string()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_pids_limit() -> i64 {
    256
}

fn default_tmpfs_size() -> String {
    "512m".to_string()
}

fn default_network_install() -> bool {
    true
}

fn default_max_output_chars() -> usize {
    50_000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            timeout_install: default_timeout_install(),
            timeout_build: default_timeout_build(),
            timeout_test: default_timeout_test(),
            timeout_lint: default_timeout_lint(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
            tmpfs_size: default_tmpfs_size(),
            network_install: default_network_install(),
            network_verify: false,
            max_output_chars: default_max_output_chars(),
        }
    }
}

/// Longest per-command timeout a project override may ask for.
pub const MAX_OVERRIDE_TIMEOUT_SECS: u64 = 3600;

/// Most CPUs a project override may ask for.
pub const MAX_OVERRIDE_CPUS: f64 = 16.0;

/// Memory range a project override may ask for.
const MIN_OVERRIDE_MEMORY: i64 = 64 * 1024 * 1024;
const MAX_OVERRIDE_MEMORY: i64 = 64 * 1024 * 1024 * 1024;

impl SandboxConfig {
    /// Apply a project's overrides on top of this configuration.
    ///
    /// Overrides come from model-written plans, so each one is range-checked
    /// and an out-of-range value keeps the configured limit.
    pub fn with_overrides(&self, overrides: &VerificationOverrides) -> Self {
        let mut config = self.clone();
        let timeouts = [
            (SandboxPhase::Install, overrides.timeout_install, &mut config.timeout_install),
            (SandboxPhase::Build, overrides.timeout_build, &mut config.timeout_build),
            (SandboxPhase::Test, overrides.timeout_test, &mut config.timeout_test),
            (SandboxPhase::Lint, overrides.timeout_lint, &mut config.timeout_lint),
        ];
        for (phase, value, slot) in timeouts {
            match value {
                Some(secs) if (1..=MAX_OVERRIDE_TIMEOUT_SECS).contains(&secs) => *slot = secs,
                Some(secs) => {
                    tracing::warn!(phase = %phase, secs, "Ignoring out-of-range timeout override")
                }
                None => {}
            }
        }
        if let Some(memory) = &overrides.memory_limit {
            match parse_size(memory) {
                Some(bytes) if (MIN_OVERRIDE_MEMORY..=MAX_OVERRIDE_MEMORY).contains(&bytes) => {
                    config.memory_limit = memory.clone();
                }
                _ => tracing::warn!(memory_limit = %memory, "Ignoring invalid memory override"),
            }
        }
        if let Some(cpus) = overrides.cpu_limit {
            if cpus.is_finite() && cpus > 0.0 && cpus <= MAX_OVERRIDE_CPUS {
                config.cpu_limit = cpus;
            } else {
                tracing::warn!(cpu_limit = cpus, "Ignoring invalid CPU override");
            }
        }
        if let Some(tmpfs) = &overrides.tmpfs_size {
            match parse_size(tmpfs) {
                Some(bytes) if bytes <= MAX_OVERRIDE_MEMORY => config.tmpfs_size = tmpfs.clone(),
                _ => tracing::warn!(tmpfs_size = %tmpfs, "Ignoring invalid tmpfs override"),
            }
        }
        if let Some(network) = overrides.network_install {
            config.network_install = network;
        }
        if let Some(network) = overrides.network_verify {
            config.network_verify = network;
        }
        config
    }

    pub fn timeout_for(&self, phase: SandboxPhase) -> u64 {
        match phase {
            SandboxPhase::Install => self.timeout_install,
            SandboxPhase::Build => self.timeout_build,
            SandboxPhase::Test => self.timeout_test,
            SandboxPhase::Lint => self.timeout_lint,
        }
    }

    pub fn network_for(&self, phase: SandboxPhase) -> bool {
        match phase {
            SandboxPhase::Install => self.network_install,
            _ => self.network_verify,
        }
    }

    /// Memory ceiling in bytes. An invalid `memory_limit` falls back to the
    /// default ceiling; a container never runs without one.
    pub fn memory_bytes(&self) -> i64 {
        parse_size(&self.memory_limit)
            .or_else(|| parse_size(&default_memory_limit()))
            .unwrap_or(2 * 1024 * 1024 * 1024)
    }

    /// CPU quota in billionths of a CPU. Zero would mean unlimited to Docker,
    /// so a non-positive `cpu_limit` falls back to the default.
    pub fn nano_cpus(&self) -> i64 {
        let cpus = if self.cpu_limit.is_finite() && self.cpu_limit > 0.0 {
            self.cpu_limit
        } else {
            default_cpu_limit()
        };
        ((cpus * 1e9) as i64).max(1)
    }

    /// `tmpfs_size`, or the default when it is not a valid size.
    pub fn tmpfs_size(&self) -> String {
        if parse_size(&self.tmpfs_size).is_some() {
            self.tmpfs_size.clone()
        } else {
            default_tmpfs_size()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if parse_size(&self.memory_limit).is_none() {
            warnings.push(format!(
                "Invalid memory_limit '{}': expected a size such as '512m' or '2g'",
                self.memory_limit
            ));
        }
        if parse_size(&self.tmpfs_size).is_none() {
            warnings.push(format!(
                "Invalid tmpfs_size '{}': expected a size such as '512m'",
                self.tmpfs_size
            ));
        }
        if self.cpu_limit <= 0.0 {
            warnings.push(format!("cpu_limit must be positive, got {}", self.cpu_limit));
        }
        for phase in SandboxPhase::ALL {
            if self.timeout_for(phase) == 0 {
                warnings.push(format!("timeout_{} must be greater than zero", phase));
            }
        }
        warnings
    }
}

/// Parse a Docker-style size string ("512m", "2g", "1024k", "1048576").
pub fn parse_size(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024_i64),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value, 1),
        _ => return None,
    };
    let number: f64 = digits.trim().parse().ok()?;
    if number <= 0.0 {
        return None;
    }
    Some((number * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert!(config.enabled);
        assert_eq!(config.timeout_install, 300);
        assert_eq!(config.timeout_test, 120);
        assert_eq!(config.memory_limit, "2g");
        assert_eq!(config.cpu_limit, 1.0);
        assert_eq!(config.pids_limit, 256);
        assert!(config.network_install);
        assert!(!config.network_verify);
    }

    #[test]
    fn test_sandbox_config_partial_toml() {
        let config: SandboxConfig = toml::from_str(
            r#"
timeout_build = 900
memory_limit = "4g"
"#,
        )
        .unwrap();
        assert_eq!(config.timeout_build, 900);
        assert_eq!(config.memory_limit, "4g");
        assert_eq!(config.timeout_lint, 60); // default
        assert_eq!(config.tmpfs_size, "512m"); // default
    }

    #[test]
    fn test_with_overrides_only_touches_set_fields() {
        let base = SandboxConfig::default();
        let overrides = VerificationOverrides {
            timeout_test: Some(600),
            cpu_limit: Some(2.0),
            network_verify: Some(true),
            ..Default::default()
        };
        let merged = base.with_overrides(&overrides);
        assert_eq!(merged.timeout_test, 600);
        assert_eq!(merged.cpu_limit, 2.0);
        assert!(merged.network_for(SandboxPhase::Lint));
        assert_eq!(merged.timeout_build, base.timeout_build);
        assert_eq!(merged.memory_limit, base.memory_limit);
    }

    #[test]
    fn test_hostile_overrides_keep_configured_limits() {
        let base = SandboxConfig::default();
        let overrides = VerificationOverrides {
            memory_limit: Some("unlimited".into()),
            cpu_limit: Some(0.0),
            tmpfs_size: Some("-1".into()),
            timeout_install: Some(0),
            timeout_test: Some(u64::MAX),
            ..Default::default()
        };
        let merged = base.with_overrides(&overrides);
        assert_eq!(merged.memory_limit, "2g");
        assert_eq!(merged.cpu_limit, 1.0);
        assert_eq!(merged.tmpfs_size, "512m");
        assert_eq!(merged.timeout_install, 300);
        assert_eq!(merged.timeout_test, 120);
        assert!(merged.validate().is_empty());

        let huge = base.with_overrides(&VerificationOverrides {
            memory_limit: Some("1024g".into()),
            cpu_limit: Some(f64::NAN),
            timeout_build: Some(MAX_OVERRIDE_TIMEOUT_SECS),
            ..Default::default()
        });
        assert_eq!(huge.memory_limit, "2g");
        assert_eq!(huge.cpu_limit, 1.0);
        assert_eq!(huge.timeout_build, MAX_OVERRIDE_TIMEOUT_SECS);
    }

    #[test]
    fn test_limits_never_unbounded() {
        let config = SandboxConfig {
            memory_limit: "unlimited".into(),
            cpu_limit: 0.0,
            tmpfs_size: "big".into(),
            ..Default::default()
        };
        assert_eq!(config.memory_bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(config.nano_cpus(), 1_000_000_000);
        assert_eq!(config.tmpfs_size(), "512m");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("2GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let config = SandboxConfig {
            memory_limit: "huge".into(),
            cpu_limit: 0.0,
            timeout_lint: 0,
            ..Default::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(SandboxConfig::default().validate().is_empty());
    }
}
