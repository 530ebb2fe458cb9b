//! Feature flags for the fast-path / memory rollout.
//!
//! Flags are read from the environment once and cached for the process
//! lifetime. `reload()` exists for tests only.

use std::sync::{OnceLock, RwLock};

use tracing::info;

/// Floor applied to MEM0_TIMEOUT_MS regardless of configuration.
pub const MEMORY_TIMEOUT_FLOOR_MS: u64 = 800;

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    /// Enable fast-path routing for greetings / handoff / price queries.
    pub fast_path_enabled: bool,
    /// Enable memory-layer reads.
    pub memory_reads_enabled: bool,
    /// Run memory writes in shadow mode (writes happen, reads stay off).
    pub memory_shadow_mode: bool,
    /// Fraction of traffic routed through canary features (0.0–1.0).
    pub canary_sample_rate: f64,
    /// When set, conversation log failures become hard errors (tests).
    pub conversation_log_fail_fast: bool,
    /// Memory query timeout, clamped to [MEMORY_TIMEOUT_FLOOR_MS, ∞).
    pub memory_timeout_ms: u64,
}

impl FeatureFlags {
    fn from_env() -> Self {
        let flags = Self {
            fast_path_enabled: parse_bool(std::env::var("FAST_PATH_ENABLED").ok()),
            memory_reads_enabled: parse_bool(std::env::var("MEM0_READS_ENABLED").ok()),
            memory_shadow_mode: parse_bool(std::env::var("MEM0_SHADOW_MODE").ok()),
            canary_sample_rate: std::env::var("CANARY_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v.clamp(0.0, 1.0))
                .unwrap_or(0.0),
            conversation_log_fail_fast: parse_bool(
                std::env::var("CONVERSATION_LOG_FAIL_FAST").ok(),
            ),
            memory_timeout_ms: std::env::var("MEM0_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(6_000)
                .max(MEMORY_TIMEOUT_FLOOR_MS),
        };
        info!(
            fast_path = flags.fast_path_enabled,
            memory_reads = flags.memory_reads_enabled,
            memory_shadow = flags.memory_shadow_mode,
            canary_rate = flags.canary_sample_rate,
            "feature flags loaded"
        );
        flags
    }

    /// Reads are only live outside shadow mode.
    pub fn memory_reads_live(&self) -> bool {
        self.memory_reads_enabled && !self.memory_shadow_mode
    }

    /// Writes are live when reads are enabled OR shadow mode is on.
    pub fn memory_writes_live(&self) -> bool {
        self.memory_reads_enabled || self.memory_shadow_mode
    }
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("true") | Some("1") | Some("yes") | Some("on")
    )
}

fn cell() -> &'static RwLock<Option<FeatureFlags>> {
    static CELL: OnceLock<RwLock<Option<FeatureFlags>>> = OnceLock::new();
    CELL.get_or_init(|| RwLock::new(None))
}

/// Global flags, loaded on first access.
pub fn get() -> FeatureFlags {
    {
        let guard = cell().read().unwrap();
        if let Some(ref flags) = *guard {
            return flags.clone();
        }
    }
    let flags = FeatureFlags::from_env();
    *cell().write().unwrap() = Some(flags.clone());
    flags
}

/// Re-read flags from the environment. Test hook.
pub fn reload() -> FeatureFlags {
    let flags = FeatureFlags::from_env();
    *cell().write().unwrap() = Some(flags.clone());
    flags
}

pub fn is_fast_path_enabled() -> bool {
    get().fast_path_enabled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool(Some("true".into())));
        assert!(parse_bool(Some("1".into())));
        assert!(parse_bool(Some("YES".into())));
        assert!(!parse_bool(Some("false".into())));
        assert!(!parse_bool(Some("0".into())));
        assert!(!parse_bool(None));
    }

    #[test]
    fn memory_gating_rules() {
        let flags = FeatureFlags {
            fast_path_enabled: false,
            memory_reads_enabled: true,
            memory_shadow_mode: true,
            canary_sample_rate: 0.0,
            conversation_log_fail_fast: false,
            memory_timeout_ms: 6_000,
        };
        // Shadow mode keeps writes on but reads off.
        assert!(!flags.memory_reads_live());
        assert!(flags.memory_writes_live());
    }
}
