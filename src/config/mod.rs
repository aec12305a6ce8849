//! Process-wide configuration, read once from the environment and
//! published behind a [`OnceLock`] (spec.md section 5: "read once at
//! first use, under the init guard; immutable thereafter").
//!
//! `parse` is a pure function of a name-lookup closure so it can be unit
//! tested without touching real process environment variables; `from_env`
//! is the thin wrapper that plugs in [`std::env::var`].

use std::sync::OnceLock;

use crate::decision::Scheme;

#[derive(Clone, Debug)]
pub struct Config {
    pub scheme: Scheme,
    pub hash_mask: u64,
    pub poisson_mean_bytes: u64,
    pub hybrid_threshold: u64,
    pub window_size: u64,
    pub stats_file: Option<String>,
    pub log_enabled: bool,
    pub event_trace_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scheme: Scheme::None,
            hash_mask: 0xFF,
            poisson_mean_bytes: 4096,
            hybrid_threshold: 256,
            window_size: 100_000,
            stats_file: None,
            log_enabled: false,
            event_trace_enabled: false,
        }
    }
}

/// Parses a mask value, accepting either `0x`/`0X`-prefixed hex or plain
/// decimal (spec.md section 6 gives hex examples; the env var is a string,
/// and operators reasonably expect either form to work).
fn parse_mask(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse::<u64>().ok()
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "yes" | "on")
}

/// Builds a [`Config`] from a lookup function, defaulting any var that is
/// absent or fails to parse rather than aborting (spec.md section 6: bad
/// or missing env vars fall back to the documented default).
fn parse(lookup: impl Fn(&str) -> Option<String>) -> Config {
    let mut cfg = Config::default();

    if let Some(v) = lookup("SAMPLER_SCHEME") {
        cfg.scheme = Scheme::from_env_name(v.trim());
    }
    if let Some(v) = lookup("SAMPLER_HASH_MASK").and_then(|v| parse_mask(&v)) {
        cfg.hash_mask = v;
    }
    if let Some(v) = lookup("SAMPLER_POISSON_MEAN_BYTES").and_then(|v| v.trim().parse().ok()) {
        cfg.poisson_mean_bytes = v;
    }
    if let Some(v) = lookup("SAMPLER_HYBRID_THRESHOLD").and_then(|v| v.trim().parse().ok()) {
        cfg.hybrid_threshold = v;
    }
    if let Some(v) = lookup("SAMPLER_WINDOW_SIZE").and_then(|v| v.trim().parse().ok()) {
        cfg.window_size = v;
    }
    if let Some(v) = lookup("SAMPLER_STATS_FILE") {
        cfg.stats_file = Some(v);
    }
    if let Some(v) = lookup("SAMPLER_LOG") {
        cfg.log_enabled = parse_bool(&v);
    }
    if let Some(v) = lookup("SAMPLER_EVENT_TRACE") {
        cfg.event_trace_enabled = parse_bool(&v);
    }

    // The scheme a build recognizes is fixed by the compiled liveness
    // policy; a scheme from a different family is a configuration error,
    // not something this build can honor, so it's downgraded to no
    // sampling (SPEC_FULL.md section 13).
    if let Some(wanted) = cfg.scheme.policy() {
        if wanted != crate::liveness::ACTIVE_POLICY {
            crate::diag::log(
                cfg.log_enabled,
                format_args!(
                    "SAMPLER_SCHEME {:?} needs policy {:?}, but this build only has {:?}; disabling sampling",
                    cfg.scheme,
                    wanted,
                    crate::liveness::ACTIVE_POLICY
                ),
            );
            cfg.scheme = Scheme::None;
        }
    }

    cfg
}

fn from_env() -> Config {
    parse(|name| std::env::var(name).ok())
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Returns the process-wide config, parsing it from the environment on
/// first call and caching it for the life of the process.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(from_env)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let cfg = parse(lookup_from(&HashMap::new()));
        assert_eq!(cfg.scheme, Scheme::None);
        assert_eq!(cfg.hash_mask, 0xFF);
        assert_eq!(cfg.poisson_mean_bytes, 4096);
        assert_eq!(cfg.window_size, 100_000);
        assert!(!cfg.event_trace_enabled);
    }

    #[test]
    fn test_hex_and_decimal_mask_parse_equally() {
        assert_eq!(parse_mask("0xFF"), Some(0xFF));
        assert_eq!(parse_mask("0XFF"), Some(0xFF));
        assert_eq!(parse_mask("255"), Some(255));
        assert_eq!(parse_mask("not a number"), None);
    }

    #[test]
    fn test_unknown_scheme_name_falls_back_to_none() {
        let mut vars = HashMap::new();
        vars.insert("SAMPLER_SCHEME", "NOT_A_REAL_SCHEME");
        let cfg = parse(lookup_from(&vars));
        assert_eq!(cfg.scheme, Scheme::None);
    }

    #[test]
    fn test_scheme_from_mismatched_policy_falls_back_to_none() {
        // This crate is compiled with exactly one liveness policy; request
        // a scheme from a different family and confirm the fallback.
        let wrong_family = match crate::liveness::ACTIVE_POLICY {
            crate::liveness::Policy::AllHeaders => "STATELESS_HASH_XOR",
            crate::liveness::Policy::SampleHeaders => "HEADER_HASH",
            crate::liveness::Policy::Stateless => "SAMPLE_HEADERS_HASH_MAP",
        };
        let mut vars = HashMap::new();
        vars.insert("SAMPLER_SCHEME", wrong_family);
        let cfg = parse(lookup_from(&vars));
        assert_eq!(cfg.scheme, Scheme::None);
    }

    #[test]
    fn test_log_flag_accepts_common_truthy_spellings() {
        for spelling in ["1", "true", "TRUE", "yes", "on"] {
            let mut vars = HashMap::new();
            vars.insert("SAMPLER_LOG", spelling);
            assert!(parse(lookup_from(&vars)).log_enabled, "{spelling} should be truthy");
        }
        let mut vars = HashMap::new();
        vars.insert("SAMPLER_LOG", "0");
        assert!(!parse(lookup_from(&vars)).log_enabled);
    }

    #[test]
    fn test_event_trace_flag_accepts_common_truthy_spellings() {
        for spelling in ["1", "true", "TRUE", "yes", "on"] {
            let mut vars = HashMap::new();
            vars.insert("SAMPLER_EVENT_TRACE", spelling);
            assert!(
                parse(lookup_from(&vars)).event_trace_enabled,
                "{spelling} should be truthy"
            );
        }
        let mut vars = HashMap::new();
        vars.insert("SAMPLER_EVENT_TRACE", "0");
        assert!(!parse(lookup_from(&vars)).event_trace_enabled);
    }

    #[test]
    fn test_stats_file_passthrough() {
        let mut vars = HashMap::new();
        vars.insert("SAMPLER_STATS_FILE", "/tmp/sampler-stats.json");
        let cfg = parse(lookup_from(&vars));
        assert_eq!(cfg.stats_file.as_deref(), Some("/tmp/sampler-stats.json"));
    }
}
