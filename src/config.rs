//! `key = value` boot configuration.
//!
//! ```text
//! # kairos.cfg
//! log_level = debug
//! max_cores = 4
//! timer_initial_count = 0x10_0000
//! color_demo = yes
//! ```

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::logger::Level;
use crate::percpu::MAX_CORES;
use crate::process::MAX_PROCS;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Line has no `=`.
    MissingEquals { line: usize },
    /// Nothing before the `=`.
    EmptyKey { line: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingEquals { line } => write!(f, "line {}: expected `key = value`", line),
            ConfigError::EmptyKey { line } => write!(f, "line {}: empty key", line),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    entries: BTreeMap<String, String>,
}

impl Config {
    /// Parses `text`, skipping bad lines. Later keys override earlier ones.
    pub fn parse(text: &str) -> (Config, Vec<ConfigError>) {
        let mut config = Config::default();
        let mut errors = Vec::new();

        for (i, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(hash) => &raw[..hash],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                errors.push(ConfigError::MissingEquals { line: i + 1 });
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                errors.push(ConfigError::EmptyKey { line: i + 1 });
                continue;
            }
            config.entries.insert(key.to_string(), unquote(value.trim()).to_string());
        }

        (config, errors)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(parse_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse_bool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Decimal or `0x` hex, `_` separators allowed.
pub fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, radix) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };

    let mut value: u64 = 0;
    let mut seen_digit = false;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(radix)? as u64;
        value = value.checked_mul(radix as u64)?.checked_add(digit)?;
        seen_digit = true;
    }
    seen_digit.then_some(value)
}

pub fn parse_bool(text: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["true", "yes", "on", "1"];
    const FALSE: [&str; 4] = ["false", "no", "off", "0"];
    let text = text.trim();
    if TRUE.iter().any(|t| t.eq_ignore_ascii_case(text)) {
        Some(true)
    } else if FALSE.iter().any(|f| f.eq_ignore_ascii_case(text)) {
        Some(false)
    } else {
        None
    }
}

// --- BOOT SETTINGS ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootConfig {
    pub log_level: Level,
    pub max_cores: usize,
    /// Local APIC timer initial count at divide-by-16.
    pub timer_initial_count: u32,
    pub demo_processes: usize,
    pub color_demo: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            log_level: Level::Info,
            max_cores: MAX_CORES,
            timer_initial_count: 0x20_0000,
            demo_processes: 4,
            color_demo: false,
        }
    }
}

impl BootConfig {
    /// Typed view over `config`. Unknown keys are ignored; malformed or
    /// out-of-range values fall back to (or clamp towards) the defaults.
    pub fn from_config(config: &Config) -> BootConfig {
        let defaults = BootConfig::default();

        let log_level = match config.get("log_level") {
            Some(name) => Level::parse(name).unwrap_or_else(|| {
                klog_warn!("config: unknown log_level {:?}", name);
                defaults.log_level
            }),
            None => defaults.log_level,
        };

        let max_cores = config
            .get_u64("max_cores")
            .map_or(defaults.max_cores, |n| (n as usize).clamp(1, MAX_CORES));

        let timer_initial_count = config
            .get_u64("timer_initial_count")
            .filter(|&n| n > 0)
            .map_or(defaults.timer_initial_count, |n| n.min(u32::MAX as u64) as u32);

        let demo_processes = config
            .get_u64("demo_processes")
            .map_or(defaults.demo_processes, |n| (n as usize).min(MAX_PROCS));

        let color_demo = config.get_bool("color_demo").unwrap_or(defaults.color_demo);

        BootConfig {
            log_level,
            max_cores,
            timer_initial_count,
            demo_processes,
            color_demo,
        }
    }

    /// Parses a config file, logging every skipped line.
    pub fn load(text: &str) -> BootConfig {
        let (config, errors) = Config::parse(text);
        for error in &errors {
            klog_warn!("config: {}", error);
        }
        BootConfig::from_config(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_quotes_and_overrides() {
        let text = "\
# boot settings
log_level = debug   # noisy
name = \"kairos os\"

log_level = trace
";
        let (config, errors) = Config::parse(text);
        assert!(errors.is_empty());
        assert_eq!(config.get("log_level"), Some("trace"));
        assert_eq!(config.get("name"), Some("kairos os"));
        assert_eq!(config.len(), 2);
    }

    #[test]
    fn bad_lines_are_reported_and_skipped() {
        let (config, errors) = Config::parse("a = 1\njunk\n = 3\nb=2");
        assert_eq!(
            errors,
            [ConfigError::MissingEquals { line: 2 }, ConfigError::EmptyKey { line: 3 }]
        );
        assert_eq!(config.get_u64("a"), Some(1));
        assert_eq!(config.get_u64("b"), Some(2));
    }

    #[test]
    fn integers_accept_hex_and_separators() {
        assert_eq!(parse_u64("0x20_0000"), Some(0x20_0000));
        assert_eq!(parse_u64("1_000"), Some(1000));
        assert_eq!(parse_u64("0x"), None);
        assert_eq!(parse_u64("12a"), None);
        assert_eq!(parse_u64("99999999999999999999999"), None);
    }

    #[test]
    fn booleans_accept_common_spellings() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn boot_config_defaults_and_clamps() {
        assert_eq!(BootConfig::load(""), BootConfig::default());

        let boot = BootConfig::load(
            "max_cores = 64\ndemo_processes = 1000\ncolor_demo = on\nlog_level = WARN\ntimer_initial_count = 0",
        );
        assert_eq!(boot.max_cores, MAX_CORES);
        assert_eq!(boot.demo_processes, MAX_PROCS);
        assert!(boot.color_demo);
        assert_eq!(boot.log_level, Level::Warn);
        assert_eq!(boot.timer_initial_count, 0x20_0000);

        assert_eq!(BootConfig::load("max_cores = 0").max_cores, 1);
    }
}
