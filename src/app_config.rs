//! Optional config file supplying CLI defaults.
//!
//! The file is a flat list of `key = value` lines (a TOML subset):
//!
//! ```text
//! output_dir = "/srv/mirror"
//! workers = 8
//! read_timeout_secs = 120
//! priority = "high"
//! ```
//!
//! Command-line flags always win over values read here.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use file_downloader::Priority;

/// Defaults read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Default output directory.
    pub output_dir: Option<PathBuf>,
    /// Default worker count (1..=64).
    pub workers: Option<u8>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// User-Agent override.
    pub user_agent: Option<String>,
    /// Default scheduling priority.
    pub priority: Option<Priority>,
    /// Sweep stale temp files older than this many days on start.
    pub cleanup_days: Option<u32>,
}

impl FileConfig {
    /// Validates values against the same ranges the CLI enforces.
    pub fn validate(&self) -> Result<()> {
        if let Some(workers) = self.workers
            && !(1..=64).contains(&workers)
        {
            bail!("Invalid config value for `workers`: {workers}. Expected range: 1..=64");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        if let Some(user_agent) = &self.user_agent
            && user_agent.trim().is_empty()
        {
            bail!("Invalid config value for `user_agent`: must not be empty");
        }
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed config when the file exists.
    pub config: Option<FileConfig>,
}

impl LoadedConfig {
    /// Parsed values, or all-default when no file was read.
    #[must_use]
    pub fn into_config(self) -> FileConfig {
        self.config.unwrap_or_default()
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/file-downloader/config.toml`
/// 2. `$HOME/.config/file-downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("file-downloader")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("file-downloader")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config from the default path if the file exists.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "workers" => {
                cfg.workers = Some(parse_integer_u8(value).with_context(invalid)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "user_agent" => {
                cfg.user_agent = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "priority" => {
                let label = parse_string_literal(value).with_context(invalid)?;
                let priority = label
                    .parse::<Priority>()
                    .map_err(anyhow::Error::msg)
                    .with_context(invalid)?;
                cfg.priority = Some(priority);
            }
            "cleanup_days" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                let days = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("cleanup_days out of range for u32"))?;
                cfg.cleanup_days = Some(days);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let value = parse_integer_u64(raw_value)?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
            # mirror settings
            output_dir = "/srv/mirror"   # trailing comment
            workers = 8
            connect_timeout_secs = 10
            read_timeout_secs = 120
            user_agent = "mirror-bot/1.0 (#ops)"
            priority = "high"
            cleanup_days = 7
            "#,
        )
        .expect("config should parse");

        assert_eq!(cfg.output_dir, Some(PathBuf::from("/srv/mirror")));
        assert_eq!(cfg.workers, Some(8));
        assert_eq!(cfg.connect_timeout_secs, Some(10));
        assert_eq!(cfg.read_timeout_secs, Some(120));
        assert_eq!(cfg.user_agent.as_deref(), Some("mirror-bot/1.0 (#ops)"));
        assert_eq!(cfg.priority, Some(Priority::High));
        assert_eq!(cfg.cleanup_days, Some(7));
    }

    #[test]
    fn test_parse_config_empty_is_default() {
        let cfg = parse_config_str("\n  # nothing here\n").unwrap();
        assert_eq!(cfg, FileConfig::default());
    }

    #[test]
    fn test_parse_config_rejects_unknown_key() {
        let err = parse_config_str("concurrency = 4").expect_err("unknown key");
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("workers 4").expect_err("bad syntax");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_workers() {
        let err = parse_config_str("workers = 65").expect_err("out of range");
        assert!(err.to_string().contains("Expected range: 1..=64"));

        assert!(parse_config_str("workers = 300").is_err());
        assert!(parse_config_str("workers = -1").is_err());
    }

    #[test]
    fn test_parse_config_rejects_zero_timeout() {
        let err = parse_config_str("read_timeout_secs = 0").expect_err("zero timeout");
        assert!(err.to_string().contains("read_timeout_secs"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_string() {
        let err = parse_config_str("output_dir = /tmp").expect_err("unquoted");
        assert!(format!("{err:#}").contains("double-quoted"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_priority() {
        let err = parse_config_str(r#"priority = "urgent""#).expect_err("bad priority");
        assert!(format!("{err:#}").contains("invalid priority"));
    }

    #[test]
    fn test_load_file_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "workers = nope\n").unwrap();

        let err = load_file_config(&path).expect_err("invalid integer");
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_loaded_config_without_file_is_default() {
        let loaded = LoadedConfig {
            path: None,
            config: None,
        };
        assert_eq!(loaded.into_config(), FileConfig::default());
    }
}
