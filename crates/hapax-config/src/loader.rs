use std::path::{Path, PathBuf};

use tracing::warn;

use crate::expand::expand_process_env;
use crate::schema::HapaxConfig;

/// Resolve the config path: explicit path > `HAPAX_CONFIG` env > `./hapax.toml`.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("HAPAX_CONFIG") {
        return PathBuf::from(p);
    }
    PathBuf::from("hapax.toml")
}

/// Read `path`, substitute `${VAR}` / `${VAR:-default}` against the process
/// environment, parse as TOML over a defaults baseline, and validate (§4.7,
/// §6). Returns the merged, validated config — never a partially applied
/// one.
pub fn load_and_validate(path: &Path) -> hapax_core::Result<HapaxConfig> {
    let raw = std::fs::read_to_string(path)?;
    parse_and_validate(&raw)
}

/// Parse and validate a config document already read into memory. Exposed
/// separately so the watcher can reuse it without re-reading the file twice.
pub fn parse_and_validate(raw: &str) -> hapax_core::Result<HapaxConfig> {
    let expanded = expand_process_env(raw).map_err(hapax_core::HapaxError::Config)?;
    let config: HapaxConfig = toml::from_str(&expanded)
        .map_err(|e| hapax_core::HapaxError::Config(format!("failed to parse config: {e}")))?;
    config
        .validate()
        .map_err(hapax_core::HapaxError::Config)?;
    Ok(config)
}

/// Load the config from disk, falling back to defaults when the file is
/// absent (first-boot convenience — matches the loader idiom this codebase
/// already uses for its other config file).
///
/// The synthetic default has no provider configured at all (`llm.provider`
/// is empty), which `HapaxConfig::validate` rejects by design (§6 "empty
/// provider/model" is a validation failure for a config an operator wrote).
/// That check doesn't apply to a bootstrap default nobody wrote yet, so this
/// path skips it rather than refusing to start a gateway that has no config
/// file on disk; `/ready` and `/v1/completions` degrade gracefully (§4.8,
/// §4.2 "no healthy provider available") until a real file is written.
pub fn load_or_default(path: &Path) -> hapax_core::Result<HapaxConfig> {
    if path.exists() {
        load_and_validate(path)
    } else {
        warn!(
            ?path,
            "no config file found, starting with unconfigured defaults; \
             no provider is set until a config is written"
        );
        Ok(HapaxConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_valid_config() {
        let toml = r#"
            [llm]
            provider = "mock"
            model = "mock-1"
        "#;
        let config = parse_and_validate(toml).unwrap();
        assert_eq!(config.llm.provider, "mock");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn rejects_invalid_log_level() {
        let toml = r#"
            [llm]
            provider = "mock"
            model = "mock-1"

            [logging]
            level = "verbose"
        "#;
        assert!(parse_and_validate(toml).is_err());
    }

    #[test]
    fn rejects_http3_without_tls_files() {
        let toml = r#"
            [llm]
            provider = "mock"
            model = "mock-1"

            [server.http3]
            enabled = true
        "#;
        assert!(parse_and_validate(toml).is_err());
    }

    #[test]
    fn expands_env_vars_before_parsing() {
        unsafe {
            std::env::set_var("HAPAX_TEST_MODEL", "expanded-model");
        }
        let toml = r#"
            [llm]
            provider = "mock"
            model = "${HAPAX_TEST_MODEL}"
        "#;
        let config = parse_and_validate(toml).unwrap();
        assert_eq!(config.llm.model, "expanded-model");
        unsafe {
            std::env::remove_var("HAPAX_TEST_MODEL");
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn loads_from_an_actual_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hapax.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[llm]\nprovider = \"mock\"\nmodel = \"m\"").unwrap();
        let config = load_and_validate(&path).unwrap();
        assert_eq!(config.llm.provider, "mock");
    }
}
