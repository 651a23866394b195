//! Configuration loading and schema definitions.
//!
//! Configuration lives in a TOML file (`volley.toml` by default) and is
//! deserialized into [`Config`]. Host and framework selection use tagged
//! enums, so the file reads as `type = "local"` / `type = "pytest"`.
//! See [`schema`] for the full set of options.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load_config_str(
            r#"
            [host]
            type = "local"

            [framework]
            type = "cargo"
            "#,
        )
        .unwrap();

        assert_eq!(config.runner.max_parallel, 4);
        assert_eq!(config.runner.retry_count, 0);
        assert_eq!(config.runner.max_cache_size, 10);
        assert_eq!(config.runner.max_cache_age_secs, 5);
        assert_eq!(config.runner.test_timeout_secs, 900);
        assert!(config.report.junit);
        assert!(matches!(config.host, HostConfig::Local(_)));
        assert!(matches!(config.framework, FrameworkConfig::Cargo(_)));

        config.validate().unwrap();
    }

    #[test]
    fn runner_section_overrides_defaults() {
        let config = load_config_str(
            r#"
            [runner]
            max_parallel = 16
            retry_count = 2
            max_cache_size = 50
            max_cache_age_secs = 1

            [host]
            type = "process"
            root_dir = "/tmp/volley-ci"

            [framework]
            type = "pytest"
            markers = "not slow"
            "#,
        )
        .unwrap();

        assert_eq!(config.runner.max_parallel, 16);
        assert_eq!(config.runner.retry_count, 2);
        assert_eq!(config.runner.max_cache_size, 50);
        assert_eq!(
            config.runner.max_cache_age(),
            std::time::Duration::from_secs(1)
        );

        match &config.host {
            HostConfig::Process(p) => {
                assert_eq!(p.root_dir.as_deref(), Some(Path::new("/tmp/volley-ci")));
            }
            other => panic!("expected process host, got {other:?}"),
        }
        match &config.framework {
            FrameworkConfig::Pytest(p) => assert_eq!(p.markers.as_deref(), Some("not slow")),
            other => panic!("expected pytest framework, got {other:?}"),
        }
    }

    #[test]
    fn shell_framework_requires_commands() {
        let config = load_config_str(
            r#"
            [host]
            type = "local"

            [framework]
            type = "shell"
            discover_command = "cat tests.txt"
            run_command = "./run-tests.sh {tests}"
            result_file = "/tmp/results.xml"
            "#,
        )
        .unwrap();

        config.validate().unwrap();

        match &config.framework {
            FrameworkConfig::Shell(s) => {
                assert_eq!(s.discover_command, "cat tests.txt");
                assert_eq!(s.result_file.as_deref(), Some("/tmp/results.xml"));
            }
            other => panic!("expected shell framework, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let base = |runner: &str| {
            load_config_str(&format!(
                r#"
                [runner]
                {runner}

                [host]
                type = "local"

                [framework]
                type = "cargo"
                "#
            ))
            .unwrap()
        };

        let err = base("max_cache_size = 0").validate().unwrap_err();
        assert!(err.to_string().contains("max_cache_size"));

        let err = base("max_cache_age_secs = 0").validate().unwrap_err();
        assert!(err.to_string().contains("max_cache_age_secs"));

        let err = base("max_parallel = 0").validate().unwrap_err();
        assert!(err.to_string().contains("max_parallel"));
    }

    #[test]
    fn validate_rejects_empty_shell_commands() {
        let config = load_config_str(
            r#"
            [host]
            type = "local"

            [framework]
            type = "shell"
            discover_command = ""
            run_command = "./run.sh"
            "#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("discover_command"));
    }

    #[test]
    fn unknown_host_type_is_an_error() {
        let err = load_config_str(
            r#"
            [host]
            type = "mainframe"

            [framework]
            type = "cargo"
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("parse"));
    }
}
