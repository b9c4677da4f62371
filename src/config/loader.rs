use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate.
/// The format is chosen by file extension; YAML is the default.
pub fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let gateway_config: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn load_yaml_config() {
        let yaml_content = r#"
server:
  port: 3000
  host: "127.0.0.1"
upstreams:
  - name: users
    targets:
      - url: "http://localhost:9001"
      - url: "http://localhost:9002"
        weight: 3
    load_balance: weighted_round_robin
routes:
  - path: "/api/v1/users/**"
    upstream: users
    strip_path: true
rate_limit:
  enabled: true
  default_rps: 50
  default_burst: 100
  cleanup_interval: "1m"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].targets[1].weight, 3);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.rate_limit.default_rps, 50);
        assert_eq!(
            config.rate_limit.cleanup_interval,
            std::time::Duration::from_secs(60)
        );
    }

    #[test]
    fn load_json_config() {
        let json_content = r#"
{
  "server": {"port": 3000, "host": "127.0.0.1"},
  "upstreams": [
    {"name": "backend", "targets": [{"url": "http://backend:8080"}]}
  ],
  "routes": [
    {"path": "/api/**", "upstream": "backend"}
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.routes.len(), 1);
        // Absent discipline falls back to round robin.
        assert_eq!(
            config.upstreams[0].load_balance,
            crate::config::BalanceDiscipline::RoundRobin
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config("/nonexistent/gantry.yml").is_err());
    }
}
