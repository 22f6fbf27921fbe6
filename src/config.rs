use clap::Parser;
use std::time::Duration;
use thiserror::Error;

use crate::metrics::export::ExportFormat;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{flag} must start with '/' and not be the root path, got '{value}'")]
    InvalidEndpoint { flag: &'static str, value: String },

    #[error("{flag} may not contain route parameters (':' or '*'), got '{value}'")]
    RouteParameter { flag: &'static str, value: String },

    #[error("metrics and health endpoints overlap at '{0}'")]
    EndpointConflict(String),

    #[error("invalid upstream target {0}")]
    InvalidTarget(String),
}

/// Command line / environment configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "metrics-sidecar",
    version,
    about = "HTTP reverse proxy that records per-request metrics",
    after_help = "Examples:\n  \
        metrics-sidecar --proxy-port 3000\n  \
        metrics-sidecar --listen-port 9090 --proxy-host example.com --proxy-port 80\n  \
        metrics-sidecar --proxy-port 3000 --metrics-endpoint /api/metrics --health-endpoint /api/health"
)]
pub struct Config {
    /// Port the sidecar listens on
    #[arg(long, env = "SIDECAR_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Host of the target service
    #[arg(long, env = "SIDECAR_PROXY_HOST", default_value = "localhost")]
    pub proxy_host: String,

    /// Port of the target service
    #[arg(
        long,
        env = "SIDECAR_PROXY_PORT",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub proxy_port: u16,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, env = "SIDECAR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path serving the metrics snapshot
    #[arg(long, env = "SIDECAR_METRICS_ENDPOINT", default_value = "/metrics")]
    pub metrics_endpoint: String,

    /// Path serving the health check
    #[arg(long, env = "SIDECAR_HEALTH_ENDPOINT", default_value = "/health")]
    pub health_endpoint: String,

    /// Format used when a metrics request carries no `format` parameter
    #[arg(long, env = "SIDECAR_METRICS_FORMAT", default_value = "json")]
    pub metrics_format: ExportFormat,

    /// Give up on the upstream after this long (e.g. 500ms, 30s)
    #[arg(
        long,
        env = "SIDECAR_UPSTREAM_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub upstream_timeout: Duration,

    /// Extra path segments never collapsed into `:key` (repeatable)
    #[arg(
        long = "static-segment",
        env = "SIDECAR_STATIC_SEGMENTS",
        value_delimiter = ','
    )]
    pub static_segments: Vec<String>,
}

impl Config {
    /// Path of the live SSE feed, derived from the metrics endpoint.
    pub fn metrics_stream_endpoint(&self) -> String {
        format!("{}/stream", self.metrics_endpoint.trim_end_matches('/'))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_endpoint("--metrics-endpoint", &self.metrics_endpoint)?;
        check_endpoint("--health-endpoint", &self.health_endpoint)?;

        if self.metrics_endpoint == self.health_endpoint {
            return Err(ConfigError::EndpointConflict(self.health_endpoint.clone()));
        }
        if self.health_endpoint == self.metrics_stream_endpoint() {
            return Err(ConfigError::EndpointConflict(self.health_endpoint.clone()));
        }
        Ok(())
    }
}

fn check_endpoint(flag: &'static str, value: &str) -> Result<(), ConfigError> {
    if !value.starts_with('/') || value.len() < 2 {
        return Err(ConfigError::InvalidEndpoint {
            flag,
            value: value.to_string(),
        });
    }
    if value.contains(':') || value.contains('*') || value.contains('{') {
        return Err(ConfigError::RouteParameter {
            flag,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(std::iter::once("metrics-sidecar").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let config = parse(&["--proxy-port", "3000"]).unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.proxy_host, "localhost");
        assert_eq!(config.proxy_port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.metrics_endpoint, "/metrics");
        assert_eq!(config.health_endpoint, "/health");
        assert_eq!(config.metrics_format, ExportFormat::Json);
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert!(config.static_segments.is_empty());
        assert_eq!(config.metrics_stream_endpoint(), "/metrics/stream");
        config.validate().unwrap();
    }

    #[test]
    fn proxy_port_is_required_and_non_zero() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--proxy-port", "0"]).is_err());
    }

    #[test]
    fn full_flag_set() {
        let config = parse(&[
            "--listen-port", "9090",
            "--proxy-host", "example.com",
            "--proxy-port", "80",
            "--metrics-endpoint", "/api/metrics",
            "--health-endpoint", "/api/health",
            "--metrics-format", "prometheus",
            "--upstream-timeout", "1500ms",
            "--static-segment", "checkout2,tenant9x",
            "--static-segment", "region1ab",
        ])
        .unwrap();

        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.metrics_format, ExportFormat::Prometheus);
        assert_eq!(config.upstream_timeout, Duration::from_millis(1500));
        assert_eq!(config.static_segments, ["checkout2", "tenant9x", "region1ab"]);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_metrics_format_is_rejected() {
        assert!(parse(&["--proxy-port", "3000", "--metrics-format", "xml"]).is_err());
    }

    #[test]
    fn endpoints_are_validated() {
        let bad = |args: &[&str]| {
            let mut all = vec!["--proxy-port", "3000"];
            all.extend_from_slice(args);
            parse(&all).unwrap().validate()
        };

        assert!(matches!(
            bad(&["--metrics-endpoint", "metrics"]),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            bad(&["--health-endpoint", "/"]),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            bad(&["--health-endpoint", "/status/:id"]),
            Err(ConfigError::RouteParameter { .. })
        ));
        assert!(matches!(
            bad(&["--health-endpoint", "/metrics"]),
            Err(ConfigError::EndpointConflict(_))
        ));
        assert!(matches!(
            bad(&["--health-endpoint", "/metrics/stream"]),
            Err(ConfigError::EndpointConflict(_))
        ));
    }
}
