use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener; disabled when unset.
    pub metrics_bind: Option<SocketAddr>,
    // Max frame size accepted from clients.
    pub max_frame_bytes: usize,
}

const DEFAULT_BIND: &str = "0.0.0.0:5672";

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    max_frame_bytes: Option<usize>,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("CONVEYOR_BROKER_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse CONVEYOR_BROKER_BIND")?;
        let metrics_bind = std::env::var("METRICS_BIND")
            .ok()
            .filter(|value| !value.is_empty())
            .map(|value| value.parse())
            .transpose()
            .with_context(|| "parse METRICS_BIND")?;
        let max_frame_bytes = std::env::var("CONVEYOR_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(conveyor_wire::DEFAULT_MAX_FRAME_BYTES);
        Ok(Self {
            bind,
            metrics_bind,
            max_frame_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CONVEYOR_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CONVEYOR_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = Some(value.parse().with_context(|| "parse metrics_bind")?);
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        let _g1 = EnvGuard::unset("CONVEYOR_BROKER_BIND");
        let _g2 = EnvGuard::unset("METRICS_BIND");
        let _g3 = EnvGuard::unset("CONVEYOR_MAX_FRAME_BYTES");
        let _g4 = EnvGuard::unset("CONVEYOR_CONFIG");
        let config = BrokerConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind, DEFAULT_BIND.parse().expect("addr"));
        assert!(config.metrics_bind.is_none());
        assert_eq!(config.max_frame_bytes, conveyor_wire::DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    #[serial]
    fn env_values_are_parsed() {
        let _g1 = EnvGuard::set("CONVEYOR_BROKER_BIND", "127.0.0.1:6000");
        let _g2 = EnvGuard::set("METRICS_BIND", "127.0.0.1:9100");
        let _g3 = EnvGuard::set("CONVEYOR_MAX_FRAME_BYTES", "0");
        let _g4 = EnvGuard::unset("CONVEYOR_CONFIG");
        let config = BrokerConfig::from_env().expect("config");
        assert_eq!(config.bind.port(), 6000);
        assert_eq!(config.metrics_bind.map(|addr| addr.port()), Some(9100));
        // Zero is not a usable limit.
        assert_eq!(config.max_frame_bytes, conveyor_wire::DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    #[serial]
    fn bad_bind_is_rejected() {
        let _g1 = EnvGuard::set("CONVEYOR_BROKER_BIND", "not-an-addr");
        let _g2 = EnvGuard::unset("CONVEYOR_CONFIG");
        let err = BrokerConfig::from_env().expect_err("bad bind");
        assert!(err.to_string().contains("CONVEYOR_BROKER_BIND"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "bind: 127.0.0.1:7000\nmetrics_bind: 127.0.0.1:7001\nmax_frame_bytes: 4096"
        )
        .expect("write");
        let _g1 = EnvGuard::set("CONVEYOR_BROKER_BIND", "127.0.0.1:6000");
        let _g2 = EnvGuard::unset("METRICS_BIND");
        let _g3 = EnvGuard::set("CONVEYOR_CONFIG", file.path().to_str().expect("path"));
        let config = BrokerConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind.port(), 7000);
        assert_eq!(config.metrics_bind.map(|addr| addr.port()), Some(7001));
        assert_eq!(config.max_frame_bytes, 4096);
    }
}
