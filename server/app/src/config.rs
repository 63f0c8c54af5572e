//! Server settings, layered the way `game::core::config` layers `GameConfig`: built-in defaults,
//! overlaid by an optional on-disk TOML file, overlaid again by whatever the command line gave.

use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 50000;

pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub idle_timeout: Duration,
    pub dead_timeout: Duration,
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_file: None,
            log_level: "info".to_string(),
            idle_timeout: Duration::from_secs(30),
            dead_timeout: Duration::from_secs(90),
            poll_timeout: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Starts from [`Config::default`] and overlays any field present in the file at `path`. A
    /// field the file omits keeps its default; the file itself is entirely optional.
    pub fn load_layered<P: AsRef<Path>>(path: Option<P>) -> Config {
        let mut config = Config::default();

        let path = match path {
            Some(path) => path,
            None => return config,
        };

        let file: ConfigFile =
            serdeconv::from_toml_file(path.as_ref()).expect("Error loading server configuration file");

        if let Some(host) = file.host {
            config.host = host;
        }
        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(log_file) = file.log_file {
            config.log_file = Some(log_file);
        }
        if let Some(log_level) = file.log_level {
            config.log_level = log_level;
        }
        if let Some(secs) = file.idle_timeout_secs {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.dead_timeout_secs {
            config.dead_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.poll_timeout_secs {
            config.poll_timeout = Duration::from_secs(secs);
        }

        config
    }
}

/// Mirrors [`Config`] but with every field optional, so a file that supplies only `port` leaves
/// everything else at its built-in default.
#[derive(Deserialize, Default)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    log_file: Option<PathBuf>,
    log_level: Option<String>,
    idle_timeout_secs: Option<u64>,
    dead_timeout_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 50000);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.dead_timeout, Duration::from_secs(90));
        assert_eq!(config.bind_address(), "localhost:50000");
    }
}
