//! Server configuration: TOML file + `WTTY_` environment variables + CLI
//! overrides, in that precedence order (later wins).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;
use wtty_core::{WttyError, WttyResult};

use crate::history::DEFAULT_HISTORY_SIZE;

/// Optional values parsed from the TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub cmd: Option<String>,
    pub term: Option<String>,
    pub default_cols: Option<u16>,
    pub default_rows: Option<u16>,
    pub history_size: Option<usize>,
    pub theme: Option<String>,
    pub motd_art: Option<String>,
    pub log_enabled: Option<bool>,
    pub log_dir: Option<PathBuf>,
    pub unsecure: Option<bool>,
    pub ssl_dir: Option<PathBuf>,
}

/// CLI overrides applied on top of file and environment values.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub cmd: Option<String>,
    pub theme: Option<String>,
    pub motd_art: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub no_log: bool,
    pub unsecure: bool,
    pub ssl_dir: Option<PathBuf>,
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Login shell spawned when no command is configured.
    pub shell: String,
    /// Command run instead of the shell (e.g. "htop"). Per-session `?cmd=`
    /// takes precedence over this.
    pub cmd: Option<String>,
    /// TERM value for spawned children.
    pub term: String,
    /// Terminal size used when a client supplies none.
    pub default_cols: u16,
    pub default_rows: u16,
    /// Replay buffer capacity in bytes.
    pub history_size: usize,
    /// Default client color theme.
    pub theme: String,
    /// MOTD banner: "default", "none", or a file path.
    pub motd_art: String,
    /// Session logging (script/scriptreplay files).
    pub log_enabled: bool,
    pub log_dir: PathBuf,
    /// Serve plain HTTP instead of TLS.
    pub unsecure: bool,
    /// Directory holding the CA and per-host certificates.
    pub ssl_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 57575,
            shell: "/bin/bash".to_string(),
            cmd: None,
            term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
            history_size: DEFAULT_HISTORY_SIZE,
            theme: "default".to_string(),
            motd_art: "default".to_string(),
            log_enabled: true,
            log_dir: PathBuf::from("logs"),
            unsecure: false,
            ssl_dir: default_ssl_dir(),
        }
    }
}

/// Default config file location: `<config-dir>/wtty/config.toml`.
pub fn default_config_path() -> PathBuf {
    config_root().join("config.toml")
}

fn default_ssl_dir() -> PathBuf {
    config_root().join("ssl")
}

fn config_root() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from("/etc")).join("wtty")
}

impl Settings {
    /// Resolve settings: defaults, then the config file (if present), then
    /// `WTTY_*` environment variables, then CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> WttyResult<Self> {
        let mut settings = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                let file: ConfigFile = toml::from_str(&content)
                    .map_err(|e| WttyError::Config(format!("config parse error: {e}")))?;
                settings.apply_file(file);
            }
        }

        settings.apply_env(std::env::vars())?;
        settings.apply_overrides(overrides);
        Ok(settings)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = file.$field {
                    self.$field = v;
                }
            };
        }
        take!(host);
        take!(port);
        take!(shell);
        take!(term);
        take!(default_cols);
        take!(default_rows);
        take!(history_size);
        take!(theme);
        take!(motd_art);
        take!(log_enabled);
        take!(log_dir);
        take!(unsecure);
        take!(ssl_dir);
        if file.cmd.is_some() {
            self.cmd = file.cmd.filter(|c| !c.is_empty());
        }
    }

    /// Apply `WTTY_*` variables from the given environment snapshot.
    pub fn apply_env(&mut self, vars: impl Iterator<Item = (String, String)>) -> WttyResult<()> {
        for (key, value) in vars {
            match key.as_str() {
                "WTTY_HOST" => self.host = value,
                "WTTY_PORT" => self.port = parse(&key, &value)?,
                "WTTY_SHELL" => self.shell = value,
                "WTTY_CMD" => self.cmd = Some(value).filter(|v| !v.is_empty()),
                "WTTY_TERM" => self.term = value,
                "WTTY_DEFAULT_COLS" => self.default_cols = parse(&key, &value)?,
                "WTTY_DEFAULT_ROWS" => self.default_rows = parse(&key, &value)?,
                "WTTY_HISTORY_SIZE" => self.history_size = parse(&key, &value)?,
                "WTTY_THEME" => self.theme = value,
                "WTTY_MOTD_ART" => self.motd_art = value,
                "WTTY_LOG_ENABLED" => self.log_enabled = parse_bool(&key, &value)?,
                "WTTY_LOG_DIR" => self.log_dir = PathBuf::from(value),
                "WTTY_UNSECURE" => self.unsecure = parse_bool(&key, &value)?,
                "WTTY_SSL_DIR" => self.ssl_dir = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        let o = overrides.clone();
        if let Some(host) = o.host {
            self.host = host;
        }
        if let Some(port) = o.port {
            self.port = port;
        }
        if let Some(shell) = o.shell {
            self.shell = shell;
        }
        if let Some(cmd) = o.cmd {
            self.cmd = Some(cmd).filter(|c| !c.is_empty());
        }
        if let Some(theme) = o.theme {
            self.theme = theme;
        }
        if let Some(motd_art) = o.motd_art {
            self.motd_art = motd_art;
        }
        if let Some(log_dir) = o.log_dir {
            self.log_dir = log_dir;
        }
        if o.no_log {
            self.log_enabled = false;
        }
        if o.unsecure {
            self.unsecure = true;
        }
        if let Some(ssl_dir) = o.ssl_dir {
            self.ssl_dir = ssl_dir;
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> WttyResult<T> {
    value
        .parse()
        .map_err(|_| WttyError::Config(format!("invalid value for {key}: {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> WttyResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WttyError::Config(format!("invalid boolean for {key}: {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.port, 57575);
        assert_eq!(s.history_size, 50 * 1024);
        assert!(s.log_enabled);
        assert!(!s.unsecure);
    }

    #[test]
    fn env_overrides_defaults() {
        let mut s = Settings::default();
        let vars = [
            ("WTTY_PORT".to_string(), "8022".to_string()),
            ("WTTY_UNSECURE".to_string(), "true".to_string()),
            ("WTTY_CMD".to_string(), "htop".to_string()),
            ("UNRELATED".to_string(), "ignored".to_string()),
        ];
        s.apply_env(vars.into_iter()).unwrap();
        assert_eq!(s.port, 8022);
        assert!(s.unsecure);
        assert_eq!(s.cmd.as_deref(), Some("htop"));
    }

    #[test]
    fn invalid_env_number_is_an_error() {
        let mut s = Settings::default();
        let vars = [("WTTY_PORT".to_string(), "not-a-port".to_string())];
        assert!(s.apply_env(vars.into_iter()).is_err());
    }

    #[test]
    fn cli_overrides_beat_env() {
        let mut s = Settings::default();
        s.apply_env([("WTTY_THEME".to_string(), "nord".to_string())].into_iter()).unwrap();
        s.apply_overrides(&Overrides {
            theme: Some("dracula".to_string()),
            no_log: true,
            ..Default::default()
        });
        assert_eq!(s.theme, "dracula");
        assert!(!s.log_enabled);
    }

    #[test]
    fn file_values_parse() {
        let mut s = Settings::default();
        let file: ConfigFile = toml::from_str(
            r#"
            port = 7000
            shell = "/bin/zsh"
            history_size = 102400
            log_enabled = false
            "#,
        )
        .unwrap();
        s.apply_file(file);
        assert_eq!(s.port, 7000);
        assert_eq!(s.shell, "/bin/zsh");
        assert_eq!(s.history_size, 102400);
        assert!(!s.log_enabled);
    }
}
