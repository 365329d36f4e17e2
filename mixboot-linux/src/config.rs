//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mixboot_core::{E2eParams, ParamsError};
use serde::Deserialize;

/// Default remote location of the signed network definition.
pub const DEFAULT_NDF_URL: &str = "https://elixxir-bins.s3.us-west-1.amazonaws.com/ndf/mainnet.json";

/// Daemon configuration. File: ~/.config/mixboot/config.toml or /etc/mixboot/config.toml.
/// Env overrides: `MIXBOOT_<FIELD>` for every scalar field, e.g. MIXBOOT_STATE_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Persisted state directory.
    pub state_path: PathBuf,
    pub state_passphrase: String,
    /// scrypt cost (log2 N) used when the state is first created.
    pub state_kdf_log_n: u8,
    pub identity_storage_key: String,
    /// Local network-definition cache, trusted without verification.
    pub ndf_path: PathBuf,
    pub certificate_path: PathBuf,
    pub ndf_url: String,
    /// Where the server exports its contact.
    pub contact_path: PathBuf,
    /// Contact the sender connects to.
    pub peer_contact_path: PathBuf,
    pub message: String,
    pub follower_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Log file (appended), or `-` for stderr.
    pub log_file: String,
    pub log_level: String,
    pub network: E2eParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("statePath"),
            state_passphrase: "password".into(),
            state_kdf_log_n: 15,
            identity_storage_key: "identityStorageKey".into(),
            ndf_path: PathBuf::from("ndf.json"),
            certificate_path: PathBuf::from("mainnet.crt"),
            ndf_url: DEFAULT_NDF_URL.into(),
            contact_path: PathBuf::from("restlikeServer.xxc"),
            peer_contact_path: PathBuf::from("server-contact.json"),
            message: "If this message is sent successfully, we'll have established first contact with aliens."
                .into(),
            follower_timeout_secs: 5,
            connect_timeout_secs: 30,
            log_file: "client.log".into(),
            log_level: "info".into(),
            network: E2eParams::default(),
        }
    }
}

impl Config {
    pub fn follower_timeout(&self) -> Duration {
        Duration::from_secs(self.follower_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("environment variable {var}={value:?} is not valid")]
    Env { var: String, value: String },
    #[error("network parameters: {0}")]
    Params(#[from] ParamsError),
}

/// Load config: `explicit` path if given, else the first existing default file, else defaults;
/// then environment overrides. Network parameters are checked last.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    c.network.base.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mixboot/config.toml"));
    }
    out.push(PathBuf::from("/etc/mixboot/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(v) = var("MIXBOOT_STATE_PATH") {
        c.state_path = v.into();
    }
    if let Some(v) = var("MIXBOOT_STATE_PASSPHRASE") {
        c.state_passphrase = v;
    }
    if let Some(v) = var("MIXBOOT_STATE_KDF_LOG_N") {
        c.state_kdf_log_n = parse_env("MIXBOOT_STATE_KDF_LOG_N", v)?;
    }
    if let Some(v) = var("MIXBOOT_IDENTITY_STORAGE_KEY") {
        c.identity_storage_key = v;
    }
    if let Some(v) = var("MIXBOOT_NDF_PATH") {
        c.ndf_path = v.into();
    }
    if let Some(v) = var("MIXBOOT_CERTIFICATE_PATH") {
        c.certificate_path = v.into();
    }
    if let Some(v) = var("MIXBOOT_NDF_URL") {
        c.ndf_url = v;
    }
    if let Some(v) = var("MIXBOOT_CONTACT_PATH") {
        c.contact_path = v.into();
    }
    if let Some(v) = var("MIXBOOT_PEER_CONTACT_PATH") {
        c.peer_contact_path = v.into();
    }
    if let Some(v) = var("MIXBOOT_MESSAGE") {
        c.message = v;
    }
    if let Some(v) = var("MIXBOOT_FOLLOWER_TIMEOUT_SECS") {
        c.follower_timeout_secs = parse_env("MIXBOOT_FOLLOWER_TIMEOUT_SECS", v)?;
    }
    if let Some(v) = var("MIXBOOT_CONNECT_TIMEOUT_SECS") {
        c.connect_timeout_secs = parse_env("MIXBOOT_CONNECT_TIMEOUT_SECS", v)?;
    }
    if let Some(v) = var("MIXBOOT_LOG_FILE") {
        c.log_file = v;
    }
    if let Some(v) = var("MIXBOOT_LOG_LEVEL") {
        c.log_level = v;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.state_path, PathBuf::from("statePath"));
        assert_eq!(c.identity_storage_key, "identityStorageKey");
        assert_eq!(c.follower_timeout(), Duration::from_secs(5));
        assert_eq!(c.connect_timeout(), Duration::from_secs(30));
        assert_eq!(c.ndf_url, DEFAULT_NDF_URL);
    }

    #[test]
    fn file_fields_and_network_table() {
        let c: Config = toml::from_str(
            r#"
            state_path = "/var/lib/mixboot/state"
            connect_timeout_secs = 60

            [network.base]
            max_part_len = 512
            "#,
        )
        .unwrap();
        assert_eq!(c.state_path, PathBuf::from("/var/lib/mixboot/state"));
        assert_eq!(c.connect_timeout_secs, 60);
        assert_eq!(c.network.base.max_part_len, 512);
        assert_eq!(c.follower_timeout_secs, 5);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("MIXBOOT_STATE_PASSPHRASE", "hunter2"),
                ("MIXBOOT_CONNECT_TIMEOUT_SECS", "12"),
            ]),
        )
        .unwrap();
        assert_eq!(c.state_passphrase, "hunter2");
        assert_eq!(c.connect_timeout_secs, 12);
    }

    #[test]
    fn bad_env_number_is_error() {
        let mut c = Config::default();
        let r = apply_env(&mut c, env(&[("MIXBOOT_STATE_KDF_LOG_N", "many")]));
        assert!(matches!(r, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn explicit_path_must_exist_and_parse() {
        let dir = std::env::temp_dir().join(format!("mixboot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let missing = dir.join("missing.toml");
        assert!(matches!(read_file(&missing), Err(ConfigError::Read { .. })));
        let broken = dir.join("broken.toml");
        std::fs::write(&broken, "state_path = [").unwrap();
        assert!(matches!(read_file(&broken), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn part_len_over_frame_limit_rejected_at_load() {
        let dir = std::env::temp_dir().join(format!("mixboot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[network.base]\nmax_part_len = 2000000\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(ConfigError::Params(_))));
    }
}
