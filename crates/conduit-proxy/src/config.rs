use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use conduit_protocol::ProtocolVersion;
use serde::Deserialize;

use crate::forwarding::ForwardingMode;

/// The proxy configuration, loaded from `velocity.toml`.
///
/// Hot-reloadable: the server table, message strings, forwarding settings,
/// minimum version, and the login rate limit. The bind address is not; a
/// changed bind requires an atomic close/bind swap driven by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub config_version: String,
    pub bind: String,
    pub online_mode: bool,
    pub online_mode_kick_existing_players: bool,
    /// Pass the client's IP to the session service so it can reject logins
    /// routed through anonymizing proxies.
    pub prevent_client_proxy_connections: bool,
    pub player_info_forwarding_mode: ForwardingMode,
    pub forwarding_secret: String,
    pub minimum_version: String,
    pub enable_dynamic_fallbacks: bool,
    pub disable_forge: bool,
    pub enforce_chat_signing: bool,
    pub allow_illegal_characters_in_chat: bool,
    pub compression_threshold: i32,
    pub compression_level: u32,
    /// Minimum gap between login attempts per source IP, in milliseconds.
    /// 0 disables the limiter.
    pub login_ratelimit: u64,
    /// Backend dial / pre-login client timeout, in milliseconds.
    pub connection_timeout: u64,
    /// Established-session idle timeout, in milliseconds.
    pub read_timeout: u64,
    pub show_max_players: u32,
    pub announce_proxy_commands: bool,
    pub server_brand: String,
    pub motd: String,
    /// Template used in the status version block when the client's version
    /// is unsupported. Substitutions: `{proxy-brand}`, `{protocol-min}`,
    /// `{protocol-max}`.
    pub fallback_version_ping: String,
    pub log_offline_connections: bool,
    pub haproxy: bool,
    pub query_enabled: bool,
    pub query_port: u16,
    pub favicon: Option<String>,
    pub servers: ServersSection,
    pub forwarding_overrides: HashMap<String, ForwardingMode>,
    pub messages: Messages,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServersSection {
    /// Fallback order, first-declared first.
    #[serde(rename = "try")]
    pub try_order: Vec<String>,
    /// server-name -> host:port
    #[serde(flatten)]
    pub entries: HashMap<String, String>,
}

impl Default for ServersSection {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert("lobby".to_owned(), "127.0.0.1:25566".to_owned());
        Self {
            try_order: vec!["lobby".to_owned()],
            entries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Messages {
    pub kick_below_minimum: String,
    pub kick_unsupported_version: String,
    pub kick_duplicate_login: String,
    pub kick_too_fast_login: String,
    pub kick_lost_connection: String,
    pub kick_proxy_shutdown: String,
    pub kick_online_mode_only: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            kick_below_minimum: "Your client is too old for this server (minimum: {minimum-version}).".to_owned(),
            kick_unsupported_version: "This server does not support your client version yet.".to_owned(),
            kick_duplicate_login: "You logged in from another location.".to_owned(),
            kick_too_fast_login: "You are logging in too fast, try again later.".to_owned(),
            kick_lost_connection: "Lost connection to the server.".to_owned(),
            kick_proxy_shutdown: "Proxy shutting down.".to_owned(),
            kick_online_mode_only: "Could not verify your username against the session service.".to_owned(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_version: "1.0".to_owned(),
            bind: "0.0.0.0:25577".to_owned(),
            online_mode: true,
            online_mode_kick_existing_players: false,
            prevent_client_proxy_connections: false,
            player_info_forwarding_mode: ForwardingMode::None,
            forwarding_secret: String::new(),
            minimum_version: "1.7.2".to_owned(),
            enable_dynamic_fallbacks: false,
            disable_forge: false,
            enforce_chat_signing: true,
            allow_illegal_characters_in_chat: false,
            compression_threshold: 256,
            compression_level: 6,
            login_ratelimit: 3000,
            connection_timeout: 5000,
            read_timeout: 30000,
            show_max_players: 500,
            announce_proxy_commands: true,
            server_brand: "Conduit".to_owned(),
            motd: "A Conduit proxy".to_owned(),
            fallback_version_ping: "{proxy-brand} {protocol-min}-{protocol-max}".to_owned(),
            log_offline_connections: true,
            haproxy: false,
            query_enabled: false,
            query_port: 25577,
            favicon: None,
            servers: ServersSection::default(),
            forwarding_overrides: HashMap::new(),
            messages: Messages::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid bind address {0:?}")]
    InvalidBind(String),
    #[error("unknown minimum-version {0:?}")]
    InvalidMinimumVersion(String),
    #[error("compression-level must be 0-9, got {0}")]
    InvalidCompressionLevel(u32),
    #[error("forwarding mode {0:?} requires a forwarding-secret")]
    MissingForwardingSecret(&'static str),
    #[error("fallback {0:?} is not a registered server")]
    UnknownFallback(String),
    #[error("server {0:?} has an unparseable address {1:?}")]
    InvalidServerAddress(String, String),
}

impl ProxyConfig {
    /// Load and validate. A missing file yields the defaults, matching how
    /// a first run behaves before the operator writes a config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ProxyConfig>(&contents)?
        } else {
            tracing::info!("no config file at {}, using defaults", path.display());
            ProxyConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr().is_none() {
            return Err(ConfigError::InvalidBind(self.bind.clone()));
        }
        if self.minimum_protocol().is_none() {
            return Err(ConfigError::InvalidMinimumVersion(
                self.minimum_version.clone(),
            ));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::InvalidCompressionLevel(self.compression_level));
        }
        let needs_secret = |mode: ForwardingMode| {
            matches!(mode, ForwardingMode::Modern | ForwardingMode::Bungeeguard)
        };
        if self.forwarding_secret.is_empty()
            && (needs_secret(self.player_info_forwarding_mode)
                || self.forwarding_overrides.values().any(|m| needs_secret(*m)))
        {
            return Err(ConfigError::MissingForwardingSecret("modern/bungeeguard"));
        }
        for name in &self.servers.try_order {
            if !self.servers.entries.contains_key(name) {
                return Err(ConfigError::UnknownFallback(name.clone()));
            }
        }
        for (name, address) in &self.servers.entries {
            if address.parse::<SocketAddr>().is_err() && !is_host_port(address) {
                return Err(ConfigError::InvalidServerAddress(
                    name.clone(),
                    address.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Option<SocketAddr> {
        self.bind.parse().ok()
    }

    pub fn minimum_protocol(&self) -> Option<ProtocolVersion> {
        conduit_protocol::SUPPORTED_VERSIONS
            .iter()
            .copied()
            .find(|v| v.name() == self.minimum_version)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    /// The effective forwarding mode for a backend.
    pub fn forwarding_for(&self, server: &str) -> ForwardingMode {
        self.forwarding_overrides
            .get(server)
            .copied()
            .unwrap_or(self.player_info_forwarding_mode)
    }

    /// Read the configured favicon into a `data:` URI for the status
    /// document.
    pub fn load_favicon(&self) -> Option<String> {
        let path = self.favicon.as_deref()?;
        match std::fs::read(path) {
            Ok(bytes) => Some(format!(
                "data:image/png;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            )),
            Err(err) => {
                tracing::warn!("failed to read favicon {path}: {err}");
                None
            }
        }
    }

    pub fn fallback_version_name(&self) -> String {
        self.fallback_version_ping
            .replace("{proxy-brand}", &self.server_brand)
            .replace(
                "{protocol-min}",
                ProtocolVersion::MINIMUM.name(),
            )
            .replace(
                "{protocol-max}",
                ProtocolVersion::MAXIMUM.name(),
            )
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ProxyConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_a_full_document() {
        let doc = r#"
            config-version = "1.0"
            bind = "0.0.0.0:25577"
            online-mode = true
            player-info-forwarding-mode = "modern"
            forwarding-secret = "s3cret"
            minimum-version = "1.8"
            compression-threshold = 512
            login-ratelimit = 1500

            [servers]
            lobby = "127.0.0.1:30066"
            factions = "127.0.0.1:30067"
            try = ["lobby", "factions"]

            [forwarding-overrides]
            factions = "bungeeguard"

            [messages]
            kick-duplicate-login = "duplicate!"
        "#;
        let config: ProxyConfig = toml::from_str(doc).unwrap();
        config.validate().unwrap();
        assert_eq!(config.servers.entries.len(), 2);
        assert_eq!(config.servers.try_order, vec!["lobby", "factions"]);
        assert_eq!(
            config.forwarding_for("factions"),
            ForwardingMode::Bungeeguard
        );
        assert_eq!(config.forwarding_for("lobby"), ForwardingMode::Modern);
        assert_eq!(config.messages.kick_duplicate_login, "duplicate!");
        assert_eq!(
            config.minimum_protocol(),
            Some(ProtocolVersion::V1_8)
        );
    }

    #[test]
    fn modern_forwarding_without_secret_is_rejected() {
        let mut config = ProxyConfig::default();
        config.player_info_forwarding_mode = ForwardingMode::Modern;
        config.forwarding_secret.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingForwardingSecret(_))
        ));
    }

    #[test]
    fn unknown_fallback_is_rejected() {
        let mut config = ProxyConfig::default();
        config.servers.try_order.push("missing".to_owned());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownFallback(_))
        ));
    }

    #[test]
    fn bad_bind_is_rejected() {
        let mut config = ProxyConfig::default();
        config.bind = "not-an-address".to_owned();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBind(_))));
    }

    #[test]
    fn fallback_version_template_substitutes() {
        let config = ProxyConfig::default();
        let name = config.fallback_version_name();
        assert_eq!(name, "Conduit 1.7.2-1.21");
    }
}
