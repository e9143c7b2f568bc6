use conduit_protocol::{LegacyPingFormat, ProtocolVersion};
use conduit_types::{StatusDialect, TextComponent};
use serde_json::json;
use uuid::Uuid;

use crate::config::ProxyConfig;

/// A status-response document under construction. Observers may rewrite any
/// field before serialization.
#[derive(Debug, Clone)]
pub struct StatusDocument {
    pub version_name: String,
    pub protocol: i32,
    pub max_players: u32,
    pub online: u32,
    pub sample: Vec<(String, Uuid)>,
    pub description: TextComponent,
    pub favicon: Option<String>,
}

impl StatusDocument {
    /// Assemble the document for a client that declared `client_protocol`.
    pub fn build(
        config: &ProxyConfig,
        favicon: Option<String>,
        online: u32,
        client_protocol: i32,
    ) -> Self {
        let supported = client_protocol >= ProtocolVersion::MINIMUM.number()
            && client_protocol <= ProtocolVersion::MAXIMUM.number();
        let (version_name, protocol) = if supported {
            let version = ProtocolVersion::closest_supported(client_protocol)
                .unwrap_or(ProtocolVersion::MAXIMUM);
            (
                format!("{} {}", config.server_brand, version.name()),
                client_protocol,
            )
        } else {
            (
                config.fallback_version_name(),
                ProtocolVersion::MAXIMUM.number(),
            )
        };

        Self {
            version_name,
            protocol,
            max_players: config.show_max_players,
            online,
            sample: Vec::new(),
            description: TextComponent::plain(config.motd.clone()),
            favicon,
        }
    }

    /// Serialize under the dialect matching the client's version.
    pub fn to_json(&self, dialect: StatusDialect) -> String {
        let sample: Vec<_> = self
            .sample
            .iter()
            .map(|(name, id)| json!({ "name": name, "id": id.hyphenated().to_string() }))
            .collect();
        let mut doc = json!({
            "version": {
                "name": self.version_name,
                "protocol": self.protocol,
            },
            "players": {
                "max": self.max_players,
                "online": self.online,
                "sample": sample,
            },
            "description": self.description.to_json_value(dialect),
        });
        if let Some(favicon) = &self.favicon {
            doc["favicon"] = json!(favicon);
        }
        doc.to_string()
    }
}

/// The legacy server-list ping reply: `0xFF` followed by a length-prefixed
/// UTF-16BE string. The 1.6 probe gets the five-field
/// `§1\0proto\0version\0motd\0online\0max` body; the pre-1.6 bare-0xFE probe
/// expects the three-field `motd§online§max` body with no version block.
pub fn legacy_ping_response(
    config: &ProxyConfig,
    online: u32,
    format: LegacyPingFormat,
) -> Vec<u8> {
    let body = match format {
        LegacyPingFormat::V1_6 => format!(
            "\u{a7}1\0{}\0{}\0{}\0{}\0{}",
            ProtocolVersion::MAXIMUM.number(),
            ProtocolVersion::MAXIMUM.name(),
            config.motd,
            online,
            config.show_max_players
        ),
        LegacyPingFormat::Pre1_6 => format!(
            "{}\u{a7}{}\u{a7}{}",
            config.motd, online, config.show_max_players
        ),
    };
    let units: Vec<u16> = body.encode_utf16().collect();
    let mut out = Vec::with_capacity(3 + units.len() * 2);
    out.push(0xFF);
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}
