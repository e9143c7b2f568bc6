use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::net::IpAddr;

use bytes::{BufMut, BytesMut};
use conduit_protocol::{read_string, write_string, write_uuid, write_varint};
use conduit_types::GameProfile;

/// The plugin channel used for the modern forwarding round trip.
pub const PLAYER_INFO_CHANNEL: &str = "velocity:player_info";

/// Version tag inside the modern forwarding payload.
const MODERN_FORWARDING_VERSION: i32 = 1;

/// How a backend learns the real client's identity and address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Backend sees the proxy's socket as the client.
    None,
    /// BungeeCord-style `\0`-spliced handshake address. Spoofable by anyone
    /// who can reach the backend.
    Legacy,
    /// Legacy payload plus a shared-secret token in the properties.
    Bungeeguard,
    /// Dedicated login-plugin round trip, HMAC-signed. Requires 1.13+.
    Modern,
}

impl Default for ForwardingMode {
    fn default() -> Self {
        ForwardingMode::None
    }
}

/// Build the spliced handshake address for LEGACY and BUNGEEGUARD modes:
/// `host\0clientIp\0undashedUuid\0propertiesJson`.
pub fn legacy_handshake_address(
    backend_host: &str,
    client_ip: IpAddr,
    profile: &GameProfile,
    bungeeguard_token: Option<&str>,
) -> String {
    let mut properties = profile.properties.clone();
    if let Some(token) = bungeeguard_token {
        properties.push(conduit_types::ProfileProperty::new(
            "bungeeguard-token",
            token,
        ));
    }
    let properties_json =
        serde_json::to_string(&properties).unwrap_or_else(|_| "[]".to_owned());
    format!(
        "{}\0{}\0{}\0{}",
        backend_host,
        client_ip,
        profile.uuid.simple(),
        properties_json
    )
}

/// Build the signed modern-forwarding payload carried in the
/// LoginPluginResponse: `hmac(32) ‖ varint(version) ‖ address ‖ uuid ‖
/// username ‖ properties`.
pub fn modern_forwarding_payload(
    secret: &[u8],
    client_ip: IpAddr,
    profile: &GameProfile,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    write_varint(&mut body, MODERN_FORWARDING_VERSION);
    write_string(&mut body, &client_ip.to_string());
    write_uuid(&mut body, &profile.uuid);
    write_string(&mut body, &profile.name);
    write_varint(&mut body, profile.properties.len() as i32);
    for property in &profile.properties {
        write_string(&mut body, &property.name);
        write_string(&mut body, &property.value);
        match &property.signature {
            Some(sig) => {
                body.put_u8(1);
                write_string(&mut body, sig);
            }
            None => body.put_u8(0),
        }
    }

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&body);
    let signature = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(signature.len() + body.len());
    payload.extend_from_slice(&signature);
    payload.extend_from_slice(&body);
    payload
}

/// Serverbound REGISTER/UNREGISTER channel names, which differ across the
/// 1.13 identifier flattening.
pub fn register_channel(modern: bool) -> &'static str {
    if modern {
        "minecraft:register"
    } else {
        "REGISTER"
    }
}

pub fn unregister_channel(modern: bool) -> &'static str {
    if modern {
        "minecraft:unregister"
    } else {
        "UNREGISTER"
    }
}

/// The brand channel, same flattening split.
pub fn brand_channel(modern: bool) -> &'static str {
    if modern {
        "minecraft:brand"
    } else {
        "MC|Brand"
    }
}

/// Encode a REGISTER payload: `\0`-joined channel identifiers.
pub fn encode_channel_list<'a>(channels: impl Iterator<Item = &'a str>) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, channel) in channels.enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(channel.as_bytes());
    }
    out
}

/// Split a REGISTER/UNREGISTER payload into channel identifiers.
pub fn decode_channel_list(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .filter_map(|part| std::str::from_utf8(part).ok().map(str::to_owned))
        .collect()
}

/// Rewrite a brand plugin-message payload to append the proxy's brand.
pub fn rewrite_brand(data: &[u8], proxy_brand: &str) -> Vec<u8> {
    let mut buf = BytesMut::from(data);
    let backend_brand = read_string(&mut buf, 256).unwrap_or_default();
    let mut out = BytesMut::new();
    write_string(&mut out, &format!("{backend_brand} ({proxy_brand})"));
    out.to_vec()
}
