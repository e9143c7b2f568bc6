use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A player's game profile (UUID + name + properties).
///
/// The serde field names match the session-service response document, so the
/// same type deserializes the `hasJoined` body directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameProfile {
    #[serde(rename = "id")]
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<ProfileProperty>,
}

impl GameProfile {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Profile for an unauthenticated player, with the derived offline UUID.
    pub fn offline(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uuid: offline_uuid(&name),
            name,
            properties: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileProperty {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ProfileProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            signature: None,
        }
    }
}

/// Derive the offline-mode UUID for a username.
///
/// This is the MD5 of `OfflinePlayer:<name>` with the version field forced to
/// 3 and the RFC 4122 variant bits set, matching what vanilla servers compute
/// for unauthenticated players.
pub fn offline_uuid(name: &str) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(b"OfflinePlayer:");
    hasher.update(name.as_bytes());
    let mut bytes: [u8; 16] = hasher.finalize().into();
    bytes[6] = (bytes[6] & 0x0F) | 0x30;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_uuid_is_stable_and_v3() {
        let a = offline_uuid("Alice");
        let b = offline_uuid("Alice");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 3);
        assert_ne!(offline_uuid("alice"), a);
    }

    #[test]
    fn profile_deserializes_session_service_body() {
        let body = r#"{
            "id": "af74a02d19cb445bb07f6866a861f783",
            "name": "Alice",
            "properties": [
                {"name": "textures", "value": "dGV4dHVyZQ==", "signature": "c2ln"}
            ]
        }"#;
        let profile: GameProfile = serde_json::from_str(body).unwrap();
        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.properties.len(), 1);
        assert_eq!(profile.properties[0].name, "textures");
    }
}
