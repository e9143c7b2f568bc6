use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which status-JSON dialect a client understands.
///
/// Chat components gained RGB colors in 1.16 and moved to the modern
/// component encoding in 1.20.3; the ping document must be serialized with
/// the dialect matching the client's declared version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDialect {
    /// Pre-1.16: named colors only.
    Legacy,
    /// 1.16 up to (excluding) 1.20.3: hex colors allowed.
    Rgb,
    /// 1.20.3 and newer.
    Modern,
}

/// A chat component, covering the subset the proxy itself produces
/// (kick reasons, the status description, duplicate-login notices).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextComponent {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extra: Vec<TextComponent>,
}

const NAMED_COLORS: &[(&str, u32)] = &[
    ("black", 0x000000),
    ("dark_blue", 0x0000AA),
    ("dark_green", 0x00AA00),
    ("dark_aqua", 0x00AAAA),
    ("dark_red", 0xAA0000),
    ("dark_purple", 0xAA00AA),
    ("gold", 0xFFAA00),
    ("gray", 0xAAAAAA),
    ("dark_gray", 0x555555),
    ("blue", 0x5555FF),
    ("green", 0x55FF55),
    ("aqua", 0x55FFFF),
    ("red", 0xFF5555),
    ("light_purple", 0xFF55FF),
    ("yellow", 0xFFFF55),
    ("white", 0xFFFFFF),
];

impl TextComponent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn colored(text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: Some(color.into()),
            ..Default::default()
        }
    }

    /// Serialize under the given dialect.
    ///
    /// Hex colors are downsampled to the nearest named color for clients
    /// that predate RGB support; everything else passes through unchanged.
    pub fn to_json_value(&self, dialect: StatusDialect) -> Value {
        let mut out = serde_json::to_value(self).unwrap_or_else(|_| Value::String(String::new()));
        if dialect == StatusDialect::Legacy {
            downgrade_colors(&mut out);
        }
        out
    }

    pub fn to_json(&self, dialect: StatusDialect) -> String {
        self.to_json_value(dialect).to_string()
    }
}

fn downgrade_colors(value: &mut Value) {
    let Value::Object(map) = value else { return };
    let hex = match map.get("color") {
        Some(Value::String(color)) => parse_hex_color(color),
        _ => None,
    };
    if let Some(rgb) = hex {
        map.insert(
            "color".to_owned(),
            Value::String(nearest_named_color(rgb).to_owned()),
        );
    }
    if let Some(Value::Array(extra)) = map.get_mut("extra") {
        for child in extra {
            downgrade_colors(child);
        }
    }
}

fn parse_hex_color(s: &str) -> Option<u32> {
    let hex = s.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

fn nearest_named_color(rgb: u32) -> &'static str {
    let (r, g, b) = ((rgb >> 16) as i64 & 0xFF, (rgb >> 8) as i64 & 0xFF, rgb as i64 & 0xFF);
    NAMED_COLORS
        .iter()
        .min_by_key(|(_, named)| {
            let (nr, ng, nb) = (
                (named >> 16) as i64 & 0xFF,
                (named >> 8) as i64 & 0xFF,
                *named as i64 & 0xFF,
            );
            (r - nr).pow(2) + (g - ng).pow(2) + (b - nb).pow(2)
        })
        .map(|(name, _)| *name)
        .unwrap_or("white")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_component_serializes_minimally() {
        let c = TextComponent::plain("hello");
        assert_eq!(c.to_json(StatusDialect::Rgb), r#"{"text":"hello"}"#);
    }

    #[test]
    fn hex_color_survives_rgb_dialect() {
        let c = TextComponent::colored("x", "#55FFFF");
        let v = c.to_json_value(StatusDialect::Rgb);
        assert_eq!(v["color"], "#55FFFF");
    }

    #[test]
    fn hex_color_downgrades_for_legacy_dialect() {
        let c = TextComponent::colored("x", "#55FFFE");
        let v = c.to_json_value(StatusDialect::Legacy);
        assert_eq!(v["color"], "aqua");
    }

    #[test]
    fn named_color_passes_through_legacy() {
        let c = TextComponent::colored("x", "gold");
        let v = c.to_json_value(StatusDialect::Legacy);
        assert_eq!(v["color"], "gold");
    }

    #[test]
    fn nested_extra_is_downgraded() {
        let mut c = TextComponent::plain("a");
        c.extra.push(TextComponent::colored("b", "#FF5554"));
        let v = c.to_json_value(StatusDialect::Legacy);
        assert_eq!(v["extra"][0]["color"], "red");
    }
}
