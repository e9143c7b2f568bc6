use conduit_types::StatusDialect;

/// A supported wire-protocol revision, ordered oldest to newest.
///
/// Every packet-ID table, serializer variant, and the ping JSON dialect is
/// keyed on this. The enum only names revisions at which something the proxy
/// cares about changed; clients declaring an in-between number are mapped to
/// the nearest revision at or below theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1_7_2,
    V1_7_6,
    V1_8,
    V1_9,
    V1_9_4,
    V1_12_2,
    V1_13,
    V1_14,
    V1_15,
    V1_16,
    V1_16_2,
    V1_17,
    V1_18_2,
    V1_19,
    V1_19_1,
    V1_19_4,
    V1_20_2,
    V1_20_3,
    V1_20_5,
    V1_21,
}

pub const SUPPORTED_VERSIONS: &[ProtocolVersion] = &[
    ProtocolVersion::V1_7_2,
    ProtocolVersion::V1_7_6,
    ProtocolVersion::V1_8,
    ProtocolVersion::V1_9,
    ProtocolVersion::V1_9_4,
    ProtocolVersion::V1_12_2,
    ProtocolVersion::V1_13,
    ProtocolVersion::V1_14,
    ProtocolVersion::V1_15,
    ProtocolVersion::V1_16,
    ProtocolVersion::V1_16_2,
    ProtocolVersion::V1_17,
    ProtocolVersion::V1_18_2,
    ProtocolVersion::V1_19,
    ProtocolVersion::V1_19_1,
    ProtocolVersion::V1_19_4,
    ProtocolVersion::V1_20_2,
    ProtocolVersion::V1_20_3,
    ProtocolVersion::V1_20_5,
    ProtocolVersion::V1_21,
];

impl ProtocolVersion {
    pub const MINIMUM: ProtocolVersion = ProtocolVersion::V1_7_2;
    pub const MAXIMUM: ProtocolVersion = ProtocolVersion::V1_21;

    /// The numeric protocol version carried in the Handshake packet.
    pub fn number(self) -> i32 {
        match self {
            ProtocolVersion::V1_7_2 => 4,
            ProtocolVersion::V1_7_6 => 5,
            ProtocolVersion::V1_8 => 47,
            ProtocolVersion::V1_9 => 107,
            ProtocolVersion::V1_9_4 => 110,
            ProtocolVersion::V1_12_2 => 340,
            ProtocolVersion::V1_13 => 393,
            ProtocolVersion::V1_14 => 477,
            ProtocolVersion::V1_15 => 573,
            ProtocolVersion::V1_16 => 735,
            ProtocolVersion::V1_16_2 => 751,
            ProtocolVersion::V1_17 => 755,
            ProtocolVersion::V1_18_2 => 758,
            ProtocolVersion::V1_19 => 759,
            ProtocolVersion::V1_19_1 => 760,
            ProtocolVersion::V1_19_4 => 762,
            ProtocolVersion::V1_20_2 => 764,
            ProtocolVersion::V1_20_3 => 765,
            ProtocolVersion::V1_20_5 => 766,
            ProtocolVersion::V1_21 => 767,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V1_7_2 => "1.7.2",
            ProtocolVersion::V1_7_6 => "1.7.6",
            ProtocolVersion::V1_8 => "1.8",
            ProtocolVersion::V1_9 => "1.9",
            ProtocolVersion::V1_9_4 => "1.9.4",
            ProtocolVersion::V1_12_2 => "1.12.2",
            ProtocolVersion::V1_13 => "1.13",
            ProtocolVersion::V1_14 => "1.14",
            ProtocolVersion::V1_15 => "1.15",
            ProtocolVersion::V1_16 => "1.16",
            ProtocolVersion::V1_16_2 => "1.16.2",
            ProtocolVersion::V1_17 => "1.17",
            ProtocolVersion::V1_18_2 => "1.18.2",
            ProtocolVersion::V1_19 => "1.19",
            ProtocolVersion::V1_19_1 => "1.19.1",
            ProtocolVersion::V1_19_4 => "1.19.4",
            ProtocolVersion::V1_20_2 => "1.20.2",
            ProtocolVersion::V1_20_3 => "1.20.3",
            ProtocolVersion::V1_20_5 => "1.20.5",
            ProtocolVersion::V1_21 => "1.21",
        }
    }

    /// Exact lookup of a declared protocol number.
    pub fn from_number(number: i32) -> Option<ProtocolVersion> {
        SUPPORTED_VERSIONS.iter().copied().find(|v| v.number() == number)
    }

    /// Map a declared protocol number to the nearest supported revision at or
    /// below it. Returns `None` when the number predates 1.7.2.
    pub fn closest_supported(number: i32) -> Option<ProtocolVersion> {
        SUPPORTED_VERSIONS
            .iter()
            .copied()
            .take_while(|v| v.number() <= number)
            .last()
    }

    pub fn at_least(self, other: ProtocolVersion) -> bool {
        self >= other
    }

    /// Whether this revision carries the CONFIG state (1.20.2+).
    pub fn has_config_state(self) -> bool {
        self >= ProtocolVersion::V1_20_2
    }

    /// Modern (plugin-channel) identity forwarding needs 1.13 semantics.
    pub fn supports_modern_forwarding(self) -> bool {
        self >= ProtocolVersion::V1_13
    }

    pub fn status_dialect(self) -> StatusDialect {
        if self < ProtocolVersion::V1_16 {
            StatusDialect::Legacy
        } else if self < ProtocolVersion::V1_20_3 {
            StatusDialect::Rgb
        } else {
            StatusDialect::Modern
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (protocol {})", self.name(), self.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ordered_by_number() {
        for pair in SUPPORTED_VERSIONS.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].number() < pair[1].number());
        }
    }

    #[test]
    fn closest_supported_rounds_down() {
        // 1.12.1 is 338; the nearest revision we key tables on is 1.9.4.
        assert_eq!(
            ProtocolVersion::closest_supported(338),
            Some(ProtocolVersion::V1_9_4)
        );
        assert_eq!(
            ProtocolVersion::closest_supported(767),
            Some(ProtocolVersion::V1_21)
        );
        assert_eq!(ProtocolVersion::closest_supported(3), None);
    }

    #[test]
    fn dialect_boundaries() {
        assert_eq!(ProtocolVersion::V1_8.status_dialect(), StatusDialect::Legacy);
        assert_eq!(ProtocolVersion::V1_16.status_dialect(), StatusDialect::Rgb);
        assert_eq!(
            ProtocolVersion::V1_20_2.status_dialect(),
            StatusDialect::Rgb
        );
        assert_eq!(
            ProtocolVersion::V1_20_3.status_dialect(),
            StatusDialect::Modern
        );
    }

    #[test]
    fn config_state_starts_at_1_20_2() {
        assert!(!ProtocolVersion::V1_19_4.has_config_state());
        assert!(ProtocolVersion::V1_20_2.has_config_state());
    }
}
