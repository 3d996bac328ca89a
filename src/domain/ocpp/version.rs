//! Negotiated OCPP protocol version

use std::fmt;

use serde::{Deserialize, Serialize};

/// OCPP dialects the engine speaks. Only 1.6-J today; a second dialect is a
/// new variant here plus an entry in the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    V16,
}

impl OcppVersion {
    /// WebSocket subprotocol identifier used in `Sec-WebSocket-Protocol`.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
        }
    }

    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            _ => None,
        }
    }

    /// All supported versions, in server preference order.
    pub const ALL: &'static [OcppVersion] = &[Self::V16];

    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocol_round_trip() {
        for v in OcppVersion::ALL {
            assert_eq!(OcppVersion::from_subprotocol(v.subprotocol()), Some(*v));
        }
        assert_eq!(OcppVersion::from_subprotocol(" ocpp1.6 "), Some(OcppVersion::V16));
        assert_eq!(OcppVersion::from_subprotocol("ocpp2.0.1"), None);
    }

    #[test]
    fn display() {
        assert_eq!(OcppVersion::V16.to_string(), "OCPP 1.6");
    }
}
