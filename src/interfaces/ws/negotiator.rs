//! OCPP protocol version negotiation
//!
//! During the WebSocket handshake the charge point advertises which OCPP
//! sub-protocols it supports via the `Sec-WebSocket-Protocol` header.
//! The negotiator picks the first server-preferred version it offered.

use crate::domain::OcppVersion;

pub struct ProtocolNegotiator {
    /// Versions the server supports, in preference order
    supported_versions: Vec<OcppVersion>,
}

impl ProtocolNegotiator {
    pub fn new(supported_versions: Vec<OcppVersion>) -> Self {
        Self { supported_versions }
    }

    /// Negotiate the OCPP version from the `Sec-WebSocket-Protocol` header value.
    ///
    /// Returns the best mutually-supported version, or `None` if no match.
    pub fn negotiate(&self, requested_protocols: &str) -> Option<OcppVersion> {
        let requested: Vec<&str> = requested_protocols.split(',').map(|s| s.trim()).collect();

        self.supported_versions
            .iter()
            .find(|version| requested.iter().any(|p| *p == version.subprotocol()))
            .copied()
    }

    /// Subprotocols to advertise (server info / logging).
    pub fn supported_subprotocols(&self) -> Vec<&'static str> {
        self.supported_versions
            .iter()
            .map(|v| v.subprotocol())
            .collect()
    }
}

impl Default for ProtocolNegotiator {
    fn default() -> Self {
        Self::new(OcppVersion::ALL.to_vec())
    }
}

/// Extract the charge point identity from the request path: the last
/// segment of `/ocpp/{id}` or `/{id}`.
pub fn extract_charge_point_id(path: &str) -> Option<String> {
    let path = path.trim_matches('/');

    let id = match path.strip_prefix("ocpp/") {
        Some(rest) => rest.trim_start_matches('/'),
        None if !path.contains('/') => path,
        None => return None,
    };

    if id.is_empty() || id.contains('/') || id == "ocpp" {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_single_match() {
        let negotiator = ProtocolNegotiator::default();
        assert_eq!(negotiator.negotiate("ocpp1.6"), Some(OcppVersion::V16));
    }

    #[test]
    fn negotiate_among_several_offers() {
        let negotiator = ProtocolNegotiator::default();
        assert_eq!(
            negotiator.negotiate("ocpp2.0.1, ocpp1.6"),
            Some(OcppVersion::V16)
        );
    }

    #[test]
    fn negotiate_no_match() {
        let negotiator = ProtocolNegotiator::default();
        assert_eq!(negotiator.negotiate("ocpp2.0.1"), None);
        assert_eq!(negotiator.negotiate(""), None);
    }

    #[test]
    fn identity_is_last_path_segment() {
        assert_eq!(extract_charge_point_id("/ocpp/CP001"), Some("CP001".into()));
        assert_eq!(extract_charge_point_id("/CP001"), Some("CP001".into()));
        assert_eq!(extract_charge_point_id("/ocpp/CP001/"), Some("CP001".into()));
        assert_eq!(extract_charge_point_id("/"), None);
        assert_eq!(extract_charge_point_id("/ocpp/"), None);
        assert_eq!(extract_charge_point_id("/a/b/c"), None);
    }
}
