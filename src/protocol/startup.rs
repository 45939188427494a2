//! Startup-phase decoding: the untagged first packet (StartupMessage,
//! SSLRequest or CancelRequest) and the mapping from `application_name`
//! to the proxy's test id.

use crate::protocol::messages::{
    decode_utf8, find_zero, ProtocolError, CANCEL_REQUEST_CODE, PROTOCOL_VERSION_3,
    SSL_REQUEST_CODE,
};

/// The test id used when the client does not identify one.
pub const DEFAULT_TEST_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPacket {
    pub protocol_version: u32,
    pub parameters: Vec<(String, String)>,
}

impl StartupPacket {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// The test id carried in `application_name`. `pgtest_<id>` and
    /// `pgrollback_<id>` strip to `<id>`; empty or `default` collapse to
    /// the shared default session; anything else is used verbatim.
    pub fn test_id(&self) -> String {
        extract_test_id(self.parameter("application_name"))
    }
}

pub fn extract_test_id(application_name: Option<&str>) -> String {
    let app_name = application_name.unwrap_or("").trim();
    if app_name.is_empty() || app_name.eq_ignore_ascii_case(DEFAULT_TEST_ID) {
        return DEFAULT_TEST_ID.to_string();
    }
    for prefix in ["pgtest_", "pgrollback_"] {
        if let Some(id) = app_name.strip_prefix(prefix) {
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    app_name.to_string()
}

/// The `application_name` the proxy uses on its own upstream connection.
pub fn upstream_application_name(test_id: &str) -> String {
    format!("pgrollback-{test_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupAction {
    Startup(StartupPacket),
    SslRequest,
    CancelRequest { process_id: u32, secret_key: u32 },
}

/// Decodes the first packet of a connection. `bytes` is the whole packet
/// including its 4-byte length prefix.
pub fn decode_startup_action(bytes: &[u8]) -> Result<StartupAction, ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::new("startup packet is too short"));
    }
    let declared_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared_len != bytes.len() {
        return Err(ProtocolError::new("startup packet length mismatch"));
    }
    let code = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    match code {
        PROTOCOL_VERSION_3 => parse_startup_parameters(bytes),
        SSL_REQUEST_CODE => {
            if bytes.len() != 8 {
                return Err(ProtocolError::new("SSL request packet has invalid length"));
            }
            Ok(StartupAction::SslRequest)
        }
        CANCEL_REQUEST_CODE => {
            if bytes.len() != 16 {
                return Err(ProtocolError::new("cancel request packet has invalid length"));
            }
            let process_id = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            let secret_key = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
            Ok(StartupAction::CancelRequest {
                process_id,
                secret_key,
            })
        }
        other => Err(ProtocolError::new(format!(
            "unsupported startup code {other}"
        ))),
    }
}

fn parse_startup_parameters(bytes: &[u8]) -> Result<StartupAction, ProtocolError> {
    let mut idx = 8usize;
    let mut params = Vec::new();
    while idx < bytes.len() {
        if bytes[idx] == 0 {
            idx += 1;
            break;
        }
        let key_end = find_zero(bytes, idx)
            .ok_or_else(|| ProtocolError::new("startup packet key terminator missing"))?;
        let key = decode_utf8(&bytes[idx..key_end], "startup packet key")?;
        idx = key_end + 1;

        let value_end = find_zero(bytes, idx)
            .ok_or_else(|| ProtocolError::new("startup packet value terminator missing"))?;
        let value = decode_utf8(&bytes[idx..value_end], "startup packet value")?;
        idx = value_end + 1;
        params.push((key, value));
    }
    if idx != bytes.len() {
        return Err(ProtocolError::new("startup packet has trailing garbage"));
    }
    Ok(StartupAction::Startup(StartupPacket {
        protocol_version: PROTOCOL_VERSION_3,
        parameters: params,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_startup(params: &[(&str, &str)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
        for (key, value) in params {
            payload.extend_from_slice(key.as_bytes());
            payload.push(0);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn startup_packet_parses_parameters() {
        let bytes = encode_startup(&[
            ("user", "alice"),
            ("database", "appdb"),
            ("application_name", "pgtest_t1"),
        ]);
        let action = decode_startup_action(&bytes).expect("startup should decode");
        let StartupAction::Startup(packet) = action else {
            panic!("expected startup action");
        };
        assert_eq!(packet.parameter("user"), Some("alice"));
        assert_eq!(packet.parameter("database"), Some("appdb"));
        assert_eq!(packet.test_id(), "t1");
    }

    #[test]
    fn detects_ssl_and_cancel_requests() {
        let mut ssl = Vec::new();
        ssl.extend_from_slice(&8u32.to_be_bytes());
        ssl.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        assert_eq!(
            decode_startup_action(&ssl).expect("ssl request should decode"),
            StartupAction::SslRequest
        );

        let mut cancel = Vec::new();
        cancel.extend_from_slice(&16u32.to_be_bytes());
        cancel.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        cancel.extend_from_slice(&123u32.to_be_bytes());
        cancel.extend_from_slice(&456u32.to_be_bytes());
        assert_eq!(
            decode_startup_action(&cancel).expect("cancel request should decode"),
            StartupAction::CancelRequest {
                process_id: 123,
                secret_key: 456
            }
        );
    }

    #[test]
    fn test_id_extraction_rules() {
        assert_eq!(extract_test_id(None), "default");
        assert_eq!(extract_test_id(Some("")), "default");
        assert_eq!(extract_test_id(Some("default")), "default");
        assert_eq!(extract_test_id(Some("pgtest_t42")), "t42");
        assert_eq!(extract_test_id(Some("pgrollback_suite_a")), "suite_a");
        assert_eq!(extract_test_id(Some("my-app")), "my-app");
        // A bare prefix with nothing after it is not an id.
        assert_eq!(extract_test_id(Some("pgtest_")), "pgtest_");
    }

    #[test]
    fn upstream_application_name_carries_test_id() {
        assert_eq!(upstream_application_name("t1"), "pgrollback-t1");
    }
}
