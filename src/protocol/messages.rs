//! Wire codec for the client-facing half of the proxy: decoding frontend
//! messages and encoding backend messages, PostgreSQL protocol 3.0.
//!
//! Result values travel as raw bytes so whatever the real backend produced
//! is relayed to the client untouched.

use std::fmt;

pub const PROTOCOL_VERSION_3: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query {
        sql: String,
    },
    Parse {
        statement_name: String,
        query: String,
        parameter_types: Vec<u32>,
    },
    Bind {
        portal_name: String,
        statement_name: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    DescribeStatement {
        statement_name: String,
    },
    DescribePortal {
        portal_name: String,
    },
    CloseStatement {
        statement_name: String,
    },
    ClosePortal {
        portal_name: String,
    },
    Password {
        password: String,
    },
    Flush,
    Sync,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format_code: i16,
}

impl FieldDescription {
    /// A text-format column with no table provenance, as synthesized
    /// descriptions use.
    pub fn text(name: impl Into<String>, type_oid: u32) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format_code: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Failed => b'E',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: u32,
        secret_key: u32,
    },
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    ParameterDescription {
        parameter_types: Vec<u32>,
    },
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Vec<u8>>>,
    },
    CommandComplete {
        tag: String,
    },
    NoticeResponse {
        severity: String,
        code: String,
        message: String,
    },
    ErrorResponse {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<u32>,
    },
}

impl BackendMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ErrorResponse {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
        }
    }
}

pub fn decode_frontend_message(tag: u8, payload: &[u8]) -> Result<FrontendMessage, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let message = match tag {
        b'Q' => FrontendMessage::Query {
            sql: cursor.read_cstring()?,
        },
        b'P' => {
            let statement_name = cursor.read_cstring()?;
            let query = cursor.read_cstring()?;
            let count = cursor.read_i16()? as usize;
            let mut parameter_types = Vec::with_capacity(count);
            for _ in 0..count {
                parameter_types.push(cursor.read_i32()? as u32);
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                parameter_types,
            }
        }
        b'B' => {
            let portal_name = cursor.read_cstring()?;
            let statement_name = cursor.read_cstring()?;

            let format_count = cursor.read_i16()? as usize;
            let mut param_formats = Vec::with_capacity(format_count);
            for _ in 0..format_count {
                param_formats.push(cursor.read_i16()?);
            }

            let param_count = cursor.read_i16()? as usize;
            let mut params = Vec::with_capacity(param_count);
            for _ in 0..param_count {
                let len = cursor.read_i32()?;
                if len == -1 {
                    params.push(None);
                } else if len < -1 {
                    return Err(ProtocolError::new("bind parameter length is invalid"));
                } else {
                    params.push(Some(cursor.read_bytes(len as usize)?.to_vec()));
                }
            }

            let result_format_count = cursor.read_i16()? as usize;
            let mut result_formats = Vec::with_capacity(result_format_count);
            for _ in 0..result_format_count {
                result_formats.push(cursor.read_i16()?);
            }

            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                params,
                result_formats,
            }
        }
        b'E' => FrontendMessage::Execute {
            portal_name: cursor.read_cstring()?,
            max_rows: cursor.read_i32()?,
        },
        b'D' => {
            let kind = cursor.read_u8()?;
            let name = cursor.read_cstring()?;
            match kind {
                b'S' => FrontendMessage::DescribeStatement {
                    statement_name: name,
                },
                b'P' => FrontendMessage::DescribePortal { portal_name: name },
                _ => return Err(ProtocolError::new("describe message kind must be S or P")),
            }
        }
        b'C' => {
            let kind = cursor.read_u8()?;
            let name = cursor.read_cstring()?;
            match kind {
                b'S' => FrontendMessage::CloseStatement {
                    statement_name: name,
                },
                b'P' => FrontendMessage::ClosePortal { portal_name: name },
                _ => return Err(ProtocolError::new("close message kind must be S or P")),
            }
        }
        b'p' => FrontendMessage::Password {
            password: cursor.read_cstring()?,
        },
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'X' => FrontendMessage::Terminate,
        _ => {
            return Err(ProtocolError::new(format!(
                "unsupported frontend message tag {}",
                tag as char
            )));
        }
    };
    cursor.ensure_consumed()?;
    Ok(message)
}

pub fn encode_backend_message(message: &BackendMessage) -> Vec<u8> {
    match message {
        BackendMessage::AuthenticationOk => {
            frame_message(b'R', 0i32.to_be_bytes().to_vec())
        }
        BackendMessage::AuthenticationCleartextPassword => {
            frame_message(b'R', 3i32.to_be_bytes().to_vec())
        }
        BackendMessage::ParameterStatus { name, value } => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, name);
            push_cstring(&mut payload, value);
            frame_message(b'S', payload)
        }
        BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        } => {
            let mut payload = Vec::new();
            payload.extend_from_slice(&process_id.to_be_bytes());
            payload.extend_from_slice(&secret_key.to_be_bytes());
            frame_message(b'K', payload)
        }
        BackendMessage::ReadyForQuery { status } => {
            frame_message(b'Z', vec![status.as_byte()])
        }
        BackendMessage::ParseComplete => frame_message(b'1', Vec::new()),
        BackendMessage::BindComplete => frame_message(b'2', Vec::new()),
        BackendMessage::CloseComplete => frame_message(b'3', Vec::new()),
        BackendMessage::NoData => frame_message(b'n', Vec::new()),
        BackendMessage::PortalSuspended => frame_message(b's', Vec::new()),
        BackendMessage::EmptyQueryResponse => frame_message(b'I', Vec::new()),
        BackendMessage::ParameterDescription { parameter_types } => {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(parameter_types.len() as i16).to_be_bytes());
            for oid in parameter_types {
                payload.extend_from_slice(&oid.to_be_bytes());
            }
            frame_message(b't', payload)
        }
        BackendMessage::RowDescription { fields } => {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(fields.len() as i16).to_be_bytes());
            for field in fields {
                push_cstring(&mut payload, &field.name);
                payload.extend_from_slice(&field.table_oid.to_be_bytes());
                payload.extend_from_slice(&field.column_attr.to_be_bytes());
                payload.extend_from_slice(&field.type_oid.to_be_bytes());
                payload.extend_from_slice(&field.type_size.to_be_bytes());
                payload.extend_from_slice(&field.type_modifier.to_be_bytes());
                payload.extend_from_slice(&field.format_code.to_be_bytes());
            }
            frame_message(b'T', payload)
        }
        BackendMessage::DataRow { values } => {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(values.len() as i16).to_be_bytes());
            for value in values {
                match value {
                    Some(bytes) => {
                        payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                        payload.extend_from_slice(bytes);
                    }
                    None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
                }
            }
            frame_message(b'D', payload)
        }
        BackendMessage::CommandComplete { tag } => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, tag);
            frame_message(b'C', payload)
        }
        BackendMessage::NoticeResponse {
            severity,
            code,
            message,
        } => frame_message(
            b'N',
            encode_error_or_notice(severity, code, message, None, None, None),
        ),
        BackendMessage::ErrorResponse {
            severity,
            code,
            message,
            detail,
            hint,
            position,
        } => frame_message(
            b'E',
            encode_error_or_notice(
                severity,
                code,
                message,
                detail.as_deref(),
                hint.as_deref(),
                *position,
            ),
        ),
    }
}

fn encode_error_or_notice(
    severity: &str,
    code: &str,
    message: &str,
    detail: Option<&str>,
    hint: Option<&str>,
    position: Option<u32>,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    push_cstring(&mut payload, severity);
    payload.push(b'V');
    push_cstring(&mut payload, severity);
    payload.push(b'C');
    push_cstring(&mut payload, code);
    payload.push(b'M');
    push_cstring(&mut payload, message);
    if let Some(detail) = detail {
        payload.push(b'D');
        push_cstring(&mut payload, detail);
    }
    if let Some(hint) = hint {
        payload.push(b'H');
        push_cstring(&mut payload, hint);
    }
    if let Some(position) = position {
        payload.push(b'P');
        push_cstring(&mut payload, &position.to_string());
    }
    payload.push(0);
    payload
}

fn frame_message(tag: u8, payload: Vec<u8>) -> Vec<u8> {
    let len = (payload.len() + 4) as u32;
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

fn push_cstring(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

pub(crate) fn find_zero(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|b| *b == 0)
        .map(|offset| from + offset)
}

pub(crate) fn decode_utf8(bytes: &[u8], context: &str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::new(format!("{context} is not valid utf8")))
}

pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    idx: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, idx: 0 }
    }

    fn ensure_consumed(&self) -> Result<(), ProtocolError> {
        if self.idx == self.bytes.len() {
            Ok(())
        } else {
            Err(ProtocolError::new("message payload has trailing bytes"))
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.idx + len > self.bytes.len() {
            return Err(ProtocolError::new("message payload is truncated"));
        }
        let out = &self.bytes[self.idx..self.idx + len];
        self.idx += len;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_cstring(&mut self) -> Result<String, ProtocolError> {
        let start = self.idx;
        let Some(end) = find_zero(self.bytes, start) else {
            return Err(ProtocolError::new("cstring terminator missing"));
        };
        self.idx = end + 1;
        decode_utf8(&self.bytes[start..end], "cstring")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cstr(payload: &mut Vec<u8>, value: &str) {
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }

    #[test]
    fn decodes_simple_query() {
        let mut payload = Vec::new();
        push_cstr(&mut payload, "SELECT 1");
        let decoded = decode_frontend_message(b'Q', &payload).expect("query should decode");
        assert_eq!(
            decoded,
            FrontendMessage::Query {
                sql: "SELECT 1".to_string()
            }
        );
    }

    #[test]
    fn decodes_parse_bind_execute_messages() {
        let parse_payload = {
            let mut payload = Vec::new();
            push_cstr(&mut payload, "s1");
            push_cstr(&mut payload, "SELECT $1");
            payload.extend_from_slice(&1i16.to_be_bytes());
            payload.extend_from_slice(&23u32.to_be_bytes());
            payload
        };
        let parse = decode_frontend_message(b'P', &parse_payload).expect("parse should decode");
        assert_eq!(
            parse,
            FrontendMessage::Parse {
                statement_name: "s1".to_string(),
                query: "SELECT $1".to_string(),
                parameter_types: vec![23],
            }
        );

        let bind_payload = {
            let mut payload = Vec::new();
            push_cstr(&mut payload, "p1");
            push_cstr(&mut payload, "s1");
            payload.extend_from_slice(&0i16.to_be_bytes());
            payload.extend_from_slice(&2i16.to_be_bytes());
            payload.extend_from_slice(&1i32.to_be_bytes());
            payload.extend_from_slice(b"7");
            payload.extend_from_slice(&(-1i32).to_be_bytes());
            payload.extend_from_slice(&0i16.to_be_bytes());
            payload
        };
        let bind = decode_frontend_message(b'B', &bind_payload).expect("bind should decode");
        assert_eq!(
            bind,
            FrontendMessage::Bind {
                portal_name: "p1".to_string(),
                statement_name: "s1".to_string(),
                param_formats: vec![],
                params: vec![Some(b"7".to_vec()), None],
                result_formats: vec![],
            }
        );

        let execute_payload = {
            let mut payload = Vec::new();
            push_cstr(&mut payload, "p1");
            payload.extend_from_slice(&100i32.to_be_bytes());
            payload
        };
        let execute =
            decode_frontend_message(b'E', &execute_payload).expect("execute should decode");
        assert_eq!(
            execute,
            FrontendMessage::Execute {
                portal_name: "p1".to_string(),
                max_rows: 100
            }
        );
    }

    #[test]
    fn decodes_describe_close_and_password() {
        let mut describe = vec![b'S'];
        push_cstr(&mut describe, "stmt");
        assert_eq!(
            decode_frontend_message(b'D', &describe).expect("describe should decode"),
            FrontendMessage::DescribeStatement {
                statement_name: "stmt".to_string()
            }
        );

        let mut close = vec![b'P'];
        push_cstr(&mut close, "portal");
        assert_eq!(
            decode_frontend_message(b'C', &close).expect("close should decode"),
            FrontendMessage::ClosePortal {
                portal_name: "portal".to_string()
            }
        );

        let mut password = Vec::new();
        push_cstr(&mut password, "secret");
        assert_eq!(
            decode_frontend_message(b'p', &password).expect("password should decode"),
            FrontendMessage::Password {
                password: "secret".to_string()
            }
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut payload = Vec::new();
        push_cstr(&mut payload, "SELECT 1");
        payload.push(b'x');
        assert!(decode_frontend_message(b'Q', &payload).is_err());
    }

    #[test]
    fn encodes_data_row_with_nulls_as_raw_bytes() {
        let frame = encode_backend_message(&BackendMessage::DataRow {
            values: vec![Some(b"42".to_vec()), None],
        });
        assert_eq!(frame[0], b'D');
        // column count 2, "42" with length 2, then NULL marker -1
        let payload = &frame[5..];
        assert_eq!(&payload[..2], &2i16.to_be_bytes());
        assert_eq!(&payload[2..6], &2i32.to_be_bytes());
        assert_eq!(&payload[6..8], b"42");
        assert_eq!(&payload[8..12], &(-1i32).to_be_bytes());
    }

    #[test]
    fn encodes_ready_for_query_status_bytes() {
        let idle = encode_backend_message(&BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        });
        assert_eq!(idle, vec![b'Z', 0, 0, 0, 5, b'I']);
        let in_tx = encode_backend_message(&BackendMessage::ReadyForQuery {
            status: TransactionStatus::InTransaction,
        });
        assert_eq!(*in_tx.last().expect("status byte"), b'T');
    }

    #[test]
    fn encodes_error_response_with_sqlstate_detail_hint_and_position() {
        let frame = encode_backend_message(&BackendMessage::ErrorResponse {
            severity: "ERROR".to_string(),
            code: "42601".to_string(),
            message: "syntax error".to_string(),
            detail: Some("unexpected token".to_string()),
            hint: Some("check query near SELECT".to_string()),
            position: Some(17),
        });
        assert_eq!(frame[0], b'E');
        let payload = &frame[5..];
        let expected: &[u8] = b"SERROR\0VERROR\0C42601\0Msyntax error\0Dunexpected token\0Hcheck query near SELECT\0P17\0\0";
        assert_eq!(payload, expected);
    }

    #[test]
    fn encodes_row_description_fields() {
        let frame = encode_backend_message(&BackendMessage::RowDescription {
            fields: vec![FieldDescription::text("id", 20)],
        });
        assert_eq!(frame[0], b'T');
        let payload = &frame[5..];
        assert_eq!(&payload[..2], &1i16.to_be_bytes());
        assert_eq!(&payload[2..5], b"id\0");
    }
}
