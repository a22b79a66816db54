//! Unary `RequestProtocol` / `ResponseProtocol` headers and the stream
//! frame metas.

use crate::error::ProtocolError;
use crate::mutation::Mutation;
use crate::pb::{self, Field, FieldReader};

pub const RET_SERVER_NOSERVICE: i32 = 11;
pub const RET_SERVER_SYSTEM: i32 = 31;

const REQ_VERSION: u32 = 1;
const REQ_CALL_TYPE: u32 = 2;
const REQ_REQUEST_ID: u32 = 3;
const REQ_TIMEOUT: u32 = 4;
const REQ_CALLER: u32 = 5;
const REQ_CALLEE: u32 = 6;
const REQ_FUNC: u32 = 7;
const REQ_MESSAGE_TYPE: u32 = 8;
const REQ_TRANS_INFO: u32 = 9;
const REQ_CONTENT_TYPE: u32 = 10;
const REQ_CONTENT_ENCODING: u32 = 11;

const RSP_VERSION: u32 = 1;
const RSP_CALL_TYPE: u32 = 2;
const RSP_REQUEST_ID: u32 = 3;
const RSP_RET: u32 = 4;
const RSP_FUNC_RET: u32 = 5;
const RSP_ERROR_MSG: u32 = 6;
const RSP_MESSAGE_TYPE: u32 = 7;
const RSP_TRANS_INFO: u32 = 8;
const RSP_CONTENT_TYPE: u32 = 9;
const RSP_CONTENT_ENCODING: u32 = 10;

const INIT_REQUEST_META: u32 = 1;
const INIT_META_CALLER: u32 = 1;
const INIT_META_CALLEE: u32 = 2;
const INIT_META_FUNC: u32 = 3;
const INIT_META_TRANS_INFO: u32 = 5;

const CLOSE_TYPE: u32 = 1;
const CLOSE_TYPE_RESET: u64 = 1;

/// Fields shared by request and response headers, plus the direction
/// specific ones.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnaryHeader {
    pub version: u32,
    pub call_type: u32,
    pub request_id: u32,
    pub timeout: u32,
    pub caller: String,
    pub callee: String,
    pub func: String,
    pub message_type: u32,
    pub content_type: u32,
    pub content_encoding: u32,
    pub ret: i32,
    pub func_ret: i32,
    pub error_msg: String,
    pub trans_info: Vec<(String, Vec<u8>)>,
}

fn varint_u32(value: Field<'_>) -> u32 {
    value.as_u64().unwrap_or_default() as u32
}

impl UnaryHeader {
    pub fn parse_request(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut header = Self::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                REQ_VERSION => header.version = varint_u32(value),
                REQ_CALL_TYPE => header.call_type = varint_u32(value),
                REQ_REQUEST_ID => header.request_id = varint_u32(value),
                REQ_TIMEOUT => header.timeout = varint_u32(value),
                REQ_CALLER => header.caller = value.as_string().unwrap_or_default(),
                REQ_CALLEE => header.callee = value.as_string().unwrap_or_default(),
                REQ_FUNC => header.func = value.as_string().unwrap_or_default(),
                REQ_MESSAGE_TYPE => header.message_type = varint_u32(value),
                REQ_TRANS_INFO => header.push_trans_info(value)?,
                REQ_CONTENT_TYPE => header.content_type = varint_u32(value),
                REQ_CONTENT_ENCODING => header.content_encoding = varint_u32(value),
                _ => {}
            }
        }
        Ok(header)
    }

    pub fn parse_response(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut header = Self::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                RSP_VERSION => header.version = varint_u32(value),
                RSP_CALL_TYPE => header.call_type = varint_u32(value),
                RSP_REQUEST_ID => header.request_id = varint_u32(value),
                RSP_RET => header.ret = value.as_i32().unwrap_or_default(),
                RSP_FUNC_RET => header.func_ret = value.as_i32().unwrap_or_default(),
                RSP_ERROR_MSG => header.error_msg = value.as_string().unwrap_or_default(),
                RSP_MESSAGE_TYPE => header.message_type = varint_u32(value),
                RSP_TRANS_INFO => header.push_trans_info(value)?,
                RSP_CONTENT_TYPE => header.content_type = varint_u32(value),
                RSP_CONTENT_ENCODING => header.content_encoding = varint_u32(value),
                _ => {}
            }
        }
        Ok(header)
    }

    fn push_trans_info(&mut self, value: Field<'_>) -> Result<(), ProtocolError> {
        if let Some(entry) = value.as_bytes() {
            let (key, value) = pb::decode_map_entry(entry)?;
            self.trans_info
                .push((String::from_utf8_lossy(key).into_owned(), value.to_vec()));
        }
        Ok(())
    }

    /// Encodes the response-side fields of this header.
    pub fn encode_response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.error_msg.len() + 32);
        put_nonzero(&mut out, RSP_VERSION, self.version);
        put_nonzero(&mut out, RSP_CALL_TYPE, self.call_type);
        put_nonzero(&mut out, RSP_REQUEST_ID, self.request_id);
        if self.ret != 0 {
            pb::put_int32_field(&mut out, RSP_RET, self.ret);
        }
        if self.func_ret != 0 {
            pb::put_int32_field(&mut out, RSP_FUNC_RET, self.func_ret);
        }
        if !self.error_msg.is_empty() {
            pb::put_bytes_field(&mut out, RSP_ERROR_MSG, self.error_msg.as_bytes());
        }
        put_nonzero(&mut out, RSP_MESSAGE_TYPE, self.message_type);
        for (key, value) in &self.trans_info {
            pb::put_map_entry(&mut out, RSP_TRANS_INFO, key, value);
        }
        put_nonzero(&mut out, RSP_CONTENT_TYPE, self.content_type);
        put_nonzero(&mut out, RSP_CONTENT_ENCODING, self.content_encoding);
        out
    }

    /// Encodes the request-side fields of this header.
    pub fn encode_request(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.callee.len() + self.func.len() + 32);
        put_nonzero(&mut out, REQ_VERSION, self.version);
        put_nonzero(&mut out, REQ_CALL_TYPE, self.call_type);
        put_nonzero(&mut out, REQ_REQUEST_ID, self.request_id);
        put_nonzero(&mut out, REQ_TIMEOUT, self.timeout);
        for (field, text) in [
            (REQ_CALLER, &self.caller),
            (REQ_CALLEE, &self.callee),
            (REQ_FUNC, &self.func),
        ] {
            if !text.is_empty() {
                pb::put_bytes_field(&mut out, field, text.as_bytes());
            }
        }
        put_nonzero(&mut out, REQ_MESSAGE_TYPE, self.message_type);
        for (key, value) in &self.trans_info {
            pb::put_map_entry(&mut out, REQ_TRANS_INFO, key, value);
        }
        put_nonzero(&mut out, REQ_CONTENT_TYPE, self.content_type);
        put_nonzero(&mut out, REQ_CONTENT_ENCODING, self.content_encoding);
        out
    }
}

fn put_nonzero(out: &mut Vec<u8>, field: u32, value: u32) {
    if value != 0 {
        pb::put_varint_field(out, field, u64::from(value));
    }
}

/// Re-encodes a unary header with the string edits of `mutation` merged into
/// `trans_info`. Other fields are copied unchanged.
pub fn merge_trans_info(
    header: &[u8],
    response: bool,
    mutation: &Mutation,
) -> Result<Vec<u8>, ProtocolError> {
    let trans_field = if response { RSP_TRANS_INFO } else { REQ_TRANS_INFO };
    let mut out = Vec::with_capacity(header.len() + mutation.len() * 32);
    let mut reader = FieldReader::new(header);
    while let Some((field, value)) = reader.next_field()? {
        if field == trans_field {
            if let Some(entry) = value.as_bytes() {
                let (key, _) = pb::decode_map_entry(entry)?;
                let replaced = std::str::from_utf8(key)
                    .ok()
                    .and_then(|key| mutation.get(key))
                    .and_then(|value| value.as_str())
                    .is_some();
                if replaced {
                    continue;
                }
            }
        }
        value.write_to(&mut out, field);
    }
    for (key, value) in mutation.string_entries() {
        pb::put_map_entry(&mut out, trans_field, key, value.as_bytes());
    }
    Ok(out)
}

/// Routing fields carried by a stream INIT frame.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamInit {
    pub caller: String,
    pub callee: String,
    pub func: String,
    pub trans_info: Vec<(String, Vec<u8>)>,
}

impl StreamInit {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut init = Self::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            if let (INIT_REQUEST_META, Field::Bytes(meta)) = (field, value) {
                let mut inner = FieldReader::new(meta);
                while let Some((field, value)) = inner.next_field()? {
                    match field {
                        INIT_META_CALLER => init.caller = value.as_string().unwrap_or_default(),
                        INIT_META_CALLEE => init.callee = value.as_string().unwrap_or_default(),
                        INIT_META_FUNC => init.func = value.as_string().unwrap_or_default(),
                        INIT_META_TRANS_INFO => {
                            if let Some(entry) = value.as_bytes() {
                                let (key, value) = pb::decode_map_entry(entry)?;
                                init.trans_info.push((
                                    String::from_utf8_lossy(key).into_owned(),
                                    value.to_vec(),
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(init)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut meta = Vec::new();
        pb::put_bytes_field(&mut meta, INIT_META_CALLER, self.caller.as_bytes());
        pb::put_bytes_field(&mut meta, INIT_META_CALLEE, self.callee.as_bytes());
        pb::put_bytes_field(&mut meta, INIT_META_FUNC, self.func.as_bytes());
        for (key, value) in &self.trans_info {
            pb::put_map_entry(&mut meta, INIT_META_TRANS_INFO, key, value);
        }
        let mut out = Vec::with_capacity(meta.len() + 4);
        pb::put_bytes_field(&mut out, INIT_REQUEST_META, &meta);
        out
    }
}

/// Returns `true` when a CLOSE frame meta asks for a reset of both directions.
pub fn is_reset_close(bytes: &[u8]) -> Result<bool, ProtocolError> {
    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        if field == CLOSE_TYPE {
            return Ok(value.as_u64() == Some(CLOSE_TYPE_RESET));
        }
    }
    Ok(false)
}

/// Encodes a CLOSE frame meta.
pub fn encode_close(reset: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if reset {
        pb::put_varint_field(&mut out, CLOSE_TYPE, CLOSE_TYPE_RESET);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UnaryHeader {
        UnaryHeader {
            version: 1,
            request_id: 8,
            timeout: 500,
            caller: "trpc.app.client".to_owned(),
            callee: "trpc.app.greeter".to_owned(),
            func: "/trpc.app.greeter/SayHello".to_owned(),
            trans_info: vec![("traceparent".to_owned(), b"00-abc".to_vec())],
            ..UnaryHeader::default()
        }
    }

    #[test]
    fn request_header_reads_back() {
        let bytes = request().encode_request();
        assert_eq!(UnaryHeader::parse_request(&bytes).unwrap(), request());
    }

    #[test]
    fn response_header_keeps_negative_ret() {
        let header = UnaryHeader {
            request_id: 3,
            ret: -1,
            func_ret: 31,
            error_msg: "boom".to_owned(),
            ..UnaryHeader::default()
        };
        let parsed = UnaryHeader::parse_response(&header.encode_response()).unwrap();
        assert_eq!(parsed.ret, -1);
        assert_eq!(parsed.func_ret, 31);
        assert_eq!(parsed.error_msg, "boom");
        assert_eq!(parsed.request_id, 3);
    }

    #[test]
    fn merge_overrides_existing_trans_info() {
        let mut mutation = Mutation::new();
        mutation.put_string("traceparent", "00-def");
        mutation.put_string("x-env", "prod");
        let merged = merge_trans_info(&request().encode_request(), false, &mutation).unwrap();
        let parsed = UnaryHeader::parse_request(&merged).unwrap();
        assert_eq!(parsed.callee, "trpc.app.greeter");
        assert_eq!(
            parsed.trans_info,
            vec![
                ("traceparent".to_owned(), b"00-def".to_vec()),
                ("x-env".to_owned(), b"prod".to_vec()),
            ]
        );
    }

    #[test]
    fn stream_init_reads_routing_fields() {
        let init = StreamInit {
            caller: "client".to_owned(),
            callee: "trpc.app.chat".to_owned(),
            func: "/trpc.app.chat/Talk".to_owned(),
            trans_info: Vec::new(),
        };
        assert_eq!(StreamInit::parse(&init.encode()).unwrap(), init);
    }

    #[test]
    fn close_type_detection() {
        assert!(is_reset_close(&encode_close(true)).unwrap());
        assert!(!is_reset_close(&encode_close(false)).unwrap());
    }
}
