//! `RpcMeta`, the protobuf header that follows the 12-byte Brpc frame header.

use crate::error::ProtocolError;
use crate::mutation::Mutation;
use crate::pb::{self, Field, FieldReader};

const META_REQUEST: u32 = 1;
const META_RESPONSE: u32 = 2;
const META_COMPRESS_TYPE: u32 = 3;
const META_CORRELATION_ID: u32 = 4;
const META_ATTACHMENT_SIZE: u32 = 5;
const META_USER_FIELDS: u32 = 9;

const REQUEST_SERVICE_NAME: u32 = 1;
const REQUEST_METHOD_NAME: u32 = 2;
const REQUEST_LOG_ID: u32 = 3;

const RESPONSE_ERROR_CODE: u32 = 1;
const RESPONSE_ERROR_TEXT: u32 = 2;

/// Request section of the meta.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequestMeta {
    pub service_name: String,
    pub method_name: String,
    pub log_id: Option<i64>,
}

/// Response section of the meta.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResponseMeta {
    pub error_code: i32,
    pub error_text: String,
}

/// The fields of `RpcMeta` the proxy reads.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RpcMeta {
    pub request: Option<RequestMeta>,
    pub response: Option<ResponseMeta>,
    pub compress_type: i32,
    pub correlation_id: i64,
    pub attachment_size: i32,
    pub user_fields: Vec<(String, String)>,
}

impl RpcMeta {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut meta = Self::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            match (field, value) {
                (META_REQUEST, Field::Bytes(section)) => {
                    meta.request = Some(parse_request(section)?);
                }
                (META_RESPONSE, Field::Bytes(section)) => {
                    meta.response = Some(parse_response(section)?);
                }
                (META_COMPRESS_TYPE, value) => {
                    meta.compress_type = value.as_i32().unwrap_or_default();
                }
                (META_CORRELATION_ID, value) => {
                    meta.correlation_id = value.as_u64().unwrap_or_default() as i64;
                }
                (META_ATTACHMENT_SIZE, value) => {
                    meta.attachment_size = value.as_i32().unwrap_or_default();
                }
                (META_USER_FIELDS, Field::Bytes(entry)) => {
                    let (key, value) = pb::decode_map_entry(entry)?;
                    meta.user_fields.push((
                        String::from_utf8_lossy(key).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    ));
                }
                _ => {}
            }
        }
        Ok(meta)
    }

    /// Encodes an error response meta.
    pub fn encode_error(
        correlation_id: i64,
        compress_type: i32,
        error_code: i32,
        error_text: &str,
    ) -> Vec<u8> {
        let mut response = Vec::with_capacity(error_text.len() + 8);
        pb::put_int32_field(&mut response, RESPONSE_ERROR_CODE, error_code);
        pb::put_bytes_field(&mut response, RESPONSE_ERROR_TEXT, error_text.as_bytes());

        let mut meta = Vec::with_capacity(response.len() + 16);
        pb::put_bytes_field(&mut meta, META_RESPONSE, &response);
        if compress_type != 0 {
            pb::put_int32_field(&mut meta, META_COMPRESS_TYPE, compress_type);
        }
        pb::put_varint_field(&mut meta, META_CORRELATION_ID, correlation_id as u64);
        meta
    }
}

fn parse_request(bytes: &[u8]) -> Result<RequestMeta, ProtocolError> {
    let mut request = RequestMeta::default();
    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            REQUEST_SERVICE_NAME => request.service_name = value.as_string().unwrap_or_default(),
            REQUEST_METHOD_NAME => request.method_name = value.as_string().unwrap_or_default(),
            REQUEST_LOG_ID => request.log_id = value.as_u64().map(|id| id as i64),
            _ => {}
        }
    }
    Ok(request)
}

fn parse_response(bytes: &[u8]) -> Result<ResponseMeta, ProtocolError> {
    let mut response = ResponseMeta::default();
    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            RESPONSE_ERROR_CODE => response.error_code = value.as_i32().unwrap_or_default(),
            RESPONSE_ERROR_TEXT => response.error_text = value.as_string().unwrap_or_default(),
            _ => {}
        }
    }
    Ok(response)
}

/// Re-encodes `meta` with the string edits of `mutation` written into `user_fields`.
///
/// Every other field is copied unchanged; user fields whose key is overridden
/// are dropped before the new entries are appended.
pub fn merge_user_fields(meta: &[u8], mutation: &Mutation) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(meta.len() + mutation.len() * 32);
    let mut reader = FieldReader::new(meta);
    while let Some((field, value)) = reader.next_field()? {
        if let (META_USER_FIELDS, Field::Bytes(entry)) = (field, value) {
            let (key, _) = pb::decode_map_entry(entry)?;
            let overridden = std::str::from_utf8(key)
                .ok()
                .is_some_and(|key| mutation.get(key).and_then(|v| v.as_str()).is_some());
            if overridden {
                continue;
            }
        }
        value.write_to(&mut out, field);
    }
    for (key, value) in mutation.string_entries() {
        pb::put_map_entry(&mut out, META_USER_FIELDS, key, value.as_bytes());
    }
    Ok(out)
}
