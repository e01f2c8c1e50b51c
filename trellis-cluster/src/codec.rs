//! Binary codec for load protocol messages.
//!
//! Each message is framed as:
//! - 4 bytes: message length (u32 little-endian, not including this prefix)
//! - 1 byte: message type tag
//! - N bytes: message-specific payload
//!
//! Strings are u32-length-prefixed UTF-8; blobs are u32-length-prefixed
//! bytes; optional fields carry a one-byte presence flag. Compatibility of
//! the format across versions is a non-goal.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use trellis_core::{CacheName, Limits, NodeId, RequestId};

use crate::message::{
    DeployMode, DeploymentDescriptor, LoadRequest, LoadResponse, Message, Topic,
};

/// Maximum encoded message size.
const MAX_MESSAGE_SIZE: u32 = Limits::MAX_REQUEST_BYTES_DEFAULT;

/// Message type tags.
const TAG_LOAD_REQUEST: u8 = 0;
const TAG_LOAD_RESPONSE: u8 = 1;

/// Topic tags.
const TAG_TOPIC_LOAD: u8 = 0;
const TAG_TOPIC_LOAD_REPLY: u8 = 1;

/// Deploy mode tags.
const TAG_DEPLOY_PRIVATE: u8 = 0;
const TAG_DEPLOY_ISOLATED: u8 = 1;
const TAG_DEPLOY_SHARED: u8 = 2;
const TAG_DEPLOY_CONTINUOUS: u8 = 3;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// Unknown message type tag.
    #[error("unknown message type: {tag}")]
    UnknownMessageType {
        /// The unknown tag value.
        tag: u8,
    },

    /// Unknown tag inside a message field.
    #[error("unknown {field} tag: {tag}")]
    UnknownFieldTag {
        /// Which field carried the tag.
        field: &'static str,
        /// The unknown tag value.
        tag: u8,
    },

    /// Insufficient data to decode a message.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// Which field was malformed.
        field: &'static str,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a message with its length prefix.
///
/// # Errors
/// Returns [`CodecError::MessageTooLarge`] if the encoded form exceeds the
/// wire limit.
pub fn encode_message(message: &Message) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);

    // Reserve space for the length prefix (filled in at the end).
    buf.put_u32_le(0);

    match message {
        Message::LoadRequest(req) => {
            buf.put_u8(TAG_LOAD_REQUEST);
            encode_load_request(&mut buf, req);
        }
        Message::LoadResponse(resp) => {
            buf.put_u8(TAG_LOAD_RESPONSE);
            encode_load_response(&mut buf, resp);
        }
    }

    finish_frame(buf)
}

/// Decodes one length-prefixed message.
///
/// # Errors
/// Returns an error on truncated input, unknown tags, or malformed fields.
pub fn decode_message(buf: &mut impl Buf) -> CodecResult<Message> {
    need(buf, 4)?;
    let len = buf.get_u32_le();

    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    need(buf, len as usize)?;

    let mut frame = buf.copy_to_bytes(len as usize);

    need(&mut frame, 1)?;
    let tag = frame.get_u8();

    match tag {
        TAG_LOAD_REQUEST => Ok(Message::LoadRequest(decode_load_request(&mut frame)?)),
        TAG_LOAD_RESPONSE => Ok(Message::LoadResponse(decode_load_response(&mut frame)?)),
        tag => Err(CodecError::UnknownMessageType { tag }),
    }
}

fn finish_frame(mut buf: BytesMut) -> CodecResult<Bytes> {
    let payload_len = buf.len() - 4;

    u32::try_from(payload_len)
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(CodecError::MessageTooLarge {
            size: u32::try_from(payload_len).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        })?;

    // Safe cast: checked against MAX_MESSAGE_SIZE above.
    #[allow(clippy::cast_possible_truncation)]
    let len = payload_len as u32;
    buf[..4].copy_from_slice(&len.to_le_bytes());

    Ok(buf.freeze())
}

fn need(buf: &impl Buf, bytes: usize) -> CodecResult<()> {
    if buf.remaining() < bytes {
        return Err(CodecError::InsufficientData {
            need: bytes,
            have: buf.remaining(),
        });
    }

    Ok(())
}

fn encode_load_request(buf: &mut BytesMut, req: &LoadRequest) {
    buf.put_u64_le(req.req_id.get());
    encode_topic(buf, req.response_topic);
    put_str(buf, req.cache_name.as_str());
    put_blob(buf, &req.updater_blob);
    put_blob(buf, &req.entries_blob);
    buf.put_u8(u8::from(req.skip_store));

    match &req.deployment {
        None => buf.put_u8(0),
        Some(dep) => {
            buf.put_u8(1);
            encode_deployment(buf, dep);
        }
    }
}

fn decode_load_request(buf: &mut impl Buf) -> CodecResult<LoadRequest> {
    need(buf, 8)?;
    let req_id = RequestId::new(buf.get_u64_le());
    let response_topic = decode_topic(buf)?;
    let cache_name = CacheName::new(get_str(buf, "cache_name")?);
    let updater_blob = get_blob(buf)?;
    let entries_blob = get_blob(buf)?;

    need(buf, 2)?;
    let skip_store = buf.get_u8() != 0;
    let deployment = match buf.get_u8() {
        0 => None,
        _ => Some(decode_deployment(buf)?),
    };

    Ok(LoadRequest {
        req_id,
        response_topic,
        cache_name,
        updater_blob,
        entries_blob,
        skip_store,
        deployment,
    })
}

fn encode_load_response(buf: &mut BytesMut, resp: &LoadResponse) {
    buf.put_u64_le(resp.req_id.get());

    match &resp.error_blob {
        None => buf.put_u8(0),
        Some(blob) => {
            buf.put_u8(1);
            put_blob(buf, blob);
        }
    }
}

fn decode_load_response(buf: &mut impl Buf) -> CodecResult<LoadResponse> {
    need(buf, 9)?;
    let req_id = RequestId::new(buf.get_u64_le());
    let error_blob = match buf.get_u8() {
        0 => None,
        _ => Some(get_blob(buf)?),
    };

    Ok(LoadResponse { req_id, error_blob })
}

fn encode_topic(buf: &mut BytesMut, topic: Topic) {
    match topic {
        Topic::Load => buf.put_u8(TAG_TOPIC_LOAD),
        Topic::LoadReply(node) => {
            buf.put_u8(TAG_TOPIC_LOAD_REPLY);
            buf.put_u64_le(node.get());
        }
    }
}

fn decode_topic(buf: &mut impl Buf) -> CodecResult<Topic> {
    need(buf, 1)?;

    match buf.get_u8() {
        TAG_TOPIC_LOAD => Ok(Topic::Load),
        TAG_TOPIC_LOAD_REPLY => {
            need(buf, 8)?;
            Ok(Topic::LoadReply(NodeId::new(buf.get_u64_le())))
        }
        tag => Err(CodecError::UnknownFieldTag {
            field: "topic",
            tag,
        }),
    }
}

fn encode_deployment(buf: &mut BytesMut, dep: &DeploymentDescriptor) {
    let mode = match dep.mode {
        DeployMode::Private => TAG_DEPLOY_PRIVATE,
        DeployMode::Isolated => TAG_DEPLOY_ISOLATED,
        DeployMode::Shared => TAG_DEPLOY_SHARED,
        DeployMode::Continuous => TAG_DEPLOY_CONTINUOUS,
    };

    buf.put_u8(mode);
    put_str(buf, &dep.class_name);
    put_str(buf, &dep.user_version);

    // Safe cast: participant count bounded far below u32::MAX in practice,
    // and the frame-size check rejects oversized messages anyway.
    #[allow(clippy::cast_possible_truncation)]
    let participants = dep.participants.len() as u32;
    buf.put_u32_le(participants);

    for (node, loader_id) in &dep.participants {
        buf.put_u64_le(node.get());
        buf.put_u64_le(*loader_id);
    }

    buf.put_u64_le(dep.class_loader_id);
}

fn decode_deployment(buf: &mut impl Buf) -> CodecResult<DeploymentDescriptor> {
    need(buf, 1)?;
    let mode = match buf.get_u8() {
        TAG_DEPLOY_PRIVATE => DeployMode::Private,
        TAG_DEPLOY_ISOLATED => DeployMode::Isolated,
        TAG_DEPLOY_SHARED => DeployMode::Shared,
        TAG_DEPLOY_CONTINUOUS => DeployMode::Continuous,
        tag => {
            return Err(CodecError::UnknownFieldTag {
                field: "deploy_mode",
                tag,
            })
        }
    };

    let class_name = get_str(buf, "class_name")?;
    let user_version = get_str(buf, "user_version")?;

    need(buf, 4)?;
    let count = buf.get_u32_le() as usize;

    need(buf, count.saturating_mul(16))?;
    let mut participants = Vec::with_capacity(count);

    for _ in 0..count {
        let node = NodeId::new(buf.get_u64_le());
        let loader_id = buf.get_u64_le();
        participants.push((node, loader_id));
    }

    need(buf, 8)?;
    let class_loader_id = buf.get_u64_le();

    Ok(DeploymentDescriptor {
        mode,
        class_name,
        user_version,
        participants,
        class_loader_id,
    })
}

fn put_str(buf: &mut BytesMut, value: &str) {
    // Safe cast: string length bounded by the frame-size check.
    #[allow(clippy::cast_possible_truncation)]
    let len = value.len() as u32;
    buf.put_u32_le(len);
    buf.put_slice(value.as_bytes());
}

fn get_str(buf: &mut impl Buf, field: &'static str) -> CodecResult<String> {
    let bytes = get_blob(buf)?;

    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}

fn put_blob(buf: &mut BytesMut, blob: &Bytes) {
    // Safe cast: blob length bounded by the frame-size check.
    #[allow(clippy::cast_possible_truncation)]
    let len = blob.len() as u32;
    buf.put_u32_le(len);
    buf.put_slice(blob);
}

fn get_blob(buf: &mut impl Buf) -> CodecResult<Bytes> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;

    need(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}
