//! Marshalling of opaque request payloads.
//!
//! Entry batches, updater descriptors, and response errors travel as
//! opaque blobs inside [`trellis_cluster::LoadRequest`] and
//! [`trellis_cluster::LoadResponse`]. This module is the loader's
//! marshaller: the transport layer never interprets these bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use trellis_core::{Entry, Limits};

use crate::error::LoadError;
use crate::updater::Updater;

/// Updater descriptor tags.
const TAG_UPDATER_INDIVIDUAL: u8 = 0;
const TAG_UPDATER_BATCHED: u8 = 1;

/// Marshals a batch of entries.
#[must_use]
pub fn marshal_entries(entries: &[Entry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + entries.iter().map(Entry::size).sum::<usize>());

    // Safe cast: entry counts are bounded by the request-size limit.
    #[allow(clippy::cast_possible_truncation)]
    let count = entries.len() as u32;
    buf.put_u32_le(count);

    for entry in entries {
        put_chunk(&mut buf, &entry.key);

        match &entry.value {
            Some(value) => {
                buf.put_u8(1);
                put_chunk(&mut buf, value);
            }
            None => buf.put_u8(0),
        }
    }

    buf.freeze()
}

/// Unmarshals a batch of entries.
///
/// # Errors
/// Returns [`LoadError::MarshalError`] on truncated or malformed input.
pub fn unmarshal_entries(blob: &Bytes) -> Result<Vec<Entry>, LoadError> {
    let mut buf = blob.clone();

    if buf.remaining() < 4 {
        return Err(malformed("entry batch missing count"));
    }
    let count = buf.get_u32_le();

    if count > Limits::MAX_ENTRIES_PER_REQUEST_DEFAULT {
        return Err(malformed(format!("entry batch too large: {count}")));
    }
    let count = count as usize;

    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        let key = get_chunk(&mut buf).ok_or_else(|| malformed("truncated entry key"))?;

        if buf.remaining() < 1 {
            return Err(malformed("truncated entry value flag"));
        }

        let value = match buf.get_u8() {
            0 => None,
            _ => Some(get_chunk(&mut buf).ok_or_else(|| malformed("truncated entry value"))?),
        };

        entries.push(Entry { key, value });
    }

    Ok(entries)
}

/// Marshals an updater descriptor.
#[must_use]
pub fn marshal_updater(updater: Updater) -> Bytes {
    let tag = match updater {
        Updater::Individual => TAG_UPDATER_INDIVIDUAL,
        Updater::Batched => TAG_UPDATER_BATCHED,
    };

    Bytes::copy_from_slice(&[tag])
}

/// Unmarshals an updater descriptor.
///
/// # Errors
/// Returns [`LoadError::MarshalError`] on an empty or unknown descriptor.
pub fn unmarshal_updater(blob: &Bytes) -> Result<Updater, LoadError> {
    match blob.first() {
        Some(&TAG_UPDATER_INDIVIDUAL) => Ok(Updater::Individual),
        Some(&TAG_UPDATER_BATCHED) => Ok(Updater::Batched),
        Some(tag) => Err(malformed(format!("unknown updater descriptor {tag}"))),
        None => Err(malformed("empty updater descriptor")),
    }
}

/// Marshals an updater failure for the response error blob.
#[must_use]
pub fn marshal_error(message: &str) -> Bytes {
    Bytes::copy_from_slice(message.as_bytes())
}

/// Unmarshals a response error blob.
///
/// # Errors
/// Returns [`LoadError::MarshalError`] when the blob is not valid UTF-8.
pub fn unmarshal_error(blob: &Bytes) -> Result<String, LoadError> {
    String::from_utf8(blob.to_vec()).map_err(|_| malformed("error blob is not UTF-8"))
}

fn malformed(message: impl Into<String>) -> LoadError {
    LoadError::MarshalError {
        message: message.into(),
    }
}

fn put_chunk(buf: &mut BytesMut, chunk: &Bytes) {
    // Safe cast: chunk sizes are bounded by the request-size limit.
    #[allow(clippy::cast_possible_truncation)]
    let len = chunk.len() as u32;
    buf.put_u32_le(len);
    buf.put_slice(chunk);
}

fn get_chunk(buf: &mut Bytes) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;

    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_round_trip() {
        let entries = vec![
            Entry::put("k1", "v1"),
            Entry::remove("k2"),
            Entry::put("", "empty-key-still-encodes"),
        ];

        let blob = marshal_entries(&entries);
        let decoded = unmarshal_entries(&blob).expect("unmarshal");

        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_truncated_entries_are_rejected() {
        let blob = marshal_entries(&[Entry::put("key", "value")]);
        let truncated = blob.slice(..blob.len() - 2);

        let err = unmarshal_entries(&truncated).expect_err("truncated");
        assert!(matches!(err, LoadError::MarshalError { .. }));
    }

    #[test]
    fn test_updater_round_trip() {
        for updater in [Updater::Individual, Updater::Batched] {
            let blob = marshal_updater(updater);
            assert_eq!(unmarshal_updater(&blob).expect("unmarshal"), updater);
        }
    }

    #[test]
    fn test_unknown_updater_is_rejected() {
        let err = unmarshal_updater(&Bytes::from_static(&[9])).expect_err("unknown");
        assert!(matches!(err, LoadError::MarshalError { .. }));
    }

    #[test]
    fn test_error_blob_round_trip() {
        let blob = marshal_error("updater exploded");
        assert_eq!(unmarshal_error(&blob).expect("unmarshal"), "updater exploded");
    }
}
