//! Recording frame wire format.
//!
//! ```text
//! +--------+---------+---------+-------------+-------------------+--------+
//! | magic  | version | flags   | header-size | fixed header (LE) | suffix |
//! | 4 B    | 2 B     | 2 B     | 2 B         | 52 B              | 4 B    |
//! +--------+---------+---------+-------------+-------------------+--------+
//!              followed by, in order, length-prefixed key, from, body
//! ```
//!
//! All integers little-endian. Variable-field lengths appear both in the
//! fixed header and as a 4-byte prefix before each field; `-1` encodes
//! null, `0` empty. The suffix is a fixed sentinel validating the frame
//! boundary.

use std::io::Read;

use crate::recording::serializer::SerializerVersion;
use crate::{Error, Result};

pub(crate) const FRAME_MAGIC: [u8; 4] = *b"CBRF";
pub(crate) const FRAME_SUFFIX: [u8; 4] = *b"FEND";
pub(crate) const FRAME_VERSION: u16 = 1;
pub(crate) const FIXED_HEADER_LEN: u16 = 52;
const PRELUDE_LEN: usize = 10;

/// One decoded frame, body still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawFrame {
    pub id: u64,
    pub timestamp: i64,
    pub correlation_id: i64,
    pub inception: i64,
    pub tag_a: i64,
    pub key: Option<Vec<u8>>,
    pub from: Option<Vec<u8>>,
    pub body: Vec<u8>,
    pub serializer: SerializerVersion,
    /// Total encoded size, including prelude and suffix.
    pub encoded_len: u64,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_into(
    scratch: &mut Vec<u8>,
    id: u64,
    timestamp: i64,
    correlation_id: i64,
    inception: i64,
    tag_a: i64,
    key: Option<&[u8]>,
    from: Option<&[u8]>,
    body: &[u8],
    serializer: SerializerVersion,
) {
    scratch.clear();
    scratch.extend_from_slice(&FRAME_MAGIC);
    scratch.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    // Serializer major rides in the low byte of flags, minor in the high.
    let flags = u16::from_le_bytes([serializer.major, serializer.minor]);
    scratch.extend_from_slice(&flags.to_le_bytes());
    scratch.extend_from_slice(&FIXED_HEADER_LEN.to_le_bytes());

    scratch.extend_from_slice(&id.to_le_bytes());
    scratch.extend_from_slice(&timestamp.to_le_bytes());
    scratch.extend_from_slice(&correlation_id.to_le_bytes());
    scratch.extend_from_slice(&inception.to_le_bytes());
    scratch.extend_from_slice(&tag_a.to_le_bytes());
    scratch.extend_from_slice(&field_len(key).to_le_bytes());
    scratch.extend_from_slice(&field_len(from).to_le_bytes());
    scratch.extend_from_slice(&(body.len() as i32).to_le_bytes());

    write_field(scratch, key);
    write_field(scratch, from);
    write_field(scratch, Some(body));
    scratch.extend_from_slice(&FRAME_SUFFIX);
}

pub(crate) fn encode_frame(frame: &RawFrame, scratch: &mut Vec<u8>) {
    encode_into(
        scratch,
        frame.id,
        frame.timestamp,
        frame.correlation_id,
        frame.inception,
        frame.tag_a,
        frame.key.as_deref(),
        frame.from.as_deref(),
        &frame.body,
        frame.serializer,
    );
}

fn field_len(field: Option<&[u8]>) -> i32 {
    field.map_or(-1, |bytes| bytes.len() as i32)
}

fn write_field(scratch: &mut Vec<u8>, field: Option<&[u8]>) {
    match field {
        None => scratch.extend_from_slice(&(-1_i32).to_le_bytes()),
        Some(bytes) => {
            scratch.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            scratch.extend_from_slice(bytes);
        }
    }
}

/// Reads the next frame. `Ok(None)` on a clean end of stream; anything
/// short of a full, sentinel-terminated frame is corrupt.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Option<RawFrame>> {
    let mut prelude = [0u8; PRELUDE_LEN];
    if !fill(reader, &mut prelude)? {
        return Ok(None);
    }
    if prelude[0..4] != FRAME_MAGIC {
        return Err(Error::CorruptRecording("frame magic mismatch"));
    }
    let version = u16::from_le_bytes(prelude[4..6].try_into().expect("slice length"));
    if version != FRAME_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let flags = u16::from_le_bytes(prelude[6..8].try_into().expect("slice length"));
    let [major, minor] = flags.to_le_bytes();
    let header_size = u16::from_le_bytes(prelude[8..10].try_into().expect("slice length"));
    if header_size != FIXED_HEADER_LEN {
        return Err(Error::CorruptRecording("unexpected fixed header size"));
    }

    let mut header = [0u8; FIXED_HEADER_LEN as usize];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::CorruptRecording("truncated fixed header"))?;
    let id = u64::from_le_bytes(header[0..8].try_into().expect("slice length"));
    let timestamp = i64::from_le_bytes(header[8..16].try_into().expect("slice length"));
    let correlation_id = i64::from_le_bytes(header[16..24].try_into().expect("slice length"));
    let inception = i64::from_le_bytes(header[24..32].try_into().expect("slice length"));
    let tag_a = i64::from_le_bytes(header[32..40].try_into().expect("slice length"));
    let key_len = i32::from_le_bytes(header[40..44].try_into().expect("slice length"));
    let from_len = i32::from_le_bytes(header[44..48].try_into().expect("slice length"));
    let body_len = i32::from_le_bytes(header[48..52].try_into().expect("slice length"));
    if body_len < 0 {
        return Err(Error::CorruptRecording("negative body length"));
    }

    let key = read_field(reader, key_len)?;
    let from = read_field(reader, from_len)?;
    let body = read_field(reader, body_len)?
        .ok_or(Error::CorruptRecording("null body"))?;

    let mut suffix = [0u8; 4];
    reader
        .read_exact(&mut suffix)
        .map_err(|_| Error::CorruptRecording("truncated frame suffix"))?;
    if suffix != FRAME_SUFFIX {
        return Err(Error::CorruptRecording("frame suffix mismatch"));
    }

    let variable = |len: i32| if len < 0 { 4 } else { 4 + len as u64 };
    let encoded_len = PRELUDE_LEN as u64
        + FIXED_HEADER_LEN as u64
        + variable(key_len)
        + variable(from_len)
        + variable(body_len)
        + 4;

    Ok(Some(RawFrame {
        id,
        timestamp,
        correlation_id,
        inception,
        tag_a,
        key,
        from,
        body,
        serializer: SerializerVersion { major, minor },
        encoded_len,
    }))
}

fn read_field<R: Read>(reader: &mut R, header_len: i32) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    reader
        .read_exact(&mut prefix)
        .map_err(|_| Error::CorruptRecording("truncated field prefix"))?;
    let len = i32::from_le_bytes(prefix);
    if len != header_len {
        return Err(Error::CorruptRecording("field prefix disagrees with header"));
    }
    match len {
        -1 => Ok(None),
        len if len < 0 => Err(Error::CorruptRecording("negative field length")),
        len => {
            let mut bytes = vec![0u8; len as usize];
            reader
                .read_exact(&mut bytes)
                .map_err(|_| Error::CorruptRecording("truncated field body"))?;
            Ok(Some(bytes))
        }
    }
}

/// Fills `buf` completely, or reports a clean end of stream when the very
/// first read returns no bytes.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::CorruptRecording("truncated frame prelude"));
        }
        filled += read;
    }
    Ok(true)
}
