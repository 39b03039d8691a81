//! Offline transformations over recording streams. Pure functions of
//! their inputs; every output uses the same frame format the recorder
//! writes.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;
use crate::recording::format::{self, RawFrame};
use crate::recording::metadata::RecordingMetadata;
use crate::recording::serializer::BodySerializer;
use crate::{Error, Result};

/// What to do with frames sharing an envelope id during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateIdPolicy {
    KeepFirst,
    KeepLast,
    KeepAll,
}

/// Chunk boundary rule for [`split`].
#[derive(Debug, Clone, Copy)]
pub enum SplitBy {
    MessageCount(u64),
    /// Envelope-timestamp span per chunk.
    Duration(Duration),
    ByteBudget(u64),
}

/// K-way merges recordings by envelope timestamp (ties resolve to the
/// lower input index). Returns the number of frames written.
pub fn merge<R, W>(
    mut inputs: Vec<R>,
    output: &mut W,
    policy: DuplicateIdPolicy,
) -> Result<u64>
where
    R: Read + Seek,
    W: Write,
{
    // KeepLast needs to know, at every duplicate, whether a later
    // occurrence exists; a counting pre-pass answers that.
    let mut remaining: HashMap<u64, u64> = HashMap::new();
    if policy == DuplicateIdPolicy::KeepLast {
        for input in &mut inputs {
            input.seek(SeekFrom::Start(0))?;
            while let Some(frame) = format::read_frame(input)? {
                *remaining.entry(frame.id).or_insert(0) += 1;
            }
            input.seek(SeekFrom::Start(0))?;
        }
    }

    let mut pending: Vec<Option<RawFrame>> = Vec::with_capacity(inputs.len());
    for input in &mut inputs {
        pending.push(format::read_frame(input)?);
    }

    let mut seen: HashSet<u64> = HashSet::new();
    let mut scratch = Vec::new();
    let mut written = 0_u64;
    loop {
        let mut best: Option<(usize, i64)> = None;
        for (index, slot) in pending.iter().enumerate() {
            let Some(frame) = slot.as_ref() else {
                continue;
            };
            match best {
                None => best = Some((index, frame.timestamp)),
                Some((_, best_timestamp)) if frame.timestamp < best_timestamp => {
                    best = Some((index, frame.timestamp));
                }
                Some(_) => {}
            }
        }
        let Some((source, _)) = best else {
            return Ok(written);
        };
        let frame = pending[source]
            .take()
            .ok_or(Error::CorruptRecording("pending frame missing"))?;
        pending[source] = format::read_frame(&mut inputs[source])?;

        let keep = match policy {
            DuplicateIdPolicy::KeepAll => true,
            DuplicateIdPolicy::KeepFirst => seen.insert(frame.id),
            DuplicateIdPolicy::KeepLast => {
                let count = remaining
                    .get_mut(&frame.id)
                    .ok_or(Error::CorruptRecording("unseen id in merge pass"))?;
                *count -= 1;
                *count == 0
            }
        };
        if keep {
            format::encode_frame(&frame, &mut scratch);
            output.write_all(&scratch)?;
            written += 1;
        }
    }
}

/// Splits a recording into chunks, opening each chunk sink through
/// `open_chunk`. Returns one metadata document per emitted chunk, derived
/// from `template` with chunk bookkeeping added under `custom`.
pub fn split<R, W, F>(
    mut input: R,
    by: SplitBy,
    mut open_chunk: F,
    template: &RecordingMetadata,
) -> Result<Vec<RecordingMetadata>>
where
    R: Read,
    W: Write,
    F: FnMut(usize) -> Result<W>,
{
    struct Chunk<W: Write> {
        sink: W,
        messages: u64,
        bytes: u64,
        first_timestamp: i64,
        last_timestamp: i64,
    }

    let mut chunks: Vec<RecordingMetadata> = Vec::new();
    let mut current: Option<Chunk<W>> = None;
    let mut scratch = Vec::new();

    let mut finish = |chunk: Chunk<W>, chunks: &mut Vec<RecordingMetadata>| {
        let mut metadata = template.clone();
        metadata.custom.insert("chunk".into(), chunks.len().into());
        metadata
            .custom
            .insert("messages".into(), chunk.messages.into());
        metadata
            .custom
            .insert("firstTimestamp".into(), chunk.first_timestamp.into());
        metadata
            .custom
            .insert("lastTimestamp".into(), chunk.last_timestamp.into());
        chunks.push(metadata);
    };

    while let Some(frame) = format::read_frame(&mut input)? {
        let frame_bytes = frame.encoded_len;
        format::encode_frame(&frame, &mut scratch);

        if let Some(chunk) = current.as_ref() {
            let boundary = match by {
                SplitBy::MessageCount(limit) => chunk.messages >= limit,
                SplitBy::Duration(span) => {
                    frame.timestamp - chunk.first_timestamp >= span.as_nanos() as i64
                }
                SplitBy::ByteBudget(budget) => chunk.bytes + frame_bytes > budget,
            };
            if boundary {
                let chunk = current.take().expect("chunk present");
                finish(chunk, &mut chunks);
            }
        }

        if current.is_none() {
            let sink = open_chunk(chunks.len())?;
            current = Some(Chunk {
                sink,
                messages: 0,
                bytes: 0,
                first_timestamp: frame.timestamp,
                last_timestamp: frame.timestamp,
            });
        }
        let chunk = current.as_mut().expect("chunk present");
        chunk.sink.write_all(&scratch)?;
        chunk.messages += 1;
        chunk.bytes += frame_bytes;
        chunk.last_timestamp = frame.timestamp;
    }

    if let Some(chunk) = current.take() {
        finish(chunk, &mut chunks);
    }
    Ok(chunks)
}

/// Copies frames whose decoded envelope passes `predicate`, bit-exactly.
/// Returns the number of frames kept.
pub fn filter<T, R, W, S, P>(
    mut input: R,
    output: &mut W,
    serializer: &S,
    predicate: P,
) -> Result<u64>
where
    R: Read,
    W: Write,
    S: BodySerializer<T>,
    P: Fn(&Message<T>) -> bool,
{
    let mut scratch = Vec::new();
    let mut kept = 0_u64;
    while let Some(frame) = format::read_frame(&mut input)? {
        let message = decode_envelope(&frame, serializer)?;
        if predicate(&message) {
            format::encode_frame(&frame, &mut scratch);
            output.write_all(&scratch)?;
            kept += 1;
        }
    }
    Ok(kept)
}

/// Re-encodes every body with a different serializer, stamping its
/// version into the rewritten frames. Returns the number of frames
/// converted.
pub fn convert<T, R, W, S1, S2>(
    mut input: R,
    output: &mut W,
    decode_with: &S1,
    encode_with: &S2,
) -> Result<u64>
where
    R: Read,
    W: Write,
    S1: BodySerializer<T>,
    S2: BodySerializer<T>,
{
    let mut scratch = Vec::new();
    let mut body = Vec::new();
    let mut converted = 0_u64;
    while let Some(mut frame) = format::read_frame(&mut input)? {
        let value = decode_with.deserialize(&frame.body)?;
        body.clear();
        encode_with.serialize(&value, &mut body);
        frame.body.clear();
        frame.body.extend_from_slice(&body);
        frame.serializer = encode_with.version();
        format::encode_frame(&frame, &mut scratch);
        output.write_all(&scratch)?;
        converted += 1;
    }
    Ok(converted)
}

/// Decodes a frame into an envelope without re-stamping `inception`;
/// offline predicates see the recorded values.
fn decode_envelope<T, S: BodySerializer<T>>(frame: &RawFrame, serializer: &S) -> Result<Message<T>> {
    let decode_str = |bytes: Option<&Vec<u8>>| -> Result<Option<Arc<str>>> {
        match bytes {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(|s| Some(Arc::from(s)))
                .map_err(|_| Error::CorruptRecording("non-utf8 string field")),
        }
    };
    Ok(Message {
        id: frame.id,
        timestamp: frame.timestamp,
        inception: frame.inception,
        correlation_id: frame.correlation_id,
        key: decode_str(frame.key.as_ref())?,
        from: decode_str(frame.from.as_ref())?,
        tag_a: frame.tag_a,
        body: serializer.deserialize(&frame.body)?,
    })
}
