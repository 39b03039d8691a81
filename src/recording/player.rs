//! Framed playback: a lazy envelope sequence with optional pacing and
//! index-assisted seeks.

use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, QuantaClock};
use crate::message::Message;
use crate::recording::format::{self, RawFrame};
use crate::recording::index::RecordingIndex;
use crate::recording::serializer::BodySerializer;
use crate::{Error, Result};

/// How the sequence is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMode {
    #[default]
    AsFastAsPossible,
    /// Sleep the delta of consecutive envelope timestamps, skipping
    /// non-positive deltas.
    RespectOriginalMessageIntervals,
}

/// Cancels a running playback at the next frame boundary.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct FrameCursor<R: Read> {
    reader: R,
    stopped: Arc<AtomicBool>,
    done: bool,
}

impl<R: Read> FrameCursor<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            stopped: Arc::new(AtomicBool::new(false)),
            done: false,
        }
    }

    fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        if self.done || self.stopped.load(Ordering::Acquire) {
            return None;
        }
        match format::read_frame(&mut self.reader) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn assemble<T, S: BodySerializer<T>>(
    frame: RawFrame,
    serializer: &S,
    clock: &QuantaClock,
) -> Result<Message<T>> {
    let decode_str = |bytes: Option<Vec<u8>>| -> Result<Option<Arc<str>>> {
        match bytes {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(|s| Some(Arc::from(s.as_str())))
                .map_err(|_| Error::CorruptRecording("non-utf8 string field")),
        }
    };
    Ok(Message {
        id: frame.id,
        timestamp: frame.timestamp,
        // Re-stamped at the replay moment so downstream latency stats
        // stay meaningful.
        inception: clock.steady_ns(),
        correlation_id: frame.correlation_id,
        key: decode_str(frame.key)?,
        from: decode_str(frame.from)?,
        tag_a: frame.tag_a,
        body: serializer.deserialize(&frame.body)?,
    })
}

fn pace(mode: ReplayMode, last_timestamp: &mut Option<i64>, timestamp: i64) {
    if mode == ReplayMode::RespectOriginalMessageIntervals {
        if let Some(last) = *last_timestamp {
            let delta = timestamp - last;
            if delta > 0 {
                std::thread::sleep(Duration::from_nanos(delta as u64));
            }
        }
    }
    *last_timestamp = Some(timestamp);
}

/// Lazy sequence of envelopes decoded from a framed input.
///
/// Iteration yields `Err` once for a corrupt frame and then ends.
pub struct Player<T, R: Read, S: BodySerializer<T>> {
    cursor: FrameCursor<R>,
    serializer: S,
    mode: ReplayMode,
    clock: QuantaClock,
    last_timestamp: Option<i64>,
    _body: PhantomData<fn() -> T>,
}

impl<T, R: Read, S: BodySerializer<T>> Player<T, R, S> {
    pub fn new(reader: R, serializer: S) -> Self {
        Self::with_mode(reader, serializer, ReplayMode::default())
    }

    pub fn with_mode(reader: R, serializer: S, mode: ReplayMode) -> Self {
        Self {
            cursor: FrameCursor::new(reader),
            serializer,
            mode,
            clock: QuantaClock::new(),
            last_timestamp: None,
            _body: PhantomData,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.cursor.stopped))
    }
}

impl<T, R: Read, S: BodySerializer<T>> Iterator for Player<T, R, S> {
    type Item = Result<Message<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.cursor.next_frame()? {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        pace(self.mode, &mut self.last_timestamp, frame.timestamp);
        Some(assemble(frame, &self.serializer, &self.clock))
    }
}

/// Playback over a seekable input with a sparse index.
pub struct IndexedPlayer<T, R: Read + Seek, S: BodySerializer<T>> {
    cursor: FrameCursor<R>,
    serializer: S,
    mode: ReplayMode,
    clock: QuantaClock,
    last_timestamp: Option<i64>,
    index: RecordingIndex,
    /// Message number the cursor will read next.
    position: u64,
    pending: Option<RawFrame>,
    _body: PhantomData<fn() -> T>,
}

impl<T, R: Read + Seek, S: BodySerializer<T>> IndexedPlayer<T, R, S> {
    pub fn new(reader: R, index_reader: impl Read, serializer: S) -> Result<Self> {
        Self::with_mode(reader, index_reader, serializer, ReplayMode::default())
    }

    pub fn with_mode(
        reader: R,
        index_reader: impl Read,
        serializer: S,
        mode: ReplayMode,
    ) -> Result<Self> {
        let index = RecordingIndex::load(index_reader)?;
        Ok(Self {
            cursor: FrameCursor::new(reader),
            serializer,
            mode,
            clock: QuantaClock::new(),
            last_timestamp: None,
            index,
            position: 0,
            pending: None,
            _body: PhantomData,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.cursor.stopped))
    }

    /// Total messages from the finalised index header.
    pub fn total_messages(&self) -> u64 {
        self.index.total_messages
    }

    fn restart_at(&mut self, offset: u64, message_number: u64) -> Result<()> {
        self.cursor.reader.seek(SeekFrom::Start(offset))?;
        self.cursor.done = false;
        self.pending = None;
        self.position = message_number;
        self.last_timestamp = None;
        Ok(())
    }

    /// Positions playback so the next envelope is message `target`
    /// (zero-based): the largest index entry at or before the target,
    /// then a forward decode.
    pub fn seek_to_message(&mut self, target: u64) -> Result<()> {
        let (offset, number) = match self.index.entry_for_message(target) {
            Some(entry) => (entry.file_offset, entry.message_number),
            None => (0, 0),
        };
        self.restart_at(offset, number)?;
        while self.position < target {
            match self.cursor.next_frame() {
                Some(Ok(_)) => self.position += 1,
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        Ok(())
    }

    /// Positions playback so the next envelope is the first one whose
    /// timestamp is at or past `target`.
    pub fn seek_to_timestamp(&mut self, target: i64) -> Result<()> {
        let (offset, number) = match self.index.entry_for_timestamp(target) {
            Some(entry) => (entry.file_offset, entry.message_number),
            None => (0, 0),
        };
        self.restart_at(offset, number)?;
        loop {
            match self.cursor.next_frame() {
                Some(Ok(frame)) => {
                    if frame.timestamp >= target {
                        self.pending = Some(frame);
                        return Ok(());
                    }
                    self.position += 1;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            }
        }
    }
}

impl<T, R: Read + Seek, S: BodySerializer<T>> Iterator for IndexedPlayer<T, R, S> {
    type Item = Result<Message<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => match self.cursor.next_frame()? {
                Ok(frame) => frame,
                Err(err) => return Some(Err(err)),
            },
        };
        self.position += 1;
        pace(self.mode, &mut self.last_timestamp, frame.timestamp);
        Some(assemble(frame, &self.serializer, &self.clock))
    }
}
