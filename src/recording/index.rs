//! Sparse recording index: a periodic mapping from message number and
//! timestamp to file offset, enabling seek-then-scan playback.
//!
//! Layout: `"RIDX"` magic, version (u16), interval (u32), total message
//! count (u64), then `(message_number: u64, file_offset: u64,
//! timestamp: i64)` entries, all little-endian. The count is written as a
//! placeholder and patched when the recorder is disposed.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::{Error, Result};

pub(crate) const INDEX_MAGIC: [u8; 4] = *b"RIDX";
pub(crate) const INDEX_VERSION: u16 = 1;
const INDEX_HEADER_LEN: usize = 18;
const TOTAL_OFFSET: u64 = 10;
const ENTRY_LEN: usize = 24;

pub const DEFAULT_INDEX_INTERVAL: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub message_number: u64,
    pub file_offset: u64,
    pub timestamp: i64,
}

/// Streaming index writer. One entry every `interval` messages, starting
/// with message number zero.
pub(crate) struct IndexWriter<W: Write + Seek> {
    sink: W,
    interval: u32,
    finalized: bool,
}

impl<W: Write + Seek> IndexWriter<W> {
    pub(crate) fn new(mut sink: W, interval: u32) -> Result<Self> {
        let interval = interval.max(1);
        let mut header = [0u8; INDEX_HEADER_LEN];
        header[0..4].copy_from_slice(&INDEX_MAGIC);
        header[4..6].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        header[6..10].copy_from_slice(&interval.to_le_bytes());
        header[10..18].copy_from_slice(&0_u64.to_le_bytes());
        sink.write_all(&header)?;
        Ok(Self {
            sink,
            interval,
            finalized: false,
        })
    }

    pub(crate) fn observe(
        &mut self,
        message_number: u64,
        file_offset: u64,
        timestamp: i64,
    ) -> Result<()> {
        if message_number % self.interval as u64 != 0 {
            return Ok(());
        }
        let mut entry = [0u8; ENTRY_LEN];
        entry[0..8].copy_from_slice(&message_number.to_le_bytes());
        entry[8..16].copy_from_slice(&file_offset.to_le_bytes());
        entry[16..24].copy_from_slice(&timestamp.to_le_bytes());
        self.sink.write_all(&entry)?;
        Ok(())
    }

    /// Patches the placeholder header with the final message count.
    pub(crate) fn finalize(&mut self, total_messages: u64) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.sink.seek(SeekFrom::Start(TOTAL_OFFSET))?;
        self.sink.write_all(&total_messages.to_le_bytes())?;
        self.sink.seek(SeekFrom::End(0))?;
        self.sink.flush()?;
        Ok(())
    }
}

/// A fully loaded index.
#[derive(Debug, Clone)]
pub(crate) struct RecordingIndex {
    pub interval: u32,
    pub total_messages: u64,
    pub entries: Vec<IndexEntry>,
}

impl RecordingIndex {
    pub(crate) fn load<R: Read>(mut reader: R) -> Result<Self> {
        let mut header = [0u8; INDEX_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(|_| Error::CorruptRecording("truncated index header"))?;
        if header[0..4] != INDEX_MAGIC {
            return Err(Error::CorruptRecording("index magic mismatch"));
        }
        let version = u16::from_le_bytes(header[4..6].try_into().expect("slice length"));
        if version != INDEX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let interval = u32::from_le_bytes(header[6..10].try_into().expect("slice length"));
        let total_messages = u64::from_le_bytes(header[10..18].try_into().expect("slice length"));

        let mut entries = Vec::new();
        let mut buf = [0u8; ENTRY_LEN];
        loop {
            match reader.read_exact(&mut buf) {
                Ok(()) => entries.push(IndexEntry {
                    message_number: u64::from_le_bytes(buf[0..8].try_into().expect("slice length")),
                    file_offset: u64::from_le_bytes(buf[8..16].try_into().expect("slice length")),
                    timestamp: i64::from_le_bytes(buf[16..24].try_into().expect("slice length")),
                }),
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Self {
            interval,
            total_messages,
            entries,
        })
    }

    /// Largest entry with `message_number <= target`.
    pub(crate) fn entry_for_message(&self, target: u64) -> Option<IndexEntry> {
        match self
            .entries
            .partition_point(|entry| entry.message_number <= target)
        {
            0 => None,
            n => Some(self.entries[n - 1]),
        }
    }

    /// Largest entry with `timestamp <= target`.
    pub(crate) fn entry_for_timestamp(&self, target: i64) -> Option<IndexEntry> {
        match self.entries.partition_point(|entry| entry.timestamp <= target) {
            0 => None,
            n => Some(self.entries[n - 1]),
        }
    }
}
