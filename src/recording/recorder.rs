//! Subscription-backed capture of a channel to a framed byte sink.

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SubscribeOptions;
use crate::hub::CrossBar;
use crate::message::Message;
use crate::recording::format;
use crate::recording::index::{IndexWriter, DEFAULT_INDEX_INTERVAL};
use crate::recording::serializer::BodySerializer;
use crate::stats::Stats;
use crate::subscription::Subscription;
use crate::{Error, Result};

/// Sink requirements for the sparse index: seekable (the placeholder
/// header is patched on dispose), readable and writable.
pub trait IndexSink: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> IndexSink for T {}

struct RecorderState<W: Write> {
    sink: Option<W>,
    index: Option<IndexWriter<Box<dyn IndexSink>>>,
    /// Frame assembly buffer, reused across messages.
    scratch: Vec<u8>,
    /// Serialized body buffer, reused across messages.
    body: Vec<u8>,
    offset: u64,
    count: u64,
    closed: bool,
}

impl<W: Write> RecorderState<W> {
    fn record<T, S: BodySerializer<T>>(
        &mut self,
        serializer: &S,
        message: &Message<T>,
    ) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        self.body.clear();
        serializer.serialize(&message.body, &mut self.body);
        format::encode_into(
            &mut self.scratch,
            message.id,
            message.timestamp,
            message.correlation_id,
            message.inception,
            message.tag_a,
            message.key().map(str::as_bytes),
            message.from().map(str::as_bytes),
            &self.body,
            serializer.version(),
        );
        if let Some(index) = self.index.as_mut() {
            index.observe(self.count, self.offset, message.timestamp)?;
        }
        sink.write_all(&self.scratch)?;
        self.offset += self.scratch.len() as u64;
        self.count += 1;
        Ok(())
    }
}

/// A recording in progress: a subscription whose handler frames each
/// envelope into the sink. Sink write time is part of the recording's
/// service-time metric.
pub struct Recorder<W: Write + Send + 'static> {
    subscription: Subscription,
    state: Arc<Mutex<RecorderState<W>>>,
    channel: String,
}

impl<W: Write + Send + 'static> Recorder<W> {
    /// Starts recording `channel` (a literal name or wildcard pattern)
    /// into `sink`.
    pub fn start<T, S>(bus: &CrossBar, channel: &str, serializer: S, sink: W) -> Result<Self>
    where
        T: Clone + Send + Sync + 'static,
        S: BodySerializer<T>,
    {
        Self::spawn(bus, channel, serializer, sink, None)
    }

    /// Starts recording with a sparse index appended to `index_sink`
    /// every `interval` messages ([`DEFAULT_INDEX_INTERVAL`] when zero).
    pub fn start_with_index<T, S>(
        bus: &CrossBar,
        channel: &str,
        serializer: S,
        sink: W,
        index_sink: impl IndexSink + 'static,
        interval: u32,
    ) -> Result<Self>
    where
        T: Clone + Send + Sync + 'static,
        S: BodySerializer<T>,
    {
        let interval = if interval == 0 {
            DEFAULT_INDEX_INTERVAL
        } else {
            interval
        };
        let index = IndexWriter::new(Box::new(index_sink) as Box<dyn IndexSink>, interval)?;
        Self::spawn(bus, channel, serializer, sink, Some(index))
    }

    fn spawn<T, S>(
        bus: &CrossBar,
        channel: &str,
        serializer: S,
        sink: W,
        index: Option<IndexWriter<Box<dyn IndexSink>>>,
    ) -> Result<Self>
    where
        T: Clone + Send + Sync + 'static,
        S: BodySerializer<T>,
    {
        let state = Arc::new(Mutex::new(RecorderState {
            sink: Some(sink),
            index,
            scratch: Vec::with_capacity(4096),
            body: Vec::with_capacity(1024),
            offset: 0,
            count: 0,
            closed: false,
        }));
        let serializer = Arc::new(serializer);

        let handler_state = Arc::clone(&state);
        let subscription = bus.subscribe_with::<T, _, _>(
            channel,
            move |message| {
                let state = Arc::clone(&handler_state);
                let serializer = Arc::clone(&serializer);
                async move {
                    state.lock().record(serializer.as_ref(), &message)?;
                    Ok(())
                }
            },
            SubscribeOptions::named(format!("recording-{channel}")),
        )?;

        Ok(Self {
            subscription,
            state,
            channel: channel.to_string(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Messages written to the sink so far.
    pub fn message_count(&self) -> u64 {
        self.state.lock().count
    }

    /// The recording subscription's statistics window.
    pub fn stats(&self, reset: bool) -> Stats {
        self.subscription.stats(reset)
    }

    /// Stops capturing, flushes the sink and finalises the index header
    /// with the total message count. Idempotent.
    pub fn dispose(&self) -> Result<()> {
        self.subscription.dispose();
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let count = state.count;
        if let Some(sink) = state.sink.as_mut() {
            sink.flush()?;
        }
        if let Some(index) = state.index.as_mut() {
            index.finalize(count)?;
        }
        Ok(())
    }

    /// Disposes the recording and hands back the sink.
    pub fn finish(self) -> Result<W> {
        self.dispose()?;
        self.state
            .lock()
            .sink
            .take()
            .ok_or(Error::Disposed("Recorder sink"))
    }
}
