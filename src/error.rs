use std::any::type_name;

/// Errors surfaced by the bus and the recording subsystem.
///
/// Publisher-observable failures are synchronous validation errors and
/// `FailedPublish`; everything a consumer handler does wrong is absorbed by
/// the subscription loop and never appears here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),

    #[error("channel '{channel}' is bound to body type {bound}, requested {requested}")]
    ChannelTypeMismatch {
        channel: String,
        bound: &'static str,
        requested: &'static str,
    },

    #[error("publish failed: {0}")]
    FailedPublish(String),

    #[error("corrupt recording: {0}")]
    CorruptRecording(&'static str),

    #[error("unsupported recording version: {0}")]
    UnsupportedVersion(u16),

    #[error("serializer error: {0}")]
    Serializer(String),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn type_mismatch<T: 'static>(channel: &str, bound: &'static str) -> Self {
        Error::ChannelTypeMismatch {
            channel: channel.to_string(),
            bound,
            requested: type_name::<T>(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
