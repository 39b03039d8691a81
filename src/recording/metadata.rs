//! Optional recording metadata document.
//!
//! A JSON sidecar describing a recording. The recorder and player never
//! require it; these helpers only read and write the document for callers
//! that want one.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::recording::serializer::SerializerVersion;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializerInfo {
    pub name: String,
    pub major: u8,
    pub minor: u8,
}

impl SerializerInfo {
    pub fn new(name: impl Into<String>, version: SerializerVersion) -> Self {
        Self {
            name: name.into(),
            major: version.major,
            minor: version.minor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    /// Wall-clock nanoseconds since the UNIX epoch at recording start.
    pub created_utc: i64,
    pub channel: String,
    pub serializer: SerializerInfo,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

pub fn write_metadata<W: Write>(writer: W, metadata: &RecordingMetadata) -> Result<()> {
    serde_json::to_writer_pretty(writer, metadata)
        .map_err(|err| Error::Serializer(err.to_string()))
}

pub fn read_metadata<R: Read>(reader: R) -> Result<RecordingMetadata> {
    serde_json::from_reader(reader).map_err(|err| Error::Serializer(err.to_string()))
}
