use crate::Result;

/// Version of a body serializer, written into each frame's flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerializerVersion {
    pub major: u8,
    pub minor: u8,
}

/// Encodes and decodes channel bodies for recording and playback.
///
/// `serialize` must be deterministic and append exactly the body bytes to
/// the supplied buffer; `deserialize` must consume exactly those bytes.
pub trait BodySerializer<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T, out: &mut Vec<u8>);
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;

    fn version(&self) -> SerializerVersion {
        SerializerVersion { major: 1, minor: 0 }
    }
}
