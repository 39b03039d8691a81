//! Record/replay subsystem: framed capture of channels to byte sinks,
//! deterministic playback, sparse indexes and offline stream utilities.

mod format;
pub mod index;
pub mod metadata;
pub mod player;
pub mod recorder;
pub mod serializer;
pub mod utilities;

pub use index::{IndexEntry, DEFAULT_INDEX_INTERVAL};
pub use metadata::{read_metadata, write_metadata, RecordingMetadata, SerializerInfo};
pub use player::{IndexedPlayer, Player, ReplayMode, StopHandle};
pub use recorder::{IndexSink, Recorder};
pub use serializer::{BodySerializer, SerializerVersion};
pub use utilities::{convert, filter, merge, split, DuplicateIdPolicy, SplitBy};
