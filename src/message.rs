use std::sync::Arc;

/// The immutable per-message envelope handed to every subscription.
///
/// Cloned once per receiving subscription during fan-out; `key` and `from`
/// are shared `Arc<str>` so a clone is two pointer bumps plus the body
/// clone.
#[derive(Debug, Clone)]
pub struct Message<T> {
    /// Monotonically increasing per-hub sequence number.
    pub id: u64,
    /// Wall-clock nanoseconds at publish. Reporting only.
    pub timestamp: i64,
    /// Steady-clock nanoseconds at enqueue. Latency stats and paced
    /// replay are computed from this field.
    pub inception: i64,
    /// Opaque 64-bit correlation value, carried through uninterpreted.
    pub correlation_id: i64,
    /// Storage key. Required for state-storing publishes.
    pub key: Option<Arc<str>>,
    /// Free-form producer identifier.
    pub from: Option<Arc<str>>,
    /// Opaque 64-bit user slot.
    pub tag_a: i64,
    pub body: T,
}

impl<T> Message<T> {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Maps the body, keeping every envelope field.
    pub fn map_body<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: self.id,
            timestamp: self.timestamp,
            inception: self.inception,
            correlation_id: self.correlation_id,
            key: self.key,
            from: self.from,
            tag_a: self.tag_a,
            body: f(self.body),
        }
    }
}
