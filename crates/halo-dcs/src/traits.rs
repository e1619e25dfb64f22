//! Capabilities the DCS layer consumes from its host

/// The local database process, as far as leader election is concerned
///
/// The election engine only asks for a name (for logging) and the latest
/// progress marker, written next to the leader key on every lease renewal.
pub trait DatabaseState: Send + Sync {
    /// Name of the local instance
    fn name(&self) -> &str;

    /// Monotonic progress marker (e.g. a WAL position)
    fn last_operation(&self) -> String;
}
