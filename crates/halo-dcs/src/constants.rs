// Key layout of a cluster below `<namespace>/<scope>`

pub mod cluster_key {
    /// Bootstrap marker, holds the name of the initializing member
    pub const INITIALIZE: &str = "initialize";
    /// Leader lock, holds the leader's name under a TTL
    pub const LEADER: &str = "leader";
    /// Last operation reported by the leader
    pub const OPTIME_LEADER: &str = "optime/leader";
    /// Directory of member records
    pub const MEMBERS: &str = "members";
    /// Pending manual failover request
    pub const FAILOVER: &str = "failover";
}

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "/service";

/// Default leader lease in seconds
pub const DEFAULT_TTL: u64 = 30;

/// Watches with less time left than this are not worth issuing
pub const MIN_WATCH_TIMEOUT_MS: u64 = 1000;
