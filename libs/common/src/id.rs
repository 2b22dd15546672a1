use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = huddle_common::id::prefixed_ulid("gch");
/// assert!(id.starts_with("gch_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// A single live group channel (one WebSocket connection).
    pub const CHANNEL: &str = "gch";
}
