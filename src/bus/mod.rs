//! Message Bus Plumbing
//!
//! Everything the manager needs from the inter-process control bus:
//! * `message` - answers and the events a session can deliver
//! * `wire` - length-prefixed JSON framing
//! * `session` - the session trait and the socket-backed client

/// Answers and bus event shapes
pub mod message;

/// The session trait and the socket-backed client
pub mod session;

/// Length-prefixed JSON framing
pub mod wire;

/// The group segment readers subscribe to.
pub const SEGMENT_READER_GROUP: &str = "SegmentReader";

/// The group zone update notifications arrive on.
pub const ZONE_UPDATES_GROUP: &str = "ZoneUpdates";

/// The group the bus itself announces membership changes on.
pub const MEMBERS_GROUP: &str = "cc_members";
