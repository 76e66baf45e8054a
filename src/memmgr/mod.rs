//! Shared-Memory Zone Data Management
//!
//! This module keeps the zone data of an authoritative server loaded in
//! shared memory segments and coordinates handing those segments between
//! one builder thread and any number of out-of-process readers:
//! * `segment_info` - per data-source state machine driving segment swaps
//! * `builder` - the worker thread that populates writable segments
//! * `datasrc` - generation-tagged data source configuration snapshots
//! * `roster` - subscribed readers and their outstanding update counts
//! * `manager` - the single-threaded event loop tying it all together

/// The segment builder worker thread and its command channel
pub mod builder;

/// Runtime configuration parameters
pub mod config;

/// Data source configuration snapshots and generations
pub mod datasrc;

/// Populating writable segments from data sources
pub mod loader;

/// The manager event loop
pub mod manager;

/// Reader bookkeeping
pub mod roster;

/// Segment identity and mapped file bookkeeping
pub mod segment;

/// The per-segment state machine
pub mod segment_info;

/// Small domain types
pub mod types;
