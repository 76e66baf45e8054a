//! Strata
//!
//! A shared-memory zone data manager for authoritative DNS servers.
//!
//! # Features
//!
//! * Double-buffered shared memory segments per data source and RR class
//! * Non-blocking zone reloads: readers keep serving the previous image
//!   while the next one is built
//! * Reader synchronization over an inter-process message bus
//! * Generation-tagged data source configuration snapshots
//! * A dedicated builder thread so the control loop never blocks on disk
//!
//! # Architecture
//!
//! The crate is divided into two main modules:
//! * `bus` - Message bus session, framing and message shapes
//! * `memmgr` - Segment lifecycle management and the manager event loop

/// Message bus session and wire plumbing
pub mod bus;

/// Shared-memory segment lifecycle management
pub mod memmgr;
