//! The per-segment state machine
//!
//! Each data source with a shared memory cache gets one `SegmentInfo`
//! driving a pair of segment files. Loads are double-buffered: a build
//! runs against the writable file while readers keep the other one
//! mapped, then the roles swap and every reader is walked over to the new
//! file before the freed one is rewritten to match.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::Path;

use crate::memmgr::segment::{MappedSegment, SegmentId, SegmentParams, SegmentRole};
use crate::memmgr::types::{ReaderId, ZoneName};

#[derive(Debug)]
pub enum SegmentInfoError {
    ReaderExists(ReaderId),
    UnknownReader(ReaderId),
    UnexpectedCompletion(SegmentState),
}

impl fmt::Display for SegmentInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentInfoError::ReaderExists(reader) => {
                write!(f, "reader {} is already tracked", reader)
            }
            SegmentInfoError::UnknownReader(reader) => {
                write!(f, "reader {} is not tracked", reader)
            }
            SegmentInfoError::UnexpectedCompletion(state) => {
                write!(f, "build completion arrived in state {}", state)
            }
        }
    }
}

impl std::error::Error for SegmentInfoError {}

type Result<T> = std::result::Result<T, SegmentInfoError>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegmentState {
    Ready,
    Updating,
    Synchronizing,
    Copying,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            SegmentState::Ready => "READY",
            SegmentState::Updating => "UPDATING",
            SegmentState::Synchronizing => "SYNCHRONIZING",
            SegmentState::Copying => "COPYING",
        };
        write!(f, "{}", name)
    }
}

/// One unit of work for the builder thread.
///
/// Carries everything the builder needs by value, including the writable
/// file's attach parameters, so the builder never reaches back into
/// manager-owned state.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildRequest {
    pub segment: SegmentId,
    /// `None` means every zone the data source defines.
    pub zone: Option<ZoneName>,
    pub params: SegmentParams,
}

#[derive(Debug)]
pub struct SegmentInfo {
    id: SegmentId,
    state: SegmentState,
    mapped: MappedSegment,
    events: VecDeque<Option<ZoneName>>,
    readers: HashSet<ReaderId>,
    old_readers: HashSet<ReaderId>,
}

impl SegmentInfo {
    pub fn new(id: SegmentId, mapped_dir: &Path) -> SegmentInfo {
        let mapped = MappedSegment::new(mapped_dir, &id);
        SegmentInfo {
            id,
            state: SegmentState::Ready,
            mapped,
            events: VecDeque::new(),
            readers: HashSet::new(),
            old_readers: HashSet::new(),
        }
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    pub fn readers(&self) -> &HashSet<ReaderId> {
        &self.readers
    }

    pub fn old_readers(&self) -> &HashSet<ReaderId> {
        &self.old_readers
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn reset_param(&self, role: SegmentRole) -> Option<SegmentParams> {
        self.mapped.reset_param(role)
    }

    fn head_request(&self) -> Option<BuildRequest> {
        self.events.front().map(|zone| BuildRequest {
            segment: self.id.clone(),
            zone: zone.clone(),
            params: self.mapped.writer_param(),
        })
    }

    /// Queue a load without starting it. `None` loads all zones.
    pub fn add_event(&mut self, zone: Option<ZoneName>) {
        self.events.push_back(zone);
    }

    /// Kick off the next build if the segment is idle.
    ///
    /// Returns the request to hand to the builder, or `None` when a cycle
    /// is already running and will pick the event up on completion.
    pub fn start_update(&mut self) -> Option<BuildRequest> {
        if self.state != SegmentState::Ready {
            return None;
        }
        match self.head_request() {
            Some(request) => {
                self.state = SegmentState::Updating;
                Some(request)
            }
            None => None,
        }
    }

    /// Drive the state machine forward on a finished build.
    ///
    /// After the first half of a cycle the segment roles swap and all
    /// current readers become old readers that must be walked over. After
    /// the copy half the event is retired and the next one, if any,
    /// starts immediately.
    pub fn complete_update(&mut self) -> Result<Option<BuildRequest>> {
        match self.state {
            SegmentState::Updating => {
                self.mapped.mark_built();
                self.mapped.switch();
                self.old_readers.extend(self.readers.drain());
                if self.old_readers.is_empty() {
                    self.state = SegmentState::Copying;
                    Ok(self.head_request())
                } else {
                    self.state = SegmentState::Synchronizing;
                    Ok(None)
                }
            }
            SegmentState::Copying => {
                self.mapped.mark_built();
                self.events.pop_front();
                if self.events.is_empty() {
                    self.state = SegmentState::Ready;
                    Ok(None)
                } else {
                    self.state = SegmentState::Updating;
                    Ok(self.head_request())
                }
            }
            state => Err(SegmentInfoError::UnexpectedCompletion(state)),
        }
    }

    /// Track a newly subscribed reader on the current readable version.
    pub fn add_reader(&mut self, reader: ReaderId) -> Result<()> {
        if self.readers.contains(&reader) || self.old_readers.contains(&reader) {
            return Err(SegmentInfoError::ReaderExists(reader));
        }
        self.readers.insert(reader);
        Ok(())
    }

    /// A reader acknowledged switching to the current readable version.
    ///
    /// A reader that subscribed mid-sync is already on the new version;
    /// its ack is a no-op. An untracked reader is an error for the caller
    /// to log.
    pub fn sync_reader(&mut self, reader: &str) -> Result<Option<BuildRequest>> {
        if self.old_readers.remove(reader) {
            self.readers.insert(reader.to_string());
            return Ok(self.synchronized());
        }
        if self.readers.contains(reader) {
            return Ok(None);
        }
        Err(SegmentInfoError::UnknownReader(reader.to_string()))
    }

    /// Drop an unsubscribed reader from whichever set holds it.
    ///
    /// Removing the last old reader releases the previous version just as
    /// an ack would; the returned request, if any, starts the copy phase.
    pub fn remove_reader(&mut self, reader: &str) -> Option<BuildRequest> {
        if self.old_readers.remove(reader) {
            return self.synchronized();
        }
        self.readers.remove(reader);
        None
    }

    fn synchronized(&mut self) -> Option<BuildRequest> {
        if self.state == SegmentState::Synchronizing && self.old_readers.is_empty() {
            self.state = SegmentState::Copying;
            return self.head_request();
        }
        None
    }
}
