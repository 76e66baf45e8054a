//! Segment identity and mapped file bookkeeping

use std::fmt;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::memmgr::types::RRClass;

/// Identity of one segment pair across configuration generations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId {
    pub gen_id: u64,
    pub class: RRClass,
    pub datasrc: String,
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (generation {})",
            self.class, self.datasrc, self.gen_id
        )
    }
}

/// The serializable parameters a process needs to attach to a segment.
///
/// For mapped segments this is just the path of the backing file; the
/// layout of the file itself is owned by the zone loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentParams {
    #[serde(rename = "mapped-file")]
    pub mapped_file: PathBuf,
}

/// Which side of a segment pair attach parameters are requested for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegmentRole {
    Reader,
    Writer,
}

/// A pair of mapped segment files, one readable and one writable.
///
/// Files are named `zone-<class>-<generation>-<datasrc>-<version>` under
/// the configured mapped file directory, with versions 0 and 1 alternating
/// between the readable and writable role.
#[derive(Debug)]
pub struct MappedSegment {
    base: PathBuf,
    readable: usize,
    built: [bool; 2],
}

impl MappedSegment {
    pub fn new(dir: &Path, id: &SegmentId) -> MappedSegment {
        let base = dir.join(format!("zone-{}-{}-{}", id.class, id.gen_id, id.datasrc));
        MappedSegment {
            base,
            readable: 0,
            built: [false, false],
        }
    }

    fn version_file(&self, version: usize) -> PathBuf {
        let mut file = self.base.clone().into_os_string();
        file.push(format!("-{}", version));
        PathBuf::from(file)
    }

    fn writable(&self) -> usize {
        1 - self.readable
    }

    /// Attach parameters for the requested role.
    ///
    /// The writer side always resolves; the reader side only once the
    /// readable version has been built at least once.
    pub fn reset_param(&self, role: SegmentRole) -> Option<SegmentParams> {
        let version = match role {
            SegmentRole::Reader => self.readable,
            SegmentRole::Writer => self.writable(),
        };
        if role == SegmentRole::Reader && !self.built[version] {
            return None;
        }
        Some(SegmentParams {
            mapped_file: self.version_file(version),
        })
    }

    /// Attach parameters for the writable version, which always exist.
    pub fn writer_param(&self) -> SegmentParams {
        SegmentParams {
            mapped_file: self.version_file(self.writable()),
        }
    }

    /// Record that the writable version now holds a complete image.
    pub fn mark_built(&mut self) {
        let version = self.writable();
        self.built[version] = true;
    }

    /// Make the just-built version readable and free the previous one
    /// for rewriting.
    pub fn switch(&mut self) {
        self.readable = self.writable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> SegmentId {
        SegmentId {
            gen_id: 1,
            class: RRClass::IN,
            datasrc: "mem".to_string(),
        }
    }

    #[test]
    fn test_file_naming() {
        let segment = MappedSegment::new(Path::new("/var/strata"), &test_id());
        let params = segment.writer_param();
        assert_eq!(
            PathBuf::from("/var/strata/zone-IN-1-mem-1"),
            params.mapped_file
        );
    }

    #[test]
    fn test_reader_param_requires_build() {
        let mut segment = MappedSegment::new(Path::new("/tmp/m"), &test_id());
        assert_eq!(None, segment.reset_param(SegmentRole::Reader));
        assert!(segment.reset_param(SegmentRole::Writer).is_some());

        segment.mark_built();
        segment.switch();
        let params = segment.reset_param(SegmentRole::Reader).unwrap();
        assert_eq!(PathBuf::from("/tmp/m/zone-IN-1-mem-1"), params.mapped_file);
        // The freed version is now the writer target.
        assert_eq!(
            PathBuf::from("/tmp/m/zone-IN-1-mem-0"),
            segment.writer_param().mapped_file
        );
    }

    #[test]
    fn test_params_serialization() {
        let params = SegmentParams {
            mapped_file: PathBuf::from("/tmp/m/zone-IN-1-mem-0"),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            serde_json::json!({"mapped-file": "/tmp/m/zone-IN-1-mem-0"}),
            value
        );
        let back: SegmentParams = serde_json::from_value(value).unwrap();
        assert_eq!(params, back);
    }
}
