//! Integration tests for the segment lifecycle
//!
//! These drive the public API end to end: a real builder thread with the
//! file image loader, fed by the same state machine the manager uses.

use std::fs;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use strata::memmgr::builder::{
    spawn_builder, BuildOutcome, BuilderChannel, BuilderCommand, BuilderResponse,
};
use strata::memmgr::loader::FileImageLoader;
use strata::memmgr::segment::{SegmentId, SegmentRole};
use strata::memmgr::segment_info::{SegmentInfo, SegmentState};
use strata::memmgr::types::{RRClass, ZoneName};

struct Scratch {
    root: PathBuf,
}

impl Scratch {
    fn new(tag: &str) -> Scratch {
        let root =
            std::env::temp_dir().join(format!("strata-lifecycle-{}-{}", tag, std::process::id()));
        if root.is_dir() {
            fs::remove_dir_all(&root).unwrap();
        }
        fs::create_dir_all(root.join("mapped")).unwrap();
        fs::create_dir_all(root.join("zones/mem/IN")).unwrap();
        Scratch { root }
    }

    fn mapped_dir(&self) -> PathBuf {
        self.root.join("mapped")
    }

    fn zones_dir(&self) -> PathBuf {
        self.root.join("zones")
    }

    fn add_zone(&self, name: &str, contents: &str) {
        fs::write(self.zones_dir().join("mem/IN").join(name), contents).unwrap();
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

struct BuilderFixture {
    channel: Arc<BuilderChannel>,
    wake: UnixStream,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BuilderFixture {
    fn start(zones_dir: PathBuf) -> BuilderFixture {
        let channel = Arc::new(BuilderChannel::new());
        let (tx, rx) = UnixStream::pair().unwrap();
        let loader = Arc::new(FileImageLoader::new(zones_dir));
        let handle = spawn_builder(channel.clone(), loader, tx).unwrap();
        BuilderFixture {
            channel,
            wake: rx,
            handle: Some(handle),
        }
    }

    /// Run one request through the builder and return its outcome.
    fn build(&mut self, request: strata::memmgr::segment_info::BuildRequest) -> BuildOutcome {
        self.channel.push_command(BuilderCommand::Load(request));
        let mut byte = [0u8; 1];
        self.wake.read_exact(&mut byte).unwrap();
        let responses = self.channel.take_responses();
        assert_eq!(1, responses.len());
        let BuilderResponse::LoadCompleted { outcome, .. } = responses.into_iter().next().unwrap();
        outcome
    }

    fn stop(&mut self) {
        self.channel.push_command(BuilderCommand::Shutdown);
        self.handle.take().unwrap().join().unwrap();
        assert_eq!(0, self.channel.command_len());
    }
}

fn segment_id() -> SegmentId {
    SegmentId {
        gen_id: 1,
        class: RRClass::IN,
        datasrc: "mem".to_string(),
    }
}

#[test]
fn test_full_load_cycle_builds_both_versions() {
    let scratch = Scratch::new("cycle");
    scratch.add_zone("example.com", "@ IN SOA ns1 admin 1 7200 3600 1209600 3600");

    let mut builder = BuilderFixture::start(scratch.zones_dir());
    let mut info = SegmentInfo::new(segment_id(), &scratch.mapped_dir());

    info.add_event(None);
    let request = info.start_update().unwrap();
    assert!(builder.build(request).is_ok());

    // First half done: the fresh version goes readable, the copy phase
    // brings the other file level.
    let copy = info.complete_update().unwrap().unwrap();
    assert_eq!(SegmentState::Copying, info.state());
    assert!(builder.build(copy).is_ok());
    assert_eq!(None, info.complete_update().unwrap());
    assert_eq!(SegmentState::Ready, info.state());

    for version in 0..2 {
        let file = scratch.mapped_dir().join(format!("zone-IN-1-mem-{}", version));
        assert!(file.is_file(), "missing {}", file.display());
        assert!(fs::metadata(&file).unwrap().len() > 0);
    }

    builder.stop();
}

#[test]
fn test_single_zone_reload_after_full_load() {
    let scratch = Scratch::new("reload");
    scratch.add_zone("example.com", "v1");

    let mut builder = BuilderFixture::start(scratch.zones_dir());
    let mut info = SegmentInfo::new(segment_id(), &scratch.mapped_dir());

    info.add_event(None);
    let request = info.start_update().unwrap();
    assert!(builder.build(request).is_ok());
    let copy = info.complete_update().unwrap().unwrap();
    assert!(builder.build(copy).is_ok());
    info.complete_update().unwrap();

    let before = fs::read(scratch.mapped_dir().join("zone-IN-1-mem-0")).unwrap();

    // Reload one zone; both versions get rewritten over the cycle.
    scratch.add_zone("example.com", "v2 with more data than before");
    info.add_event(Some(ZoneName::parse("example.com").unwrap()));
    let request = info.start_update().unwrap();
    assert!(builder.build(request).is_ok());
    let copy = info.complete_update().unwrap().unwrap();
    assert!(builder.build(copy).is_ok());
    info.complete_update().unwrap();
    assert_eq!(SegmentState::Ready, info.state());

    let after = fs::read(scratch.mapped_dir().join("zone-IN-1-mem-0")).unwrap();
    assert_ne!(before, after);

    builder.stop();
}

#[test]
fn test_failed_load_reports_and_cycle_continues() {
    let scratch = Scratch::new("failure");
    let mut builder = BuilderFixture::start(scratch.zones_dir());
    let mut info = SegmentInfo::new(segment_id(), &scratch.mapped_dir());

    // The zone has no master file, so the build fails, but the state
    // machine still gets its completion and finishes the cycle.
    info.add_event(Some(ZoneName::parse("ghost.example").unwrap()));
    let request = info.start_update().unwrap();
    match builder.build(request) {
        BuildOutcome::Failed(reason) => assert!(reason.contains("zone not found")),
        BuildOutcome::Loaded => panic!("load of a missing zone succeeded"),
    }

    let copy = info.complete_update().unwrap().unwrap();
    builder.build(copy);
    assert_eq!(None, info.complete_update().unwrap());
    assert_eq!(SegmentState::Ready, info.state());

    builder.stop();
}

#[test]
fn test_readers_gate_the_copy_phase() {
    let scratch = Scratch::new("readers");
    scratch.add_zone("example.com", "@ IN SOA ...");

    let mut builder = BuilderFixture::start(scratch.zones_dir());
    let mut info = SegmentInfo::new(segment_id(), &scratch.mapped_dir());
    info.add_reader("reader-1".to_string()).unwrap();

    info.add_event(None);
    let request = info.start_update().unwrap();
    assert!(builder.build(request).is_ok());

    // The old version stays untouched until the reader moves over.
    assert_eq!(None, info.complete_update().unwrap());
    assert_eq!(SegmentState::Synchronizing, info.state());
    let readable = info.reset_param(SegmentRole::Reader).unwrap();
    assert_eq!(
        scratch.mapped_dir().join("zone-IN-1-mem-1"),
        readable.mapped_file
    );
    assert!(!scratch.mapped_dir().join("zone-IN-1-mem-0").exists());

    let copy = info.sync_reader("reader-1").unwrap().unwrap();
    assert!(builder.build(copy).is_ok());
    info.complete_update().unwrap();
    assert_eq!(SegmentState::Ready, info.state());
    assert!(scratch.mapped_dir().join("zone-IN-1-mem-0").is_file());

    builder.stop();
}
