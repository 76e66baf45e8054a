//! The segment builder worker thread and its command channel
//!
//! The builder is the only thread that writes segment files. It shares
//! two queues with the manager, both behind one mutex: commands flowing
//! in, responses flowing out. The condition variable wakes the builder;
//! the manager is woken the other way, by a byte on a socket pair its
//! poll loop watches.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::memmgr::loader::ZoneLoader;
use crate::memmgr::segment_info::BuildRequest;

#[derive(Clone, Debug, PartialEq)]
pub enum BuilderCommand {
    Load(BuildRequest),
    Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BuildOutcome {
    Loaded,
    Failed(String),
}

impl BuildOutcome {
    pub fn is_ok(&self) -> bool {
        *self == BuildOutcome::Loaded
    }
}

/// Every dispatched load produces exactly one completion, failed or not,
/// so the state machine always gets to move on.
#[derive(Clone, Debug, PartialEq)]
pub enum BuilderResponse {
    LoadCompleted {
        request: BuildRequest,
        outcome: BuildOutcome,
    },
}

struct Queues {
    commands: VecDeque<BuilderCommand>,
    responses: VecDeque<BuilderResponse>,
}

pub struct BuilderChannel {
    queues: Mutex<Queues>,
    commands_ready: Condvar,
}

impl Default for BuilderChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BuilderChannel {
    pub fn new() -> BuilderChannel {
        BuilderChannel {
            queues: Mutex::new(Queues {
                commands: VecDeque::new(),
                responses: VecDeque::new(),
            }),
            commands_ready: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        // A poisoned lock means the peer thread died mid-operation;
        // nothing sensible is left to do.
        self.queues.lock().expect("builder channel lock poisoned")
    }

    pub fn push_command(&self, command: BuilderCommand) {
        self.lock().commands.push_back(command);
        self.commands_ready.notify_one();
    }

    /// Pop a queued command without waiting. Only tests and diagnostics
    /// want this; the builder itself blocks in `next_command`.
    pub fn pop_command(&self) -> Option<BuilderCommand> {
        self.lock().commands.pop_front()
    }

    pub fn command_len(&self) -> usize {
        self.lock().commands.len()
    }

    pub fn push_response(&self, response: BuilderResponse) {
        self.lock().responses.push_back(response);
    }

    pub fn take_responses(&self) -> Vec<BuilderResponse> {
        self.lock().responses.drain(..).collect()
    }

    fn next_command(&self) -> BuilderCommand {
        let mut queues = self.lock();
        loop {
            if let Some(command) = queues.commands.pop_front() {
                return command;
            }
            queues = self
                .commands_ready
                .wait(queues)
                .expect("builder channel lock poisoned");
        }
    }
}

/// Start the builder thread.
///
/// `wake` is the builder's end of the socket pair; one byte goes out per
/// batch of responses pushed.
pub fn spawn_builder(
    channel: Arc<BuilderChannel>,
    loader: Arc<dyn ZoneLoader>,
    wake: UnixStream,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("segment-builder".to_string())
        .spawn(move || run_builder(&channel, &*loader, wake))
}

fn run_builder(channel: &BuilderChannel, loader: &dyn ZoneLoader, mut wake: UnixStream) {
    log::info!("segment builder started");
    loop {
        match channel.next_command() {
            BuilderCommand::Shutdown => {
                log::info!("segment builder shutting down");
                return;
            }
            BuilderCommand::Load(request) => {
                let outcome = match loader.load(
                    request.zone.as_ref(),
                    request.segment.class,
                    &request.segment.datasrc,
                    &request.params,
                ) {
                    Ok(()) => BuildOutcome::Loaded,
                    Err(e) => {
                        log::error!("load into segment {} failed: {}", request.segment, e);
                        BuildOutcome::Failed(e.to_string())
                    }
                };
                channel.push_response(BuilderResponse::LoadCompleted { request, outcome });
                if let Err(e) = wake.write_all(&[0]) {
                    log::error!("failed to wake the manager: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmgr::loader::LoaderError;
    use crate::memmgr::segment::{SegmentId, SegmentParams};
    use crate::memmgr::types::{RRClass, ZoneName};
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    struct RecordingLoader {
        loads: StdMutex<Vec<Option<ZoneName>>>,
        fail: bool,
    }

    impl RecordingLoader {
        fn new(fail: bool) -> RecordingLoader {
            RecordingLoader {
                loads: StdMutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl ZoneLoader for RecordingLoader {
        fn load(
            &self,
            zone: Option<&ZoneName>,
            _class: RRClass,
            _datasrc: &str,
            _params: &SegmentParams,
        ) -> std::result::Result<(), LoaderError> {
            self.loads.lock().unwrap().push(zone.cloned());
            if self.fail {
                Err(LoaderError::ZoneNotFound("nowhere.".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn request() -> BuildRequest {
        BuildRequest {
            segment: SegmentId {
                gen_id: 1,
                class: RRClass::IN,
                datasrc: "mem".to_string(),
            },
            zone: None,
            params: SegmentParams {
                mapped_file: PathBuf::from("/tmp/m/zone-IN-1-mem-1"),
            },
        }
    }

    fn run_one(loader: RecordingLoader) -> (Vec<BuilderResponse>, u8) {
        let channel = Arc::new(BuilderChannel::new());
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let handle = spawn_builder(channel.clone(), Arc::new(loader), tx).unwrap();

        channel.push_command(BuilderCommand::Load(request()));
        channel.push_command(BuilderCommand::Shutdown);
        handle.join().unwrap();

        let mut wake = [0u8; 8];
        let woken = rx.read(&mut wake).unwrap();
        (channel.take_responses(), woken as u8)
    }

    #[test]
    fn test_load_produces_completion_and_wake() {
        let (responses, woken) = run_one(RecordingLoader::new(false));
        assert_eq!(1, woken);
        assert_eq!(
            vec![BuilderResponse::LoadCompleted {
                request: request(),
                outcome: BuildOutcome::Loaded,
            }],
            responses
        );
    }

    #[test]
    fn test_failed_load_still_completes() {
        let (responses, woken) = run_one(RecordingLoader::new(true));
        assert_eq!(1, woken);
        match &responses[..] {
            [BuilderResponse::LoadCompleted { outcome, .. }] => {
                assert!(!outcome.is_ok());
            }
            other => panic!("unexpected responses: {:?}", other),
        }
    }

    #[test]
    fn test_commands_drain_in_order_before_shutdown() {
        let loader = Arc::new(RecordingLoader::new(false));
        let channel = Arc::new(BuilderChannel::new());
        let (tx, _rx) = UnixStream::pair().unwrap();

        let mut req_a = request();
        req_a.zone = Some(ZoneName::parse("a.example").unwrap());
        let mut req_b = request();
        req_b.zone = Some(ZoneName::parse("b.example").unwrap());
        channel.push_command(BuilderCommand::Load(req_a));
        channel.push_command(BuilderCommand::Load(req_b));
        channel.push_command(BuilderCommand::Shutdown);

        let handle = spawn_builder(channel.clone(), loader.clone(), tx).unwrap();
        handle.join().unwrap();

        let loads = loader.loads.lock().unwrap();
        assert_eq!(
            vec![
                Some(ZoneName::parse("a.example").unwrap()),
                Some(ZoneName::parse("b.example").unwrap())
            ],
            *loads
        );
        assert_eq!(0, channel.command_len());
        assert_eq!(2, channel.take_responses().len());
    }
}
