//! The manager event loop
//!
//! A single cooperative thread multiplexing the bus socket and the
//! builder wake channel with `poll(2)`. All segment, generation and
//! roster state is touched from here and nowhere else; the builder only
//! ever sees self-contained build requests.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use derive_more::{Display, Error, From};
use serde_json::{json, Value};

use crate::bus::message::{Answer, BusEvent};
use crate::bus::session::{BusError, BusSession};
use crate::bus::{MEMBERS_GROUP, SEGMENT_READER_GROUP, ZONE_UPDATES_GROUP};
use crate::memmgr::builder::{
    self, BuildOutcome, BuilderChannel, BuilderCommand, BuilderResponse,
};
use crate::memmgr::config::{self, ConfigError, ConfigParams};
use crate::memmgr::datasrc::{self, DataSrcInfo};
use crate::memmgr::loader::ZoneLoader;
use crate::memmgr::roster::{AckOutcome, ReaderRoster};
use crate::memmgr::segment::{SegmentId, SegmentParams, SegmentRole};
use crate::memmgr::segment_info::{BuildRequest, SegmentInfo, SegmentState};
use crate::memmgr::types::{BadRRClass, NameError, RRClass, ReaderId, ZoneName};

/// Failures during initial setup. These are fatal; the daemon exits.
#[derive(Debug, Display, From, Error)]
pub enum SetupError {
    Config(ConfigError),
    Bus(BusError),
    Thread(io::Error),
}

type SetupResult<T> = std::result::Result<T, SetupError>;

#[derive(Debug)]
enum LoadZoneError {
    NoDataSource,
    MissingArg(&'static str),
    BadClass(BadRRClass),
    BadOrigin(NameError),
    UnknownDataSource(RRClass, String),
}

impl std::fmt::Display for LoadZoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadZoneError::NoDataSource => write!(f, "no data source configuration"),
            LoadZoneError::MissingArg(name) => write!(f, "missing argument: {}", name),
            LoadZoneError::BadClass(e) => write!(f, "{}", e),
            LoadZoneError::BadOrigin(e) => write!(f, "bad origin: {}", e),
            LoadZoneError::UnknownDataSource(class, name) => {
                write!(f, "unknown data source: {}/{}", class, name)
            }
        }
    }
}

pub struct ManagerStatistics {
    pub builds_completed: AtomicUsize,
    pub info_updates_sent: AtomicUsize,
    pub acks_received: AtomicUsize,
}

impl ManagerStatistics {
    fn new() -> ManagerStatistics {
        ManagerStatistics {
            builds_completed: AtomicUsize::new(0),
            info_updates_sent: AtomicUsize::new(0),
            acks_received: AtomicUsize::new(0),
        }
    }

    pub fn get_builds_completed(&self) -> usize {
        self.builds_completed.load(Ordering::Acquire)
    }

    pub fn get_info_updates_sent(&self) -> usize {
        self.info_updates_sent.load(Ordering::Acquire)
    }

    pub fn get_acks_received(&self) -> usize {
        self.acks_received.load(Ordering::Acquire)
    }
}

pub struct Memmgr {
    session: Box<dyn BusSession>,
    loader: Arc<dyn ZoneLoader>,
    config: Option<ConfigParams>,
    /// Generations in configuration order, newest last. Older ones stay
    /// until their readers are gone.
    // TODO: drop a generation once none of its segments has readers left.
    generations: Vec<DataSrcInfo>,
    roster: ReaderRoster,
    channel: Arc<BuilderChannel>,
    wake_rx: UnixStream,
    wake_tx: Option<UnixStream>,
    builder: Option<JoinHandle<()>>,
    stats: ManagerStatistics,
    shutting_down: bool,
}

impl Memmgr {
    pub fn new(session: Box<dyn BusSession>, loader: Arc<dyn ZoneLoader>) -> io::Result<Memmgr> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        Ok(Memmgr {
            session,
            loader,
            config: None,
            generations: Vec::new(),
            roster: ReaderRoster::new(),
            channel: Arc::new(BuilderChannel::new()),
            wake_rx,
            wake_tx: Some(wake_tx),
            builder: None,
            stats: ManagerStatistics::new(),
            shutting_down: false,
        })
    }

    pub fn statistics(&self) -> &ManagerStatistics {
        &self.stats
    }

    /// Bring the module up: adopt the initial configuration, start the
    /// builder, subscribe to the notification groups and seed the roster
    /// with the readers already on the bus.
    ///
    /// Subscribing to membership changes happens before the `members`
    /// rpc so no reader can slip between the two.
    pub fn setup(&mut self, initial_config: &Value) -> SetupResult<()> {
        let params = config::parse(initial_config, None)?;
        params.validate()?;
        log::info!(
            "using mapped file directory {}",
            params.mapped_file_dir.display()
        );
        self.config = Some(params);

        self.spawn_builder()?;

        self.session.subscribe(ZONE_UPDATES_GROUP)?;
        self.session.subscribe(MEMBERS_GROUP)?;
        for reader in self.session.members(SEGMENT_READER_GROUP)? {
            if self.roster.add_reader(&reader) {
                log::info!("found subscribed reader {}", reader);
            }
        }
        Ok(())
    }

    fn spawn_builder(&mut self) -> io::Result<()> {
        let wake = self
            .wake_tx
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "builder already started"))?;
        let handle = builder::spawn_builder(self.channel.clone(), self.loader.clone(), wake)?;
        self.builder = Some(handle);
        Ok(())
    }

    /// Run until a shutdown command arrives or the bus goes away.
    pub fn run(&mut self) -> std::result::Result<(), BusError> {
        log::info!("manager running");
        while !self.shutting_down {
            // Events buffered behind the members rpc never show up on
            // the descriptor, so drain them before blocking.
            if self.session.has_pending() {
                for event in self.session.receive()? {
                    self.dispatch(event);
                }
                continue;
            }
            let fds = [self.session.poll_fd(), self.wake_rx.as_raw_fd()];
            let readable = poll_readable(&fds)?;
            if readable[1] {
                self.notify_from_builder();
            }
            if readable[0] {
                for event in self.session.receive()? {
                    self.dispatch(event);
                }
            }
        }
        Ok(())
    }

    /// Stop the builder thread and wait for it.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.builder.take() {
            self.channel.push_command(BuilderCommand::Shutdown);
            if handle.join().is_err() {
                log::error!("builder thread panicked");
            }
        }
    }

    fn dispatch(&mut self, event: BusEvent) {
        match event {
            BusEvent::Command {
                name,
                args,
                reply_to,
            } => {
                if let Some(answer) = self.handle_command(&name, &args) {
                    self.answer_to(reply_to.as_deref(), &name, answer);
                }
            }
            BusEvent::Notification { group, event, args } => {
                self.handle_notification(&group, &event, &args)
            }
            BusEvent::ModuleConfig { value, reply_to } => {
                let answer = self.reconfigure(&value);
                self.answer_to(reply_to.as_deref(), "configuration update", answer);
            }
            BusEvent::DatasrcConfig { value, reply_to } => {
                let answer = self.datasrc_reconfigure(&value);
                self.answer_to(reply_to.as_deref(), "data source update", answer);
            }
        }
    }

    fn answer_to(&mut self, reply_to: Option<&str>, context: &str, answer: Answer) {
        match reply_to {
            Some(reply_to) => {
                if let Err(e) = self.session.send_answer(reply_to, &answer) {
                    log::error!("failed to answer {}: {}", context, e);
                }
            }
            None => {
                if !answer.is_ok() {
                    log::warn!("{} failed with nobody to answer: {}", context, answer);
                }
            }
        }
    }

    /// Commands with no answer return `None`.
    fn handle_command(&mut self, name: &str, args: &Value) -> Option<Answer> {
        match name {
            "loadzone" => Some(self.loadzone(args)),
            "info_update_ack" => {
                self.info_update_ack(args);
                None
            }
            "shutdown" => {
                log::info!("shutdown command received");
                self.shutting_down = true;
                Some(Answer::ok())
            }
            _ => {
                log::warn!("unknown command: {}", name);
                Some(Answer::error(format!("unknown command: {}", name)))
            }
        }
    }

    fn loadzone(&mut self, args: &Value) -> Answer {
        match self.load_zone(args, false) {
            Ok(()) => Answer::ok(),
            Err(e) => {
                log::error!("loadzone rejected: {}", e);
                Answer::error(e.to_string())
            }
        }
    }

    fn zone_updated(&mut self, args: &Value) {
        if let Err(e) = self.load_zone(args, true) {
            log::warn!("ignoring zone update notification: {}", e);
        }
    }

    fn load_zone(
        &mut self,
        args: &Value,
        tolerate_local: bool,
    ) -> std::result::Result<(), LoadZoneError> {
        if self.generations.is_empty() {
            return Err(LoadZoneError::NoDataSource);
        }
        let (class, datasrc, origin) = parse_load_args(args)?;
        let Some(generation) = self.generations.last_mut() else {
            return Err(LoadZoneError::NoDataSource);
        };
        let request = if let Some(segment) = generation.segment_mut(class, &datasrc) {
            log::info!("queueing load of {}/{} into {}", class, origin, datasrc);
            segment.add_event(Some(origin));
            segment.start_update()
        } else if tolerate_local && generation.has_local(class, &datasrc) {
            log::debug!(
                "zone update for process-local data source {}/{}",
                class,
                datasrc
            );
            None
        } else {
            return Err(LoadZoneError::UnknownDataSource(class, datasrc));
        };
        if let Some(request) = request {
            self.cmd_load(request);
        }
        Ok(())
    }

    fn info_update_ack(&mut self, args: &Value) {
        let Some(mnemonic) = args.get("data-source-class").and_then(Value::as_str) else {
            log::warn!("info_update_ack without data-source-class");
            return;
        };
        let Ok(class) = mnemonic.parse::<RRClass>() else {
            log::warn!("info_update_ack with bad class {}", mnemonic);
            return;
        };
        let Some(datasrc) = args.get("data-source-name").and_then(Value::as_str) else {
            log::warn!("info_update_ack without data-source-name");
            return;
        };
        let Some(reader) = args.get("reader").and_then(Value::as_str) else {
            log::warn!("info_update_ack without reader");
            return;
        };
        self.stats.acks_received.fetch_add(1, Ordering::Release);

        // The ack does not name a generation, so find the one this
        // reader still owes an ack for, newest first.
        let segment = self.generations.iter().rev().find_map(|generation| {
            generation
                .segment(class, datasrc)
                .map(|segment| segment.id().clone())
                .filter(|id| self.roster.has_outstanding(reader, id))
        });
        let Some(id) = segment else {
            log::warn!(
                "ignoring ack from {} for unknown segment {}/{}",
                reader,
                class,
                datasrc
            );
            return;
        };

        match self.roster.ack(reader, &id) {
            AckOutcome::Untracked => {
                log::warn!("ignoring ack from untracked reader {}", reader);
            }
            AckOutcome::Pending(left) => {
                log::debug!("{} still owes {} acks for {}", reader, left, id);
            }
            AckOutcome::Synced => {
                if let Some(request) = self.sync_reader(&id, reader) {
                    self.cmd_load(request);
                }
            }
        }
    }

    fn sync_reader(&mut self, id: &SegmentId, reader: &str) -> Option<BuildRequest> {
        let Some(segment) = self.segment_mut(id) else {
            log::warn!("ack for vanished segment {}", id);
            return None;
        };
        match segment.sync_reader(reader) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("ignoring ack: {}", e);
                None
            }
        }
    }

    fn handle_notification(&mut self, group: &str, event: &str, args: &Value) {
        match group {
            MEMBERS_GROUP => self.reader_notification(event, args),
            ZONE_UPDATES_GROUP => match event {
                "zone_updated" => self.zone_updated(args),
                _ => log::debug!("ignoring {} notification on {}", event, group),
            },
            _ => log::debug!("ignoring notification group {}", group),
        }
    }

    fn reader_notification(&mut self, event: &str, args: &Value) {
        match event {
            "subscribed" | "unsubscribed" => {
                let Some(subject) = args.get("group").and_then(Value::as_str) else {
                    return;
                };
                if subject != SEGMENT_READER_GROUP {
                    return;
                }
                let Some(client) = args.get("client").and_then(Value::as_str) else {
                    log::warn!("membership notification without client");
                    return;
                };
                if event == "subscribed" {
                    self.reader_subscribed(client.to_string());
                } else {
                    self.reader_unsubscribed(client);
                }
            }
            _ => log::debug!("ignoring {} notification", event),
        }
    }

    fn reader_subscribed(&mut self, reader: ReaderId) {
        if !self.roster.add_reader(&reader) {
            log::debug!("duplicate subscription from {}", reader);
            return;
        }
        log::info!("reader {} subscribed", reader);

        // The new reader starts on the current readable version of every
        // segment that has one; the rest catch it up when they first
        // complete a build.
        let mut updates = Vec::new();
        for generation in self.generations.iter_mut() {
            for segment in generation.segments_mut() {
                if let Err(e) = segment.add_reader(reader.clone()) {
                    log::error!("failed to track reader {}: {}", reader, e);
                    continue;
                }
                if let Some(params) = segment.reset_param(SegmentRole::Reader) {
                    updates.push((segment.id().clone(), params));
                }
            }
        }
        for (id, params) in updates {
            self.send_info_update(&id, &reader, params);
        }
    }

    fn reader_unsubscribed(&mut self, reader: &str) {
        if !self.roster.remove_reader(reader) {
            log::debug!("unsubscription from unknown reader {}", reader);
            return;
        }
        log::info!("reader {} unsubscribed", reader);

        let mut requests = Vec::new();
        for generation in self.generations.iter_mut() {
            for segment in generation.segments_mut() {
                if let Some(request) = segment.remove_reader(reader) {
                    requests.push(request);
                }
            }
        }
        for request in requests {
            self.cmd_load(request);
        }
    }

    fn reconfigure(&mut self, value: &Value) -> Answer {
        let proposed = match config::parse(value, self.config.as_ref()) {
            Ok(proposed) => proposed,
            Err(e) => {
                log::error!("configuration update rejected: {}", e);
                return Answer::error(e.to_string());
            }
        };
        if let Err(e) = proposed.validate() {
            log::error!("configuration update rejected: {}", e);
            return Answer::error(e.to_string());
        }
        if self.config.as_ref() != Some(&proposed) {
            log::info!(
                "mapped file directory is now {}",
                proposed.mapped_file_dir.display()
            );
        }
        self.config = Some(proposed);
        Answer::ok()
    }

    fn datasrc_reconfigure(&mut self, value: &Value) -> Answer {
        let Some(params) = self.config.clone() else {
            return Answer::error("module is not configured yet");
        };
        let gen_id = self
            .generations
            .last()
            .map(|generation| generation.gen_id() + 1)
            .unwrap_or(1);
        let built = datasrc::parse_config(value)
            .and_then(|config| DataSrcInfo::build(gen_id, &config, &params.mapped_file_dir));
        match built {
            Ok(mut info) => {
                log::info!(
                    "data source generation {} configured with {} mapped segments",
                    info.gen_id(),
                    info.segment_count()
                );
                let requests = self.init_segments(&mut info);
                self.generations.push(info);
                for request in requests {
                    self.cmd_load(request);
                }
                Answer::ok()
            }
            Err(e) => {
                log::error!("data source reconfiguration failed: {}", e);
                Answer::error(e.to_string())
            }
        }
    }

    /// Attach every known reader to a fresh generation's segments and
    /// queue a full load for each of them.
    fn init_segments(&self, info: &mut DataSrcInfo) -> Vec<BuildRequest> {
        let readers = self.roster.reader_ids();
        let mut requests = Vec::new();
        for segment in info.segments_mut() {
            for reader in &readers {
                if let Err(e) = segment.add_reader(reader.clone()) {
                    log::error!("failed to track reader {}: {}", reader, e);
                }
            }
            segment.add_event(None);
            if let Some(request) = segment.start_update() {
                requests.push(request);
            }
        }
        requests
    }

    /// Called when the wake channel turns readable: drain it, then work
    /// through everything the builder has finished.
    fn notify_from_builder(&mut self) {
        let mut buffer = [0u8; 16];
        loop {
            match self.wake_rx.read(&mut buffer) {
                Ok(0) => {
                    log::error!("builder wake channel closed");
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("wake channel read failed: {}", e);
                    break;
                }
            }
        }
        for response in self.channel.take_responses() {
            match response {
                BuilderResponse::LoadCompleted { request, outcome } => {
                    self.load_completed(request, outcome)
                }
            }
        }
    }

    fn load_completed(&mut self, request: BuildRequest, outcome: BuildOutcome) {
        self.stats.builds_completed.fetch_add(1, Ordering::Release);
        if let BuildOutcome::Failed(reason) = &outcome {
            log::error!(
                "build of {} failed, readers keep the previous data: {}",
                request.segment,
                reason
            );
        }

        let id = request.segment;
        let followup = {
            let Some(segment) = self.segment_mut(&id) else {
                log::warn!("build completion for vanished segment {}", id);
                return;
            };
            match segment.complete_update() {
                Ok(followup) => followup,
                Err(e) => {
                    log::error!("stray build completion for {}: {}", id, e);
                    return;
                }
            }
        };

        if let Some(request) = followup {
            self.cmd_load(request);
            return;
        }

        // No follow-up means either the cycle is over or old readers
        // must be walked over to the new version first.
        let pending = self.segment(&id).and_then(|segment| {
            if segment.state() != SegmentState::Synchronizing {
                return None;
            }
            let readers: Vec<ReaderId> = segment.old_readers().iter().cloned().collect();
            Some((segment.reset_param(SegmentRole::Reader), readers))
        });
        if let Some((params, readers)) = pending {
            let Some(params) = params else {
                log::error!("segment {} has no readable version to announce", id);
                return;
            };
            for reader in readers {
                self.send_info_update(&id, &reader, params.clone());
            }
        }
    }

    fn send_info_update(&mut self, id: &SegmentId, reader: &str, params: SegmentParams) {
        let param_value = match serde_json::to_value(&params) {
            Ok(param_value) => param_value,
            Err(e) => {
                log::error!("cannot encode segment parameters for {}: {}", id, e);
                return;
            }
        };
        let args = json!({
            "data-source-class": id.class.to_string(),
            "data-source-name": id.datasrc,
            "segment-params": param_value,
            "reader": reader,
        });
        if let Err(e) = self
            .session
            .group_sendmsg(SEGMENT_READER_GROUP, reader, "info_update", args)
        {
            log::error!("failed to send info_update to {}: {}", reader, e);
            return;
        }
        self.roster.note_update_sent(reader, id);
        self.stats.info_updates_sent.fetch_add(1, Ordering::Release);
        log::debug!("sent info_update for {} to {}", id, reader);
    }

    fn cmd_load(&self, request: BuildRequest) {
        log::debug!("dispatching build of {} to the builder", request.segment);
        self.channel.push_command(BuilderCommand::Load(request));
    }

    fn segment(&self, id: &SegmentId) -> Option<&SegmentInfo> {
        self.generations
            .iter()
            .find(|generation| generation.gen_id() == id.gen_id)
            .and_then(|generation| generation.segment(id.class, &id.datasrc))
    }

    fn segment_mut(&mut self, id: &SegmentId) -> Option<&mut SegmentInfo> {
        self.generations
            .iter_mut()
            .find(|generation| generation.gen_id() == id.gen_id)
            .and_then(|generation| generation.segment_mut(id.class, &id.datasrc))
    }
}

fn parse_load_args(args: &Value) -> std::result::Result<(RRClass, String, ZoneName), LoadZoneError> {
    let mnemonic = args
        .get("class")
        .and_then(Value::as_str)
        .ok_or(LoadZoneError::MissingArg("class"))?;
    let class: RRClass = mnemonic.parse().map_err(LoadZoneError::BadClass)?;
    let datasrc = args
        .get("datasource")
        .and_then(Value::as_str)
        .ok_or(LoadZoneError::MissingArg("datasource"))?
        .to_string();
    let origin = args
        .get("origin")
        .and_then(Value::as_str)
        .ok_or(LoadZoneError::MissingArg("origin"))?;
    let origin = ZoneName::parse(origin).map_err(LoadZoneError::BadOrigin)?;
    Ok((class, datasrc, origin))
}

/// Wait for any of the descriptors to turn readable.
fn poll_readable(fds: &[RawFd]) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    loop {
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            return Ok(pollfds
                .iter()
                .map(|p| p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
                .collect());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
