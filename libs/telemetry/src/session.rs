use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};
use uavo::{ObjectDefinition, ObjectId, ObjectInstance, SchemaRegistry};
use uavtalk::{Decoder, LinkEvents};

use crate::config::{ServiceMode, SessionConfig};
use crate::error::{Error, is_transient};
use crate::pending::{Callback, PendingRequests, RequestKey};
use crate::transport::{Received, Transport};

pub const GCS_STATS: &str = "GCSTelemetryStats";
pub const FLIGHT_STATS: &str = "FlightTelemetryStats";
const STATUS_FIELD: &str = "Status";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    HandshakeRequested,
    HandshakeAcked,
    Connected,
}

/// Values of the `Status` field of both telemetry stats objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkStatus {
    Disconnected,
    HandshakeReq,
    HandshakeAck,
    Connected,
}

impl LinkStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "Disconnected",
            LinkStatus::HandshakeReq => "HandshakeReq",
            LinkStatus::HandshakeAck => "HandshakeAck",
            LinkStatus::Connected => "Connected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Disconnected" => LinkStatus::Disconnected,
            "HandshakeReq" => LinkStatus::HandshakeReq,
            "HandshakeAck" => LinkStatus::HandshakeAck,
            "Connected" => LinkStatus::Connected,
            _ => return None,
        })
    }

    /// Our answer to the flight side status, and the phase it leads to.
    fn respond(self) -> Option<(LinkStatus, ConnectionPhase)> {
        match self {
            LinkStatus::Disconnected => {
                Some((LinkStatus::HandshakeReq, ConnectionPhase::HandshakeRequested))
            }
            LinkStatus::HandshakeAck => Some((LinkStatus::Connected, ConnectionPhase::HandshakeAcked)),
            LinkStatus::Connected => Some((LinkStatus::Connected, ConnectionPhase::Connected)),
            LinkStatus::HandshakeReq => None,
        }
    }
}

struct Io<T> {
    transport: T,
    decoder: Decoder,
    first_handshake_needed: bool,
}

#[derive(Default)]
struct State {
    log: Vec<ObjectInstance>,
    last_values: IndexMap<ObjectId, ObjectInstance>,
    pending: PendingRequests,
    phase: ConnectionPhase,
}

struct FileChunk {
    data: Vec<u8>,
    eof: bool,
}

#[derive(Default)]
struct AckState {
    acks: HashSet<ObjectId>,
    nacks: HashSet<ObjectId>,
    chunks: HashMap<(u32, u32), FileChunk>,
    /// Next expected offset of every file being read.
    transfers: HashMap<u32, u32>,
}

impl AckState {
    /// Keeps a chunk only if a transfer of its file expects it or a later
    /// offset.
    fn accept_chunk(&mut self, file_id: u32, offset: u32, chunk: FileChunk) -> bool {
        match self.transfers.get(&file_id) {
            Some(&next) if offset >= next => {
                self.chunks.insert((file_id, offset), chunk);
                true
            }
            _ => false,
        }
    }

    /// Takes the chunk at `offset` and forgets older chunks of the same file.
    fn take_chunk(&mut self, file_id: u32, offset: u32) -> Option<FileChunk> {
        let chunk = self.chunks.remove(&(file_id, offset))?;
        let next = offset.saturating_add(chunk.data.len() as u32);
        self.transfers.insert(file_id, next);
        self.chunks.retain(|&(id, off), _| id != file_id || off >= next);
        Some(chunk)
    }

    fn start_transfer(&mut self, file_id: u32) {
        self.chunks.retain(|&(id, _), _| id != file_id);
        self.transfers.insert(file_id, 0);
    }

    fn end_transfer(&mut self, file_id: u32) {
        self.chunks.retain(|&(id, _), _| id != file_id);
        self.transfers.remove(&file_id);
    }
}

/// Link events collected while decoding one batch.
#[derive(Default)]
struct CycleEvents {
    acked: Vec<ObjectId>,
    nacked: Vec<RequestKey>,
    ack_requested: Vec<RequestKey>,
    chunks: Vec<(u32, u32, FileChunk)>,
}

impl LinkEvents for CycleEvents {
    fn object_acked(&mut self, obj_id: ObjectId, _inst_id: u16) {
        self.acked.push(obj_id);
    }

    fn object_nacked(&mut self, obj_id: ObjectId, inst_id: u16) {
        self.nacked.push((obj_id, inst_id));
    }

    fn ack_requested(&mut self, obj_id: ObjectId, inst_id: u16) {
        self.ack_requested.push((obj_id, inst_id));
    }

    fn file_chunk(&mut self, file_id: u32, offset: u32, data: &[u8], eof: bool) {
        let chunk = FileChunk {
            data: data.to_vec(),
            eof,
        };
        self.chunks.push((file_id, offset, chunk));
    }
}

type Completion = (Vec<Callback>, Option<ObjectInstance>);

/// Telemetry session over one transport.
///
/// Lock order is `io`, then `state`, then `acks`; `outbox` is only ever
/// taken last. Request callbacks run after every lock is released.
pub struct Session<T> {
    registry: Arc<SchemaRegistry>,
    config: SessionConfig,
    gcs_stats: Option<Arc<ObjectDefinition>>,
    flight_stats: Option<ObjectId>,
    io: Mutex<Io<T>>,
    state: Mutex<State>,
    cond: Condvar,
    acks: Mutex<AckState>,
    ack_cond: Condvar,
    outbox: Mutex<Vec<u8>>,
    eof: AtomicBool,
    started: AtomicBool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, registry: Arc<SchemaRegistry>, config: SessionConfig) -> Result<Self, Error> {
        let (gcs_stats, flight_stats) = if config.handshaking {
            let gcs = registry
                .find_by_name(GCS_STATS)
                .ok_or(Error::MissingObject(GCS_STATS))?
                .clone();
            let flight = registry
                .find_by_name(FLIGHT_STATS)
                .ok_or(Error::MissingObject(FLIGHT_STATS))?
                .id();
            (Some(gcs), Some(flight))
        } else {
            (None, None)
        };
        let decoder = Decoder::new(registry.clone(), config.decoder());
        Ok(Session {
            io: Mutex::new(Io {
                transport,
                decoder,
                first_handshake_needed: config.handshaking,
            }),
            registry,
            config,
            gcs_stats,
            flight_stats,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            acks: Mutex::new(AckState::default()),
            ack_cond: Condvar::new(),
            outbox: Mutex::new(Vec::new()),
            eof: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    /// Runs one service cycle: first handshake, request retries, one bounded
    /// receive and the application of everything it decoded.
    ///
    /// A transport failure ends the session and is returned; later cycles
    /// are no-ops.
    pub fn service(&self) -> Result<(), Error> {
        if self.is_finished() {
            return Ok(());
        }
        let mut io = self.io.lock();
        let mut completions = Vec::new();
        let res = self.cycle(&mut io, &mut completions);
        if let Err(err) = &res {
            warn!(%err, "telemetry session failed");
            completions.extend(self.terminate(&mut io));
        }
        drop(io);
        run_completions(completions);
        res
    }

    fn cycle(&self, io: &mut Io<T>, completions: &mut Vec<Completion>) -> Result<(), Error> {
        if self.is_finished() {
            return Ok(());
        }
        if io.first_handshake_needed {
            io.first_handshake_needed = false;
            self.queue(&self.handshake_frame(LinkStatus::Disconnected)?);
        }

        let poll = self
            .state
            .lock()
            .pending
            .poll(Instant::now(), self.config.request_retry_interval);
        for ((id, inst), callbacks) in poll.expired {
            debug!(%id, inst, "object request expired");
            completions.push((callbacks, None));
        }
        if let Some((id, inst)) = poll.retransmit {
            trace!(%id, inst, "retransmitting object request");
            self.queue(&uavtalk::request_object(id, inst));
        }

        self.flush(io)?;

        let deadline = Instant::now() + self.config.receive_timeout;
        let data = match io.transport.receive(Some(deadline)) {
            Ok(Received::Data(data)) => data,
            Ok(Received::Empty) => return Ok(()),
            Ok(Received::Closed) => {
                info!("telemetry stream closed");
                completions.extend(self.terminate(io));
                return Ok(());
            }
            Err(err) if is_transient(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut events = CycleEvents::default();
        let objects = io.decoder.feed(&data, &mut events);

        let mut phase = None;
        for obj in &objects {
            if Some(obj.id()) != self.flight_stats {
                continue;
            }
            let Some(status) = obj.get_enum(STATUS_FIELD).and_then(LinkStatus::parse) else {
                continue;
            };
            if let Some((reply, next)) = status.respond() {
                debug!(peer = status.as_str(), reply = reply.as_str(), "handshake");
                self.queue(&self.handshake_frame(reply)?);
                phase = Some(next);
            }
        }
        if self.config.handshaking {
            for (id, inst) in &events.ack_requested {
                self.queue(&uavtalk::acknowledge_object(*id, *inst));
            }
        }

        {
            let mut state = self.state.lock();
            if let Some(phase) = phase {
                state.phase = phase;
            }
            for obj in objects {
                if let Some(callbacks) = state.pending.complete((obj.id(), obj.instance_id())) {
                    completions.push((callbacks, Some(obj.clone())));
                }
                state.last_values.insert(obj.id(), obj.clone());
                state.log.push(obj);
            }
            for key in &events.nacked {
                if let Some(callbacks) = state.pending.complete(*key) {
                    debug!(id = %key.0, inst = key.1, "object request refused");
                    completions.push((callbacks, None));
                }
            }
            self.cond.notify_all();
        }

        if !events.acked.is_empty() || !events.nacked.is_empty() || !events.chunks.is_empty() {
            let mut acks = self.acks.lock();
            acks.acks.extend(events.acked);
            acks.nacks.extend(events.nacked.iter().map(|(id, _)| *id));
            for (file_id, offset, chunk) in events.chunks {
                if !acks.accept_chunk(file_id, offset, chunk) {
                    trace!(file_id, offset, "dropping unrequested file chunk");
                }
            }
            self.ack_cond.notify_all();
        }

        self.flush(io)?;
        Ok(())
    }

    /// Ends the session: marks end of stream, hands every pending request
    /// back for completion with `None` and wakes all waiters.
    fn terminate(&self, io: &mut Io<T>) -> Vec<Completion> {
        let mut state = self.state.lock();
        if self.eof.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let completions = state
            .pending
            .drain()
            .into_iter()
            .map(|(_, callbacks)| (callbacks, None))
            .collect();
        self.cond.notify_all();
        drop(state);
        {
            let _acks = self.acks.lock();
            self.ack_cond.notify_all();
        }
        io.transport.close();
        completions
    }

    /// Stops the session. Blocked callers are released.
    pub fn close(&self) {
        let mut io = self.io.lock();
        let completions = self.terminate(&mut io);
        drop(io);
        run_completions(completions);
    }

    fn handshake_frame(&self, status: LinkStatus) -> Result<Vec<u8>, Error> {
        let def = self.gcs_stats.as_ref().ok_or(Error::NotBidirectional)?;
        let mut stats = ObjectInstance::new(def);
        stats.set_enum(STATUS_FIELD, status.as_str())?;
        Ok(uavtalk::send_object(&stats, false)?)
    }

    fn queue(&self, frame: &[u8]) {
        self.outbox.lock().extend_from_slice(frame);
    }

    fn flush(&self, io: &mut Io<T>) -> Result<(), Error> {
        let mut outbox = self.outbox.lock();
        let mut sent = 0;
        while sent < outbox.len() {
            match io.transport.send(&outbox[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(err) if is_transient(&err) => break,
                Err(err) => {
                    outbox.drain(..sent);
                    return Err(err.into());
                }
            }
        }
        outbox.drain(..sent);
        Ok(())
    }

    /// Sends queued frames right away unless a service cycle owns the
    /// transport, in which case that cycle sends them.
    fn try_flush(&self) {
        let Some(mut io) = self.io.try_lock() else {
            return;
        };
        if self.is_finished() {
            return;
        }
        if let Err(err) = self.flush(&mut io) {
            warn!(%err, "telemetry send failed");
            let completions = self.terminate(&mut io);
            drop(io);
            run_completions(completions);
        }
    }

    fn ensure_bidirectional(&self) -> Result<(), Error> {
        if self.config.handshaking {
            Ok(())
        } else {
            Err(Error::NotBidirectional)
        }
    }

    fn is_inline(&self) -> bool {
        self.config.mode == ServiceMode::Inline
    }

    /// Requests an object from the peer. `callback` receives it when it
    /// arrives, or `None` once retries run out, the peer refuses or the
    /// session ends. Requests for an object already in flight share one
    /// retransmission schedule.
    pub fn request(
        &self,
        def: &ObjectDefinition,
        instance_id: u16,
        callback: impl FnOnce(Option<ObjectInstance>) + Send + 'static,
    ) -> Result<(), Error> {
        self.ensure_bidirectional()?;
        let key = (def.id(), instance_id);
        {
            let mut state = self.state.lock();
            if !self.is_finished() {
                let deadline = Instant::now() + self.config.request_retry_interval;
                state
                    .pending
                    .register(key, Box::new(callback), self.config.request_retries, deadline);
                drop(state);
                self.queue(&uavtalk::request_object(key.0, key.1));
                self.try_flush();
                return Ok(());
            }
        }
        callback(None);
        Ok(())
    }

    /// Requests an object and blocks until the request completes.
    pub fn request_blocking(
        &self,
        def: &ObjectDefinition,
        instance_id: u16,
    ) -> Result<Option<ObjectInstance>, Error> {
        let (tx, rx) = mpsc::channel();
        self.request(def, instance_id, move |res| {
            let _ = tx.send(res);
        })?;
        if !self.is_inline() {
            return Ok(rx.recv().ok().flatten());
        }
        loop {
            match rx.try_recv() {
                Ok(res) => return Ok(res),
                Err(mpsc::TryRecvError::Disconnected) => return Ok(None),
                Err(mpsc::TryRecvError::Empty) => self.service()?,
            }
        }
    }

    /// Sends an object. With `require_ack` the object is resent until the
    /// peer acknowledges it or the attempts run out, which returns `false`.
    pub fn send(&self, instance: &ObjectInstance, require_ack: bool) -> Result<bool, Error> {
        self.ensure_bidirectional()?;
        let frame = uavtalk::send_object(instance, require_ack)?;
        if !require_ack {
            self.queue(&frame);
            self.try_flush();
            return Ok(true);
        }

        let id = instance.id();
        self.acks.lock().acks.remove(&id);
        for attempt in 0..self.config.ack_attempts {
            self.queue(&frame);
            self.try_flush();
            let deadline = Instant::now() + self.config.ack_timeout;
            if self.wait_acks(deadline, |acks| acks.acks.contains(&id).then_some(()))?.is_some() {
                return Ok(true);
            }
            if self.is_finished() {
                break;
            }
            trace!(%id, attempt, "no ack yet");
        }
        debug!(object = instance.name(), "object not acknowledged");
        Ok(false)
    }

    /// Reads a whole file from the peer, one chunk at a time. Chunks that
    /// arrive while no read of their file is running are discarded.
    pub fn read_file(&self, file_id: u32) -> Result<Vec<u8>, Error> {
        self.ensure_bidirectional()?;
        self.acks.lock().start_transfer(file_id);
        let res = self.fetch_file(file_id);
        self.acks.lock().end_transfer(file_id);
        res
    }

    fn fetch_file(&self, file_id: u32) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        let mut offset = 0u32;
        loop {
            let mut attempts = 0;
            let chunk = loop {
                if attempts == self.config.file_request_attempts {
                    return Err(Error::FileTransfer {
                        file_id,
                        offset,
                        attempts,
                    });
                }
                attempts += 1;
                self.queue(&uavtalk::request_file_chunk(file_id, offset));
                self.try_flush();
                let deadline = Instant::now() + self.config.file_poll;
                if let Some(chunk) = self.wait_acks(deadline, |acks| acks.take_chunk(file_id, offset))? {
                    break chunk;
                }
                if self.is_finished() {
                    return Err(Error::Closed);
                }
                trace!(file_id, offset, attempts, "re-requesting file chunk");
            };
            offset = offset.saturating_add(chunk.data.len() as u32);
            data.extend_from_slice(&chunk.data);
            if chunk.eof {
                debug!(file_id, len = data.len(), "file transfer complete");
                return Ok(data);
            }
        }
    }

    /// Waits on the ack monitor until `check` yields, the deadline passes or
    /// the session ends.
    fn wait_acks<R>(
        &self,
        deadline: Instant,
        mut check: impl FnMut(&mut AckState) -> Option<R>,
    ) -> Result<Option<R>, Error> {
        if self.is_inline() {
            loop {
                if let Some(r) = check(&mut *self.acks.lock()) {
                    return Ok(Some(r));
                }
                if self.is_finished() || Instant::now() >= deadline {
                    return Ok(None);
                }
                self.service()?;
            }
        }
        let mut acks = self.acks.lock();
        loop {
            if let Some(r) = check(&mut *acks) {
                return Ok(Some(r));
            }
            if self.is_finished() {
                return Ok(None);
            }
            if self.ack_cond.wait_until(&mut acks, deadline).timed_out() {
                return Ok(check(&mut *acks));
            }
        }
    }

    /// Blocks until the peer reports the link connected.
    pub fn wait_connection(&self) -> Result<(), Error> {
        self.wait_state(|state| state.phase == ConnectionPhase::Connected)
    }

    fn wait_state(&self, mut ready: impl FnMut(&State) -> bool) -> Result<(), Error> {
        if self.is_inline() {
            loop {
                if ready(&*self.state.lock()) {
                    return Ok(());
                }
                if self.is_finished() {
                    return Err(Error::Closed);
                }
                self.service()?;
            }
        }
        let mut state = self.state.lock();
        loop {
            if ready(&*state) {
                return Ok(());
            }
            if self.is_finished() {
                return Err(Error::Closed);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Objects NACKed by the peer since the last call.
    pub fn take_nacks(&self) -> HashSet<ObjectId> {
        std::mem::take(&mut self.acks.lock().nacks)
    }

    /// Most recent instance of every object received so far.
    pub fn last_values(&self) -> IndexMap<ObjectId, ObjectInstance> {
        self.state.lock().last_values.clone()
    }

    pub fn last_value(&self, name: &str) -> Option<ObjectInstance> {
        let def = self.registry.find_by_name(name)?;
        self.state.lock().last_values.get(&def.id()).cloned()
    }

    /// Number of objects received so far.
    pub fn received(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Iterates every object received, from the first one.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            session: self,
            next: 0,
        }
    }

    fn next_logged(&self, index: usize) -> Option<ObjectInstance> {
        if self.is_inline() {
            loop {
                {
                    let state = self.state.lock();
                    if let Some(obj) = state.log.get(index) {
                        return Some(obj.clone());
                    }
                    if self.is_finished() {
                        return None;
                    }
                }
                if self.service().is_err() {
                    return None;
                }
            }
        }
        let mut state = self.state.lock();
        loop {
            if let Some(obj) = state.log.get(index) {
                return Some(obj.clone());
            }
            if self.is_finished() || !self.config.iter_blocks {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }
}

impl<T: Transport + Send + 'static> Session<T> {
    /// Spawns the thread that services a background session until it ends.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, Error> {
        if self.is_inline() {
            return Err(Error::InlineSession);
        }
        if self.is_finished() {
            return Err(Error::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let session = self.clone();
        let handle = thread::Builder::new()
            .name("uavo-telemetry".to_string())
            .spawn(move || {
                while !session.is_finished() {
                    if let Err(err) = session.service() {
                        debug!(%err, "service thread exiting");
                        break;
                    }
                }
            })?;
        Ok(handle)
    }
}

fn run_completions(completions: Vec<Completion>) {
    for (callbacks, result) in completions {
        for callback in callbacks {
            callback(result.clone());
        }
    }
}

pub struct Iter<'a, T> {
    session: &'a Session<T>,
    next: usize,
}

impl<T: Transport> Iterator for Iter<'_, T> {
    type Item = ObjectInstance;

    fn next(&mut self) -> Option<Self::Item> {
        let obj = self.session.next_logged(self.next)?;
        self.next += 1;
        Some(obj)
    }
}

impl<'a, T: Transport> IntoIterator for &'a Session<T> {
    type Item = ObjectInstance;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[u8], eof: bool) -> FileChunk {
        FileChunk {
            data: data.to_vec(),
            eof,
        }
    }

    #[test]
    fn chunks_only_kept_for_running_transfers() {
        let mut acks = AckState::default();
        assert!(!acks.accept_chunk(7, 0, chunk(b"early", true)));

        acks.start_transfer(7);
        assert!(acks.accept_chunk(7, 0, chunk(b"abcd", false)));
        assert!(!acks.accept_chunk(8, 0, chunk(b"other", true)));
        assert_eq!(acks.take_chunk(7, 0).unwrap().data, b"abcd");

        // a duplicate of the chunk already consumed
        assert!(!acks.accept_chunk(7, 0, chunk(b"abcd", false)));
        assert!(acks.accept_chunk(7, 4, chunk(b"ef", true)));
        assert!(acks.take_chunk(7, 4).unwrap().eof);

        acks.accept_chunk(7, 6, chunk(b"late", true));
        acks.end_transfer(7);
        assert!(acks.chunks.is_empty());
        assert!(!acks.accept_chunk(7, 6, chunk(b"late", true)));
    }
}
