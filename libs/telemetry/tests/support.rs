use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uavo::{ObjectId, ObjectInstance, SchemaRegistry};
use uavo_telemetry::{Received, Transport};
use uavtalk::{Decoder, DecoderConfig, LinkEvents};

const GCS_STATS: &str = r#"<xml>
  <object name="GCSTelemetryStats" singleinstance="true" settings="false">
    <description>Ground side link state.</description>
    <field name="TxDataRate" units="bytes/sec" type="float" elements="1"/>
    <field name="RxDataRate" units="bytes/sec" type="float" elements="1"/>
    <field name="TxFailures" units="count" type="uint32" elements="1"/>
    <field name="Status" units="" type="enum" elements="1" options="Disconnected,HandshakeReq,HandshakeAck,Connected"/>
  </object>
</xml>"#;

const FLIGHT_STATS: &str = r#"<xml>
  <object name="FlightTelemetryStats" singleinstance="true" settings="false">
    <description>Flight side link state.</description>
    <field name="TxDataRate" units="bytes/sec" type="float" elements="1"/>
    <field name="RxDataRate" units="bytes/sec" type="float" elements="1"/>
    <field name="Status" units="" type="enum" elements="1" options="Disconnected,HandshakeReq,HandshakeAck,Connected"/>
  </object>
</xml>"#;

const ATTITUDE: &str = r#"<xml>
  <object name="AttitudeActual" singleinstance="true" settings="false">
    <description>Estimated attitude.</description>
    <field name="Roll" units="degrees" type="float" elements="1"/>
    <field name="Pitch" units="degrees" type="float" elements="1"/>
    <field name="Yaw" units="degrees" type="float" elements="1"/>
  </object>
</xml>"#;

const WAYPOINT: &str = r#"<xml>
  <object name="Waypoint" singleinstance="false" settings="false">
    <description>Path waypoint.</description>
    <field name="Position" units="m" type="float" elementnames="North,East,Down"/>
    <field name="Velocity" units="m/s" type="float" elements="1"/>
  </object>
</xml>"#;

const STABILIZATION: &str = r#"<xml>
  <object name="StabilizationSettings" singleinstance="true" settings="true">
    <description>Rate loop gains.</description>
    <field name="RollRateKp" units="" type="float" elements="1" defaultvalue="0.003"/>
    <field name="MaxRate" units="deg/s" type="uint16" elements="1" defaultvalue="300"/>
  </object>
</xml>"#;

#[allow(dead_code)]
pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::from_xml([GCS_STATS, FLIGHT_STATS, ATTITUDE, WAYPOINT, STABILIZATION])
            .expect("test definitions compile"),
    )
}

#[allow(dead_code)]
pub fn object(registry: &SchemaRegistry, name: &str) -> ObjectInstance {
    let def = registry.find_by_name(name).expect("known object");
    ObjectInstance::new(def)
}

/// One end of an in-memory byte pipe.
pub struct MemoryTransport {
    rx: Receiver<Vec<u8>>,
    tx: Option<Sender<Vec<u8>>>,
}

#[allow(dead_code)]
pub fn pipe() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        MemoryTransport {
            rx: a_rx,
            tx: Some(b_tx),
        },
        MemoryTransport {
            rx: b_rx,
            tx: Some(a_tx),
        },
    )
}

impl Transport for MemoryTransport {
    fn receive(&mut self, deadline: Option<Instant>) -> io::Result<Received> {
        let res = match deadline {
            Some(deadline) => self
                .rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match res {
            Ok(data) => Ok(Received::Data(data)),
            Err(RecvTimeoutError::Timeout) => Ok(Received::Empty),
            Err(RecvTimeoutError::Disconnected) => Ok(Received::Closed),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let tx = self.tx.as_ref().ok_or(io::ErrorKind::BrokenPipe)?;
        tx.send(data.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(data.len())
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Link events seen by the flight side.
#[derive(Default)]
pub struct PeerEvents {
    pub ack_requested: Vec<(ObjectId, u16)>,
    pub requested: Vec<(ObjectId, u16)>,
    pub file_requests: Vec<(u32, u32)>,
}

impl LinkEvents for PeerEvents {
    fn ack_requested(&mut self, obj_id: ObjectId, inst_id: u16) {
        self.ack_requested.push((obj_id, inst_id));
    }

    fn object_requested(&mut self, obj_id: ObjectId, inst_id: u16) {
        self.requested.push((obj_id, inst_id));
    }

    fn file_requested(&mut self, file_id: u32, offset: u32) {
        self.file_requests.push((file_id, offset));
    }
}

/// Flight controller end of a link, answering from its own thread.
#[allow(dead_code)]
pub struct Flight {
    registry: Arc<SchemaRegistry>,
    objects: HashMap<(ObjectId, u16), ObjectInstance>,
    files: HashMap<u32, Vec<u8>>,
    chunk_size: usize,
    acks: bool,
    answers_requests: bool,
}

#[allow(dead_code)]
impl Flight {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Flight {
            registry,
            objects: HashMap::new(),
            files: HashMap::new(),
            chunk_size: 64,
            acks: true,
            answers_requests: true,
        }
    }

    pub fn with_object(mut self, obj: ObjectInstance) -> Self {
        self.objects.insert((obj.id(), obj.instance_id()), obj);
        self
    }

    pub fn with_file(mut self, file_id: u32, data: Vec<u8>, chunk_size: usize) -> Self {
        self.files.insert(file_id, data);
        self.chunk_size = chunk_size;
        self
    }

    /// Never acknowledges objects.
    pub fn silent(mut self) -> Self {
        self.acks = false;
        self
    }

    /// Swallows object requests without answering.
    pub fn ignoring_requests(mut self) -> Self {
        self.answers_requests = false;
        self
    }

    /// Returns the ground side transport and a handle to the running flight
    /// side.
    pub fn spawn(self) -> (MemoryTransport, FlightHandle) {
        let (ground, mut air) = pipe();
        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(AtomicUsize::new(0));
        let handle = FlightHandle {
            stop: stop.clone(),
            received: received.clone(),
            requests: requests.clone(),
            thread: Some(thread::spawn(move || {
                self.run(&mut air, &stop, &received, &requests);
            })),
        };
        (ground, handle)
    }

    fn run(
        self,
        transport: &mut MemoryTransport,
        stop: &AtomicBool,
        received: &Mutex<Vec<ObjectInstance>>,
        requests: &AtomicUsize,
    ) {
        let flight_stats = self
            .registry
            .find_by_name("FlightTelemetryStats")
            .expect("flight stats")
            .clone();
        let mut decoder = Decoder::new(self.registry.clone(), DecoderConfig::default());
        let mut status = "Disconnected";
        while !stop.load(Ordering::Acquire) {
            let deadline = Instant::now() + Duration::from_millis(10);
            let data = match transport.receive(Some(deadline)) {
                Ok(Received::Data(data)) => data,
                Ok(Received::Empty) => continue,
                _ => break,
            };
            let mut events = PeerEvents::default();
            let objects = decoder.feed(&data, &mut events);
            let mut out = Vec::new();

            for obj in objects {
                if obj.name() == "GCSTelemetryStats" {
                    let ground = obj.get_enum("Status").unwrap_or("Disconnected");
                    let next = match (ground, status) {
                        ("HandshakeReq", _) => "HandshakeAck",
                        ("Connected", "HandshakeAck" | "Connected") => "Connected",
                        _ => "Disconnected",
                    };
                    if next != status || ground == "Disconnected" {
                        status = next;
                        let mut stats = ObjectInstance::new(&flight_stats);
                        stats.set_enum("Status", status).expect("status option");
                        out.extend(uavtalk::send_object(&stats, false).expect("stats frame"));
                    }
                }
                received.lock().push(obj);
            }
            if self.acks {
                for (id, inst) in events.ack_requested {
                    out.extend(uavtalk::acknowledge_object(id, inst));
                }
            }
            for key in events.requested {
                requests.fetch_add(1, Ordering::AcqRel);
                if !self.answers_requests {
                    continue;
                }
                match self.objects.get(&key) {
                    Some(obj) => out.extend(uavtalk::send_object(obj, false).expect("object frame")),
                    None => out.extend(uavtalk::nack_object(key.0, key.1)),
                }
            }
            for (file_id, offset) in events.file_requests {
                let Some(file) = self.files.get(&file_id) else {
                    continue;
                };
                let start = (offset as usize).min(file.len());
                let end = (start + self.chunk_size).min(file.len());
                let frame = uavtalk::file_chunk(file_id, offset, &file[start..end], end == file.len())
                    .expect("chunk frame");
                out.extend(frame);
            }

            if !out.is_empty() && transport.send(&out).is_err() {
                break;
            }
        }
    }
}

/// Flight side driven step by step from the test thread.
#[allow(dead_code)]
pub struct Peer {
    transport: MemoryTransport,
    decoder: Decoder,
    objects: VecDeque<ObjectInstance>,
    events: PeerEvents,
}

#[allow(dead_code)]
impl Peer {
    /// Returns the ground side transport and the peer on the other end.
    pub fn new(registry: Arc<SchemaRegistry>) -> (MemoryTransport, Peer) {
        let (ground, air) = pipe();
        let peer = Peer {
            transport: air,
            decoder: Decoder::new(registry, DecoderConfig::default()),
            objects: VecDeque::new(),
            events: PeerEvents::default(),
        };
        (ground, peer)
    }

    pub fn send(&mut self, frame: &[u8]) {
        self.transport.send(frame).expect("ground side open");
    }

    /// Waits up to five seconds for an object matching `matches`, dropping
    /// the objects received before it.
    pub fn next_object(&mut self, mut matches: impl FnMut(&ObjectInstance) -> bool) -> Option<ObjectInstance> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(pos) = self.objects.iter().position(&mut matches) {
                return self.objects.drain(..=pos).last();
            }
            if Instant::now() >= deadline || !self.pump() {
                return None;
            }
        }
    }

    /// Waits up to five seconds for the next file request.
    pub fn next_file_request(&mut self) -> Option<(u32, u32)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if !self.events.file_requests.is_empty() {
                return Some(self.events.file_requests.remove(0));
            }
            if Instant::now() >= deadline || !self.pump() {
                return None;
            }
        }
    }

    fn pump(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_millis(10);
        match self.transport.receive(Some(deadline)) {
            Ok(Received::Data(data)) => {
                let objects = self.decoder.feed(&data, &mut self.events);
                self.objects.extend(objects);
                true
            }
            Ok(Received::Empty) => true,
            _ => false,
        }
    }
}

#[allow(dead_code)]
pub struct FlightHandle {
    stop: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<ObjectInstance>>>,
    requests: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

#[allow(dead_code)]
impl FlightHandle {
    /// Objects the flight side has decoded so far.
    pub fn received(&self) -> Vec<ObjectInstance> {
        self.received.lock().clone()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }

    /// Stops the flight side and drops its end of the pipe.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.join().expect("flight thread");
        }
    }
}

impl Drop for FlightHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(dead_code)]
pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let collector = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(collector);
}

/// Polls `cond` until it holds or five seconds pass.
#[allow(dead_code)]
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
