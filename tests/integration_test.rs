//! Integration tests for scans, the topology store and RFCOMM sessions,
//! driven by a scripted in-memory radio.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use uuid::Uuid;

use rfcomm_explorer::bluetooth::{
    codes, status, uuid_from_alias, ConnCompletion, ConnHandle, ConnOp, Device, DeviceRecord,
    Fetch, InquiryStatus, PeerAddress, PlatformEvent, RadioCode, RadioStack, Service,
    ServiceSize, SessionEnd, SessionState, Topology, UserInput, MAX_UUIDS,
};
use rfcomm_explorer::discovery::{
    DeviceDiscovery, DeviceScanState, DeviceServiceStatus, ServiceDiscovery, MAX_FETCH_ERRORS,
};
use rfcomm_explorer::storage::{deserialize, serialize, DiscoveryStore, FileStore};
use rfcomm_explorer::{Config, EventSink, EventSource, Explorer, ExplorerError};

const ADDR_A: PeerAddress = PeerAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
const ADDR_B: PeerAddress = PeerAddress([0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
const ADDR_C: PeerAddress = PeerAddress([0xcc, 0xdd, 0xee, 0xff, 0x00, 0x01]);

/// Records arrive in batches; each exhausted batch reports progress, the
/// last one reports `final_code`.
struct Script<T> {
    batches: VecDeque<Vec<Fetch<T>>>,
    queue: VecDeque<Fetch<T>>,
    final_code: i32,
    finished: bool,
    /// Report this status right after the first batch is queued.
    early_status: Option<i32>,
}

impl<T> Script<T> {
    fn new(batches: Vec<Vec<Fetch<T>>>, final_code: i32) -> Self {
        Self {
            batches: batches.into(),
            queue: VecDeque::new(),
            final_code,
            finished: false,
            early_status: None,
        }
    }

    fn start(&mut self, sink: &EventSink) {
        self.advance(sink);
        if let Some(code) = self.early_status {
            self.finished = true;
            self.final_code = code;
            sink.inquiry_status(code);
        }
    }

    fn advance(&mut self, sink: &EventSink) {
        match self.batches.pop_front() {
            Some(batch) => {
                self.queue.extend(batch);
                sink.inquiry_status(status::IN_PROGRESS);
            }
            None if !self.finished => {
                self.finished = true;
                sink.inquiry_status(self.final_code);
            }
            None => {}
        }
    }

    fn next(&mut self, sink: &EventSink) -> Fetch<T> {
        match self.queue.pop_front() {
            Some(Fetch::Error(code)) => {
                sink.inquiry_status(status::IN_PROGRESS);
                Fetch::Error(code)
            }
            Some(fetch) => fetch,
            None => {
                self.advance(sink);
                Fetch::Empty
            }
        }
    }

    fn cancel(&mut self, sink: &EventSink) {
        self.batches.clear();
        if !self.finished {
            self.finished = true;
            self.final_code = status::CANCELLED;
            sink.inquiry_status(status::CANCELLED);
        }
    }
}

enum ReadStep {
    Data(&'static [u8]),
    Eof,
    Fail(i32),
    /// Leave the read outstanding and send this many close requests.
    UserClose(usize),
    /// Complete on a handle that was never issued.
    WrongHandle,
    /// Report bytes without handing the buffer back.
    MissingBuffer,
}

struct FakeRadio {
    sink: EventSink,
    devices: Script<DeviceRecord>,
    device_start_events: Vec<PlatformEvent>,
    device_start_error: Option<i32>,
    services: HashMap<PeerAddress, Script<Service>>,
    service_start_errors: HashMap<PeerAddress, i32>,
    service_start_events: HashMap<PeerAddress, Vec<PlatformEvent>>,
    service_starts: Vec<PeerAddress>,
    announced_uuids: Option<usize>,
    current: Option<PeerAddress>,
    connect_result: i32,
    reads: VecDeque<ReadStep>,
    pending_read: Option<Vec<u8>>,
    handle: ConnHandle,
    cancel_calls: usize,
    connects: Vec<(PeerAddress, u8)>,
    closes: Vec<ConnHandle>,
}

impl FakeRadio {
    fn new(sink: EventSink) -> Self {
        Self {
            sink,
            devices: Script::new(Vec::new(), status::COMPLETED),
            device_start_events: Vec::new(),
            device_start_error: None,
            services: HashMap::new(),
            service_start_errors: HashMap::new(),
            service_start_events: HashMap::new(),
            service_starts: Vec::new(),
            announced_uuids: None,
            current: None,
            connect_result: 1,
            reads: VecDeque::new(),
            pending_read: None,
            handle: ConnHandle(7),
            cancel_calls: 0,
            connects: Vec::new(),
            closes: Vec::new(),
        }
    }

    fn with_devices(mut self, batches: Vec<Vec<Fetch<DeviceRecord>>>, final_code: i32) -> Self {
        self.devices = Script::new(batches, final_code);
        self
    }

    fn with_services(mut self, address: PeerAddress, batches: Vec<Vec<Fetch<Service>>>) -> Self {
        self.services
            .insert(address, Script::new(batches, status::COMPLETED));
        self
    }

    fn complete(&self, op: ConnOp, result: i32, buffer: Option<Vec<u8>>) {
        self.sink.completion(ConnCompletion {
            handle: self.handle,
            op,
            result,
            buffer,
        });
    }

    fn service_script(&mut self) -> Option<&mut Script<Service>> {
        let address = self.current?;
        self.services.get_mut(&address)
    }
}

impl RadioStack for FakeRadio {
    fn start_device_inquiry(&mut self, _duration: Duration) -> Result<(), RadioCode> {
        if let Some(code) = self.device_start_error {
            return Err(RadioCode(code));
        }
        self.devices.start(&self.sink);
        for event in self.device_start_events.drain(..) {
            self.sink.push(event);
        }
        Ok(())
    }

    fn fetch_next_device(&mut self) -> Fetch<DeviceRecord> {
        self.devices.next(&self.sink)
    }

    fn start_service_inquiry(&mut self, address: PeerAddress, _filter: Uuid) -> Result<(), RadioCode> {
        if let Some(code) = self.service_start_errors.get(&address) {
            return Err(RadioCode(*code));
        }
        self.current = Some(address);
        self.service_starts.push(address);
        let sink = self.sink.clone();
        let script = self
            .services
            .entry(address)
            .or_insert_with(|| Script::new(Vec::new(), status::COMPLETED));
        script.start(&sink);
        for event in self.service_start_events.remove(&address).unwrap_or_default() {
            sink.push(event);
        }
        Ok(())
    }

    fn peek_next_service_size(&mut self) -> Fetch<ServiceSize> {
        let sink = self.sink.clone();
        let announced = self.announced_uuids;
        let Some(script) = self.service_script() else {
            return Fetch::Empty;
        };
        match script.queue.front() {
            Some(Fetch::Record(service)) => {
                let mut size = ServiceSize::of(service);
                if let Some(uuids) = announced {
                    size.uuids = uuids;
                }
                Fetch::Record(size)
            }
            _ => match script.next(&sink) {
                Fetch::Error(code) => Fetch::Error(code),
                _ => Fetch::Empty,
            },
        }
    }

    fn fetch_next_service(&mut self, _size: ServiceSize) -> Fetch<Service> {
        let sink = self.sink.clone();
        match self.service_script() {
            Some(script) => script.next(&sink),
            None => Fetch::Empty,
        }
    }

    fn cancel_inquiry(&mut self) -> i32 {
        self.cancel_calls += 1;
        let sink = self.sink.clone();
        match self.current {
            Some(_) => {
                if let Some(script) = self.service_script() {
                    script.cancel(&sink);
                }
            }
            None => self.devices.cancel(&sink),
        }
        0
    }

    fn connect(&mut self, address: PeerAddress, channel: u8) -> Result<ConnHandle, RadioCode> {
        self.connects.push((address, channel));
        self.complete(ConnOp::Connect, self.connect_result, None);
        Ok(self.handle)
    }

    fn read(&mut self, handle: ConnHandle, mut buffer: Vec<u8>) -> Result<(), RadioCode> {
        assert_eq!(handle, self.handle);
        match self.reads.pop_front().unwrap_or(ReadStep::Eof) {
            ReadStep::Data(bytes) => {
                assert!(bytes.len() <= buffer.capacity());
                buffer.extend_from_slice(bytes);
                self.complete(ConnOp::Read, bytes.len() as i32, Some(buffer));
            }
            ReadStep::Eof => self.complete(ConnOp::Read, codes::CLOSED, Some(buffer)),
            ReadStep::Fail(code) => self.complete(ConnOp::Read, code, Some(buffer)),
            ReadStep::UserClose(requests) => {
                self.pending_read = Some(buffer);
                for _ in 0..requests {
                    self.sink.close_session();
                }
            }
            ReadStep::WrongHandle => self.sink.completion(ConnCompletion {
                handle: ConnHandle(self.handle.0 + 1),
                op: ConnOp::Read,
                result: 3,
                buffer: Some(buffer),
            }),
            ReadStep::MissingBuffer => self.complete(ConnOp::Read, 3, None),
        }
        Ok(())
    }

    fn close(&mut self, handle: ConnHandle) {
        self.closes.push(handle);
        if let Some(buffer) = self.pending_read.take() {
            self.complete(ConnOp::Read, codes::CLOSED, Some(buffer));
        }
    }
}

fn record(address: PeerAddress, name: &str) -> Fetch<DeviceRecord> {
    Fetch::Record(DeviceRecord {
        address,
        name: name.to_string(),
    })
}

fn serial_port(channel: u8) -> Service {
    Service::new(channel, "Serial Port", vec![uuid_from_alias(0x1101)])
}

fn explorer(
    dir: &TempDir,
    build: impl FnOnce(EventSink) -> FakeRadio,
) -> Result<Explorer<FakeRadio, FileStore>> {
    let (sink, events) = EventSource::channel();
    let radio = build(sink);
    let store = DiscoveryStore::new(FileStore::new(dir.path())?, "topology");
    Ok(Explorer::new(radio, events, store, &Config::default()))
}

fn addresses(topology: &Topology) -> Vec<PeerAddress> {
    topology.devices().iter().map(|d| d.address).collect()
}

#[tokio::test]
async fn test_devices_kept_in_arrival_order_across_fetch_errors() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        FakeRadio::new(sink).with_devices(
            vec![
                vec![record(ADDR_A, "a"), Fetch::Error(codes::MALFORMED), record(ADDR_B, "b")],
                vec![record(ADDR_C, "c")],
            ],
            status::COMPLETED,
        )
    })?;

    let report = explorer.scan().await?;

    assert_eq!(report.status, InquiryStatus::Completed);
    assert!(!report.cancelled);
    assert_eq!(report.devices, 3);
    assert_eq!(addresses(explorer.topology()), vec![ADDR_A, ADDR_B, ADDR_C]);
    Ok(())
}

#[tokio::test]
async fn test_failed_inquiry_keeps_partial_results_unsaved() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "a"), record(ADDR_B, "b")]], codes::GENERIC)
    })?;

    let err = explorer.scan().await.unwrap_err();
    assert!(matches!(err, ExplorerError::Scan(code) if code == codes::GENERIC));
    assert_eq!(addresses(explorer.topology()), vec![ADDR_A, ADDR_B]);

    // Nothing was persisted.
    assert_eq!(explorer.load()?, 0);
    Ok(())
}

#[tokio::test]
async fn test_scan_discovers_services_and_round_trips() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A"), record(ADDR_B, "B")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(5))]])
    })?;

    let report = explorer.scan().await?;
    assert_eq!(report.devices, 2);
    assert_eq!(report.services, 1);
    assert_eq!(report.service_failures, 0);

    let topology = explorer.topology().clone();
    assert_eq!(topology.device(0).map(|d| d.services.len()), Some(1));
    assert_eq!(topology.device(1).map(|d| d.services.len()), Some(0));

    let decoded = deserialize(&serialize(&topology))?;
    assert_eq!(decoded, topology);

    assert_eq!(explorer.load()?, 2);
    assert_eq!(explorer.topology(), &topology);
    Ok(())
}

#[tokio::test]
async fn test_service_start_failure_skips_only_that_device() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A"), record(ADDR_B, "B")]], status::COMPLETED)
            .with_services(ADDR_B, vec![vec![Fetch::Record(serial_port(2))]]);
        radio.service_start_errors.insert(ADDR_A, codes::UNAVAILABLE);
        radio
    })?;

    let report = explorer.scan().await?;
    assert_eq!(report.service_failures, 1);
    assert_eq!(report.services, 1);
    assert_eq!(
        explorer.topology().device(1).map(|d| d.services[0].channel),
        Some(2)
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_device_inquiry_persists_partial_topology() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink).with_devices(
            vec![vec![record(ADDR_A, "A")], vec![record(ADDR_B, "B")]],
            status::COMPLETED,
        );
        radio.device_start_events = vec![PlatformEvent::Input(UserInput::Cancel)];
        radio
    })?;

    let report = explorer.scan().await?;
    assert!(report.cancelled);
    assert_eq!(report.status, InquiryStatus::Cancelled);
    assert_eq!(explorer.radio().cancel_calls, 1);
    assert_eq!(addresses(explorer.topology()), vec![ADDR_A]);

    assert_eq!(explorer.load()?, 1);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_during_scan_cancels_inquiry() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED);
        radio.device_start_events = vec![PlatformEvent::Close];
        radio
    })?;

    let err = explorer.scan().await.unwrap_err();
    assert!(matches!(err, ExplorerError::Shutdown));
    assert_eq!(explorer.radio().cancel_calls, 1);

    // Shutdown is sticky.
    assert!(matches!(
        explorer.next_command().await,
        Err(ExplorerError::Shutdown)
    ));
    Ok(())
}

#[tokio::test]
#[should_panic(expected = "UUIDs")]
async fn test_service_with_too_many_uuids_panics() {
    let (sink, mut events) = EventSource::channel();
    let uuids: Vec<Uuid> = (0..=MAX_UUIDS as u32).map(uuid_from_alias).collect();
    let mut radio = FakeRadio::new(sink)
        .with_services(ADDR_A, vec![vec![Fetch::Record(Service::new(1, "big", uuids))]]);
    let mut topology = Topology::from_devices(vec![Device::new(ADDR_A, "A")]);

    let cancel = events.begin_operation();
    let mut discovery = ServiceDiscovery::new(Uuid::nil());
    let _ = discovery
        .run(&mut radio, &mut events, &mut topology, &cancel)
        .await;
}

#[tokio::test]
async fn test_session_delivers_bytes_verbatim() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A"), record(ADDR_B, "B")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(5))]]);
        radio.reads = vec![ReadStep::Data(b"hi\n"), ReadStep::Eof].into();
        radio
    })?;
    explorer.scan().await?;

    let mut received = Vec::new();
    let report = explorer.open_session(0, 0, &mut received).await?;

    assert_eq!(received, b"hi\n");
    assert_eq!(report.end, SessionEnd::ClosedByPeer);
    assert_eq!(report.bytes_received, 3);
    assert_eq!(report.reads, 1);
    assert_eq!(explorer.radio().connects, vec![(ADDR_A, 5)]);
    assert_eq!(explorer.radio().closes.len(), 1);
    assert_eq!(explorer.session_state(), SessionState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_repeated_close_requests_close_once() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(1))]]);
        radio.reads = vec![ReadStep::Data(b"x"), ReadStep::UserClose(2)].into();
        radio
    })?;
    explorer.scan().await?;

    let mut received = Vec::new();
    let report = explorer.open_session(0, 0, &mut received).await?;

    assert_eq!(report.end, SessionEnd::ClosedByUser);
    assert_eq!(received, b"x");
    assert_eq!(explorer.radio().closes, vec![ConnHandle(7)]);
    Ok(())
}

#[tokio::test]
async fn test_read_failure_ends_session() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(1))]]);
        radio.reads = vec![ReadStep::Fail(codes::GENERIC)].into();
        radio
    })?;
    explorer.scan().await?;

    let mut received = Vec::new();
    let report = explorer.open_session(0, 0, &mut received).await?;

    assert_eq!(report.end, SessionEnd::Failed { code: codes::GENERIC });
    assert_eq!(explorer.session_state(), SessionState::Failed(codes::GENERIC));
    assert_eq!(explorer.radio().closes.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_connect_failure_is_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(9))]]);
        radio.connect_result = codes::CONNECT;
        radio
    })?;
    explorer.scan().await?;

    let mut received = Vec::new();
    let err = explorer.open_session(0, 0, &mut received).await.unwrap_err();

    assert!(matches!(
        err,
        ExplorerError::Connect { channel: 9, code, .. } if code == codes::CONNECT
    ));
    assert!(received.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_open_session_rejects_unknown_indices() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        FakeRadio::new(sink).with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
    })?;
    explorer.scan().await?;

    let mut received = Vec::new();
    assert!(matches!(
        explorer.open_session(3, 0, &mut received).await,
        Err(ExplorerError::NoSuchDevice(3))
    ));
    assert!(matches!(
        explorer.open_session(0, 0, &mut received).await,
        Err(ExplorerError::NoSuchService { device: 0, service: 0 })
    ));
    assert!(explorer.radio().connects.is_empty());
    Ok(())
}

#[tokio::test]
#[should_panic(expected = "completion for handle")]
async fn test_completion_for_foreign_handle_panics() {
    let dir = TempDir::new().unwrap();
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(1))]]);
        radio.reads = vec![ReadStep::WrongHandle].into();
        radio
    })
    .unwrap();
    explorer.scan().await.unwrap();

    let mut received = Vec::new();
    let _ = explorer.open_session(0, 0, &mut received).await;
}

#[tokio::test]
async fn test_corrupt_store_and_reset() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("topology.store"), [5, 0, 0, 0, 1, 2])?;

    let mut explorer = explorer(&dir, FakeRadio::new)?;
    assert!(matches!(explorer.load(), Err(ExplorerError::Corruption(_))));
    assert!(explorer.topology().is_empty());

    explorer.reset_store()?;
    assert!(!dir.path().join("topology.store").exists());
    assert_eq!(explorer.load()?, 0);
    Ok(())
}

#[tokio::test]
async fn test_devices_queued_before_failure_are_kept() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "a"), record(ADDR_B, "b")]], status::COMPLETED);
        radio.devices.early_status = Some(codes::GENERIC);
        radio
    })?;

    let err = explorer.scan().await.unwrap_err();
    assert!(matches!(err, ExplorerError::Scan(code) if code == codes::GENERIC));
    assert_eq!(addresses(explorer.topology()), vec![ADDR_A, ADDR_B]);
    assert_eq!(
        explorer.device_scan_state(),
        DeviceScanState::Done(InquiryStatus::Failed(codes::GENERIC))
    );
    Ok(())
}

#[tokio::test]
async fn test_services_queued_before_failure_are_kept() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(3))]]);
        if let Some(script) = radio.services.get_mut(&ADDR_A) {
            script.early_status = Some(codes::GENERIC);
        }
        radio
    })?;

    let report = explorer.scan().await?;
    assert_eq!(report.services, 1);
    assert_eq!(report.service_failures, 1);
    Ok(())
}

#[tokio::test]
async fn test_device_scan_state_transitions() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        FakeRadio::new(sink).with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
    })?;

    assert_eq!(explorer.device_scan_state(), DeviceScanState::Idle);
    explorer.scan().await?;
    assert_eq!(
        explorer.device_scan_state(),
        DeviceScanState::Done(InquiryStatus::Completed)
    );
    Ok(())
}

#[tokio::test]
async fn test_busy_radio_is_retryable_and_keeps_topology() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink);
        radio.device_start_error = Some(codes::BUSY);
        radio
    })?;

    let err = explorer.scan().await.unwrap_err();
    assert!(matches!(err, ExplorerError::RadioBusy(code) if code == codes::BUSY));
    assert!(err.is_retryable());
    assert_eq!(explorer.device_scan_state(), DeviceScanState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_service_inquiry_skips_remaining_devices() {
    let (sink, mut events) = EventSource::channel();
    let mut radio = FakeRadio::new(sink)
        .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(1))]])
        .with_services(ADDR_B, vec![vec![Fetch::Record(serial_port(2))]]);
    radio
        .service_start_events
        .insert(ADDR_A, vec![PlatformEvent::Input(UserInput::Cancel)]);
    let mut topology = Topology::from_devices(vec![
        Device::new(ADDR_A, "A"),
        Device::new(ADDR_B, "B"),
        Device::new(ADDR_C, "C"),
    ]);

    let cancel = events.begin_operation();
    let mut discovery = ServiceDiscovery::new(Uuid::nil());
    let summary = discovery
        .run(&mut radio, &mut events, &mut topology, &cancel)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(
        summary.per_device,
        vec![
            DeviceServiceStatus::Finished(InquiryStatus::Cancelled),
            DeviceServiceStatus::Skipped,
            DeviceServiceStatus::Skipped,
        ]
    );
    assert_eq!(radio.service_starts, vec![ADDR_A]);
    assert_eq!(radio.cancel_calls, 1);
    assert_eq!(topology.service_count(), 1);
}

#[tokio::test]
async fn test_cancel_during_service_inquiry_persists() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A"), record(ADDR_B, "B")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(1))]]);
        radio
            .service_start_events
            .insert(ADDR_A, vec![PlatformEvent::Input(UserInput::Cancel)]);
        radio
    })?;

    let report = explorer.scan().await?;
    assert!(report.cancelled);
    assert_eq!(report.status, InquiryStatus::Completed);
    assert_eq!(explorer.radio().service_starts, vec![ADDR_A]);

    let scanned = explorer.topology().clone();
    assert_eq!(explorer.load()?, 2);
    assert_eq!(explorer.topology(), &scanned);
    Ok(())
}

#[tokio::test]
async fn test_failed_service_records_are_skipped_in_order() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(
                ADDR_A,
                vec![vec![
                    Fetch::Record(serial_port(1)),
                    Fetch::Error(codes::MALFORMED),
                    Fetch::Record(serial_port(2)),
                ]],
            )
    })?;

    explorer.scan().await?;
    let channels: Vec<u8> = explorer
        .topology()
        .device(0)
        .map(|d| d.services.iter().map(|s| s.channel).collect())
        .unwrap_or_default();
    assert_eq!(channels, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_record_larger_than_announced_is_skipped() -> Result<()> {
    let dir = TempDir::new()?;
    let mut explorer = explorer(&dir, |sink| {
        let wide = Service::new(3, "wide", vec![uuid_from_alias(0x1101), uuid_from_alias(0x1105)]);
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(
                ADDR_A,
                vec![vec![Fetch::Record(wide), Fetch::Record(serial_port(4))]],
            );
        radio.announced_uuids = Some(1);
        radio
    })?;

    explorer.scan().await?;
    let services = &explorer.topology().devices()[0].services;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].channel, 4);
    Ok(())
}

/// Reports failed fetches forever without consuming anything.
struct StuckRadio {
    sink: EventSink,
    fetches: usize,
}

impl RadioStack for StuckRadio {
    fn start_device_inquiry(&mut self, _duration: Duration) -> Result<(), RadioCode> {
        self.sink.inquiry_status(status::COMPLETED);
        Ok(())
    }

    fn fetch_next_device(&mut self) -> Fetch<DeviceRecord> {
        self.fetches += 1;
        Fetch::Error(codes::MALFORMED)
    }

    fn start_service_inquiry(&mut self, _address: PeerAddress, _filter: Uuid) -> Result<(), RadioCode> {
        Err(RadioCode(codes::UNAVAILABLE))
    }

    fn peek_next_service_size(&mut self) -> Fetch<ServiceSize> {
        Fetch::Empty
    }

    fn fetch_next_service(&mut self, _size: ServiceSize) -> Fetch<Service> {
        Fetch::Empty
    }

    fn cancel_inquiry(&mut self) -> i32 {
        0
    }

    fn connect(&mut self, _address: PeerAddress, _channel: u8) -> Result<ConnHandle, RadioCode> {
        Err(RadioCode(codes::CONNECT))
    }

    fn read(&mut self, _handle: ConnHandle, _buffer: Vec<u8>) -> Result<(), RadioCode> {
        Err(RadioCode(codes::BAD_HANDLE))
    }

    fn close(&mut self, _handle: ConnHandle) {}
}

#[tokio::test]
async fn test_exhaustive_drain_stops_on_endless_errors() {
    let (sink, mut events) = EventSource::channel();
    let mut radio = StuckRadio { sink, fetches: 0 };
    let mut topology = Topology::new();

    let cancel = events.begin_operation();
    let mut discovery = DeviceDiscovery::new(Duration::from_secs(1));
    let status = discovery
        .run(&mut radio, &mut events, &mut topology, &cancel)
        .await
        .unwrap();

    assert_eq!(status, InquiryStatus::Completed);
    assert!(topology.is_empty());
    assert_eq!(radio.fetches, MAX_FETCH_ERRORS);
}

#[tokio::test]
#[should_panic(expected = "without a buffer")]
async fn test_read_without_buffer_panics() {
    let dir = TempDir::new().unwrap();
    let mut explorer = explorer(&dir, |sink| {
        let mut radio = FakeRadio::new(sink)
            .with_devices(vec![vec![record(ADDR_A, "A")]], status::COMPLETED)
            .with_services(ADDR_A, vec![vec![Fetch::Record(serial_port(1))]]);
        radio.reads = vec![ReadStep::MissingBuffer].into();
        radio
    })
    .unwrap();
    explorer.scan().await.unwrap();

    let mut received = Vec::new();
    let _ = explorer.open_session(0, 0, &mut received).await;
}
