//! Device Hub
//!
//! Owns one async task per paired device. Each task drives a
//! `DeviceSession`: stack events arrive through the task's inbox, timers fire
//! through `sleep_until` on the session's next deadline, and host messages
//! fan out to every connected client through a broadcast channel.
//!
//! The device map lock is only held to look up, insert or remove a handle.
//! Calibration loads and inbox sends happen after it is released, so one
//! slow device never stalls dispatch to the others.
//!
//! # Failure handling
//! - **Unknown devices**: events are answered with an error and dropped
//! - **Persistence**: each device has one writer task; records queued while
//!   a write runs collapse to the newest. A failed write is logged and
//!   reported back to the device as `PersistenceFailed`
//! - **Shutdown**: every device task is torn down and awaited

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mc_core::{
    load_calibration, CalibrationKey, CalibrationStore, CoreSettings, DeviceIdentity, DeviceSession, Millis,
    PersistedCalibration, ProfileRegistry, SessionOutput, TeardownReport, WallClock,
};
use mc_error::{MeshcapError, Result};
use mc_protocol::{DeviceAddress, HostMessage, StackEvent, WireEnvelope};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pending commands per device before senders wait
const DEVICE_INBOX_CAPACITY: usize = 256;

/// Host messages buffered per client before a slow client starts lagging
const HOST_CHANNEL_CAPACITY: usize = 1024;

/// Commands delivered to a device task
#[derive(Debug)]
pub enum DeviceCommand {
    /// A stack event and the Unix time (ms) it was observed at its source
    Event { event: StackEvent, observed_at: Millis },
    /// A calibration write for this device failed
    PersistenceFailed,
    /// Tear the session down and stop the task
    Teardown(oneshot::Sender<TeardownReport>),
}

type PersistJob = (CalibrationKey, PersistedCalibration);

struct DeviceHandle {
    identity: DeviceIdentity,
    inbox: mpsc::Sender<DeviceCommand>,
    task: JoinHandle<()>,
}

/// Shared state of all device tasks
pub struct Hub {
    registry: Arc<ProfileRegistry>,
    settings: Arc<CoreSettings>,
    store: Arc<dyn CalibrationStore>,
    devices: Mutex<HashMap<DeviceAddress, DeviceHandle>>,
    host_tx: broadcast::Sender<HostMessage>,
    epoch: Instant,
}

impl Hub {
    pub fn new(registry: ProfileRegistry, settings: CoreSettings, store: Arc<dyn CalibrationStore>) -> Arc<Self> {
        let (host_tx, _) = broadcast::channel(HOST_CHANNEL_CAPACITY);
        Arc::new(Self {
            registry: Arc::new(registry),
            settings: Arc::new(settings),
            store,
            devices: Mutex::new(HashMap::new()),
            host_tx,
            epoch: Instant::now(),
        })
    }

    /// Receive every host message emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<HostMessage> {
        self.host_tx.subscribe()
    }

    /// Milliseconds on the hub's monotonic clock
    pub fn now_ms(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis
    }

    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Route one validated envelope to its device.
    ///
    /// The envelope's `timestamp_ms` (Unix ms at the bridge) orders the
    /// datapoints it carries; envelopes without one are stamped on receipt.
    pub async fn dispatch(self: &Arc<Self>, envelope: WireEnvelope) -> Result<()> {
        let observed_at = envelope.timestamp_ms.unwrap_or_else(unix_now_ms);
        let WireEnvelope { device, event, .. } = envelope;

        match event {
            StackEvent::Paired { .. } => self.on_paired(device, event, observed_at).await,
            StackEvent::Unpaired => self.on_unpaired(&device).await.map(|_| ()),
            event => {
                let inbox = self
                    .inbox_of(&device)
                    .await
                    .ok_or_else(|| MeshcapError::DeviceNotFound(device.to_string()))?;
                deliver(&device, &inbox, event, observed_at).await
            }
        }
    }

    async fn inbox_of(&self, device: &DeviceAddress) -> Option<mpsc::Sender<DeviceCommand>> {
        self.devices.lock().await.get(device).map(|h| h.inbox.clone())
    }

    async fn on_paired(self: &Arc<Self>, device: DeviceAddress, event: StackEvent, observed_at: Millis) -> Result<()> {
        // Re-announcement: discovery in the session is idempotent
        if let Some(inbox) = self.inbox_of(&device).await {
            debug!(device = %device, "Device re-announced");
            return deliver(&device, &inbox, event, observed_at).await;
        }

        let StackEvent::Paired { vendor_id, model_id, .. } = &event else {
            return Err(MeshcapError::generic("expected a paired event"));
        };
        let identity = DeviceIdentity::new(device.clone(), vendor_id.clone(), model_id.clone());

        let store = Arc::clone(&self.store);
        let key = identity.calibration_key();
        let calibration = tokio::task::spawn_blocking(move || load_calibration(store.as_ref(), &key))
            .await
            .unwrap_or_else(|e| {
                warn!(device = %device, error = %e, "Calibration load task failed");
                None
            });

        let session = DeviceSession::new(identity.clone(), &self.registry, &self.settings, calibration)
            .with_wall_clock(WallClock::local(self.now_ms()));

        let mut devices = self.devices.lock().await;

        // Another pairing of the same device finished while calibration loaded
        if let Some(inbox) = devices.get(&device).map(|h| h.inbox.clone()) {
            drop(devices);
            debug!(device = %device, "Concurrent pairing, keeping the first session");
            return deliver(&device, &inbox, event, observed_at).await;
        }

        // The paired event goes in first so no other event can overtake it.
        // A fresh inbox always has room.
        let (inbox, rx) = mpsc::channel(DEVICE_INBOX_CAPACITY);
        inbox
            .try_send(DeviceCommand::Event { event, observed_at })
            .map_err(|_| MeshcapError::DeviceNotFound(device.to_string()))?;

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let persister = tokio::spawn(persist_loop(
            Arc::clone(&self.store),
            device.clone(),
            persist_rx,
            inbox.clone(),
        ));
        let worker = DeviceWorker {
            hub: Arc::clone(self),
            address: device.clone(),
            persist_tx,
        };
        let task = tokio::spawn(worker.run(session, rx, persister));

        info!(device = %device, vendor = %identity.vendor_id, model = %identity.model_id, "Device paired");
        devices.insert(device, DeviceHandle { identity, inbox, task });
        Ok(())
    }

    /// Tear a device down, wait for its task and drop its calibration
    async fn on_unpaired(&self, device: &DeviceAddress) -> Result<TeardownReport> {
        let handle = self
            .devices
            .lock()
            .await
            .remove(device)
            .ok_or_else(|| MeshcapError::DeviceNotFound(device.to_string()))?;

        // the task waits for its pending calibration writes before it ends
        let report = Self::stop(handle.inbox, handle.task).await;

        let store = Arc::clone(&self.store);
        let key = handle.identity.calibration_key();
        match tokio::task::spawn_blocking(move || store.remove(&key)).await {
            Ok(Ok(removed)) => debug!(device = %device, removed, "Calibration record removed"),
            Ok(Err(e)) => warn!(device = %device, error = %e, "Failed to remove calibration record"),
            Err(e) => warn!(device = %device, error = %e, "Calibration removal task failed"),
        }

        info!(
            device = %device,
            listeners = report.listeners_removed,
            timers = report.timers_cancelled,
            "Device unpaired"
        );
        Ok(report)
    }

    /// Tear down every device task
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<DeviceHandle> = self.devices.lock().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            Self::stop(handle.inbox, handle.task).await;
        }
        info!(devices = count, "All device tasks stopped");
        count
    }

    async fn stop(inbox: mpsc::Sender<DeviceCommand>, task: JoinHandle<()>) -> TeardownReport {
        let (tx, rx) = oneshot::channel();
        let report = if inbox.send(DeviceCommand::Teardown(tx)).await.is_ok() {
            rx.await.unwrap_or_default()
        } else {
            TeardownReport::default()
        };
        if let Err(e) = task.await {
            warn!(error = %e, "Device task ended abnormally");
        }
        report
    }

    fn publish(&self, message: HostMessage) {
        // No subscribers is not an error
        let _ = self.host_tx.send(message);
    }
}

async fn deliver(
    device: &DeviceAddress,
    inbox: &mpsc::Sender<DeviceCommand>,
    event: StackEvent,
    observed_at: Millis,
) -> Result<()> {
    inbox
        .send(DeviceCommand::Event { event, observed_at })
        .await
        .map_err(|_| MeshcapError::DeviceNotFound(device.to_string()))
}

/// Milliseconds since the Unix epoch
fn unix_now_ms() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Millis)
}

// ============================================================================
// Device task
// ============================================================================

struct DeviceWorker {
    hub: Arc<Hub>,
    address: DeviceAddress,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
}

impl DeviceWorker {
    async fn run(self, mut session: DeviceSession, mut rx: mpsc::Receiver<DeviceCommand>, persister: JoinHandle<()>) {
        debug!(device = %self.address, "Device task started");

        loop {
            let deadline = session
                .next_deadline()
                .map(|ms| self.hub.epoch + Duration::from_millis(ms));

            tokio::select! {
                command = rx.recv() => match command {
                    Some(DeviceCommand::Event { event, observed_at }) => {
                        let outputs = session.handle_event_at(&event, self.hub.now_ms(), observed_at);
                        self.emit(outputs);
                    }
                    Some(DeviceCommand::PersistenceFailed) => session.persistence_failed(),
                    Some(DeviceCommand::Teardown(reply)) => {
                        let _ = reply.send(session.teardown());
                        break;
                    }
                    None => {
                        session.teardown();
                        break;
                    }
                },
                _ = sleep_until(deadline) => {
                    let outputs = session.on_tick(self.hub.now_ms());
                    self.emit(outputs);
                }
            }
        }

        self.finish(persister).await;
    }

    /// Close the writer queue and wait for queued records to land
    async fn finish(self, persister: JoinHandle<()>) {
        let DeviceWorker { address, persist_tx, .. } = self;
        drop(persist_tx);
        if let Err(e) = persister.await {
            warn!(device = %address, error = %e, "Calibration writer ended abnormally");
        }
        debug!(device = %address, "Device task stopped");
    }

    fn emit(&self, outputs: Vec<SessionOutput>) {
        for output in outputs {
            match output {
                SessionOutput::PersistCalibration { key, record } => {
                    if self.persist_tx.send((key, record)).is_err() {
                        warn!(device = %self.address, "Calibration writer gone, record dropped");
                    }
                }
                other => {
                    if let Some(message) = other.into_host_message(&self.address) {
                        self.hub.publish(message);
                    }
                }
            }
        }
    }
}

/// Write one device's calibration records in order. Records queued while a
/// write runs collapse to the newest one.
async fn persist_loop(
    store: Arc<dyn CalibrationStore>,
    address: DeviceAddress,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
    inbox: mpsc::Sender<DeviceCommand>,
) {
    while let Some(mut job) = rx.recv().await {
        let mut superseded = 0usize;
        while let Ok(newer) = rx.try_recv() {
            job = newer;
            superseded += 1;
        }
        if superseded > 0 {
            debug!(device = %address, superseded, "Skipped superseded calibration records");
        }

        let store = Arc::clone(&store);
        let (key, record) = job;
        let result = tokio::task::spawn_blocking(move || store.save(&key, &record)).await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(error) = failure {
            warn!(device = %address, error = %error, "Calibration write failed");
            // the device task may be waiting on this loop, never block on its inbox
            if inbox.try_send(DeviceCommand::PersistenceFailed).is_err() {
                debug!(device = %address, "Could not report calibration write failure");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use mc_core::{
        compile, BindingRule, BindingSource, Catalog, Chemistry, CompileOptions, DataType, DatapointDecl,
        JsonCalibrationStore, Profile, Transform,
    };
    use mc_protocol::{CapabilityValue, EndpointDescriptor, EventPayload, OutboundCommand};

    fn registry() -> ProfileRegistry {
        let mut p = Profile::observe_only("ts0601_climate");
        p.category = "climate_sensor".into();
        p.vendor_ids = vec!["_TZE200_abc".into()];
        p.model_ids = vec!["TS0601".into()];
        p.datapoints = vec![DatapointDecl::new(4, DataType::Integer32)];
        p.bindings = vec![BindingRule {
            source: BindingSource::Datapoint { dp_id: 4 },
            capability: "measure_temperature".into(),
            transform: Transform::Divide { by: 10.0 },
        }];
        compile(&Catalog { version: 1, profiles: vec![p] }, &CompileOptions::default()).unwrap()
    }

    fn hub(dir: &std::path::Path) -> Arc<Hub> {
        Hub::new(
            registry(),
            CoreSettings::default(),
            Arc::new(JsonCalibrationStore::new(dir)),
        )
    }

    fn envelope(device: &str, event: StackEvent) -> WireEnvelope {
        WireEnvelope::new(DeviceAddress::new(device), event)
    }

    fn paired() -> StackEvent {
        StackEvent::Paired {
            vendor_id: "_TZE200_abc".into(),
            model_id: "TS0601".into(),
            endpoints: vec![EndpointDescriptor::new(1, &[0x0000, 0xEF00])],
        }
    }

    fn frame(bytes: Vec<u8>) -> StackEvent {
        StackEvent::Cluster {
            endpoint: 1,
            cluster: 0xEF00,
            name: "dataReport".into(),
            payload: EventPayload::Frame { bytes },
        }
    }

    fn record(confidence: u32) -> PersistedCalibration {
        PersistedCalibration {
            raw_samples: vec![(100.0, 3.0)],
            chemistry: Chemistry::Cr2032,
            confidence,
            last_level: None,
        }
    }

    async fn next_capability(rx: &mut broadcast::Receiver<HostMessage>) -> (String, CapabilityValue) {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if let HostMessage::Capability { capability, value, .. } = message {
                return (capability, value);
            }
        }
    }

    /// Store with optional slow loads that records the confidence of every save
    #[derive(Default)]
    struct SlowStore {
        slow_loads: AtomicBool,
        save_delay: Duration,
        saved: std::sync::Mutex<Vec<u32>>,
    }

    impl CalibrationStore for SlowStore {
        fn load(&self, _key: &CalibrationKey) -> Result<Option<PersistedCalibration>> {
            if self.slow_loads.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(800));
            }
            Ok(None)
        }

        fn save(&self, _key: &CalibrationKey, record: &PersistedCalibration) -> Result<()> {
            std::thread::sleep(self.save_delay);
            self.saved.lock().unwrap().push(record.confidence);
            Ok(())
        }

        fn remove(&self, _key: &CalibrationKey) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_frame_reaches_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        let mut rx = hub.subscribe();

        hub.dispatch(envelope("0x01", paired())).await.unwrap();
        hub.dispatch(envelope(
            "0x01",
            frame(vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x02, 0x62]),
        ))
        .await
        .unwrap();

        assert_eq!(
            next_capability(&mut rx).await,
            ("measure_temperature".to_string(), CapabilityValue::Number(61.0))
        );
        assert_eq!(hub.shutdown().await, 1);
    }

    #[tokio::test]
    async fn test_pairing_sends_time_sync() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        let mut rx = hub.subscribe();

        hub.dispatch(envelope("0x05", paired())).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        match message {
            HostMessage::Command {
                command: OutboundCommand::SendVendorFrame { endpoint, cluster, bytes },
                ..
            } => {
                assert_eq!((endpoint, cluster), (1, 0xEF00));
                // dp 0x24, raw, seven bytes
                assert_eq!(&bytes[2..6], &[0x24, 0x00, 0x00, 0x07]);
                assert!(bytes[12] < 7);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // deferred channel read, datapoint query and the daily time sync
        let report = hub.on_unpaired(&DeviceAddress::new("0x05")).await.unwrap();
        assert_eq!(report.timers_cancelled, 3);
    }

    #[tokio::test]
    async fn test_out_of_order_envelopes_keep_newer_value() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        let mut rx = hub.subscribe();

        hub.dispatch(envelope("0x06", paired())).await.unwrap();
        // 61.0 captured at 2000, then a late 20.0 captured at 1000, then 30.0 at 3000
        for (ts, high, low) in [(2_000, 0x02, 0x62), (1_000, 0x00, 0xC8), (3_000, 0x01, 0x2C)] {
            let bytes = vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, high, low];
            hub.dispatch(envelope("0x06", frame(bytes)).with_timestamp(ts)).await.unwrap();
        }

        assert_eq!(next_capability(&mut rx).await.1, CapabilityValue::Number(61.0));
        assert_eq!(next_capability(&mut rx).await.1, CapabilityValue::Number(30.0));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_calibration_load_does_not_block_other_devices() {
        let store = Arc::new(SlowStore::default());
        let hub = Hub::new(registry(), CoreSettings::default(), store.clone());
        hub.dispatch(envelope("0x01", paired())).await.unwrap();

        store.slow_loads.store(true, Ordering::SeqCst);
        let pairing = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.dispatch(envelope("0x02", paired())).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(
            Duration::from_millis(300),
            hub.dispatch(envelope("0x01", StackEvent::ZoneStatus { endpoint: 1, status: 1 })),
        )
        .await
        .expect("dispatch waited on another device's pairing")
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));

        pairing.await.unwrap().unwrap();
        assert_eq!(hub.device_count().await, 2);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_calibration_writes_land_in_order() {
        let store = Arc::new(SlowStore {
            save_delay: Duration::from_millis(100),
            ..SlowStore::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbox, _inbox_rx) = mpsc::channel(DEVICE_INBOX_CAPACITY);
        let key = CalibrationKey::new("_TZE200_abc", "TS0601", "0x07");

        tx.send((key.clone(), record(1))).unwrap();
        let writer = tokio::spawn(persist_loop(store.clone(), DeviceAddress::new("0x07"), rx, inbox));
        tokio::time::sleep(Duration::from_millis(20)).await;
        for confidence in 2..=4 {
            tx.send((key.clone(), record(confidence))).unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved.last(), Some(&4));
        assert!(saved.windows(2).all(|w| w[0] < w[1]), "writes out of order: {:?}", saved);
        assert!(saved.len() < 4);
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        let err = hub
            .dispatch(envelope("0x02", StackEvent::ZoneStatus { endpoint: 1, status: 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshcapError::DeviceNotFound(_)));
        assert!(hub.dispatch(envelope("0x02", StackEvent::Unpaired)).await.is_err());
    }

    #[tokio::test]
    async fn test_unpaired_removes_device_and_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        hub.dispatch(envelope("0x03", paired())).await.unwrap();
        assert_eq!(hub.device_count().await, 1);

        let key = CalibrationKey::new("_TZE200_abc", "TS0601", "0x03");
        hub.store.save(&key, &record(1)).unwrap();

        let report = hub.on_unpaired(&DeviceAddress::new("0x03")).await.unwrap();
        // primary endpoint: dataReport only
        assert_eq!(report.listeners_removed, 1);
        assert_eq!(hub.device_count().await, 0);
        assert!(hub.store.load(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repair_keeps_single_task() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        hub.dispatch(envelope("0x04", paired())).await.unwrap();
        hub.dispatch(envelope("0x04", paired())).await.unwrap();
        assert_eq!(hub.device_count().await, 1);
        hub.shutdown().await;
        assert_eq!(hub.device_count().await, 0);
    }
}
