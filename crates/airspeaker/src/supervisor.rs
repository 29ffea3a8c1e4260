//! Receiver selection, playback control and the stall watchdog.
//!
//! A [`ConnectionSupervisor`] owns at most one receiver session. Once `connect`
//! succeeds a watchdog thread polls the receiver's player state and re-issues the
//! play command when playback has been idle for `idle_threshold` consecutive polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::cast::{
    CastConnector, DeviceDescriptor, DeviceDiscovery, MdnsDiscovery, MediaRequest, PlayerState,
    ReceiverConnector, ReceiverControl,
};
use crate::config::{CastSettings, WatchdogSettings};

/// Longest gap between channel keepalives, independent of the poll interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Where the watchdog thinks playback is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    /// Receiver reported activity on the last poll (or was just connected).
    Playing,
    /// Idle threshold reached; a replay is due or the last one failed.
    Stalled,
    /// Play was just re-issued; the grace period is running.
    Replaying,
    /// No session.
    Stopped,
}

/// What the caller should do after feeding one player state to the [`Watchdog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Idle, below the threshold. Carries the consecutive idle count.
    Idle(u32),
    Replay,
}

/// Pure stall-detection state, driven by the watchdog thread.
#[derive(Debug, Clone)]
pub struct Watchdog {
    settings: WatchdogSettings,
    idle_count: u32,
    grace_until: Instant,
    phase: WatchdogPhase,
}

impl Watchdog {
    /// A freshly connected session: playing, with the grace period starting at `now`.
    pub fn new(settings: WatchdogSettings, now: Instant) -> Self {
        let grace_until = now + settings.grace_period;
        Self {
            settings,
            idle_count: 0,
            grace_until,
            phase: WatchdogPhase::Playing,
        }
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        now < self.grace_until
    }

    pub fn observe(&mut self, state: PlayerState) -> Verdict {
        if !state.is_idle() {
            self.idle_count = 0;
            self.phase = WatchdogPhase::Playing;
            return Verdict::Healthy;
        }
        self.idle_count = self.idle_count.saturating_add(1);
        if self.idle_count >= self.settings.idle_threshold {
            self.phase = WatchdogPhase::Stalled;
            Verdict::Replay
        } else {
            Verdict::Idle(self.idle_count)
        }
    }

    /// Record a successful replay. A failed replay leaves the count alone so the
    /// next idle poll retries immediately.
    pub fn replayed(&mut self, now: Instant) {
        self.idle_count = 0;
        self.grace_until = now + self.settings.grace_period;
        self.phase = WatchdogPhase::Replaying;
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.phase
    }
}

struct ActiveSession {
    device: DeviceDescriptor,
    control: Box<dyn ReceiverControl>,
    media: MediaRequest,
    watchdog: Watchdog,
}

struct Shared {
    reconnect: AtomicBool,
    session: Mutex<Option<ActiveSession>>,
    phase: Mutex<WatchdogPhase>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: WatchdogPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }
}

struct WatchdogThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the device snapshot and the single active receiver session.
pub struct ConnectionSupervisor {
    settings: CastSettings,
    discovery: Arc<dyn DeviceDiscovery>,
    connector: Arc<dyn ReceiverConnector>,
    devices: Arc<Mutex<HashMap<String, DeviceDescriptor>>>,
    shared: Arc<Shared>,
    watchdog: Option<WatchdogThread>,
    connected: Option<DeviceDescriptor>,
    title: Option<String>,
}

impl ConnectionSupervisor {
    pub fn new(
        settings: CastSettings,
        discovery: Arc<dyn DeviceDiscovery>,
        connector: Arc<dyn ReceiverConnector>,
    ) -> Self {
        Self {
            settings,
            discovery,
            connector,
            devices: Arc::new(Mutex::new(HashMap::new())),
            shared: Arc::new(Shared {
                reconnect: AtomicBool::new(false),
                session: Mutex::new(None),
                phase: Mutex::new(WatchdogPhase::Stopped),
            }),
            watchdog: None,
            connected: None,
            title: None,
        }
    }

    /// mDNS discovery and the Cast V2 connector.
    pub fn with_cast_defaults(settings: CastSettings) -> Self {
        let connector = CastConnector::new(settings.connect_timeout);
        Self::new(settings, Arc::new(MdnsDiscovery::new()), Arc::new(connector))
    }

    /// Title shown on the receiver for subsequent connects.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Run one discovery pass and replace the device snapshot with its result.
    /// A failed pass is logged, yields an empty list and keeps the previous snapshot.
    pub fn discover(&self) -> Vec<DeviceDescriptor> {
        run_discovery(self.discovery.as_ref(), self.settings.discovery_timeout, &self.devices)
    }

    /// Like [`discover`](Self::discover) on a background thread. The receiver yields
    /// exactly one list.
    pub fn discover_async(&self) -> Receiver<Vec<DeviceDescriptor>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let discovery = Arc::clone(&self.discovery);
        let snapshot = Arc::clone(&self.devices);
        let timeout = self.settings.discovery_timeout;
        let spawned = std::thread::Builder::new()
            .name("cast-discovery".to_string())
            .spawn(move || {
                let devices = run_discovery(discovery.as_ref(), timeout, &snapshot);
                let _ = tx.send(devices);
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "discovery: failed to spawn thread");
        }
        rx
    }

    /// Replace the snapshot directly.
    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        replace_devices(&self.devices, &devices);
    }

    /// The current snapshot, sorted by name.
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<DeviceDescriptor> = lock_devices(&self.devices).values().cloned().collect();
        devices.sort_by(|a, b| {
            a.friendly_name
                .to_lowercase()
                .cmp(&b.friendly_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    /// Match by exact id first, then by case-insensitive name substring.
    pub fn find_device(&self, query: &str) -> Option<DeviceDescriptor> {
        if let Some(device) = lock_devices(&self.devices).get(query) {
            return Some(device.clone());
        }
        let needle = query.to_lowercase();
        self.devices()
            .into_iter()
            .find(|d| d.friendly_name.to_lowercase().contains(&needle))
    }

    /// Point `device_id` at `stream_url` and start the watchdog.
    ///
    /// Any existing session is torn down first. On failure nothing stays connected.
    pub fn connect(&mut self, device_id: &str, stream_url: &str, content_type: &str) -> Result<()> {
        self.disconnect();

        let device = lock_devices(&self.devices)
            .get(device_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown device {device_id}"))?;
        let mut control = self
            .connector
            .connect(&device)
            .with_context(|| format!("connect to {}", device.label()))?;

        let mut media = MediaRequest::live(stream_url, content_type);
        media.title = self.title.clone();
        if let Err(e) = control.play(&media) {
            control.disconnect();
            return Err(e.context(format!("play on {}", device.label())));
        }

        tracing::info!(
            cast_id = %device.id,
            name = %device.friendly_name,
            url = %stream_url,
            "supervisor: connected"
        );
        *self.shared.session() = Some(ActiveSession {
            device: device.clone(),
            control,
            media,
            watchdog: Watchdog::new(self.settings.watchdog.clone(), Instant::now()),
        });
        self.shared.set_phase(WatchdogPhase::Playing);
        self.shared.reconnect.store(true, Ordering::SeqCst);
        self.connected = Some(device);

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let poll = self.settings.watchdog.poll_interval;
        let handle = std::thread::Builder::new()
            .name("cast-watchdog".to_string())
            .spawn(move || watchdog_loop(&shared, &stop_rx, poll));
        match handle {
            Ok(handle) => {
                self.watchdog = Some(WatchdogThread { stop_tx, handle });
                Ok(())
            }
            Err(e) => {
                self.disconnect();
                Err(anyhow::Error::new(e).context("spawn watchdog thread"))
            }
        }
    }

    /// Stop the watchdog, stop playback and release the receiver. Idempotent.
    pub fn disconnect(&mut self) {
        self.shared.reconnect.store(false, Ordering::SeqCst);
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.stop_tx.send(());
            let _ = watchdog.handle.join();
        }
        let session = self.shared.session().take();
        if let Some(mut session) = session {
            if let Err(e) = session.control.stop() {
                tracing::warn!(cast_id = %session.device.id, error = %e, "supervisor: stop failed");
            }
            session.control.disconnect();
            tracing::info!(cast_id = %session.device.id, "supervisor: disconnected");
        }
        self.connected = None;
        self.shared.set_phase(WatchdogPhase::Stopped);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    pub fn connected_device(&self) -> Option<&DeviceDescriptor> {
        self.connected.as_ref()
    }

    pub fn phase(&self) -> WatchdogPhase {
        *self.shared.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn run_discovery(
    discovery: &dyn DeviceDiscovery,
    timeout: Duration,
    snapshot: &Mutex<HashMap<String, DeviceDescriptor>>,
) -> Vec<DeviceDescriptor> {
    match discovery.discover(timeout) {
        Ok(devices) => {
            tracing::info!(count = devices.len(), "discovery: finished");
            replace_devices(snapshot, &devices);
            devices
        }
        Err(e) => {
            tracing::warn!(error = %e, "discovery: failed, keeping previous devices");
            Vec::new()
        }
    }
}

fn lock_devices(
    devices: &Mutex<HashMap<String, DeviceDescriptor>>,
) -> MutexGuard<'_, HashMap<String, DeviceDescriptor>> {
    devices.lock().unwrap_or_else(PoisonError::into_inner)
}

fn replace_devices(snapshot: &Mutex<HashMap<String, DeviceDescriptor>>, devices: &[DeviceDescriptor]) {
    let fresh = devices
        .iter()
        .map(|d| (d.id.clone(), d.clone()))
        .collect::<HashMap<_, _>>();
    *lock_devices(snapshot) = fresh;
}

fn watchdog_loop(shared: &Shared, stop_rx: &Receiver<()>, poll: Duration) {
    tracing::info!(poll_ms = poll.as_millis() as u64, "watchdog: started");
    let wake = poll.min(KEEPALIVE_INTERVAL);
    let mut next_poll = Instant::now() + poll;
    loop {
        match stop_rx.recv_timeout(wake) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if !shared.reconnect.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        let poll_due = now >= next_poll;
        if poll_due {
            next_poll = now + poll;
        }
        watchdog_tick(shared, poll_due);
    }
    tracing::info!("watchdog: stopped");
}

/// Keep the channel serviced on every wake; query status only when a poll is due
/// and the grace period is over.
fn watchdog_tick(shared: &Shared, poll_due: bool) {
    let mut guard = shared.session();
    let Some(session) = guard.as_mut() else {
        return;
    };
    if !shared.reconnect.load(Ordering::SeqCst) {
        return;
    }
    if let Err(e) = session.control.keepalive() {
        tracing::warn!(cast_id = %session.device.id, error = %e, "watchdog: keepalive failed");
    }
    if !poll_due || session.watchdog.in_grace(Instant::now()) {
        return;
    }

    let state = match session.control.status() {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(cast_id = %session.device.id, error = %e, "watchdog: status query failed");
            return;
        }
    };
    match session.watchdog.observe(state) {
        Verdict::Healthy => {}
        Verdict::Idle(count) => {
            tracing::info!(cast_id = %session.device.id, idle_count = count, "watchdog: receiver idle");
        }
        Verdict::Replay => {
            tracing::warn!(cast_id = %session.device.id, "watchdog: playback stalled, replaying");
            match session.control.play(&session.media) {
                Ok(()) => session.watchdog.replayed(Instant::now()),
                Err(e) => {
                    tracing::warn!(cast_id = %session.device.id, error = %e, "watchdog: replay failed");
                }
            }
        }
    }
    shared.set_phase(session.watchdog.phase());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn watchdog_settings(grace: Duration) -> WatchdogSettings {
        WatchdogSettings {
            poll_interval: Duration::from_millis(20),
            idle_threshold: 2,
            grace_period: grace,
        }
    }

    fn cast_settings(grace: Duration) -> CastSettings {
        CastSettings {
            discovery_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(50),
            watchdog: watchdog_settings(grace),
        }
    }

    fn device(id: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            friendly_name: name.to_string(),
            model_name: "Chromecast Audio".to_string(),
            host: "10.0.0.9".to_string(),
            port: 8009,
        }
    }

    #[derive(Default)]
    struct Counters {
        plays: AtomicUsize,
        statuses: AtomicUsize,
        keepalives: AtomicUsize,
        stops: AtomicUsize,
        disconnects: AtomicUsize,
    }

    struct FakeControl {
        script: Arc<Mutex<VecDeque<Result<PlayerState>>>>,
        counters: Arc<Counters>,
        fail_play: bool,
    }

    impl ReceiverControl for FakeControl {
        fn play(&mut self, _media: &MediaRequest) -> Result<()> {
            self.counters.plays.fetch_add(1, Ordering::SeqCst);
            if self.fail_play {
                return Err(anyhow::anyhow!("load rejected"));
            }
            Ok(())
        }

        fn status(&mut self) -> Result<PlayerState> {
            self.counters.statuses.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PlayerState::Playing))
        }

        fn keepalive(&mut self) -> Result<()> {
            self.counters.keepalives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        script: Arc<Mutex<VecDeque<Result<PlayerState>>>>,
        counters: Arc<Counters>,
        connects: AtomicUsize,
        fail_play: bool,
    }

    impl FakeConnector {
        fn new(script: Vec<Result<PlayerState>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                counters: Arc::new(Counters::default()),
                connects: AtomicUsize::new(0),
                fail_play: false,
            }
        }
    }

    impl ReceiverConnector for FakeConnector {
        fn connect(&self, _device: &DeviceDescriptor) -> Result<Box<dyn ReceiverControl>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeControl {
                script: Arc::clone(&self.script),
                counters: Arc::clone(&self.counters),
                fail_play: self.fail_play,
            }))
        }
    }

    struct FakeDiscovery {
        passes: Mutex<VecDeque<Result<Vec<DeviceDescriptor>>>>,
    }

    impl FakeDiscovery {
        fn new(passes: Vec<Result<Vec<DeviceDescriptor>>>) -> Self {
            Self {
                passes: Mutex::new(passes.into()),
            }
        }
    }

    impl DeviceDiscovery for FakeDiscovery {
        fn discover(&self, _timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
            self.passes.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn supervisor(
        grace: Duration,
        connector: Arc<FakeConnector>,
    ) -> ConnectionSupervisor {
        let discovery = Arc::new(FakeDiscovery::new(vec![Ok(vec![
            device("a", "Kitchen"),
            device("b", "Living Room"),
        ])]));
        let sup = ConnectionSupervisor::new(cast_settings(grace), discovery, connector);
        sup.discover();
        sup
    }

    fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn two_idle_samples_trigger_one_replay() {
        let start = Instant::now();
        let mut wd = Watchdog::new(watchdog_settings(Duration::from_secs(15)), start);
        assert!(wd.in_grace(start + Duration::from_secs(14)));
        let t = start + Duration::from_secs(16);
        assert!(!wd.in_grace(t));

        let mut replays = 0;
        for state in [PlayerState::Idle, PlayerState::Idle, PlayerState::Playing] {
            if wd.observe(state) == Verdict::Replay {
                replays += 1;
                assert_eq!(wd.phase(), WatchdogPhase::Stalled);
                wd.replayed(t);
                assert_eq!(wd.phase(), WatchdogPhase::Replaying);
                assert!(wd.in_grace(t + Duration::from_secs(1)));
            }
        }
        assert_eq!(replays, 1);
        assert_eq!(wd.phase(), WatchdogPhase::Playing);
        assert_eq!(wd.idle_count(), 0);
    }

    #[test]
    fn single_idle_sample_does_not_replay() {
        let mut wd = Watchdog::new(watchdog_settings(Duration::ZERO), Instant::now());
        assert_eq!(wd.observe(PlayerState::Idle), Verdict::Idle(1));
        assert_eq!(wd.phase(), WatchdogPhase::Playing);
        assert_eq!(wd.observe(PlayerState::Playing), Verdict::Healthy);
        assert_eq!(wd.observe(PlayerState::Unknown), Verdict::Idle(1));
    }

    #[test]
    fn failed_replay_retries_on_next_idle() {
        let mut wd = Watchdog::new(watchdog_settings(Duration::ZERO), Instant::now());
        wd.observe(PlayerState::Idle);
        assert_eq!(wd.observe(PlayerState::Idle), Verdict::Replay);
        // no `replayed` call: the replay failed
        assert_eq!(wd.observe(PlayerState::Idle), Verdict::Replay);
        assert_eq!(wd.phase(), WatchdogPhase::Stalled);
    }

    #[test]
    fn idle_threshold_is_configurable() {
        let mut settings = watchdog_settings(Duration::ZERO);
        settings.idle_threshold = 3;
        let mut wd = Watchdog::new(settings, Instant::now());
        assert_eq!(wd.observe(PlayerState::Idle), Verdict::Idle(1));
        assert_eq!(wd.observe(PlayerState::Idle), Verdict::Idle(2));
        assert_eq!(wd.observe(PlayerState::Idle), Verdict::Replay);
    }

    #[test]
    fn watchdog_thread_replays_once_for_idle_idle_playing() {
        let connector = Arc::new(FakeConnector::new(vec![
            Ok(PlayerState::Idle),
            Ok(PlayerState::Idle),
            Ok(PlayerState::Playing),
        ]));
        let mut sup = supervisor(Duration::ZERO, Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        let counters = Arc::clone(&connector.counters);
        assert!(wait_until(Duration::from_secs(5), || {
            counters.statuses.load(Ordering::SeqCst) >= 5
        }));
        // initial play + exactly one replay
        assert_eq!(counters.plays.load(Ordering::SeqCst), 2);
        assert_eq!(sup.phase(), WatchdogPhase::Playing);
        sup.disconnect();
    }

    #[test]
    fn watchdog_thread_ignores_single_idle() {
        let connector = Arc::new(FakeConnector::new(vec![
            Ok(PlayerState::Idle),
            Ok(PlayerState::Playing),
        ]));
        let mut sup = supervisor(Duration::ZERO, Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        let counters = Arc::clone(&connector.counters);
        assert!(wait_until(Duration::from_secs(5), || {
            counters.statuses.load(Ordering::SeqCst) >= 4
        }));
        assert_eq!(counters.plays.load(Ordering::SeqCst), 1);
        sup.disconnect();
    }

    #[test]
    fn status_errors_are_not_fatal() {
        let connector = Arc::new(FakeConnector::new(vec![
            Err(anyhow::anyhow!("timeout")),
            Err(anyhow::anyhow!("timeout")),
            Ok(PlayerState::Playing),
        ]));
        let mut sup = supervisor(Duration::ZERO, Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        let counters = Arc::clone(&connector.counters);
        assert!(wait_until(Duration::from_secs(5), || {
            counters.statuses.load(Ordering::SeqCst) >= 5
        }));
        assert_eq!(counters.plays.load(Ordering::SeqCst), 1);
        assert!(sup.is_connected());
        sup.disconnect();
    }

    #[test]
    fn grace_period_suppresses_polling() {
        let connector = Arc::new(FakeConnector::new(
            (0..10).map(|_| Ok(PlayerState::Idle)).collect(),
        ));
        let mut sup = supervisor(Duration::from_secs(30), Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(connector.counters.statuses.load(Ordering::SeqCst), 0);
        assert_eq!(connector.counters.plays.load(Ordering::SeqCst), 1);
        sup.disconnect();
    }

    #[test]
    fn channel_is_kept_alive_during_grace() {
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let mut sup = supervisor(Duration::from_secs(30), Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        let counters = Arc::clone(&connector.counters);
        assert!(wait_until(Duration::from_secs(5), || {
            counters.keepalives.load(Ordering::SeqCst) >= 3
        }));
        assert_eq!(counters.statuses.load(Ordering::SeqCst), 0);
        sup.disconnect();

        let serviced = counters.keepalives.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counters.keepalives.load(Ordering::SeqCst), serviced);
    }

    #[test]
    fn disconnect_stops_polling_and_releases_receiver() {
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let mut sup = supervisor(Duration::ZERO, Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        let counters = Arc::clone(&connector.counters);
        assert!(wait_until(Duration::from_secs(5), || {
            counters.statuses.load(Ordering::SeqCst) >= 2
        }));

        sup.disconnect();
        let polled = counters.statuses.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counters.statuses.load(Ordering::SeqCst), polled);
        assert_eq!(sup.phase(), WatchdogPhase::Stopped);
        assert!(!sup.is_connected());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);

        // second disconnect is a no-op
        sup.disconnect();
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_device_fails_without_connecting() {
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let mut sup = supervisor(Duration::ZERO, Arc::clone(&connector));
        let err = sup
            .connect("missing", "http://10.0.0.2:18573/stream", "audio/aac")
            .unwrap_err();
        assert!(err.to_string().contains("unknown device"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(sup.phase(), WatchdogPhase::Stopped);
    }

    #[test]
    fn failed_play_releases_partial_session() {
        let mut connector = FakeConnector::new(Vec::new());
        connector.fail_play = true;
        let connector = Arc::new(connector);
        let mut sup = supervisor(Duration::ZERO, Arc::clone(&connector));
        assert!(sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").is_err());
        assert_eq!(connector.counters.disconnects.load(Ordering::SeqCst), 1);
        assert!(!sup.is_connected());
        assert!(sup.connected_device().is_none());
        assert_eq!(sup.phase(), WatchdogPhase::Stopped);
    }

    #[test]
    fn connecting_again_tears_down_previous_session() {
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let mut sup = supervisor(Duration::from_secs(30), Arc::clone(&connector));
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        sup.connect("b", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(connector.counters.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(sup.connected_device().map(|d| d.id.as_str()), Some("b"));
        sup.disconnect();
    }

    #[test]
    fn discovery_replaces_snapshot_wholesale() {
        let discovery = Arc::new(FakeDiscovery::new(vec![
            Ok(vec![device("a", "Kitchen"), device("b", "Living Room")]),
            Ok(vec![device("c", "Office")]),
            Err(anyhow::anyhow!("no multicast")),
        ]));
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let sup = ConnectionSupervisor::new(cast_settings(Duration::ZERO), discovery, connector);

        assert_eq!(sup.discover().len(), 2);
        let ids: Vec<String> = sup.discover().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["c".to_string()]);
        assert!(sup.find_device("a").is_none());

        let rx = sup.discover_async();
        let devices = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn failed_discovery_keeps_previous_devices() {
        let discovery = Arc::new(FakeDiscovery::new(vec![
            Ok(vec![device("a", "Kitchen")]),
            Err(anyhow::anyhow!("no multicast")),
            Err(anyhow::anyhow!("no multicast")),
            Ok(Vec::new()),
        ]));
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let mut sup =
            ConnectionSupervisor::new(cast_settings(Duration::from_secs(30)), discovery, connector);

        assert_eq!(sup.discover().len(), 1);
        assert!(sup.discover().is_empty());
        assert_eq!(sup.find_device("a").map(|d| d.id), Some("a".to_string()));

        let rx = sup.discover_async();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_empty());
        assert_eq!(sup.devices().len(), 1);
        sup.connect("a", "http://10.0.0.2:18573/stream", "audio/aac").unwrap();
        sup.disconnect();

        // a successful empty pass still replaces the snapshot
        assert!(sup.discover().is_empty());
        assert!(sup.devices().is_empty());
    }

    #[test]
    fn find_device_by_id_then_name() {
        let connector = Arc::new(FakeConnector::new(Vec::new()));
        let sup = supervisor(Duration::ZERO, connector);
        assert_eq!(sup.find_device("b").map(|d| d.friendly_name), Some("Living Room".to_string()));
        assert_eq!(sup.find_device("kitch").map(|d| d.id), Some("a".to_string()));
        assert!(sup.find_device("garage").is_none());
        let names: Vec<String> = sup.devices().into_iter().map(|d| d.friendly_name).collect();
        assert_eq!(names, vec!["Kitchen".to_string(), "Living Room".to_string()]);
    }
}
