//! Platform pressure signals: polling, fan-out, and the probe sources.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Thermal pressure level, nominal through critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ThermalLevel {
    /// No thermal pressure.
    #[default]
    Nominal,
    /// Mild pressure; shed optional load.
    Fair,
    /// Sustained pressure; throttle.
    Serious,
    /// Imminent shutdown territory; pause noncritical work.
    Critical,
}

impl ThermalLevel {
    /// Numeric level 0..3.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Nominal => 0,
            Self::Fair => 1,
            Self::Serious => 2,
            Self::Critical => 3,
        }
    }

    /// Level from the platform's 0..3 integer; values above 3 clamp to
    /// critical.
    #[must_use]
    pub fn from_u8(level: u8) -> Self {
        match level {
            0 => Self::Nominal,
            1 => Self::Fair,
            2 => Self::Serious,
            _ => Self::Critical,
        }
    }
}

/// Battery charging state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    /// No battery information (desktop, simulator).
    #[default]
    Unknown,
    /// Discharging.
    Unplugged,
    /// Charging.
    Charging,
    /// Plugged in at 100%.
    Full,
}

/// One poll of the platform pressure signals. Immutable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Wall-clock time of the poll, unix milliseconds.
    pub timestamp_ms: i64,
    /// Thermal level.
    pub thermal: ThermalLevel,
    /// Battery charge 0..1, `None` when there is no battery.
    pub battery_level: Option<f32>,
    /// Charging state.
    pub battery_state: BatteryState,
    /// Process resident-set size in bytes (0 when the probe failed).
    pub rss_bytes: u64,
    /// Memory still available to the process in bytes.
    pub available_bytes: u64,
    /// Platform low-power mode flag.
    pub low_power: bool,
}

impl TelemetrySample {
    /// A sample with no pressure on any axis; test and fallback baseline.
    #[must_use]
    pub fn nominal(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            thermal: ThermalLevel::Nominal,
            battery_level: None,
            battery_state: BatteryState::Unknown,
            rss_bytes: 0,
            available_bytes: u64::MAX,
            low_power: false,
        }
    }
}

/// A source of pressure samples, polled on the telemetry tick.
///
/// Implementations are per-platform; the trait is the swap point for target
/// OSes and for tests.
pub trait PressureSource: Send + 'static {
    /// Read the current signals. Errors are logged and suppressed by the
    /// telemetry service; polling continues.
    fn poll(&mut self) -> std::io::Result<TelemetrySample>;
}

/// Pressure probe backed by the host OS.
///
/// Missing-signal policy: thermal defaults to nominal where the platform has
/// no thermal API, battery is unknown without a battery, RSS failures log
/// and substitute zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformPressureSource;

impl PlatformPressureSource {
    /// Create the platform probe.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PressureSource for PlatformPressureSource {
    fn poll(&mut self) -> std::io::Result<TelemetrySample> {
        let rss_bytes = match probe::rss_bytes() {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "rss probe failed; substituting zero");
                0
            }
        };
        let available_bytes = match probe::available_bytes() {
            Ok(v) => v,
            Err(err) => {
                // Treat a missing availability signal as unconstrained; zero
                // would read as exhausted memory and pause the runtime.
                warn!(error = %err, "available-memory probe failed; treating as unconstrained");
                u64::MAX
            }
        };
        Ok(TelemetrySample {
            timestamp_ms: now_ms(),
            thermal: ThermalLevel::Nominal,
            battery_level: None,
            battery_state: BatteryState::Unknown,
            rss_bytes,
            available_bytes,
            low_power: false,
        })
    }
}

/// Scripted pressure source for tests and development.
///
/// Samples are served in push order; when the queue runs dry the most recent
/// sample repeats with a fresh timestamp.
#[derive(Debug, Clone, Default)]
pub struct ManualPressureSource {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    queue: VecDeque<TelemetrySample>,
    last: Option<TelemetrySample>,
}

impl ManualPressureSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one sample.
    pub fn push(&self, sample: TelemetrySample) {
        self.lock().queue.push_back(sample);
    }

    /// Queue several samples in order.
    pub fn push_many(&self, samples: impl IntoIterator<Item = TelemetrySample>) {
        let mut state = self.lock();
        state.queue.extend(samples);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PressureSource for ManualPressureSource {
    fn poll(&mut self) -> std::io::Result<TelemetrySample> {
        let mut state = self.lock();
        let sample = match state.queue.pop_front() {
            Some(sample) => sample,
            None => {
                let mut repeat = state.last.unwrap_or_else(|| TelemetrySample::nominal(now_ms()));
                repeat.timestamp_ms = repeat.timestamp_ms.max(now_ms());
                repeat
            }
        };
        state.last = Some(sample);
        Ok(sample)
    }
}

/// Telemetry service configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Poll cadence.
    pub poll_interval: Duration,
    /// Broadcast channel capacity; slow consumers drop samples.
    pub channel_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            channel_capacity: 256,
        }
    }
}

enum TelemetryRequest {
    PollNow(oneshot::Sender<Option<TelemetrySample>>),
}

/// Polls a [`PressureSource`] on an interval and fans samples out.
///
/// Samples are emitted in timestamp order; late samples are discarded. The
/// thermal channel is edge-triggered, at most one event per level change.
#[derive(Debug)]
pub struct Telemetry {
    sample_tx: broadcast::Sender<TelemetrySample>,
    thermal_tx: broadcast::Sender<ThermalLevel>,
    latest_rx: watch::Receiver<Option<TelemetrySample>>,
    request_tx: mpsc::Sender<TelemetryRequest>,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Telemetry {
    /// Start the polling task.
    #[must_use]
    pub fn start(source: Box<dyn PressureSource>, config: TelemetryConfig) -> Self {
        let (sample_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let (thermal_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let (latest_tx, latest_rx) = watch::channel(None);
        let (request_tx, request_rx) = mpsc::channel(8);
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        tokio::spawn(run_poll_loop(
            source,
            config,
            sample_tx.clone(),
            thermal_tx.clone(),
            latest_tx,
            request_rx,
            Arc::clone(&stopped),
            Arc::clone(&stop_notify),
        ));

        Self {
            sample_tx,
            thermal_tx,
            latest_rx,
            request_tx,
            stopped,
            stop_notify,
        }
    }

    /// Subscribe to the sample stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySample> {
        self.sample_tx.subscribe()
    }

    /// Subscribe to edge-triggered thermal level changes.
    #[must_use]
    pub fn thermal_changes(&self) -> broadcast::Receiver<ThermalLevel> {
        self.thermal_tx.subscribe()
    }

    /// Most recent sample, if any poll has succeeded.
    #[must_use]
    pub fn latest(&self) -> Option<TelemetrySample> {
        *self.latest_rx.borrow()
    }

    /// Poll immediately, off-cadence, and return the fresh sample.
    pub async fn poll_now(&self) -> Option<TelemetrySample> {
        let (tx, rx) = oneshot::channel();
        if self
            .request_tx
            .send(TelemetryRequest::PollNow(tx))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Stop the polling task. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_notify.notify_waiters();
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_poll_loop(
    mut source: Box<dyn PressureSource>,
    config: TelemetryConfig,
    sample_tx: broadcast::Sender<TelemetrySample>,
    thermal_tx: broadcast::Sender<ThermalLevel>,
    latest_tx: watch::Sender<Option<TelemetrySample>>,
    mut request_rx: mpsc::Receiver<TelemetryRequest>,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) {
    let mut tick = tokio::time::interval(config.poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_ts: i64 = i64::MIN;
    let mut last_thermal: Option<ThermalLevel> = None;

    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = tick.tick() => {
                let _ = poll_once(
                    &mut source,
                    &sample_tx,
                    &thermal_tx,
                    &latest_tx,
                    &mut last_ts,
                    &mut last_thermal,
                );
            }
            req = request_rx.recv() => {
                match req {
                    Some(TelemetryRequest::PollNow(reply)) => {
                        let sample = poll_once(
                            &mut source,
                            &sample_tx,
                            &thermal_tx,
                            &latest_tx,
                            &mut last_ts,
                            &mut last_thermal,
                        );
                        let _ = reply.send(sample);
                    }
                    None => break,
                }
            }
            _ = stop_notify.notified() => break,
        }
    }
}

fn poll_once(
    source: &mut Box<dyn PressureSource>,
    sample_tx: &broadcast::Sender<TelemetrySample>,
    thermal_tx: &broadcast::Sender<ThermalLevel>,
    latest_tx: &watch::Sender<Option<TelemetrySample>>,
    last_ts: &mut i64,
    last_thermal: &mut Option<ThermalLevel>,
) -> Option<TelemetrySample> {
    let sample = match source.poll() {
        Ok(sample) => sample,
        Err(err) => {
            warn!(error = %err, "telemetry poll failed; continuing");
            return None;
        }
    };

    if sample.timestamp_ms < *last_ts {
        debug!(
            sample_ts = sample.timestamp_ms,
            last_ts = *last_ts,
            "discarding late telemetry sample"
        );
        return None;
    }
    *last_ts = sample.timestamp_ms;

    let _ = latest_tx.send(Some(sample));
    let _ = sample_tx.send(sample);

    if *last_thermal != Some(sample.thermal) {
        *last_thermal = Some(sample.thermal);
        let _ = thermal_tx.send(sample.thermal);
    }

    Some(sample)
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(unix)]
mod probe {
    //! Host memory probes. Linux reads procfs; other unix targets fall back
    //! to `getrusage`, which reports peak rather than current RSS.

    use std::io;

    pub(super) fn rss_bytes() -> io::Result<u64> {
        #[cfg(target_os = "linux")]
        {
            let statm = std::fs::read_to_string("/proc/self/statm")?;
            let resident_pages: u64 = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| io::Error::other("malformed /proc/self/statm"))?;
            Ok(resident_pages * page_size())
        }
        #[cfg(not(target_os = "linux"))]
        {
            // SAFETY: getrusage with a zeroed out-param is always safe.
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            // ru_maxrss is bytes on macOS, kilobytes elsewhere.
            #[cfg(target_os = "macos")]
            let bytes = usage.ru_maxrss as u64;
            #[cfg(not(target_os = "macos"))]
            let bytes = usage.ru_maxrss as u64 * 1024;
            Ok(bytes)
        }
    }

    pub(super) fn available_bytes() -> io::Result<u64> {
        #[cfg(target_os = "linux")]
        {
            let meminfo = std::fs::read_to_string("/proc/meminfo")?;
            if let Some(kb) = meminfo_field(&meminfo, "MemAvailable:") {
                return Ok(kb * 1024);
            }
            // Older kernels: free + inactive approximates available.
            let free = meminfo_field(&meminfo, "MemFree:").unwrap_or(0);
            let inactive = meminfo_field(&meminfo, "Inactive:").unwrap_or(0);
            Ok((free + inactive) * 1024)
        }
        #[cfg(not(target_os = "linux"))]
        {
            // No portable per-process availability signal off Linux; the
            // caller substitutes "unconstrained".
            Err(io::Error::other("no availability probe on this platform"))
        }
    }

    #[cfg(target_os = "linux")]
    fn page_size() -> u64 {
        // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as u64 } else { 4096 }
    }

    #[cfg(target_os = "linux")]
    fn meminfo_field(meminfo: &str, key: &str) -> Option<u64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }
}

#[cfg(not(unix))]
mod probe {
    use std::io;

    pub(super) fn rss_bytes() -> io::Result<u64> {
        Err(io::Error::other("no rss probe on this platform"))
    }

    pub(super) fn available_bytes() -> io::Result<u64> {
        Err(io::Error::other("no memory probe on this platform"))
    }
}
