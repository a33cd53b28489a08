use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::VOLUME_DELTA;
use crate::peek::PeekKind;

/// Failure taxonomy for hardware collaborators. None of these are fatal:
/// callers disable the affected feature and move on.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("hardware adapter unavailable")]
    Unavailable,
    #[error("all strategies failed")]
    Exhausted,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

fn classify_io(e: io::Error) -> AdapterError {
    match e.kind() {
        io::ErrorKind::NotFound => AdapterError::Unavailable,
        io::ErrorKind::PermissionDenied => AdapterError::PermissionDenied,
        _ => AdapterError::Io(e),
    }
}

/// Output volume and mute, normalized to [0, 1].
pub trait VolumeAdapter: Send + Sync {
    fn volume(&self) -> AdapterResult<f32>;
    fn set_volume(&self, value: f32) -> AdapterResult<()>;
    fn muted(&self) -> AdapterResult<bool>;
    fn set_muted(&self, muted: bool) -> AdapterResult<()>;
}

pub trait BrightnessAdapter: Send + Sync {
    fn brightness(&self) -> AdapterResult<f32>;
    fn set_brightness(&self, value: f32) -> AdapterResult<()>;
}

pub trait BacklightAdapter: Send + Sync {
    fn backlight(&self) -> AdapterResult<f32>;
    fn set_backlight(&self, value: f32) -> AdapterResult<()>;
}

pub trait MicAdapter: Send + Sync {
    fn muted(&self) -> AdapterResult<bool>;
    fn set_muted(&self, muted: bool) -> AdapterResult<()>;
}

/// Identifier of the frontmost application, used to attribute captures.
pub trait FrontmostApp: Send + Sync {
    fn bundle_id(&self) -> Option<String>;
}

/// One way of reading/writing a normalized hardware level.
pub trait LevelStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self) -> AdapterResult<f32>;
    fn set(&self, value: f32) -> AdapterResult<()>;
}

/// Ordered fallback over level strategies. The first success wins and its
/// index is cached, so strategies that already failed are not retried on
/// later calls; when every strategy fails the chain reports `Exhausted`.
pub struct StrategyChain {
    strategies: Vec<Box<dyn LevelStrategy>>,
    active: AtomicUsize,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Box<dyn LevelStrategy>>) -> Self {
        Self {
            strategies,
            active: AtomicUsize::new(0),
        }
    }

    fn try_each<T>(&self, op: impl Fn(&dyn LevelStrategy) -> AdapterResult<T>) -> AdapterResult<T> {
        let start = self.active.load(Ordering::Relaxed);
        for idx in start..self.strategies.len() {
            let strategy = self.strategies[idx].as_ref();
            match op(strategy) {
                Ok(value) => {
                    self.active.store(idx, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) => {
                    log::debug!("Strategy {} failed: {e}", strategy.name());
                    self.active.store(idx + 1, Ordering::Relaxed);
                }
            }
        }
        Err(AdapterError::Exhausted)
    }

    pub fn get(&self) -> AdapterResult<f32> {
        self.try_each(|s| s.get())
    }

    pub fn set(&self, value: f32) -> AdapterResult<()> {
        self.try_each(|s| s.set(value))
    }
}

impl BrightnessAdapter for StrategyChain {
    fn brightness(&self) -> AdapterResult<f32> {
        self.get()
    }

    fn set_brightness(&self, value: f32) -> AdapterResult<()> {
        self.set(value)
    }
}

impl BacklightAdapter for StrategyChain {
    fn backlight(&self) -> AdapterResult<f32> {
        self.get()
    }

    fn set_backlight(&self, value: f32) -> AdapterResult<()> {
        self.set(value)
    }
}

/// sysfs-backed level device: a directory with `brightness` and
/// `max_brightness` attribute files. Covers both display backlights
/// (/sys/class/backlight/<dev>) and keyboard backlight LEDs
/// (/sys/class/leds/<dev>).
pub struct SysfsLevel {
    device: PathBuf,
    name: &'static str,
}

impl SysfsLevel {
    pub fn new(device: PathBuf, name: &'static str) -> Self {
        Self { device, name }
    }

    /// Enumerates usable devices under `root`, optionally filtered by a
    /// directory-name substring. One strategy per device, in directory
    /// order, so a dead primary device falls through to the next one.
    pub fn discover(
        root: &Path,
        name: &'static str,
        filter: Option<&str>,
    ) -> AdapterResult<Vec<SysfsLevel>> {
        let mut devices = Vec::new();
        let read = fs::read_dir(root).map_err(classify_io)?;
        let mut dirs: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                filter.is_none_or(|needle| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().contains(needle))
                        .unwrap_or(false)
                })
            })
            .collect();
        dirs.sort();

        for dir in dirs {
            if dir.join("brightness").exists() && dir.join("max_brightness").exists() {
                devices.push(SysfsLevel::new(dir, name));
            }
        }

        if devices.is_empty() {
            return Err(AdapterError::Unavailable);
        }
        Ok(devices)
    }

    fn read_attr(&self, attr: &str) -> AdapterResult<u64> {
        let raw = fs::read_to_string(self.device.join(attr)).map_err(classify_io)?;
        raw.trim().parse().map_err(|_| AdapterError::Unavailable)
    }
}

impl LevelStrategy for SysfsLevel {
    fn name(&self) -> &'static str {
        self.name
    }

    fn get(&self) -> AdapterResult<f32> {
        let max = self.read_attr("max_brightness")?;
        if max == 0 {
            return Err(AdapterError::Unavailable);
        }
        let current = self.read_attr("brightness")?;
        Ok((current as f32 / max as f32).clamp(0.0, 1.0))
    }

    fn set(&self, value: f32) -> AdapterResult<()> {
        let max = self.read_attr("max_brightness")?;
        if max == 0 {
            return Err(AdapterError::Unavailable);
        }
        let raw = (value.clamp(0.0, 1.0) * max as f32).round() as u64;
        fs::write(self.device.join("brightness"), raw.to_string()).map_err(classify_io)
    }
}

/// Display brightness chain over /sys/class/backlight devices.
pub fn display_brightness_chain() -> AdapterResult<StrategyChain> {
    let devices = SysfsLevel::discover(Path::new("/sys/class/backlight"), "sysfs-backlight", None)?;
    Ok(StrategyChain::new(
        devices.into_iter().map(|d| Box::new(d) as Box<dyn LevelStrategy>).collect(),
    ))
}

/// Keyboard backlight chain over /sys/class/leds kbd_backlight devices.
pub fn keyboard_backlight_chain() -> AdapterResult<StrategyChain> {
    let devices = SysfsLevel::discover(
        Path::new("/sys/class/leds"),
        "sysfs-kbd-backlight",
        Some("kbd_backlight"),
    )?;
    Ok(StrategyChain::new(
        devices.into_iter().map(|d| Box::new(d) as Box<dyn LevelStrategy>).collect(),
    ))
}

/// A peek request produced by a hardware listener, handed to the daemon
/// for publication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeekTrigger {
    pub kind: PeekKind,
    pub value: f32,
}

/// Samples the output volume and fires on changes past the delta
/// threshold. A muted device reads as volume 0. Exactly reaching 1.0 is
/// terminal: the trigger still fires once but the changing flag clears so
/// the peek is not kept alive further.
pub struct VolumeListener {
    adapter: Arc<dyn VolumeAdapter>,
    last: Option<f32>,
    changing: bool,
    delta: f32,
}

impl VolumeListener {
    pub fn new(adapter: Arc<dyn VolumeAdapter>) -> Self {
        Self {
            adapter,
            last: None,
            changing: false,
            delta: VOLUME_DELTA,
        }
    }

    pub fn is_changing(&self) -> bool {
        self.changing
    }

    fn effective_volume(&self) -> AdapterResult<f32> {
        let volume = self.adapter.volume()?;
        if self.adapter.muted().unwrap_or(false) {
            Ok(0.0)
        } else {
            Ok(volume)
        }
    }

    /// Establishes the baseline; false when the adapter is unusable.
    pub fn prime(&mut self) -> bool {
        match self.effective_volume() {
            Ok(volume) => {
                self.last = Some(volume);
                true
            }
            Err(_) => false,
        }
    }

    pub fn sample(&mut self) -> Option<PeekTrigger> {
        let volume = self.effective_volume().ok()?;
        let prev = self.last;
        self.last = Some(volume);

        match prev {
            None => None,
            Some(prev) if (volume - prev).abs() > self.delta => {
                self.changing = volume < 1.0;
                Some(PeekTrigger {
                    kind: PeekKind::Volume,
                    value: volume,
                })
            }
            _ => None,
        }
    }
}

/// Polls display brightness; any observed delta fires.
pub struct BrightnessListener {
    adapter: Arc<dyn BrightnessAdapter>,
    last: Option<f32>,
}

impl BrightnessListener {
    pub fn new(adapter: Arc<dyn BrightnessAdapter>) -> Self {
        Self {
            adapter,
            last: None,
        }
    }

    pub fn prime(&mut self) -> bool {
        match self.adapter.brightness() {
            Ok(value) => {
                self.last = Some(value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn sample(&mut self) -> Option<PeekTrigger> {
        let value = self.adapter.brightness().ok()?;
        let prev = self.last;
        self.last = Some(value);

        match prev {
            Some(prev) if value != prev => Some(PeekTrigger {
                kind: PeekKind::Brightness,
                value,
            }),
            _ => None,
        }
    }
}

/// Samples keyboard backlight level with the same delta rule as volume.
pub struct BacklightListener {
    adapter: Arc<dyn BacklightAdapter>,
    last: Option<f32>,
    delta: f32,
}

impl BacklightListener {
    pub fn new(adapter: Arc<dyn BacklightAdapter>) -> Self {
        Self {
            adapter,
            last: None,
            delta: VOLUME_DELTA,
        }
    }

    pub fn prime(&mut self) -> bool {
        match self.adapter.backlight() {
            Ok(value) => {
                self.last = Some(value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn sample(&mut self) -> Option<PeekTrigger> {
        let value = self.adapter.backlight().ok()?;
        let prev = self.last;
        self.last = Some(value);

        match prev {
            Some(prev) if (value - prev).abs() > self.delta => Some(PeekTrigger {
                kind: PeekKind::Backlight,
                value,
            }),
            _ => None,
        }
    }
}

/// Microphone mute. Fires a peek on every explicit toggle; the value is
/// 1 when the mic ends up live, 0 when it ends up muted.
pub struct MicListener {
    adapter: Arc<dyn MicAdapter>,
}

impl MicListener {
    pub fn new(adapter: Arc<dyn MicAdapter>) -> Self {
        Self { adapter }
    }

    pub fn toggle(&self) -> AdapterResult<PeekTrigger> {
        let was_muted = self.adapter.muted()?;
        self.adapter.set_muted(!was_muted)?;
        Ok(PeekTrigger {
            kind: PeekKind::Mic,
            value: if was_muted { 1.0 } else { 0.0 },
        })
    }
}

/// Handle to a spawned listener task. Dropping it unsubscribes; the task
/// is aborted and never outlives its owner.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn from_handle(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn spawn_volume_listener(
    adapter: Arc<dyn VolumeAdapter>,
    tx: mpsc::Sender<PeekTrigger>,
    period: Duration,
) -> Subscription {
    let mut listener = VolumeListener::new(adapter);
    let handle = tokio::spawn(async move {
        if !listener.prime() {
            log::info!("Output volume unavailable, listener disabled");
            return;
        }
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Some(trigger) = listener.sample() {
                if tx.send(trigger).await.is_err() {
                    break;
                }
            }
        }
    });
    Subscription { handle }
}

pub fn spawn_brightness_listener(
    adapter: Arc<dyn BrightnessAdapter>,
    tx: mpsc::Sender<PeekTrigger>,
    period: Duration,
) -> Subscription {
    let mut listener = BrightnessListener::new(adapter);
    let handle = tokio::spawn(async move {
        if !listener.prime() {
            log::info!("Display brightness unavailable, listener disabled");
            return;
        }
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Some(trigger) = listener.sample() {
                if tx.send(trigger).await.is_err() {
                    break;
                }
            }
        }
    });
    Subscription { handle }
}

pub fn spawn_backlight_listener(
    adapter: Arc<dyn BacklightAdapter>,
    tx: mpsc::Sender<PeekTrigger>,
    period: Duration,
) -> Subscription {
    let mut listener = BacklightListener::new(adapter);
    let handle = tokio::spawn(async move {
        if !listener.prime() {
            log::info!("Keyboard backlight unavailable, listener disabled");
            return;
        }
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Some(trigger) = listener.sample() {
                if tx.send(trigger).await.is_err() {
                    break;
                }
            }
        }
    });
    Subscription { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::task::yield_now;
    use tokio::time::advance;

    struct FlakyStrategy {
        fails: bool,
        calls: Arc<AtomicUsize>,
    }

    impl LevelStrategy for FlakyStrategy {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn get(&self) -> AdapterResult<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                Err(AdapterError::Unavailable)
            } else {
                Ok(0.5)
            }
        }

        fn set(&self, _value: f32) -> AdapterResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                Err(AdapterError::Unavailable)
            } else {
                Ok(())
            }
        }
    }

    fn chain_of(specs: &[(bool, Arc<AtomicUsize>)]) -> StrategyChain {
        StrategyChain::new(
            specs
                .iter()
                .map(|(fails, calls)| {
                    Box::new(FlakyStrategy {
                        fails: *fails,
                        calls: Arc::clone(calls),
                    }) as Box<dyn LevelStrategy>
                })
                .collect(),
        )
    }

    #[test]
    fn chain_skips_known_failed_strategies() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let chain = chain_of(&[(true, Arc::clone(&first)), (false, Arc::clone(&second))]);

        assert_eq!(chain.get().unwrap(), 0.5);
        assert_eq!(chain.get().unwrap(), 0.5);

        // the failed strategy was only consulted on the first call
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exhausted_chain_reports_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain_of(&[(true, Arc::clone(&calls))]);

        assert!(matches!(chain.get(), Err(AdapterError::Exhausted)));
        assert!(matches!(chain.get(), Err(AdapterError::Exhausted)));
        // not retried once it failed
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn sysfs_device(dir: &TempDir, name: &str, brightness: u64, max: u64) -> PathBuf {
        let device = dir.path().join(name);
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("brightness"), brightness.to_string()).unwrap();
        fs::write(device.join("max_brightness"), max.to_string()).unwrap();
        device
    }

    #[test]
    fn sysfs_level_round_trips() {
        let dir = TempDir::new().unwrap();
        let device = sysfs_device(&dir, "intel_backlight", 128, 255);
        let level = SysfsLevel::new(device.clone(), "sysfs-backlight");

        let value = level.get().unwrap();
        assert!((value - 128.0 / 255.0).abs() < 1e-6);

        level.set(1.0).unwrap();
        assert_eq!(fs::read_to_string(device.join("brightness")).unwrap(), "255");
    }

    #[test]
    fn discover_requires_attribute_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("empty_device")).unwrap();

        assert!(matches!(
            SysfsLevel::discover(dir.path(), "sysfs-backlight", None),
            Err(AdapterError::Unavailable)
        ));
    }

    #[test]
    fn discover_filters_by_device_name() {
        let dir = TempDir::new().unwrap();
        sysfs_device(&dir, "tpacpi::kbd_backlight", 1, 2);
        sysfs_device(&dir, "input3::capslock", 0, 1);

        let devices =
            SysfsLevel::discover(dir.path(), "sysfs-kbd-backlight", Some("kbd_backlight"))
                .unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[derive(Default)]
    struct FakeVolume {
        volume: Mutex<f32>,
        muted: Mutex<bool>,
    }

    impl VolumeAdapter for FakeVolume {
        fn volume(&self) -> AdapterResult<f32> {
            Ok(*self.volume.lock())
        }

        fn set_volume(&self, value: f32) -> AdapterResult<()> {
            *self.volume.lock() = value;
            Ok(())
        }

        fn muted(&self) -> AdapterResult<bool> {
            Ok(*self.muted.lock())
        }

        fn set_muted(&self, muted: bool) -> AdapterResult<()> {
            *self.muted.lock() = muted;
            Ok(())
        }
    }

    #[test]
    fn volume_listener_fires_only_past_the_delta() {
        let adapter = Arc::new(FakeVolume::default());
        let mut listener = VolumeListener::new(Arc::clone(&adapter) as Arc<dyn VolumeAdapter>);
        assert!(listener.prime());

        adapter.set_volume(0.001).unwrap();
        assert!(listener.sample().is_none());

        adapter.set_volume(0.4).unwrap();
        let trigger = listener.sample().unwrap();
        assert_eq!(trigger.kind, PeekKind::Volume);
        assert_eq!(trigger.value, 0.4);
        assert!(listener.is_changing());
    }

    #[test]
    fn exact_max_volume_fires_once_and_clears_changing() {
        let adapter = Arc::new(FakeVolume::default());
        let mut listener = VolumeListener::new(Arc::clone(&adapter) as Arc<dyn VolumeAdapter>);
        assert!(listener.prime());

        adapter.set_volume(1.0).unwrap();
        let trigger = listener.sample().unwrap();
        assert_eq!(trigger.value, 1.0);
        assert!(!listener.is_changing());

        // repeated max samples stay silent
        assert!(listener.sample().is_none());
    }

    #[test]
    fn muted_volume_reads_as_zero() {
        let adapter = Arc::new(FakeVolume::default());
        adapter.set_volume(0.8).unwrap();
        let mut listener = VolumeListener::new(Arc::clone(&adapter) as Arc<dyn VolumeAdapter>);
        assert!(listener.prime());

        adapter.set_muted(true).unwrap();
        let trigger = listener.sample().unwrap();
        assert_eq!(trigger.value, 0.0);
    }

    #[test]
    fn brightness_listener_fires_on_any_delta() {
        let dir = TempDir::new().unwrap();
        let device = sysfs_device(&dir, "acpi_video0", 10, 100);
        let chain = StrategyChain::new(vec![
            Box::new(SysfsLevel::new(device.clone(), "sysfs-backlight")) as Box<dyn LevelStrategy>,
        ]);
        let adapter: Arc<dyn BrightnessAdapter> = Arc::new(chain);
        let mut listener = BrightnessListener::new(adapter);
        assert!(listener.prime());

        assert!(listener.sample().is_none());

        fs::write(device.join("brightness"), "11").unwrap();
        let trigger = listener.sample().unwrap();
        assert_eq!(trigger.kind, PeekKind::Brightness);
    }

    #[derive(Default)]
    struct FakeMic {
        muted: Mutex<bool>,
    }

    impl MicAdapter for FakeMic {
        fn muted(&self) -> AdapterResult<bool> {
            Ok(*self.muted.lock())
        }

        fn set_muted(&self, muted: bool) -> AdapterResult<()> {
            *self.muted.lock() = muted;
            Ok(())
        }
    }

    #[test]
    fn mic_toggle_fires_with_liveness_value() {
        let adapter = Arc::new(FakeMic::default());
        let listener = MicListener::new(Arc::clone(&adapter) as Arc<dyn MicAdapter>);

        // live -> muted
        let trigger = listener.toggle().unwrap();
        assert_eq!(trigger.kind, PeekKind::Mic);
        assert_eq!(trigger.value, 0.0);
        assert!(adapter.muted().unwrap());

        // muted -> live
        let trigger = listener.toggle().unwrap();
        assert_eq!(trigger.value, 1.0);
        assert!(!adapter.muted().unwrap());
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_listener_hands_triggers_over_the_channel() {
        let adapter = Arc::new(FakeVolume::default());
        let (tx, mut rx) = mpsc::channel(8);
        let _sub = spawn_volume_listener(
            Arc::clone(&adapter) as Arc<dyn VolumeAdapter>,
            tx,
            Duration::from_millis(100),
        );

        settle().await;
        adapter.set_volume(0.6).unwrap();
        advance(Duration::from_millis(150)).await;
        settle().await;

        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.kind, PeekKind::Volume);
        assert_eq!(trigger.value, 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_subscription_stops_the_listener() {
        let adapter = Arc::new(FakeVolume::default());
        let (tx, mut rx) = mpsc::channel(8);
        let sub = spawn_volume_listener(
            Arc::clone(&adapter) as Arc<dyn VolumeAdapter>,
            tx,
            Duration::from_millis(100),
        );

        settle().await;
        drop(sub);
        settle().await;

        adapter.set_volume(0.9).unwrap();
        advance(Duration::from_millis(300)).await;
        settle().await;

        // channel closed because the task was aborted with the sender
        assert!(rx.try_recv().is_err());
    }
}
