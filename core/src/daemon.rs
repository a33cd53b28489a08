use anyhow::{Context, Result};
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::adapters::{
    self, BacklightAdapter, BrightnessAdapter, FrontmostApp, MicAdapter, MicListener, PeekTrigger,
    Subscription, VolumeAdapter,
};
use crate::downloads::{self, DownloadState};
use crate::peek::{PeekController, PeekKind, SneakPeek};
use crate::search::{self, SearchHandle, SearchResults};
use crate::store::{ClipboardStore, ContentKind, Pasteboard};
use crate::{
    BRIGHTNESS_POLL_INTERVAL_MS, Config, DOWNLOAD_POLL_INTERVAL_MS, HASH_PREFIX_LEN,
    PASTEBOARD_POLL_INTERVAL_MS, VOLUME_POLL_INTERVAL_MS,
};

const IPC_MAGIC: &[u8] = b"NTCH\x00\x01";
const MAX_IPC_MESSAGE_SIZE: usize = 4096;
// retention sweep every ~100 seconds at the pasteboard poll cadence
const SWEEP_EVERY_TICKS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotchState {
    #[default]
    Closed,
    Open,
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Copy(String),
    Search(String),
    Clear,
    MicToggle,
    Exit,
}

fn parse_command(buf: &[u8]) -> Option<Command> {
    if buf.len() <= IPC_MAGIC.len() || &buf[..IPC_MAGIC.len()] != IPC_MAGIC {
        return None;
    }
    let cmd = std::str::from_utf8(&buf[IPC_MAGIC.len()..]).ok()?.trim();

    if let Some(selection) = cmd.strip_prefix("COPY:") {
        Some(Command::Copy(selection.to_string()))
    } else if let Some(query) = cmd.strip_prefix("SEARCH:") {
        Some(Command::Search(query.to_string()))
    } else if cmd == "CLEAR" {
        Some(Command::Clear)
    } else if cmd == "MIC" {
        Some(Command::MicToggle)
    } else if cmd == "EXIT" {
        Some(Command::Exit)
    } else {
        None
    }
}

/// Observable state the UI layer subscribes to. The engine never calls
/// into rendering; these receivers are the whole outward surface.
pub struct Surface {
    pub notch_state: watch::Receiver<NotchState>,
    pub sneak_peek: watch::Receiver<SneakPeek>,
    pub search_results: watch::Receiver<SearchResults>,
    pub downloads: watch::Receiver<DownloadState>,
}

struct Hotkeys {
    _manager: GlobalHotKeyManager,
    panel: u32,
    backlight_up: u32,
    backlight_down: u32,
}

/// Registers the named shortcut set: clipboard-history-panel toggle and
/// backlight step up/down. Failure disables shortcuts, nothing else.
fn register_hotkeys() -> Option<Hotkeys> {
    let manager = match GlobalHotKeyManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            log::info!("Global shortcuts unavailable: {e}");
            return None;
        }
    };

    let panel = HotKey::new(Some(Modifiers::SHIFT | Modifiers::SUPER), Code::KeyC);
    let up = HotKey::new(Some(Modifiers::SHIFT | Modifiers::SUPER), Code::Period);
    let down = HotKey::new(Some(Modifiers::SHIFT | Modifiers::SUPER), Code::Comma);
    let (panel_id, up_id, down_id) = (panel.id(), up.id(), down.id());

    for hotkey in [panel, up, down] {
        if let Err(e) = manager.register(hotkey) {
            log::info!("Failed to register global shortcut: {e}");
            return None;
        }
    }

    Some(Hotkeys {
        _manager: manager,
        panel: panel_id,
        backlight_up: up_id,
        backlight_down: down_id,
    })
}

/// The engine daemon: owns the store, the search worker, the peek
/// controller and the hardware listeners, and multiplexes their events on
/// one task. Listener callbacks never mutate shared state directly; they
/// hand triggers over a channel and this task publishes.
pub struct Daemon {
    store: Arc<RwLock<ClipboardStore>>,
    pasteboard: Box<dyn Pasteboard>,
    peek: PeekController,
    search: SearchHandle,
    notch_tx: watch::Sender<NotchState>,
    downloads_rx: watch::Receiver<DownloadState>,
    _downloads_sub: Option<Subscription>,
    _downloads_tx: Option<watch::Sender<DownloadState>>,
    trigger_tx: mpsc::Sender<PeekTrigger>,
    trigger_rx: Option<mpsc::Receiver<PeekTrigger>>,
    subscriptions: Vec<Subscription>,
    mic: Option<MicListener>,
    backlight: Option<Arc<dyn BacklightAdapter>>,
    backlight_step: f32,
    hotkeys: Option<Hotkeys>,
}

impl Daemon {
    /// Must be called from within a tokio runtime: the search worker and
    /// the download watcher are spawned here.
    pub fn new(config: Config, pasteboard: Box<dyn Pasteboard>) -> Result<Self> {
        let store = Arc::new(RwLock::new(
            ClipboardStore::open(&config).context("Failed to open clipboard store")?,
        ));
        let search = search::spawn(Arc::clone(&store));
        let (notch_tx, _) = watch::channel(NotchState::default());
        let (trigger_tx, trigger_rx) = mpsc::channel(32);

        let (downloads_sub, downloads_rx, downloads_tx) = match &config.downloads_dir {
            Some(dir) => {
                let (sub, rx) = downloads::spawn(
                    dir.clone(),
                    Duration::from_millis(DOWNLOAD_POLL_INTERVAL_MS),
                );
                (Some(sub), rx, None)
            }
            None => {
                let (tx, rx) = watch::channel(DownloadState::default());
                (None, rx, Some(tx))
            }
        };

        Ok(Self {
            store,
            pasteboard,
            peek: PeekController::new(),
            search,
            notch_tx,
            downloads_rx,
            _downloads_sub: downloads_sub,
            _downloads_tx: downloads_tx,
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            subscriptions: Vec::new(),
            mic: None,
            backlight: None,
            backlight_step: config.backlight_step,
            hotkeys: None,
        })
    }

    pub fn with_volume_adapter(mut self, adapter: Arc<dyn VolumeAdapter>) -> Self {
        self.subscriptions.push(adapters::spawn_volume_listener(
            adapter,
            self.trigger_tx.clone(),
            Duration::from_millis(VOLUME_POLL_INTERVAL_MS),
        ));
        self
    }

    pub fn with_brightness_adapter(mut self, adapter: Arc<dyn BrightnessAdapter>) -> Self {
        self.subscriptions.push(adapters::spawn_brightness_listener(
            adapter,
            self.trigger_tx.clone(),
            Duration::from_millis(BRIGHTNESS_POLL_INTERVAL_MS),
        ));
        self
    }

    pub fn with_backlight_adapter(mut self, adapter: Arc<dyn BacklightAdapter>) -> Self {
        self.subscriptions.push(adapters::spawn_backlight_listener(
            Arc::clone(&adapter),
            self.trigger_tx.clone(),
            Duration::from_millis(BRIGHTNESS_POLL_INTERVAL_MS),
        ));
        self.backlight = Some(adapter);
        self
    }

    pub fn with_mic_adapter(mut self, adapter: Arc<dyn MicAdapter>) -> Self {
        self.mic = Some(MicListener::new(adapter));
        self
    }

    pub fn with_frontmost_app(self, app: Arc<dyn FrontmostApp>) -> Self {
        self.store.write().set_frontmost(app);
        self
    }

    /// Wires up whatever sysfs-backed hardware this host exposes; missing
    /// hardware silently disables the matching feature.
    pub fn with_default_adapters(mut self) -> Self {
        match adapters::display_brightness_chain() {
            Ok(chain) => {
                self = self.with_brightness_adapter(Arc::new(chain));
            }
            Err(e) => log::info!("Display brightness disabled: {e}"),
        }
        match adapters::keyboard_backlight_chain() {
            Ok(chain) => {
                self = self.with_backlight_adapter(Arc::new(chain));
            }
            Err(e) => log::info!("Keyboard backlight disabled: {e}"),
        }
        self
    }

    pub fn surface(&self) -> Surface {
        Surface {
            notch_state: self.notch_tx.subscribe(),
            sneak_peek: self.peek.subscribe(),
            search_results: self.search.results(),
            downloads: self.downloads_rx.clone(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(10);
        self.hotkeys = register_hotkeys();

        #[cfg(unix)]
        let ipc = {
            let sock_path = socket_path();
            let tx = cmd_tx.clone();
            let path = sock_path.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = ipc_server(tx, path).await {
                    log::warn!("IPC server stopped: {e:#}");
                }
            });
            (handle, sock_path)
        };

        // hold a sender so cmd_rx stays open with or without IPC clients
        let _cmd_keepalive = cmd_tx;

        let mut trigger_rx = self
            .trigger_rx
            .take()
            .context("Daemon is already running")?;

        let mut poll = tokio::time::interval(Duration::from_millis(PASTEBOARD_POLL_INTERVAL_MS));
        let mut tick_count = 0u64;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let captured = {
                        let mut store = self.store.write();
                        store.refresh(self.pasteboard.as_mut())
                    };
                    if captured > 0 {
                        self.search.notify_store_changed();
                    }

                    self.poll_hotkeys();

                    tick_count += 1;
                    if tick_count % SWEEP_EVERY_TICKS == 0 {
                        let removed = self.store.write().sweep_expired();
                        if removed > 0 {
                            log::debug!("Expired {removed} clipboard entries");
                            self.search.notify_store_changed();
                        }
                    }
                }

                Some(trigger) = trigger_rx.recv() => {
                    self.peek.trigger(trigger.kind, trigger.value);
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Exit) => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }

        #[cfg(unix)]
        {
            let (handle, sock_path) = ipc;
            handle.abort();
            let _ = std::fs::remove_file(&sock_path);
        }

        self.trigger_rx = Some(trigger_rx);
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Copy(selection) => {
                if let Err(e) = self.copy_selection(&selection) {
                    log::warn!("Copy failed: {e:#}");
                }
            }
            Command::Search(query) => self.search.set_query(query),
            Command::Clear => {
                self.store.write().clear();
                self.search.notify_store_changed();
            }
            Command::MicToggle => self.toggle_mic(),
            Command::Exit => {}
        }
    }

    /// Selections carry an optional `#hashprefix` suffix referencing a
    /// stored entry; anything else is copied back as literal text.
    fn copy_selection(&mut self, selection: &str) -> Result<()> {
        if let Some(pos) = selection.rfind('#') {
            let hash = selection[pos + 1..]
                .split_whitespace()
                .next()
                .unwrap_or_default();

            if hash.len() >= HASH_PREFIX_LEN {
                let mut store = self.store.write();
                if store.copy_by_prefix(hash, self.pasteboard.as_mut()).is_ok() {
                    return Ok(());
                }
            }
        }

        self.store.write().write_back(
            ContentKind::Text,
            selection.as_bytes(),
            self.pasteboard.as_mut(),
        )
    }

    fn toggle_mic(&self) {
        let Some(mic) = &self.mic else {
            log::info!("Microphone adapter not configured");
            return;
        };
        match mic.toggle() {
            Ok(trigger) => self.peek.trigger(trigger.kind, trigger.value),
            Err(e) => log::info!("Microphone toggle failed: {e}"),
        }
    }

    fn poll_hotkeys(&mut self) {
        let Some(hotkeys) = &self.hotkeys else { return };
        let (panel, up, down) = (hotkeys.panel, hotkeys.backlight_up, hotkeys.backlight_down);

        while let Ok(event) = GlobalHotKeyEvent::receiver().try_recv() {
            if event.id == panel {
                self.toggle_panel();
            } else if event.id == up {
                self.step_backlight(self.backlight_step);
            } else if event.id == down {
                self.step_backlight(-self.backlight_step);
            }
        }
    }

    fn toggle_panel(&self) {
        let next = match *self.notch_tx.borrow() {
            NotchState::Closed => NotchState::Open,
            NotchState::Open => NotchState::Closed,
        };
        self.notch_tx.send_replace(next);
        if next == NotchState::Closed {
            // panel dismissal resets the filter
            self.search.set_query("");
        }
    }

    fn step_backlight(&self, delta: f32) {
        let Some(adapter) = &self.backlight else { return };
        match adapter.backlight() {
            Ok(current) => {
                let next = (current + delta).clamp(0.0, 1.0);
                if adapter.set_backlight(next).is_ok() {
                    self.peek.trigger(PeekKind::Backlight, next);
                }
            }
            Err(e) => log::debug!("Backlight read failed: {e}"),
        }
    }
}

pub fn socket_path() -> PathBuf {
    std::env::temp_dir().join("notchd.sock")
}

#[cfg(unix)]
async fn ipc_server(tx: mpsc::Sender<Command>, sock_path: PathBuf) -> Result<()> {
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o700))?;

    loop {
        let (mut stream, _addr) = listener.accept().await?;

        // only accept connections from our own user
        #[cfg(target_os = "linux")]
        {
            match stream.peer_cred() {
                Ok(cred) => {
                    let current_uid = unsafe { libc::getuid() };
                    if cred.uid() != current_uid {
                        continue;
                    }
                }
                Err(_) => continue,
            }
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_IPC_MESSAGE_SIZE];
            if let Ok(n) = stream.read(&mut buf).await {
                if let Some(cmd) = parse_command(&buf[..n]) {
                    let _ = tx.send(cmd).await;
                }
            }
        });
    }
}

/// Sends one command to a running daemon over the control socket.
pub async fn send_command(cmd: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::io::AsyncWriteExt;
        use tokio::net::UnixStream;
        use tokio::time::timeout;

        let sock_path = socket_path();
        let mut stream = timeout(Duration::from_secs(2), UnixStream::connect(&sock_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon")?;

        let mut msg = Vec::with_capacity(IPC_MAGIC.len() + cmd.len());
        msg.extend_from_slice(IPC_MAGIC);
        msg.extend_from_slice(cmd.as_bytes());
        stream.write_all(&msg).await?;
        stream.shutdown().await?;

        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = cmd;
        anyhow::bail!("Control channel unsupported on this platform")
    }
}

pub async fn send_copy_command(selection: &str) -> Result<()> {
    send_command(&format!("COPY:{selection}")).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterResult;
    use crate::store::{MemoryPasteboard, RawItem};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn msg(cmd: &str) -> Vec<u8> {
        let mut buf = IPC_MAGIC.to_vec();
        buf.extend_from_slice(cmd.as_bytes());
        buf
    }

    #[test]
    fn commands_parse_with_the_magic_header() {
        assert_eq!(
            parse_command(&msg("COPY:hello #deadbeef")),
            Some(Command::Copy("hello #deadbeef".to_string()))
        );
        assert_eq!(
            parse_command(&msg("SEARCH:query")),
            Some(Command::Search("query".to_string()))
        );
        assert_eq!(parse_command(&msg("CLEAR")), Some(Command::Clear));
        assert_eq!(parse_command(&msg("MIC")), Some(Command::MicToggle));
        assert_eq!(parse_command(&msg("EXIT")), Some(Command::Exit));
    }

    #[test]
    fn messages_without_the_magic_header_are_dropped() {
        assert_eq!(parse_command(b"CLEAR"), None);
        assert_eq!(parse_command(b"XXXX\x00\x01CLEAR"), None);
        assert_eq!(parse_command(&msg("NOT-A-COMMAND")), None);
        assert_eq!(parse_command(IPC_MAGIC), None);
    }

    fn test_daemon(dir: &TempDir) -> Daemon {
        let config = Config {
            history_path: dir.path().join("history.json"),
            downloads_dir: None,
            ..Config::default()
        };
        Daemon::new(config, Box::new(MemoryPasteboard::new())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn clear_command_empties_the_store() {
        let dir = TempDir::new().unwrap();
        let mut daemon = test_daemon(&dir);

        daemon.store.write().capture(&RawItem::text("doomed"));
        daemon.handle_command(Command::Clear);
        assert!(daemon.store.read().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn copy_selection_resolves_hash_prefixes() {
        let dir = TempDir::new().unwrap();
        let mut daemon = test_daemon(&dir);

        daemon.store.write().capture(&RawItem::text("stored payload"));
        let prefix = daemon.store.read().entries()[0].hash_prefix();

        daemon
            .copy_selection(&format!("stored payload #{prefix}"))
            .unwrap();

        let items = daemon.pasteboard.items();
        assert_eq!(
            items[0].representation(ContentKind::Text).unwrap(),
            b"stored payload"
        );
        // the write-back generation is not re-captured
        let captured = {
            let mut store = daemon.store.write();
            store.refresh(daemon.pasteboard.as_mut())
        };
        assert_eq!(captured, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_selection_falls_back_to_literal_text() {
        let dir = TempDir::new().unwrap();
        let mut daemon = test_daemon(&dir);

        daemon.copy_selection("free form text").unwrap();
        let items = daemon.pasteboard.items();
        assert_eq!(
            items[0].representation(ContentKind::Text).unwrap(),
            b"free form text"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panel_toggle_flips_notch_state() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir);
        let surface = daemon.surface();

        daemon.toggle_panel();
        assert_eq!(*surface.notch_state.borrow(), NotchState::Open);
        daemon.toggle_panel();
        assert_eq!(*surface.notch_state.borrow(), NotchState::Closed);
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

    #[tokio::test(start_paused = true)]
    async fn mic_command_toggles_and_peeks() {
        let dir = TempDir::new().unwrap();
        let mic = Arc::new(FakeMic::default());
        let mut daemon = test_daemon(&dir).with_mic_adapter(Arc::clone(&mic) as Arc<dyn MicAdapter>);

        daemon.handle_command(Command::MicToggle);
        assert!(*mic.muted.lock());

        let peek = daemon.peek.current();
        assert!(peek.visible);
        assert_eq!(peek.kind, PeekKind::Mic);
        assert_eq!(peek.value, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn search_command_feeds_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let mut daemon = test_daemon(&dir);
        daemon.store.write().capture(&RawItem::text("alpha"));
        daemon.store.write().capture(&RawItem::text("beta"));

        daemon.handle_command(Command::Search("alp".to_string()));
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_millis(350)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let results = daemon.surface().search_results.borrow().clone();
        assert_eq!(results.query, "alp");
        assert_eq!(results.entries.len(), 1);
    }
}
