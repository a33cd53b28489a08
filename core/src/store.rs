use anyhow::{Context, Result};
use arboard::{Clipboard, ImageData};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

use crate::adapters::FrontmostApp;
use crate::{Config, HASH_PREFIX_LEN, MAX_CAPTURE_SIZE};

/// Marker representation tags written by password managers and clipboard
/// utilities whose items must never enter the history.
const MARKER_TAGS: &[&str] = &[
    "org.nspasteboard.ConcealedType",
    "org.nspasteboard.TransientType",
    "org.nspasteboard.AutoGeneratedType",
    "com.agilebits.onepassword",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Text,
    Rtf,
    Html,
    ImageTiff,
    ImagePng,
    FileUrl,
}

impl ContentKind {
    /// Capture preference order: plain text wins over rich and image forms.
    const SUPPORTED: [ContentKind; 6] = [
        ContentKind::Text,
        ContentKind::Rtf,
        ContentKind::Html,
        ContentKind::ImageTiff,
        ContentKind::ImagePng,
        ContentKind::FileUrl,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Rtf => "rtf",
            ContentKind::Html => "html",
            ContentKind::ImageTiff => "image-tiff",
            ContentKind::ImagePng => "image-png",
            ContentKind::FileUrl => "file-url",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::SUPPORTED.into_iter().find(|k| k.tag() == tag)
    }

    pub fn is_image(self) -> bool {
        matches!(self, ContentKind::ImageTiff | ContentKind::ImagePng)
    }
}

/// One pasteboard item as observed during a poll: an ordered list of
/// representations, each a `(kind tag, bytes)` pair. Tags outside the
/// supported set are carried through so marker kinds stay visible.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    representations: Vec<(String, Vec<u8>)>,
}

impl RawItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.representations.push((tag.into(), data.into()));
        self
    }

    pub fn text(text: &str) -> Self {
        Self::new().with(ContentKind::Text.tag(), text.as_bytes())
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.representations.iter().map(|(tag, _)| tag.as_str())
    }

    pub fn representation(&self, kind: ContentKind) -> Option<&[u8]> {
        self.representations
            .iter()
            .find(|(tag, _)| tag == kind.tag())
            .map(|(_, data)| data.as_slice())
    }

    fn first_supported(&self) -> Option<(ContentKind, &[u8])> {
        ContentKind::SUPPORTED
            .into_iter()
            .find_map(|kind| self.representation(kind).map(|data| (kind, data)))
    }

    fn has_marker(&self, extra: &[String]) -> bool {
        self.tags().any(|tag| {
            MARKER_TAGS.contains(&tag) || extra.iter().any(|ignored| tag == ignored)
        })
    }

    /// First rich representation whose decoded text is non-empty.
    fn rich_payload(&self) -> Option<(ContentKind, &[u8])> {
        [ContentKind::Rtf, ContentKind::Html]
            .into_iter()
            .find_map(|kind| {
                let data = self.representation(kind)?;
                let decoded = decode_text(kind, data)?;
                if decoded.trim().is_empty() {
                    None
                } else {
                    Some((kind, data))
                }
            })
    }
}

/// A captured history entry. Content is immutable once created; identity
/// is the blake3 hash of the exact content bytes.
#[derive(Debug)]
pub struct ClipboardEntry {
    content: Vec<u8>,
    kind: ContentKind,
    source_app: Option<String>,
    captured_at: u64,
    hash: blake3::Hash,
}

impl ClipboardEntry {
    fn new(content: Vec<u8>, kind: ContentKind, source_app: Option<String>, captured_at: u64) -> Self {
        let hash = blake3::hash(&content);
        Self {
            content,
            kind,
            source_app,
            captured_at,
            hash,
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn source_app(&self) -> Option<&str> {
        self.source_app.as_deref()
    }

    pub fn captured_at(&self) -> u64 {
        self.captured_at
    }

    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }

    pub fn hash(&self) -> blake3::Hash {
        self.hash
    }

    pub fn hash_hex(&self) -> String {
        self.hash.to_hex().to_string()
    }

    pub fn hash_prefix(&self) -> String {
        let hex = self.hash.to_hex();
        hex[..HASH_PREFIX_LEN.min(hex.len())].to_string()
    }

    /// Best-effort text rendering; images have none and undecodable rich
    /// payloads fall back rather than erroring.
    pub fn decoded_text(&self) -> Option<String> {
        decode_text(self.kind, &self.content)
    }
}

pub(crate) fn decode_text(kind: ContentKind, data: &[u8]) -> Option<String> {
    match kind {
        ContentKind::Text | ContentKind::Html | ContentKind::FileUrl => {
            Some(String::from_utf8_lossy(data).into_owned())
        }
        ContentKind::Rtf => Some(strip_rtf(&String::from_utf8_lossy(data))),
        ContentKind::ImageTiff | ContentKind::ImagePng => None,
    }
}

/// Minimal RTF-to-plain-text pass: drops group braces and control words,
/// keeps literal text, maps \par and \line to newlines. Unknown input
/// degrades to whatever literal text survives.
fn strip_rtf(rtf: &str) -> String {
    let mut out = String::new();
    let mut chars = rtf.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' | '}' => {}
            '\\' => match chars.peek() {
                Some('\\') | Some('{') | Some('}') => {
                    out.push(chars.next().unwrap_or_default());
                }
                Some('\'') => {
                    chars.next();
                    let hex: String = chars.by_ref().take(2).collect();
                    if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                        out.push(byte as char);
                    }
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_alphabetic() {
                            word.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    // numeric parameter
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_digit() || next == '-' {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    // one space terminates the control word
                    if chars.peek() == Some(&' ') {
                        chars.next();
                    }
                    if word == "par" || word == "line" {
                        out.push('\n');
                    }
                }
            },
            '\r' | '\n' => {}
            _ => out.push(c),
        }
    }

    out
}

/// The system pasteboard seen through the change-counter model: a
/// monotonic generation, the current items, and a replace-write.
pub trait Pasteboard: Send {
    /// Monotonically increasing generation; bumps on every content change.
    fn change_count(&mut self) -> u64;

    fn items(&mut self) -> Vec<RawItem>;

    /// Clears prior contents, then writes `content` under its original kind.
    fn clear_and_write(&mut self, kind: ContentKind, content: &[u8]) -> Result<()>;
}

enum Snapshot {
    Text(String),
    Image {
        width: usize,
        height: usize,
        rgba: Vec<u8>,
    },
}

/// arboard-backed pasteboard. The platform library exposes no version
/// counter, so the generation is derived by digesting the current content
/// once per poll; same bounded-latency tradeoff as the poll loop itself.
pub struct ArboardPasteboard {
    inner: Clipboard,
    generation: u64,
    last_digest: Option<blake3::Hash>,
}

impl ArboardPasteboard {
    pub fn new() -> Result<Self> {
        let inner = Clipboard::new().context("Failed to initialize pasteboard")?;
        Ok(Self {
            inner,
            generation: 0,
            last_digest: None,
        })
    }

    fn snapshot(&mut self) -> Option<Snapshot> {
        if let Ok(text) = self.inner.get_text() {
            Some(Snapshot::Text(text))
        } else if let Ok(img) = self.inner.get_image() {
            Some(Snapshot::Image {
                width: img.width,
                height: img.height,
                rgba: img.bytes.into_owned(),
            })
        } else {
            None
        }
    }
}

fn digest_snapshot(snap: &Snapshot) -> blake3::Hash {
    match snap {
        Snapshot::Text(text) => blake3::hash(text.as_bytes()),
        Snapshot::Image { width, height, rgba } => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&(*width as u64).to_le_bytes());
            hasher.update(&(*height as u64).to_le_bytes());
            hasher.update(rgba);
            hasher.finalize()
        }
    }
}

impl Pasteboard for ArboardPasteboard {
    fn change_count(&mut self) -> u64 {
        let digest = self.snapshot().as_ref().map(digest_snapshot);
        if digest != self.last_digest {
            self.last_digest = digest;
            self.generation += 1;
        }
        self.generation
    }

    fn items(&mut self) -> Vec<RawItem> {
        match self.snapshot() {
            Some(Snapshot::Text(text)) => vec![RawItem::text(&text)],
            Some(Snapshot::Image { width, height, rgba }) => {
                match rgba_to_png(width, height, &rgba) {
                    Ok(png) => vec![RawItem::new().with(ContentKind::ImagePng.tag(), png)],
                    Err(e) => {
                        log::warn!("Failed to encode pasteboard image: {e:#}");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        }
    }

    fn clear_and_write(&mut self, kind: ContentKind, content: &[u8]) -> Result<()> {
        self.inner.clear().context("Failed to clear pasteboard")?;

        if kind.is_image() {
            let (width, height, rgba) = png_decode(content)?;
            self.inner.set_image(ImageData {
                width,
                height,
                bytes: Cow::Owned(rgba),
            })?;
        } else {
            let mut text = String::from_utf8_lossy(content).into_owned();
            self.inner.set_text(text.clone())?;
            text.zeroize();
        }

        Ok(())
    }
}

pub(crate) fn rgba_to_png(width: usize, height: usize, rgba: &[u8]) -> Result<Vec<u8>> {
    use image::{ImageBuffer, Rgba};

    let width = width as u32;
    let height = height as u32;

    let img_buffer = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(width, height, rgba.to_vec())
        .context("Failed to create image buffer")?;

    let mut png_data = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_data);
    image::ImageEncoder::write_image(
        encoder,
        &img_buffer,
        width,
        height,
        image::ExtendedColorType::Rgba8,
    )?;

    Ok(png_data)
}

fn png_decode(data: &[u8]) -> Result<(usize, usize, Vec<u8>)> {
    let img = image::load_from_memory(data)?;
    let rgba = img.to_rgba8();
    let (width, height) = (rgba.width() as usize, rgba.height() as usize);
    Ok((width, height, rgba.into_raw()))
}

/// In-memory pasteboard with a real version counter. Used by tests and
/// headless environments.
#[derive(Default)]
pub struct MemoryPasteboard {
    items: Vec<RawItem>,
    generation: u64,
}

impl MemoryPasteboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the pasteboard contents, bumping the generation.
    pub fn put(&mut self, item: RawItem) {
        self.items = vec![item];
        self.generation += 1;
    }
}

impl Pasteboard for MemoryPasteboard {
    fn change_count(&mut self) -> u64 {
        self.generation
    }

    fn items(&mut self) -> Vec<RawItem> {
        self.items.clone()
    }

    fn clear_and_write(&mut self, kind: ContentKind, content: &[u8]) -> Result<()> {
        self.items = vec![RawItem::new().with(kind.tag(), content)];
        self.generation += 1;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    /// base64 content bytes, zstd-compressed when `compressed` is set.
    content: String,
    #[serde(default)]
    compressed: bool,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sourceAppBundle", default, skip_serializing_if = "Option::is_none")]
    source_app: Option<String>,
    date: u64,
    #[serde(default)]
    expiry: u64,
}

/// Deduplicated, capacity-bounded, persisted clipboard history.
///
/// Entries are newest-first. Mutation happens on a single capture path;
/// readers share entries through `Arc`.
pub struct ClipboardStore {
    history_path: PathBuf,
    max_records: usize,
    retention_days: u32,
    compress_threshold: usize,
    trim_whitespace: bool,
    ignored_producers: Vec<String>,
    entries: Vec<Arc<ClipboardEntry>>,
    seen: HashSet<blake3::Hash>,
    last_change_count: u64,
    frontmost: Option<Arc<dyn FrontmostApp>>,
}

impl ClipboardStore {
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.history_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = load_snapshot(&config.history_path, config.retention_days, now_secs());
        let seen = entries.iter().map(|e| e.hash()).collect();

        Ok(Self {
            history_path: config.history_path.clone(),
            max_records: config.max_records,
            retention_days: config.retention_days,
            compress_threshold: config.compress_threshold,
            trim_whitespace: config.trim_whitespace,
            ignored_producers: config.ignored_producers.clone(),
            entries,
            seen,
            last_change_count: 0,
            frontmost: None,
        })
    }

    /// Injects the frontmost-application provider used to attribute
    /// captures to their source app.
    pub fn set_frontmost(&mut self, frontmost: Arc<dyn FrontmostApp>) {
        self.frontmost = Some(frontmost);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest-first history.
    pub fn entries(&self) -> &[Arc<ClipboardEntry>] {
        &self.entries
    }

    pub fn find_by_prefix(&self, prefix: &str) -> Option<Arc<ClipboardEntry>> {
        self.entries
            .iter()
            .find(|e| e.hash_hex().starts_with(prefix))
            .cloned()
    }

    /// Compares the pasteboard generation with the last one seen; on a new
    /// generation, runs a capture pass over all current items. Returns the
    /// number of entries captured. Idempotent per generation.
    pub fn refresh(&mut self, pasteboard: &mut dyn Pasteboard) -> usize {
        let generation = pasteboard.change_count();
        if generation == self.last_change_count {
            return 0;
        }

        let mut captured = 0;
        for item in pasteboard.items() {
            if self.capture(&item) {
                captured += 1;
            }
        }

        self.last_change_count = pasteboard.change_count();
        captured
    }

    /// Applies the capture rules to one raw item. Returns whether a new
    /// entry was stored.
    pub fn capture(&mut self, item: &RawItem) -> bool {
        if item.has_marker(&self.ignored_producers) {
            return false;
        }

        let Some((kind, data)) = item.first_supported() else {
            return false;
        };

        let (kind, content) = if kind == ContentKind::Text {
            let text = String::from_utf8_lossy(data);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                // whitespace-only text only survives via a non-empty rich form
                match item.rich_payload() {
                    Some((rich_kind, rich_data)) => (rich_kind, rich_data.to_vec()),
                    None => return false,
                }
            } else if self.trim_whitespace {
                (kind, trimmed.as_bytes().to_vec())
            } else {
                (kind, data.to_vec())
            }
        } else {
            (kind, data.to_vec())
        };

        if content.len() > MAX_CAPTURE_SIZE {
            return false;
        }

        let hash = blake3::hash(&content);
        if self.seen.contains(&hash) {
            return false;
        }

        let source_app = self.frontmost.as_ref().and_then(|f| f.bundle_id());
        let entry = Arc::new(ClipboardEntry::new(content, kind, source_app, now_secs()));

        self.seen.insert(hash);
        self.entries.insert(0, entry);
        while self.entries.len() > self.max_records {
            if let Some(evicted) = self.entries.pop() {
                self.seen.remove(&evicted.hash());
            }
        }

        self.persist();
        true
    }

    /// Writes content back to the pasteboard and advances the last-seen
    /// generation so the write is not re-captured as a new entry.
    pub fn write_back(
        &mut self,
        kind: ContentKind,
        content: &[u8],
        pasteboard: &mut dyn Pasteboard,
    ) -> Result<()> {
        pasteboard.clear_and_write(kind, content)?;
        self.last_change_count = pasteboard.change_count();
        Ok(())
    }

    pub fn copy(&mut self, entry: &ClipboardEntry, pasteboard: &mut dyn Pasteboard) -> Result<()> {
        self.write_back(entry.kind(), entry.content(), pasteboard)
    }

    pub fn copy_by_prefix(&mut self, prefix: &str, pasteboard: &mut dyn Pasteboard) -> Result<()> {
        let entry = self
            .find_by_prefix(prefix)
            .with_context(|| format!("Entry not found for hash: {prefix}"))?;
        self.copy(&entry, pasteboard)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
        self.persist();
    }

    /// Drops entries past their retention window. Returns how many were
    /// removed; persists only when something changed.
    pub fn sweep_expired(&mut self) -> usize {
        let cutoff = now_secs().saturating_sub(self.retention_secs());
        let before = self.entries.len();
        self.entries.retain(|e| e.captured_at() >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.seen = self.entries.iter().map(|e| e.hash()).collect();
            self.persist();
        }
        removed
    }

    fn retention_secs(&self) -> u64 {
        self.retention_days as u64 * 86400
    }

    fn persist(&self) {
        if let Err(e) = self.write_snapshot() {
            log::warn!("Failed to persist clipboard history: {e:#}");
        }
    }

    fn write_snapshot(&self) -> Result<()> {
        let records = self
            .entries
            .iter()
            .map(|e| self.record_for(e))
            .collect::<Result<Vec<_>>>()?;

        let json = serde_json::to_vec_pretty(&records)?;
        let tmp = self.history_path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.history_path)?;
        Ok(())
    }

    fn record_for(&self, entry: &ClipboardEntry) -> Result<PersistedRecord> {
        let (payload, compressed) = if entry.content.len() > self.compress_threshold {
            (zstd::encode_all(entry.content(), 3)?, true)
        } else {
            (entry.content.clone(), false)
        };

        Ok(PersistedRecord {
            content: BASE64.encode(payload),
            compressed,
            kind: entry.kind().tag().to_string(),
            source_app: entry.source_app.clone(),
            date: entry.captured_at,
            expiry: entry.captured_at + self.retention_secs(),
        })
    }
}

/// Loads the persisted snapshot. A missing or malformed file yields an
/// empty history; individually undecodable records are skipped. Records
/// past the retention window are dropped (expiry is recomputed from the
/// capture date, not trusted from the file).
fn load_snapshot(path: &Path, retention_days: u32, now: u64) -> Vec<Arc<ClipboardEntry>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(_) => return Vec::new(),
    };

    let records: Vec<PersistedRecord> = match serde_json::from_slice(&data) {
        Ok(records) => records,
        Err(e) => {
            log::warn!("Clipboard history snapshot is malformed, starting empty: {e}");
            return Vec::new();
        }
    };

    let retention_secs = retention_days as u64 * 86400;

    records
        .into_iter()
        .filter_map(|record| {
            if record.date.saturating_add(retention_secs) <= now {
                return None;
            }

            let Some(kind) = ContentKind::from_tag(&record.kind) else {
                log::warn!("Skipping history record with unknown kind: {}", record.kind);
                return None;
            };

            let raw = match BASE64.decode(&record.content) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("Skipping undecodable history record: {e}");
                    return None;
                }
            };

            let content = if record.compressed {
                match zstd::decode_all(raw.as_slice()) {
                    Ok(content) => content,
                    Err(e) => {
                        log::warn!("Skipping history record with bad compression: {e}");
                        return None;
                    }
                }
            } else {
                raw
            };

            Some(Arc::new(ClipboardEntry::new(
                content,
                kind,
                record.source_app,
                record.date,
            )))
        })
        .collect()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
