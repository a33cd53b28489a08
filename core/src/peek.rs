use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::PEEK_DISMISS_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekKind {
    Volume,
    Brightness,
    Backlight,
    Mic,
    Music,
}

/// Transient hardware-state notification. `value` is normalized to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SneakPeek {
    pub visible: bool,
    pub kind: PeekKind,
    pub value: f32,
}

impl Default for SneakPeek {
    fn default() -> Self {
        Self {
            visible: false,
            kind: PeekKind::Music,
            value: 0.0,
        }
    }
}

/// Coalesces bursty hardware change events into one self-dismissing peek.
///
/// `Hidden -> Visible(kind, value) -> Hidden` after a quiet window; a
/// retrigger replaces kind/value and restarts the window. There is no
/// queue: only the most recent event is shown. Superseded dismiss timers
/// are invalidated by a generation counter (latest wins).
pub struct PeekController {
    tx: Arc<watch::Sender<SneakPeek>>,
    generation: Arc<AtomicU64>,
    dismiss_after: Duration,
}

impl PeekController {
    pub fn new() -> Self {
        Self::with_dismiss_after(Duration::from_millis(PEEK_DISMISS_MS))
    }

    pub fn with_dismiss_after(dismiss_after: Duration) -> Self {
        let (tx, _) = watch::channel(SneakPeek::default());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            dismiss_after,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SneakPeek> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SneakPeek {
        *self.tx.borrow()
    }

    /// Shows (or replaces) the peek and restarts the auto-dismiss window.
    /// Must be called from within a tokio runtime.
    pub fn trigger(&self, kind: PeekKind, value: f32) {
        let prior = *self.tx.borrow();
        if prior.visible {
            // force a hide first so the replacement reads as a fresh
            // entrance instead of blending with the outgoing peek
            self.tx.send_replace(SneakPeek {
                visible: false,
                ..prior
            });
        }

        self.tx.send_replace(SneakPeek {
            visible: true,
            kind,
            value: value.clamp(0.0, 1.0),
        });

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.generation);
        let tx = Arc::clone(&self.tx);
        let dismiss_after = self.dismiss_after;

        tokio::spawn(async move {
            tokio::time::sleep(dismiss_after).await;
            if latest.load(Ordering::SeqCst) == generation {
                tx.send_modify(|peek| peek.visible = false);
            }
        });
    }
}

impl Default for PeekController {
    fn default() -> Self {
        Self::new()
    }
}
