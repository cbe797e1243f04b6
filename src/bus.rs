use log::{error, trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::router::SinkId;

/// A translated line ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedMessage {
    pub target: SinkId,
    pub text: String,
    /// Color name or `#RRGGBB` / `#AARRGGBB`.
    pub color: String,
}

impl TranslatedMessage {
    pub fn new(target: SinkId, text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            target,
            text: text.into(),
            color: color.into(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&TranslatedMessage) + Send + Sync>;

struct BusInner {
    handlers: RwLock<Vec<Handler>>,
    count: AtomicUsize,
}

/// In-process fan-out of translated lines. Cloning shares the same
/// subscriber list.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(Vec::new()),
                count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn subscribe(&self, handler: Handler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove one registration of `handler`. Unknown handlers are ignored,
    /// but the count is still decremented (never below zero).
    pub fn unsubscribe(&self, handler: &Handler) {
        {
            let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(pos) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
                handlers.remove(pos);
            }
        }
        let _ = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Deliver to every handler in registration order. A panicking handler
    /// is logged and skipped.
    pub fn publish(&self, message: TranslatedMessage) {
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        trace!(
            "publish to {} handler(s): {} \"{}\"",
            handlers.len(),
            message.target.as_str(),
            message.text
        );
        for (i, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                error!("Chat subscriber {} panicked handling message for {}", i, message.target.as_str());
            }
        }
    }
}
