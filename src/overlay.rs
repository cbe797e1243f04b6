use log::{debug, error, warn};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bus::{Handler, MessageBus, TranslatedMessage};
use crate::config;
use crate::router::SinkId;
use crate::translation::Provider;

pub const MAX_LINES: usize = 1000;
const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

// ─── Colors ─────────────────────────────────────────────────────────

fn named_color(name: &str) -> Option<[f32; 4]> {
    let rgb: [u8; 3] = match name.to_ascii_lowercase().as_str() {
        "white" => [255, 255, 255],
        "black" => [0, 0, 0],
        "red" => [255, 0, 0],
        "green" => [0, 128, 0],
        "lime" => [0, 255, 0],
        "lightgreen" => [144, 238, 144],
        "blue" => [0, 0, 255],
        "dodgerblue" => [30, 144, 255],
        "aqua" | "cyan" => [0, 255, 255],
        "fuchsia" | "magenta" => [255, 0, 255],
        "orange" => [255, 165, 0],
        "yellow" => [255, 255, 0],
        "gold" => [255, 215, 0],
        "gray" | "grey" => [128, 128, 128],
        "purple" => [128, 0, 128],
        "pink" => [255, 192, 203],
        _ => return None,
    };
    Some([
        rgb[0] as f32 / 255.0,
        rgb[1] as f32 / 255.0,
        rgb[2] as f32 / 255.0,
        1.0,
    ])
}

fn hex_color(hex: &str) -> Option<[f32; 4]> {
    if !hex.is_ascii() {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    let (a, r, g, b) = match hex.len() {
        6 => (255, byte(0)?, byte(2)?, byte(4)?),
        8 => (byte(0)?, byte(2)?, byte(4)?, byte(6)?),
        _ => return None,
    };
    Some([
        r as f32 / 255.0,
        g as f32 / 255.0,
        b as f32 / 255.0,
        a as f32 / 255.0,
    ])
}

/// Color name, `#RRGGBB` or `#AARRGGBB` as RGBA. Empty or unknown input
/// renders white.
pub fn parse_color(color: &str) -> [f32; 4] {
    let color = color.trim();
    if color.is_empty() {
        return WHITE;
    }
    let parsed = match color.strip_prefix('#') {
        Some(hex) => hex_color(hex),
        None => named_color(color),
    };
    parsed.unwrap_or_else(|| {
        warn!("Unparseable chat color '{}', using white", color);
        WHITE
    })
}

fn ansi_fg(rgba: [f32; 4]) -> String {
    let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("\x1b[38;2;{};{};{}m", c(rgba[0]), c(rgba[1]), c(rgba[2]))
}

// ─── Tabs ───────────────────────────────────────────────────────────

pub struct ChatPane {
    lines: VecDeque<(String, [f32; 4])>,
    capacity: usize,
}

impl ChatPane {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, text: String, color: [f32; 4]) {
        self.lines.push_back((text, color));
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&(String, [f32; 4])> {
        self.lines.back()
    }
}

/// Terminal rendering of the two chat tabs.
pub struct Overlay {
    panes: Mutex<HashMap<SinkId, ChatPane>>,
    history_path: Option<PathBuf>,
    echo: bool,
    received: AtomicUsize,
}

impl Overlay {
    pub fn new(save_history: bool) -> Arc<Self> {
        Arc::new(Self::with_panes(
            save_history.then(|| config::config_dir().join("chat.history")),
            true,
        ))
    }

    fn with_panes(history_path: Option<PathBuf>, echo: bool) -> Self {
        let panes = SinkId::ALL
            .into_iter()
            .map(|s| (s, ChatPane::new(MAX_LINES)))
            .collect();
        Self {
            panes: Mutex::new(panes),
            history_path,
            echo,
            received: AtomicUsize::new(0),
        }
    }

    /// Subscribe to the bus. Keep the handler to unsubscribe later.
    pub fn attach(self: &Arc<Self>, bus: &MessageBus) -> Handler {
        let overlay = Arc::clone(self);
        let handler: Handler = Arc::new(move |msg: &TranslatedMessage| overlay.receive(msg));
        bus.subscribe(Arc::clone(&handler));
        handler
    }

    pub fn receive(&self, msg: &TranslatedMessage) {
        let color = parse_color(&msg.color);
        {
            let mut panes = self.panes.lock().unwrap_or_else(|e| e.into_inner());
            let Some(pane) = panes.get_mut(&msg.target) else {
                warn!("Unhandled chat target: {}", msg.target.as_str());
                return;
            };
            pane.push(msg.text.clone(), color);
        }
        self.received.fetch_add(1, Ordering::SeqCst);

        if self.echo {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}[{}] {}\x1b[0m", ansi_fg(color), msg.target.as_str(), msg.text);
        }
        if let Some(path) = &self.history_path {
            append_chat_history(path, msg);
        }
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn pane_len(&self, sink: SinkId) -> usize {
        self.panes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sink)
            .map_or(0, ChatPane::len)
    }

    #[cfg(test)]
    pub fn last_line(&self, sink: SinkId) -> Option<(String, [f32; 4])> {
        self.panes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sink)
            .and_then(|p| p.last().cloned())
    }
}

// ─── Activity monitor ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Growing(usize),
    Idle(usize),
}

/// Tracks the delivered-message count between monitor ticks.
#[derive(Default)]
pub struct ActivityTracker {
    last_seen: usize,
    idle: bool,
}

impl ActivityTracker {
    /// Returns the activity and whether this tick started an idle streak.
    pub fn observe(&mut self, received: usize) -> (Activity, bool) {
        if received == self.last_seen {
            let started = !self.idle;
            self.idle = true;
            (Activity::Idle(received), started)
        } else {
            self.last_seen = received;
            self.idle = false;
            (Activity::Growing(received), false)
        }
    }
}

/// Periodically log the subscriber and message counts, warning once when
/// deliveries stop.
pub fn spawn_monitor(overlay: Arc<Overlay>, bus: MessageBus, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = ActivityTracker::default();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let subscribers = bus.subscriber_count();
            let (activity, idle_started) = tracker.observe(overlay.received());
            let (count, state) = match activity {
                Activity::Growing(n) => (n, "growing"),
                Activity::Idle(n) => (n, "idle"),
            };
            debug!("Overlay monitor: {} subscriber(s), {} message(s), {}", subscribers, count, state);
            if subscribers == 0 {
                warn!("No tab is subscribed to the message bus");
            } else if idle_started {
                warn!("Message count is not growing; the subscription or the watcher may have stopped");
            }
        }
    })
}

fn append_chat_history(path: &std::path::Path, msg: &TranslatedMessage) {
    config::rotate_file(path);

    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    else {
        error!("Failed to open chat history file");
        return;
    };

    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let _ = writeln!(file, "[{}] [{}] {}", now, msg.target.as_str(), msg.text);
}

// ─── Status notices ─────────────────────────────────────────────────

/// Startup lines shown in both tabs.
pub fn announce_startup(bus: &MessageBus, provider: Provider, has_api_key: bool) {
    let key_line = if has_api_key {
        ("DeepL API key: set", "aqua")
    } else {
        ("DeepL API key: not set", "red")
    };
    for sink in SinkId::ALL {
        bus.publish(TranslatedMessage::new(sink, "Overlay started", "aqua"));
        bus.publish(TranslatedMessage::new(
            sink,
            format!("Translation engine: {}", provider),
            "aqua",
        ));
        bus.publish(TranslatedMessage::new(sink, key_line.0, key_line.1));
    }
}

pub fn announce_engine(bus: &MessageBus, provider: Provider) {
    bus.publish(TranslatedMessage::new(
        SinkId::Primary,
        format!("[switch] Translation engine: {}", provider),
        "aqua",
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> Arc<Overlay> {
        Arc::new(Overlay::with_panes(None, false))
    }

    #[test]
    fn named_and_hex_colors() {
        assert_eq!(parse_color("white"), WHITE);
        assert_eq!(parse_color("Orange"), [1.0, 165.0 / 255.0, 0.0, 1.0]);
        assert_eq!(parse_color("#FF0000"), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(parse_color("#80FF0000"), [1.0, 0.0, 0.0, 128.0 / 255.0]);
    }

    #[test]
    fn bad_colors_fall_back_to_white() {
        assert_eq!(parse_color(""), WHITE);
        assert_eq!(parse_color("   "), WHITE);
        assert_eq!(parse_color("notacolor"), WHITE);
        assert_eq!(parse_color("#12345"), WHITE);
        assert_eq!(parse_color("#GGGGGG"), WHITE);
        assert_eq!(parse_color("#ÄÄÄ"), WHITE);
    }

    #[test]
    fn pane_is_bounded() {
        let mut pane = ChatPane::new(3);
        for i in 0..5 {
            pane.push(format!("line {}", i), WHITE);
        }
        assert_eq!(pane.len(), 3);
        assert_eq!(pane.last().unwrap().0, "line 4");
    }

    #[test]
    fn attached_overlay_receives_by_target() {
        let bus = MessageBus::new();
        let overlay = quiet();
        let handler = overlay.attach(&bus);

        bus.publish(TranslatedMessage::new(SinkId::Secondary, "Lead:pull", "orange"));
        assert_eq!(overlay.pane_len(SinkId::Primary), 0);
        assert_eq!(overlay.pane_len(SinkId::Secondary), 1);
        let (text, color) = overlay.last_line(SinkId::Secondary).unwrap();
        assert_eq!(text, "Lead:pull");
        assert_eq!(color, parse_color("orange"));

        bus.unsubscribe(&handler);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn startup_notices_reach_both_tabs() {
        let bus = MessageBus::new();
        let overlay = quiet();
        overlay.attach(&bus);

        announce_startup(&bus, Provider::Google, false);
        for sink in SinkId::ALL {
            assert_eq!(overlay.pane_len(sink), 3);
            let (text, color) = overlay.last_line(sink).unwrap();
            assert_eq!(text, "DeepL API key: not set");
            assert_eq!(color, parse_color("red"));
        }

        announce_engine(&bus, Provider::DeepL);
        assert_eq!(overlay.pane_len(SinkId::Primary), 4);
        assert_eq!(overlay.pane_len(SinkId::Secondary), 3);
    }

    #[test]
    fn received_counts_every_delivery() {
        let bus = MessageBus::new();
        let overlay = quiet();
        overlay.attach(&bus);
        announce_startup(&bus, Provider::Google, true);
        assert_eq!(overlay.received(), 6);
    }

    #[test]
    fn tracker_flags_idle_streak_once() {
        let mut tracker = ActivityTracker::default();
        assert_eq!(tracker.observe(0), (Activity::Idle(0), true));
        assert_eq!(tracker.observe(3), (Activity::Growing(3), false));
        assert_eq!(tracker.observe(3), (Activity::Idle(3), true));
        assert_eq!(tracker.observe(3), (Activity::Idle(3), false));
        assert_eq!(tracker.observe(4), (Activity::Growing(4), false));
    }

    #[tokio::test]
    async fn monitor_task_runs_until_aborted() {
        let bus = MessageBus::new();
        let overlay = quiet();
        let monitor = spawn_monitor(Arc::clone(&overlay), bus, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!monitor.is_finished());
        monitor.abort();
        assert!(monitor.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn history_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.history");
        let overlay = Overlay::with_panes(Some(path.clone()), false);

        overlay.receive(&TranslatedMessage::new(SinkId::Primary, "Bob:hi", "white"));
        overlay.receive(&TranslatedMessage::new(SinkId::Secondary, "Amy:yo", "white"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[chat1] Bob:hi"));
        assert!(lines[1].ends_with("[chat2] Amy:yo"));
    }
}
