use log::{debug, info, trace, warn};
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::bus::{MessageBus, TranslatedMessage};
use crate::chat::{self, CONSUMED_SENTINEL};
use crate::config::{AppConfig, ConfigError};
use crate::router;
use crate::translation::{ProviderSwitch, TranslateError, Translator};

/// Pending change notifications. Bursts beyond this are dropped; the
/// debounce gate would discard them anyway.
const CHANGE_QUEUE_DEPTH: usize = 16;

// ─── Errors / outcomes ──────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not read {} after {attempts} attempts: {source}", .path.display())]
    FileAccessExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("translation failed: {0}")]
    Translation(#[from] TranslateError),
    #[error("file watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// How a processing cycle ended when nothing went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Debounced,
    NoMarker,
    Duplicate,
    /// Channel id with no route.
    Unrouted(String),
    /// Number of messages put on the bus.
    Published(usize),
}

// ─── Settings ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub dir: PathBuf,
    pub file_name: String,
    pub target_lang: String,
    pub debounce: Duration,
    pub read_retries: u32,
    pub read_retry_delay: Duration,
    pub watch_refresh_interval: Duration,
    pub stale_check_interval: Duration,
    pub translate_timeout: Duration,
}

impl WatchSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ConfigError> {
        let (dir, file_name) = cfg.watch_target()?;
        Ok(Self {
            dir,
            file_name,
            target_lang: cfg.target_language.clone(),
            debounce: cfg.debounce(),
            read_retries: cfg.read_retries,
            read_retry_delay: cfg.read_retry_delay(),
            watch_refresh_interval: cfg.watch_refresh_interval(),
            stale_check_interval: cfg.stale_check_interval(),
            translate_timeout: cfg.translate_timeout(),
        })
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

// ─── Debounce ───────────────────────────────────────────────────────

/// Drops notifications that arrive within `window` of the last admitted one.
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn admit(&mut self, at: Instant) -> bool {
        if let Some(last) = self.last {
            if at.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last = Some(at);
        true
    }
}

// ─── File access ────────────────────────────────────────────────────

/// Read the whole chat file, retrying while the addon holds it.
pub async fn read_with_retry(path: &Path, attempts: u32, delay: Duration) -> Result<String, WatchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match tokio::fs::read(path).await {
            Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!("Chat file read retry {}/{}: {}", attempt, attempts, e);
                if attempt >= attempts {
                    return Err(WatchError::FileAccessExhausted {
                        path: path.to_path_buf(),
                        attempts,
                        source: e,
                    });
                }
                attempt += 1;
                time::sleep(delay).await;
            }
        }
    }
}

fn modified_time(path: &Path) -> io::Result<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified())
}

// ─── Processing cycle ───────────────────────────────────────────────

/// Owns the debounce and dedup state. Only one cycle runs at a time since
/// every entry point takes `&mut self`.
pub struct ChatProcessor<T: Translator> {
    path: PathBuf,
    target_lang: String,
    read_retries: u32,
    read_retry_delay: Duration,
    translate_timeout: Duration,
    debouncer: Debouncer,
    last_message: Option<String>,
    last_file_write: Arc<Mutex<Option<SystemTime>>>,
    translator: Arc<T>,
    bus: MessageBus,
    provider: ProviderSwitch,
}

impl<T: Translator> ChatProcessor<T> {
    pub fn new(
        settings: &WatchSettings,
        translator: Arc<T>,
        bus: MessageBus,
        provider: ProviderSwitch,
        last_file_write: Arc<Mutex<Option<SystemTime>>>,
    ) -> Self {
        Self {
            path: settings.file_path(),
            target_lang: settings.target_lang.clone(),
            read_retries: settings.read_retries,
            read_retry_delay: settings.read_retry_delay,
            translate_timeout: settings.translate_timeout,
            debouncer: Debouncer::new(settings.debounce),
            last_message: None,
            last_file_write,
            translator,
            bus,
            provider,
        }
    }

    /// Entry point for a change notification observed at `at`.
    pub async fn on_change(&mut self, at: Instant) -> Result<CycleOutcome, WatchError> {
        if !self.debouncer.admit(at) {
            trace!("change notification debounced");
            return Ok(CycleOutcome::Debounced);
        }
        self.process_file().await
    }

    /// One full read → parse → consume → dedup → route → translate → publish pass.
    pub async fn process_file(&mut self) -> Result<CycleOutcome, WatchError> {
        let content = read_with_retry(&self.path, self.read_retries, self.read_retry_delay).await?;
        if let Ok(modified) = modified_time(&self.path) {
            *self.last_file_write.lock().unwrap_or_else(|e| e.into_inner()) = Some(modified);
        }

        let Some(event) = chat::parse_marker(&content) else {
            return Ok(CycleOutcome::NoMarker);
        };

        if let Err(e) = tokio::fs::write(&self.path, CONSUMED_SENTINEL).await {
            warn!("Failed to reset chat file {}: {}", self.path.display(), e);
        }

        if self.last_message.as_deref() == Some(event.message.as_str()) {
            debug!("skipping repeated message from {}", event.speaker);
            return Ok(CycleOutcome::Duplicate);
        }
        self.last_message = Some(event.message.clone());

        let channel = event.channel_kind();
        let Some(route) = router::route(&channel).filter(|r| !r.sinks.is_empty()) else {
            return Ok(CycleOutcome::Unrouted(event.channel));
        };

        let provider = self.provider.current();
        let translated = time::timeout(
            self.translate_timeout,
            self.translator.translate(&event.message, &self.target_lang, provider),
        )
        .await
        .map_err(|_| TranslateError::Timeout(self.translate_timeout))??;

        let text = route.decorate(&format!("{}:{}", event.speaker, translated));
        let sinks = route.sinks.sinks();
        for sink in &sinks {
            self.bus.publish(TranslatedMessage::new(*sink, text.clone(), route.color));
        }
        Ok(CycleOutcome::Published(sinks.len()))
    }
}

// ─── Health checks ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Missing,
    Stalled(SystemTime),
    Updated(SystemTime),
}

/// Compare the file's mtime with the last one seen, recording it if it moved.
pub fn check_staleness(path: &Path, last_write: &Mutex<Option<SystemTime>>) -> io::Result<Staleness> {
    if !path.exists() {
        return Ok(Staleness::Missing);
    }
    let current = modified_time(path)?;
    let mut last = last_write.lock().unwrap_or_else(|e| e.into_inner());
    if *last == Some(current) {
        Ok(Staleness::Stalled(current))
    } else {
        *last = Some(current);
        Ok(Staleness::Updated(current))
    }
}

fn refresh_watch(watcher: &Mutex<RecommendedWatcher>, dir: &Path) {
    let mut watcher = watcher.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = watcher.unwatch(dir) {
        warn!("Watch refresh: unwatch failed: {}", e);
    }
    match watcher.watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => debug!("Watch refresh: re-registered {}", dir.display()),
        Err(e) => warn!("Watch refresh failed for {}: {}", dir.display(), e),
    }
}

// ─── Watcher lifecycle ──────────────────────────────────────────────

/// Keeps the OS watch and its tasks alive. Dropping it abandons any
/// in-flight cycle.
pub struct WatcherHandle {
    tasks: Vec<JoinHandle<()>>,
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl WatcherHandle {
    pub fn shutdown(self) {
        info!("Chat watcher shutting down");
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start watching the chat file. Must be called inside a tokio runtime.
pub fn start<T: Translator>(
    settings: WatchSettings,
    translator: Arc<T>,
    bus: MessageBus,
    provider: ProviderSwitch,
) -> Result<WatcherHandle, WatchError> {
    if !settings.dir.is_dir() {
        return Err(ConfigError::MissingWatchDir(settings.dir.clone()).into());
    }

    let (change_tx, mut change_rx) = mpsc::channel::<Instant>(CHANGE_QUEUE_DEPTH);
    let file_name = settings.file_name.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let is_write = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
                let affects_chat = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(OsStr::new(&file_name)));
                if is_write && affects_chat && change_tx.try_send(Instant::now()).is_err() {
                    trace!("change queue full, dropping notification");
                }
            }
            Err(e) => warn!("File watch error: {}", e),
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(&settings.dir, RecursiveMode::NonRecursive)?;
    let watcher = Arc::new(Mutex::new(watcher));

    let last_file_write = Arc::new(Mutex::new(None));
    let mut processor = ChatProcessor::new(
        &settings,
        translator,
        bus,
        provider,
        Arc::clone(&last_file_write),
    );

    let worker = tokio::spawn(async move {
        while let Some(at) = change_rx.recv().await {
            match processor.on_change(at).await {
                Ok(CycleOutcome::Published(n)) => debug!("chat cycle published {} message(s)", n),
                Ok(CycleOutcome::Unrouted(channel)) => {
                    warn!("No route for chat channel {}, message dropped", channel)
                }
                Ok(outcome) => trace!("chat cycle ended: {:?}", outcome),
                Err(e) => warn!("Chat cycle aborted: {}", e),
            }
        }
        info!("Chat change stream closed");
    });

    let refresher = {
        let watcher = Arc::clone(&watcher);
        let dir = settings.dir.clone();
        let period = settings.watch_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let (watcher, dir) = (Arc::clone(&watcher), dir.clone());
                if let Err(e) = tokio::task::spawn_blocking(move || refresh_watch(&watcher, &dir)).await {
                    warn!("Watch refresh task failed: {}", e);
                }
            }
        })
    };

    let stale_monitor = {
        let path = settings.file_path();
        let period = settings.stale_check_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match check_staleness(&path, &last_file_write) {
                    Ok(Staleness::Missing) => warn!("Chat file does not exist: {}", path.display()),
                    Ok(Staleness::Stalled(_)) => {
                        warn!("Chat file has not changed; the addon may have stopped writing")
                    }
                    Ok(Staleness::Updated(t)) => {
                        info!("Chat file last written {}", humantime::format_rfc3339_seconds(t))
                    }
                    Err(e) => warn!("Chat file check failed: {}", e),
                }
            }
        })
    };

    info!(
        "Watching {} (debounce {:?}, target {})",
        settings.file_path().display(),
        settings.debounce,
        settings.target_lang,
    );

    Ok(WatcherHandle {
        tasks: vec![worker, refresher, stale_monitor],
        _watcher: watcher,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::SinkId;
    use crate::translation::Provider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTranslator {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl FakeTranslator {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Translator for FakeTranslator {
        async fn translate(
            &self,
            text: &str,
            target_lang: &str,
            _provider: Provider,
        ) -> Result<String, TranslateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(TranslateError::MissingApiKey);
            }
            Ok(format!("{}({})", text.to_uppercase(), target_lang))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: WatchSettings,
        published: Arc<Mutex<Vec<TranslatedMessage>>>,
        bus: MessageBus,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let settings = WatchSettings {
                dir: dir.path().to_path_buf(),
                file_name: "to_be_translated.lua".into(),
                target_lang: "ja".into(),
                debounce: Duration::from_millis(500),
                read_retries: 5,
                read_retry_delay: Duration::from_millis(1),
                watch_refresh_interval: Duration::from_secs(60),
                stale_check_interval: Duration::from_secs(60),
                translate_timeout: Duration::from_secs(5),
            };
            let bus = MessageBus::new();
            let published = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&published);
            bus.subscribe(Arc::new(move |m: &TranslatedMessage| {
                sink.lock().unwrap().push(m.clone());
            }));
            Self {
                _dir: dir,
                settings,
                published,
                bus,
            }
        }

        fn processor<T: Translator>(&self, translator: Arc<T>) -> ChatProcessor<T> {
            ChatProcessor::new(
                &self.settings,
                translator,
                self.bus.clone(),
                ProviderSwitch::new(Provider::Google),
                Arc::new(Mutex::new(None)),
            )
        }

        fn write_marker(&self, channel: &str, speaker: &str, message: &str) {
            let content = format!(
                "chatMsg = \"[[CHAT||||{}||||{}||||{}]]\"\nreturn chatMsg\n",
                channel, speaker, message
            );
            std::fs::write(self.settings.file_path(), content).unwrap();
        }

        fn texts(&self) -> Vec<String> {
            self.published.lock().unwrap().iter().map(|m| m.text.clone()).collect()
        }
    }

    #[test]
    fn debouncer_drops_bursts_inside_window() {
        let mut d = Debouncer::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(d.admit(t0));
        assert!(!d.admit(t0 + Duration::from_millis(1)));
        assert!(!d.admit(t0 + Duration::from_millis(499)));
        assert!(d.admit(t0 + Duration::from_millis(500)));
        // Rejected notifications do not move the window.
        assert!(!d.admit(t0 + Duration::from_millis(900)));
        assert!(d.admit(t0 + Duration::from_millis(1000)));
    }

    #[tokio::test]
    async fn notifications_within_window_run_one_cycle() {
        let fx = Fixture::new();
        let tr = FakeTranslator::ok();
        let mut p = fx.processor(Arc::clone(&tr));
        let t0 = Instant::now();

        fx.write_marker("0", "Alice", "hello");
        assert_eq!(p.on_change(t0).await.unwrap(), CycleOutcome::Published(1));

        fx.write_marker("0", "Alice", "second");
        let out = p.on_change(t0 + Duration::from_millis(100)).await.unwrap();
        assert_eq!(out, CycleOutcome::Debounced);
        assert_eq!(tr.calls(), 1);

        let out = p.on_change(t0 + Duration::from_millis(600)).await.unwrap();
        assert_eq!(out, CycleOutcome::Published(1));
        assert_eq!(fx.texts(), vec!["Alice:HELLO(ja)", "Alice:SECOND(ja)"]);
    }

    #[tokio::test]
    async fn file_without_marker_translates_nothing() {
        let fx = Fixture::new();
        let tr = FakeTranslator::ok();
        let mut p = fx.processor(Arc::clone(&tr));
        std::fs::write(fx.settings.file_path(), "return {}").unwrap();

        assert_eq!(p.process_file().await.unwrap(), CycleOutcome::NoMarker);
        assert_eq!(tr.calls(), 0);
        assert!(fx.texts().is_empty());
    }

    #[tokio::test]
    async fn consumed_marker_resets_file_to_sentinel() {
        let fx = Fixture::new();
        let mut p = fx.processor(FakeTranslator::ok());
        fx.write_marker("7", "Guildie", "gg");

        p.process_file().await.unwrap();
        let content = std::fs::read_to_string(fx.settings.file_path()).unwrap();
        assert_eq!(content, CONSUMED_SENTINEL);
    }

    #[tokio::test]
    async fn dedup_only_suppresses_immediate_repeat() {
        let fx = Fixture::new();
        let tr = FakeTranslator::ok();
        let mut p = fx.processor(Arc::clone(&tr));

        let mut outcomes = Vec::new();
        for msg in ["a", "a", "b", "a"] {
            fx.write_marker("0", "Bob", msg);
            outcomes.push(p.process_file().await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                CycleOutcome::Published(1),
                CycleOutcome::Duplicate,
                CycleOutcome::Published(1),
                CycleOutcome::Published(1),
            ]
        );
        assert_eq!(tr.calls(), 3);
        assert_eq!(fx.texts(), vec!["Bob:A(ja)", "Bob:B(ja)", "Bob:A(ja)"]);
    }

    #[tokio::test]
    async fn raid_message_reaches_both_tabs() {
        let fx = Fixture::new();
        let mut p = fx.processor(FakeTranslator::ok());
        fx.write_marker("5", "Lead", "pull");

        assert_eq!(p.process_file().await.unwrap(), CycleOutcome::Published(2));
        let published = fx.published.lock().unwrap().clone();
        let targets: Vec<SinkId> = published.iter().map(|m| m.target).collect();
        assert_eq!(targets, vec![SinkId::Primary, SinkId::Secondary]);
        for m in &published {
            assert_eq!(m.color, "orange");
            assert_eq!(m.text, "Lead:PULL(ja)");
        }
    }

    #[tokio::test]
    async fn whisper_out_and_commander_prefixes() {
        let fx = Fixture::new();
        let mut p = fx.processor(FakeTranslator::ok());

        fx.write_marker("-4", "Me", "hi");
        p.process_file().await.unwrap();
        fx.write_marker("10", "Cmdr", "go");
        p.process_file().await.unwrap();

        assert_eq!(
            fx.texts(),
            vec!["To Me:HI(ja)", "Commander Cmdr:GO(ja)", "Commander Cmdr:GO(ja)"]
        );
    }

    #[tokio::test]
    async fn unknown_channel_is_dropped_after_consuming() {
        let fx = Fixture::new();
        let tr = FakeTranslator::ok();
        let mut p = fx.processor(Arc::clone(&tr));
        fx.write_marker("42", "Npc", "boo");

        assert_eq!(
            p.process_file().await.unwrap(),
            CycleOutcome::Unrouted("42".into())
        );
        assert!(fx.texts().is_empty());
        assert_eq!(tr.calls(), 0);
        assert_eq!(
            std::fs::read_to_string(fx.settings.file_path()).unwrap(),
            CONSUMED_SENTINEL
        );
    }

    #[tokio::test]
    async fn unreadable_file_exhausts_retries_without_publishing() {
        let fx = Fixture::new();
        let tr = FakeTranslator::ok();
        let mut p = fx.processor(Arc::clone(&tr));

        let err = p.process_file().await.unwrap_err();
        match err {
            WatchError::FileAccessExhausted { attempts, path, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(path, fx.settings.file_path());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tr.calls(), 0);
        assert!(fx.texts().is_empty());
    }

    #[tokio::test]
    async fn translation_failure_publishes_nothing() {
        let fx = Fixture::new();
        let tr = FakeTranslator::failing();
        let mut p = fx.processor(Arc::clone(&tr));
        fx.write_marker("0", "Alice", "hello");

        let err = p.process_file().await.unwrap_err();
        assert!(matches!(err, WatchError::Translation(TranslateError::MissingApiKey)));
        assert!(fx.texts().is_empty());

        // The slot was taken before translating, so the same text is not retried.
        fx.write_marker("0", "Alice", "hello");
        assert_eq!(p.process_file().await.unwrap(), CycleOutcome::Duplicate);
        assert_eq!(tr.calls(), 1);
    }

    #[tokio::test]
    async fn hung_translation_times_out() {
        let mut fx = Fixture::new();
        fx.settings.translate_timeout = Duration::from_millis(20);
        let mut p = fx.processor(FakeTranslator::slow(Duration::from_secs(5)));
        fx.write_marker("0", "Alice", "hello");

        let err = p.process_file().await.unwrap_err();
        assert!(matches!(err, WatchError::Translation(TranslateError::Timeout(_))));
        assert!(fx.texts().is_empty());
    }

    #[test]
    fn staleness_tracks_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.lua");
        let last = Mutex::new(None);

        assert_eq!(check_staleness(&path, &last).unwrap(), Staleness::Missing);

        std::fs::write(&path, "return {}").unwrap();
        assert!(matches!(check_staleness(&path, &last).unwrap(), Staleness::Updated(_)));
        assert!(matches!(check_staleness(&path, &last).unwrap(), Staleness::Stalled(_)));

        let later = SystemTime::now() + Duration::from_secs(30);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(matches!(check_staleness(&path, &last).unwrap(), Staleness::Updated(_)));
        assert_eq!(*last.lock().unwrap(), Some(modified_time(&path).unwrap()));
    }

    #[tokio::test]
    async fn start_fails_fast_on_missing_directory() {
        let fx = Fixture::new();
        let mut settings = fx.settings.clone();
        settings.dir = settings.dir.join("missing");
        let result = start(
            settings,
            FakeTranslator::ok(),
            fx.bus.clone(),
            ProviderSwitch::new(Provider::Google),
        );
        assert!(matches!(
            result,
            Err(WatchError::Config(ConfigError::MissingWatchDir(_)))
        ));
    }

    #[tokio::test]
    async fn live_watcher_publishes_written_marker() {
        let fx = Fixture::new();
        std::fs::write(fx.settings.file_path(), CONSUMED_SENTINEL).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<TranslatedMessage>();
        fx.bus.subscribe(Arc::new(move |m: &TranslatedMessage| {
            let _ = tx.send(m.clone());
        }));

        let handle = start(
            fx.settings.clone(),
            FakeTranslator::ok(),
            fx.bus.clone(),
            ProviderSwitch::new(Provider::Google),
        )
        .unwrap();

        // Stage and rename so the watcher never sees a half-written file.
        let staging = fx.settings.dir.join("staging.tmp");
        std::fs::write(&staging, "chatMsg = \"[[CHAT||||6||||Ally||||for the faction]]\"").unwrap();
        std::fs::rename(&staging, fx.settings.file_path()).unwrap();
        let msg = time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no message published")
            .unwrap();
        assert_eq!(msg.target, SinkId::Primary);
        assert_eq!(msg.color, "green");
        assert_eq!(msg.text, "Ally:FOR THE FACTION(ja)");
        handle.shutdown();
    }

    #[tokio::test]
    async fn watch_survives_repeated_refresh() {
        let mut fx = Fixture::new();
        fx.settings.watch_refresh_interval = Duration::from_millis(20);
        fx.settings.debounce = Duration::ZERO;
        std::fs::write(fx.settings.file_path(), CONSUMED_SENTINEL).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<TranslatedMessage>();
        fx.bus.subscribe(Arc::new(move |m: &TranslatedMessage| {
            let _ = tx.send(m.clone());
        }));

        let handle = start(
            fx.settings.clone(),
            FakeTranslator::ok(),
            fx.bus.clone(),
            ProviderSwitch::new(Provider::Google),
        )
        .unwrap();
        time::sleep(Duration::from_millis(120)).await;

        // A rewrite can land inside an unwatch/watch gap, so keep writing
        // fresh messages until one comes through.
        let staging = fx.settings.dir.join("staging.tmp");
        let mut received = None;
        for attempt in 0..20 {
            let marker = format!("chatMsg = \"[[CHAT||||7||||Officer||||raid tonight {}]]\"", attempt);
            std::fs::write(&staging, marker).unwrap();
            std::fs::rename(&staging, fx.settings.file_path()).unwrap();
            if let Ok(Some(msg)) = time::timeout(Duration::from_millis(500), rx.recv()).await {
                received = Some(msg);
                break;
            }
        }
        let msg = received.expect("no message published after refresh");
        assert!(msg.text.starts_with("Officer:RAID TONIGHT"));
        handle.shutdown();
    }
}
