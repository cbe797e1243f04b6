mod bus;
mod chat;
mod config;
mod overlay;
mod router;
mod translation;
mod watcher;

use log::{error, info, warn};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;

use bus::MessageBus;
use translation::{HttpTranslator, Provider, ProviderSwitch};
use watcher::{WatchError, WatchSettings};

// ─── Logging ─────────────────────────────────────────────────────────

fn setup_logging() {
    let log_path = config::config_dir().join("chat-translator.log");
    config::rotate_file(&log_path);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_millis(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Trace)
        .chain(std::io::stderr());

    if let Ok(file) = log_file {
        dispatch = dispatch.chain(file);
    } else {
        eprintln!("Warning: could not open log file {}", log_path.display());
    }

    dispatch.apply().expect("Failed to initialize logger");
    // Narrowed again once the config is loaded.
    log::set_max_level(log::LevelFilter::Info);
}

/// Forward console lines from a plain thread so a pending read never holds
/// up runtime shutdown.
fn spawn_console_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn effective_provider(cfg: &config::AppConfig) -> Provider {
    if cfg.provider == Provider::DeepL {
        if let Err(e) = translation::validate_deepl_target(&cfg.target_language) {
            error!("{}; falling back to Google", e);
            return Provider::Google;
        }
    }
    cfg.provider
}

// ─── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    setup_logging();
    info!("Addon chat translator starting");

    let cfg = config::AppConfig::load();
    log::set_max_level(cfg.log_level());

    let api_key = config::load_api_key(&cfg.api_key_path());
    let provider = ProviderSwitch::new(effective_provider(&cfg));

    let bus = MessageBus::new();
    let overlay = overlay::Overlay::new(cfg.save_history);
    let tab_handler = overlay.attach(&bus);
    info!("Message bus subscribers: {}", bus.subscriber_count());
    let monitor = overlay::spawn_monitor(Arc::clone(&overlay), bus.clone(), cfg.monitor_interval());
    overlay::announce_startup(&bus, provider.current(), !api_key.is_empty());

    let translator = match HttpTranslator::new(api_key, cfg.translate_timeout()) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("Failed to create HTTP client: {}", e);
            return;
        }
    };

    let watch = WatchSettings::from_config(&cfg)
        .map_err(WatchError::from)
        .and_then(|settings| watcher::start(settings, translator, bus.clone(), provider.clone()));
    let watch = match watch {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Chat watcher not started: {}", e);
            None
        }
    };

    info!("Type 'engine' to switch translation engine, 'quit' to exit");
    let mut commands = spawn_console_reader();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => match cmd.trim() {
                    "engine" => overlay::announce_engine(&bus, provider.toggle()),
                    "quit" | "exit" => break,
                    "" => {}
                    other => warn!("Unknown command: {}", other),
                },
                // No console attached; run until interrupted.
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
            },
        }
    }

    if let Some(handle) = watch {
        handle.shutdown();
    }
    monitor.abort();
    bus.unsubscribe(&tab_handler);
    info!("Message bus subscribers after shutdown: {}", bus.subscriber_count());
    info!("Addon chat translator exiting");
}
