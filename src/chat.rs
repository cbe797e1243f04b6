use log::{debug, trace};
use regex::Regex;
use std::sync::OnceLock;

/// Written back to the chat file once a marker has been consumed. The addon
/// treats an empty table as "nothing pending".
pub const CONSUMED_SENTINEL: &str = "return {}";

// ─── Channel ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    General,
    WhisperIn,
    WhisperOut,
    PartyOut,
    PartyIn,
    Raid,
    Faction,
    Guild,
    Commander,
    Trial,
    Unknown(String),
}

impl Channel {
    pub fn from_id(id: &str) -> Self {
        match id {
            "0" => Self::General,
            "-3" => Self::WhisperIn,
            "-4" => Self::WhisperOut,
            "3" => Self::PartyOut,
            "4" => Self::PartyIn,
            "5" => Self::Raid,
            "6" => Self::Faction,
            "7" => Self::Guild,
            "10" => Self::Commander,
            "11" => Self::Trial,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::General => "General",
            Self::WhisperIn => "Whisper",
            Self::WhisperOut => "To",
            Self::PartyOut | Self::PartyIn => "Party",
            Self::Raid => "Raid",
            Self::Faction => "Faction",
            Self::Guild => "Guild",
            Self::Commander => "Commander",
            Self::Trial => "Trial",
            Self::Unknown(_) => "???",
        }
    }
}

// ─── Chat event ─────────────────────────────────────────────────────

/// One chat line lifted out of the addon's chat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Raw channel identifier as written by the addon.
    pub channel: String,
    pub speaker: String,
    pub message: String,
}

impl ChatEvent {
    pub fn channel_kind(&self) -> Channel {
        Channel::from_id(&self.channel)
    }
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)chatMsg\s*=\s*"\[\[CHAT\|\|\|\|(.*?)\|\|\|\|(.*?)\|\|\|\|(.*?)\]\]""#)
            .expect("chat marker pattern is valid")
    })
}

/// Find the first `chatMsg = "[[CHAT||||channel||||speaker||||message]]"`
/// marker in the file content. Anything around it is ignored.
pub fn parse_marker(content: &str) -> Option<ChatEvent> {
    let Some(caps) = marker_pattern().captures(content) else {
        trace!("no chat marker in {} bytes of content", content.len());
        return None;
    };

    let event = ChatEvent {
        channel: caps[1].to_string(),
        speaker: caps[2].to_string(),
        message: caps[3].to_string(),
    };
    debug!(
        "parsed marker: ch={} ({}) speaker=\"{}\" len={}",
        event.channel,
        event.channel_kind().label(),
        event.speaker,
        event.message.len(),
    );
    Some(event)
}
