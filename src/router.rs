use crate::chat::Channel;

// ─── Sinks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkId {
    Primary,
    Secondary,
}

impl SinkId {
    pub const ALL: [SinkId; 2] = [SinkId::Primary, SinkId::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "chat1",
            Self::Secondary => "chat2",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Self::Primary => 0x01,
            Self::Secondary => 0x02,
        }
    }
}

/// Bitset over [`SinkId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkMask(u8);

impl SinkMask {
    pub const PRIMARY: SinkMask = SinkMask(0x01);
    pub const BOTH: SinkMask = SinkMask(0x03);

    pub fn contains(&self, sink: SinkId) -> bool {
        self.0 & sink.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Every sink whose bit is set, primary first.
    pub fn sinks(&self) -> Vec<SinkId> {
        SinkId::ALL.into_iter().filter(|s| self.contains(*s)).collect()
    }
}

// ─── Routes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub color: &'static str,
    pub sinks: SinkMask,
    pub prefix: Option<&'static str>,
}

impl Route {
    pub fn decorate(&self, text: &str) -> String {
        match self.prefix {
            Some(prefix) => format!("{}{}", prefix, text),
            None => text.to_string(),
        }
    }
}

/// Color, destination tabs and text prefix for a channel. `None` for
/// channels the overlay does not show.
pub fn route(channel: &Channel) -> Option<Route> {
    let (color, sinks, prefix) = match channel {
        Channel::General => ("white", SinkMask::PRIMARY, None),
        Channel::WhisperIn => ("fuchsia", SinkMask::PRIMARY, None),
        Channel::WhisperOut => ("fuchsia", SinkMask::PRIMARY, Some("To ")),
        Channel::Faction => ("green", SinkMask::PRIMARY, None),
        Channel::Guild => ("dodgerblue", SinkMask::PRIMARY, None),
        Channel::Trial => ("orange", SinkMask::PRIMARY, None),
        Channel::Raid => ("orange", SinkMask::BOTH, None),
        Channel::Commander => ("orange", SinkMask::BOTH, Some("Commander ")),
        Channel::PartyOut | Channel::PartyIn => ("lightgreen", SinkMask::BOTH, None),
        Channel::Unknown(_) => return None,
    };
    Some(Route {
        color,
        sinks,
        prefix,
    })
}
