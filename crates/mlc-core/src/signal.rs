//! Control signals delivered to workers and the media identifiers they carry.

use std::fmt;

/// Storage medium family, as numbered by the storage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaType(pub u8);

impl MediaType {
    pub const INTERNAL: MediaType = MediaType(1);
    pub const EXTERNAL: MediaType = MediaType(2);
    pub const UNSET: MediaType = MediaType(0xFF);
}

/// Selection order of one medium: its family plus its rank within the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaPriority {
    pub media_type: MediaType,
    pub rank: u8,
}

impl MediaPriority {
    pub const UNSET: MediaPriority = MediaPriority {
        media_type: MediaType::UNSET,
        rank: 0xFF,
    };

    pub const fn new(media_type: MediaType, rank: u8) -> Self {
        Self { media_type, rank }
    }

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    /// Media type in the high byte, rank in the low byte.
    pub const fn pack(self) -> u16 {
        ((self.media_type.0 as u16) << 8) | self.rank as u16
    }

    pub const fn unpack(raw: u16) -> Self {
        Self {
            media_type: MediaType((raw >> 8) as u8),
            rank: raw as u8,
        }
    }
}

impl Default for MediaPriority {
    fn default() -> Self {
        Self::UNSET
    }
}

impl fmt::Display for MediaPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            write!(f, "unset")
        } else {
            write!(f, "{}:{}", self.media_type.0, self.rank)
        }
    }
}

/// Message alphabet of the worker mailboxes.
///
/// Everything except `NewItem` is broadcast to every worker; `Cancel` is
/// acted on only by the item whose tag matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    None,
    /// Another item is queued behind the running one.
    NewItem,
    Stop,
    /// The medium with this priority went away.
    Vanish(MediaPriority),
    /// The storage manager now prefers the medium with this priority.
    CommonDestChange(MediaPriority),
    Clean,
    Cancel {
        tag: u8,
    },
}

const KIND_NONE: u8 = 0;
const KIND_NEW_ITEM: u8 = 1;
const KIND_STOP: u8 = 2;
const KIND_VANISH: u8 = 3;
const KIND_COMMON_DEST_CHANGE: u8 = 4;
const KIND_CLEAN: u8 = 5;
const KIND_CANCEL: u8 = 6;

impl ControlSignal {
    /// Packed form: kind in the top byte, media type in the next one, rank
    /// (or the cancelled tag) in the low byte.
    pub fn encode(self) -> u32 {
        let (kind, media, low) = match self {
            ControlSignal::None => (KIND_NONE, 0, 0),
            ControlSignal::NewItem => (KIND_NEW_ITEM, 0, 0),
            ControlSignal::Stop => (KIND_STOP, 0, 0),
            ControlSignal::Vanish(p) => (KIND_VANISH, p.media_type.0, p.rank),
            ControlSignal::CommonDestChange(p) => {
                (KIND_COMMON_DEST_CHANGE, p.media_type.0, p.rank)
            }
            ControlSignal::Clean => (KIND_CLEAN, 0, 0),
            ControlSignal::Cancel { tag } => (KIND_CANCEL, 0, tag),
        };
        (u32::from(kind) << 24) | (u32::from(media) << 16) | u32::from(low)
    }

    /// Inverse of [`encode`](Self::encode). Unknown kinds decode to `None`.
    pub fn decode(raw: u32) -> Self {
        let kind = (raw >> 24) as u8;
        let priority = MediaPriority::new(MediaType((raw >> 16) as u8), raw as u8);
        match kind {
            KIND_NEW_ITEM => ControlSignal::NewItem,
            KIND_STOP => ControlSignal::Stop,
            KIND_VANISH => ControlSignal::Vanish(priority),
            KIND_COMMON_DEST_CHANGE => ControlSignal::CommonDestChange(priority),
            KIND_CLEAN => ControlSignal::Clean,
            KIND_CANCEL => ControlSignal::Cancel { tag: raw as u8 },
            _ => ControlSignal::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ControlSignal::None)
    }
}

/// Asynchronous notifications coming out of the storage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    /// The current destination medium for auto-allocated items changed.
    MediaChanged(MediaPriority),
    /// A medium became inactive (unmounted, removed, full).
    MediaInactive(MediaPriority),
}

impl StorageEvent {
    pub fn into_signal(self) -> ControlSignal {
        match self {
            StorageEvent::MediaChanged(p) => ControlSignal::CommonDestChange(p),
            StorageEvent::MediaInactive(p) => ControlSignal::Vanish(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_packs_type_high_rank_low() {
        let p = MediaPriority::new(MediaType::EXTERNAL, 3);
        assert_eq!(p.pack(), 0x0203);
        assert_eq!(MediaPriority::unpack(0x0203), p);
        assert!(MediaPriority::default().is_unset());
        assert_eq!(p.to_string(), "2:3");
    }

    #[test]
    fn signal_layout_matches_packed_convention() {
        let vanish = ControlSignal::Vanish(MediaPriority::new(MediaType::INTERNAL, 2));
        assert_eq!(vanish.encode(), 0x0301_0002);
        assert_eq!(ControlSignal::Cancel { tag: 5 }.encode(), 0x0600_0005);
        assert_eq!(ControlSignal::decode(0x0301_0002), vanish);
        assert_eq!(ControlSignal::decode(0x0600_0005), ControlSignal::Cancel { tag: 5 });
        assert_eq!(ControlSignal::decode(0xEE00_0000), ControlSignal::None);
    }

    #[test]
    fn storage_events_map_to_signals() {
        let p = MediaPriority::new(MediaType::EXTERNAL, 1);
        assert_eq!(
            StorageEvent::MediaChanged(p).into_signal(),
            ControlSignal::CommonDestChange(p)
        );
        assert_eq!(
            StorageEvent::MediaInactive(p).into_signal(),
            ControlSignal::Vanish(p)
        );
    }
}
