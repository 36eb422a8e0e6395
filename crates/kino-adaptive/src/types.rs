//! Core types for Kino Adaptive

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use url::Url;

/// Kind of media handled by one buffer pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Text,
    Image,
}

impl MediaType {
    /// Every media type, in the order pipelines are created
    pub const ALL: [MediaType; 4] = [
        MediaType::Video,
        MediaType::Audio,
        MediaType::Text,
        MediaType::Image,
    ];

    /// Whether the buffer for this type holds decoded-free data that can be
    /// kept around for much longer than audio/video
    pub fn is_lightweight(&self) -> bool {
        matches!(self, MediaType::Text | MediaType::Image)
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
            MediaType::Text => write!(f, "text"),
            MediaType::Image => write!(f, "image"),
        }
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if both dimensions fit inside `other`
    pub fn fits_in(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    /// Returns true if both dimensions are at least those of `other`
    pub fn covers(&self, other: &Resolution) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Whether a quality can be decrypted with the keys currently available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decipherable {
    Yes,
    No,
    Unknown,
}

impl Decipherable {
    fn to_u8(self) -> u8 {
        match self {
            Decipherable::Unknown => 0,
            Decipherable::Yes => 1,
            Decipherable::No => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Decipherable::Yes,
            2 => Decipherable::No,
            _ => Decipherable::Unknown,
        }
    }
}

/// Byte range for partial segment requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    /// Inclusive last byte offset
    pub fn end(&self) -> u64 {
        self.start + self.length - 1
    }
}

/// One addressable unit of media for one quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Sequence number
    pub number: u64,
    /// Start time in seconds
    pub time: f64,
    /// Duration in seconds (0 for init segments)
    pub duration: f64,
    /// URL to fetch the segment from, if the transport needs one
    pub url: Option<Url>,
    /// Byte range within the resource
    pub byte_range: Option<ByteRange>,
    /// Initialization segment flag
    pub is_init: bool,
}

impl Segment {
    /// Create a media segment
    pub fn media(number: u64, time: f64, duration: f64) -> Self {
        Self {
            number,
            time,
            duration,
            url: None,
            byte_range: None,
            is_init: false,
        }
    }

    /// Create an initialization segment
    pub fn init() -> Self {
        Self {
            number: 0,
            time: 0.0,
            duration: 0.0,
            url: None,
            byte_range: None,
            is_init: true,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_byte_range(mut self, range: ByteRange) -> Self {
        self.byte_range = Some(range);
        self
    }

    /// End time in seconds
    pub fn end(&self) -> f64 {
        self.time + self.duration
    }
}

/// Ordered list of segments available for a quality
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentIndex {
    /// Initialization segment, if the container needs one
    pub init: Option<Segment>,
    /// Media segments sorted by time
    pub segments: Vec<Segment>,
    /// No segment will ever be added after the last one
    pub finished: bool,
}

impl SegmentIndex {
    pub fn new(init: Option<Segment>, mut segments: Vec<Segment>, finished: bool) -> Self {
        segments.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            init,
            segments,
            finished,
        }
    }

    /// Build an index of `count` contiguous segments of `duration` seconds
    /// starting at `start`
    pub fn uniform(start: f64, duration: f64, count: u64, with_init: bool) -> Self {
        let segments = (0..count)
            .map(|i| Segment::media(i + 1, start + i as f64 * duration, duration))
            .collect();
        Self::new(with_init.then(Segment::init), segments, true)
    }

    /// Segments overlapping `[start, end)`
    pub fn segments_in(&self, start: f64, end: f64) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(move |s| s.end() > start && s.time < end)
    }

    /// End of the last known segment
    pub fn last_position(&self) -> Option<f64> {
        self.segments.last().map(Segment::end)
    }

    /// First known position
    pub fn first_position(&self) -> Option<f64> {
        self.segments.first().map(|s| s.time)
    }

    /// Whether segments needed for `[start, end)` are probably not announced yet
    pub fn should_refresh(&self, _start: f64, end: f64) -> bool {
        if self.finished {
            return false;
        }
        match self.last_position() {
            Some(last) => end > last,
            None => true,
        }
    }

    /// If `time` falls into a hole between two segments, returns the start of
    /// the segment that follows it
    pub fn check_discontinuity(&self, time: f64) -> Option<f64> {
        let first = self.first_position()?;
        if time < first {
            return None;
        }
        if self.segments.iter().any(|s| s.time <= time && s.end() > time) {
            return None;
        }
        self.segments.iter().find(|s| s.time > time).map(|s| s.time)
    }
}

#[derive(Debug, Default)]
struct DecipherableCell(AtomicU8);

/// One fixed-bitrate encoding of a track (a "representation")
#[derive(Debug)]
pub struct Quality {
    /// Unique identifier within its track
    pub id: String,
    /// Bitrate in bits per second
    pub bitrate: u64,
    /// Video resolution (if video track)
    pub resolution: Option<Resolution>,
    /// Codec string as announced in the manifest
    pub codec: Option<String>,
    /// Segments of this quality
    pub index: SegmentIndex,
    decipherable: DecipherableCell,
}

impl Quality {
    pub fn new(id: impl Into<String>, bitrate: u64, index: SegmentIndex) -> Self {
        Self {
            id: id.into(),
            bitrate,
            resolution: None,
            codec: None,
            index,
            decipherable: DecipherableCell::default(),
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    /// Current decipherability state
    pub fn decipherable(&self) -> Decipherable {
        Decipherable::from_u8(self.decipherable.0.load(Ordering::Acquire))
    }

    /// Updated by the decryption layer
    pub fn set_decipherable(&self, value: Decipherable) {
        self.decipherable.0.store(value.to_u8(), Ordering::Release);
    }

    /// Whether this quality may still be chosen
    pub fn is_playable(&self) -> bool {
        self.decipherable() != Decipherable::No
    }
}

/// Set of qualities for one media type within a period
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub media_type: MediaType,
    /// Sorted by ascending bitrate
    pub qualities: Vec<Arc<Quality>>,
}

impl Track {
    pub fn new(id: impl Into<String>, media_type: MediaType, qualities: Vec<Quality>) -> Self {
        let mut qualities: Vec<Arc<Quality>> = qualities.into_iter().map(Arc::new).collect();
        qualities.sort_by_key(|q| q.bitrate);
        Self {
            id: id.into(),
            media_type,
            qualities,
        }
    }

    /// Qualities that have not been blacklisted by the decryption layer
    pub fn playable_qualities(&self) -> Vec<Arc<Quality>> {
        self.qualities
            .iter()
            .filter(|q| q.is_playable())
            .cloned()
            .collect()
    }
}

/// A time-bounded part of the content with its own set of tracks
#[derive(Debug)]
pub struct Period {
    pub id: String,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds, `None` while the period is still open
    pub end: Option<f64>,
    pub tracks: HashMap<MediaType, Track>,
}

impl Period {
    pub fn new(id: impl Into<String>, start: f64, end: Option<f64>) -> Self {
        Self {
            id: id.into(),
            start,
            end,
            tracks: HashMap::new(),
        }
    }

    pub fn with_track(mut self, track: Track) -> Self {
        self.tracks.insert(track.media_type, track);
        self
    }

    /// Track chosen for a media type
    pub fn track(&self, media_type: MediaType) -> Option<&Track> {
        self.tracks.get(&media_type)
    }

    /// End of the period, or infinity while it is open
    pub fn end_or_infinity(&self) -> f64 {
        self.end.unwrap_or(f64::INFINITY)
    }

    /// Whether `time` falls inside `[start, end)`
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end_or_infinity()
    }
}

/// Snapshot of the playback state reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackObservation {
    /// Current position in seconds
    pub position: f64,
    /// Seconds of contiguous buffered data ahead of the position
    pub buffer_gap: f64,
    /// Playback rate (1.0 = normal)
    pub speed: f64,
    pub paused: bool,
    /// Distance to the live edge, for dynamic contents
    pub live_gap: Option<f64>,
    /// Content duration, if known
    pub duration: Option<f64>,
}

impl Default for PlaybackObservation {
    fn default() -> Self {
        Self {
            position: 0.0,
            buffer_gap: 0.0,
            speed: 1.0,
            paused: true,
            live_gap: None,
            duration: None,
        }
    }
}

impl PlaybackObservation {
    pub fn at(position: f64) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn with_buffer_gap(mut self, buffer_gap: f64) -> Self {
        self.buffer_gap = buffer_gap;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_live_gap(mut self, live_gap: f64) -> Self {
        self.live_gap = Some(live_gap);
        self
    }

    pub fn playing(mut self) -> Self {
        self.paused = false;
        self
    }
}

/// Output of the quality selector
#[derive(Debug, Clone)]
pub struct Estimate {
    pub quality: Arc<Quality>,
    /// Bandwidth estimate in bits per second, when one is available
    pub bitrate: Option<f64>,
    /// The switch should happen right away rather than for future segments
    pub urgent: bool,
    /// Chosen because of a manual bitrate setting
    pub manual: bool,
    /// Bitrate of the last quality known to be maintainable
    pub known_stable_bitrate: Option<f64>,
}

impl PartialEq for Estimate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.quality, &other.quality)
            && self.bitrate == other.bitrate
            && self.urgent == other.urgent
            && self.manual == other.manual
            && self.known_stable_bitrate == other.known_stable_bitrate
    }
}

/// Segment scheduled for download
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub segment: Segment,
    /// Lower is more urgent
    pub priority: i32,
}
