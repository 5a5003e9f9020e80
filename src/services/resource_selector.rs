//! Resource selection
//!
//! Ranks the competing offers for one episode. Resolution wins first, then the
//! best subtitle language a resource carries. Ties keep input order so the
//! comparison can drive any stable sort.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Resolution tier, ordered from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Unknown,
    P720,
    P1080,
    P2160,
}

impl Resolution {
    /// Detect the tier from a release title
    pub fn detect(title: &str) -> Self {
        static PATTERNS: LazyLock<[(Regex, Resolution); 3]> = LazyLock::new(|| {
            [
                (
                    Regex::new(r"(?i)2160p|\b4k\b|\buhd\b|3840\s*[x×]\s*2160").unwrap(),
                    Resolution::P2160,
                ),
                (
                    Regex::new(r"(?i)1080[pi]|1920\s*[x×]\s*1080").unwrap(),
                    Resolution::P1080,
                ),
                (
                    Regex::new(r"(?i)720p|1280\s*[x×]\s*720").unwrap(),
                    Resolution::P720,
                ),
            ]
        });

        PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(title))
            .map(|(_, resolution)| *resolution)
            .unwrap_or(Resolution::Unknown)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Unknown => write!(f, "unknown"),
            Resolution::P720 => write!(f, "720p"),
            Resolution::P1080 => write!(f, "1080p"),
            Resolution::P2160 => write!(f, "2160p"),
        }
    }
}

/// Subtitle language, ordered from least to most preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubtitleLanguage {
    Unknown,
    TraditionalChinese,
    SimplifiedChinese,
}

impl SubtitleLanguage {
    /// Detect every subtitle language a release title advertises
    pub fn detect(title: &str) -> Vec<Self> {
        static SIMPLIFIED: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"(?i)简|chs|(^|[^a-z])gb([^a-z]|$)").unwrap());
        static TRADITIONAL: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"(?i)繁|cht|big5").unwrap());

        let mut languages = Vec::new();
        if SIMPLIFIED.is_match(title) {
            languages.push(SubtitleLanguage::SimplifiedChinese);
        }
        if TRADITIONAL.is_match(title) {
            languages.push(SubtitleLanguage::TraditionalChinese);
        }
        languages
    }
}

/// What a resource contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Regular,
    Special,
    Collection,
    Unknown,
}

/// How the content of a resource is obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResourcePayload {
    Torrent(Vec<u8>),
    Magnet(String),
}

/// One offer for an episode's media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Content hash; identity of the resource
    pub hash: String,
    pub title: String,
    pub resolution: Resolution,
    pub subtitles: Vec<SubtitleLanguage>,
    pub kind: ResourceKind,
    pub payload: ResourcePayload,
    /// Cleared once the resource is proven broken
    pub valid: bool,
}

impl Resource {
    /// Build a resource whose tiers are derived from its release title
    pub fn from_title(
        hash: impl Into<String>,
        title: impl Into<String>,
        kind: ResourceKind,
        payload: ResourcePayload,
    ) -> Self {
        let title = title.into();
        Self {
            hash: hash.into(),
            resolution: Resolution::detect(&title),
            subtitles: SubtitleLanguage::detect(&title),
            title,
            kind,
            payload,
            valid: true,
        }
    }

    /// Best subtitle language this resource offers
    pub fn best_subtitle(&self) -> SubtitleLanguage {
        self.subtitles
            .iter()
            .copied()
            .max()
            .unwrap_or(SubtitleLanguage::Unknown)
    }

    /// Source reference handed to the relay service
    pub fn source_reference(&self) -> String {
        match &self.payload {
            ResourcePayload::Magnet(magnet) => magnet.clone(),
            ResourcePayload::Torrent(_) => {
                format!("magnet:?xt=urn:btih:{}", self.hash.to_lowercase())
            }
        }
    }
}

/// Ordering used for ranking: `Less` means `a` ranks above `b`
pub fn compare_resources(a: &Resource, b: &Resource) -> Ordering {
    b.resolution
        .cmp(&a.resolution)
        .then_with(|| b.best_subtitle().cmp(&a.best_subtitle()))
}

/// Sort resources best first, keeping input order among equals
pub fn rank_resources(resources: &mut [Resource]) {
    resources.sort_by(compare_resources);
}

/// Pick the best resource, or `None` for an empty set
pub fn select_best_resource(resources: &[Resource]) -> Option<&Resource> {
    best_of(resources.iter())
}

/// Like [select_best_resource], ignoring resources known to be broken
pub fn select_best_valid_resource(resources: &[Resource]) -> Option<&Resource> {
    best_of(resources.iter().filter(|r| r.valid))
}

// First resource wins unless a later one ranks strictly higher.
fn best_of<'a>(resources: impl Iterator<Item = &'a Resource>) -> Option<&'a Resource> {
    resources.fold(None, |best, candidate| match best {
        Some(current) if compare_resources(candidate, current) != Ordering::Less => Some(current),
        _ => Some(candidate),
    })
}
