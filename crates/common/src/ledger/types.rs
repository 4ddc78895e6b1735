use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{signature_hex, PublicKey, Signature};

/// Content-derived identifier naming a piece of data in the CAS
///
/// Opaque to us: equality is byte equality of the string the CAS handed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ContentKey {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for ContentKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for ContentKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replicated namespaces of the trust ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Networks,
    Peer,
    Trusted,
    Admin,
    /// Keys freshly imported by some node's directory watcher
    Files,
    /// Keys whose content was found and well-formed
    Verified,
    /// Keys durably pinned by at least one node
    Safe,
    Summaries,
    Pri,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown bucket: {0}")]
pub struct UnknownBucket(pub String);

impl Bucket {
    pub const ALL: [Bucket; 9] = [
        Bucket::Networks,
        Bucket::Peer,
        Bucket::Trusted,
        Bucket::Admin,
        Bucket::Files,
        Bucket::Verified,
        Bucket::Safe,
        Bucket::Summaries,
        Bucket::Pri,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Networks => "networks",
            Bucket::Peer => "peer",
            Bucket::Trusted => "trusted",
            Bucket::Admin => "admin",
            Bucket::Files => "files",
            Bucket::Verified => "verified",
            Bucket::Safe => "safe",
            Bucket::Summaries => "summaries",
            Bucket::Pri => "pri",
        }
    }

    /// The bucket a key is promoted into once this bucket's stage succeeds
    pub fn next(&self) -> Option<Bucket> {
        match self {
            Bucket::Files => Some(Bucket::Verified),
            Bucket::Verified => Some(Bucket::Safe),
            _ => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = UnknownBucket;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bucket::ALL
            .iter()
            .copied()
            .find(|bucket| bucket.as_str() == s)
            .ok_or_else(|| UnknownBucket(s.to_string()))
    }
}

/// Half-open validity window `[start, end)`
///
/// `end = None` means the window never closes. A window whose end is not
/// after its start is empty and contains no time points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn for_duration(start: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            start,
            end: Some(start + duration),
        }
    }

    pub fn unbounded(start: DateTime<Utc>) -> Self {
        Self { start, end: None }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.end, Some(end) if end <= self.start)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end - self.start)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        !self.is_empty() && self.start <= t && self.end.map_or(true, |end| t < end)
    }

    /// True once every point of the window lies in the past
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.end, Some(end) if end <= now)
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let starts_before_other_ends = other.end.map_or(true, |end| self.start < end);
        let other_starts_before_end = self.end.map_or(true, |end| other.start < end);
        starts_before_other_ends && other_starts_before_end
    }

    pub fn is_subset_of(&self, other: &Interval) -> bool {
        if self.is_empty() {
            return true;
        }
        if other.is_empty() || self.start < other.start {
            return false;
        }
        match (self.end, other.end) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(end), Some(other_end)) => end <= other_end,
        }
    }

    /// Smallest window covering both
    pub fn hull(&self, other: &Interval) -> Interval {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Interval {
            start: self.start.min(other.start),
            end,
        }
    }

    /// Remove `cut` from this window, keeping a single contiguous piece.
    ///
    /// The piece before `cut` wins when it is non-empty, otherwise the piece
    /// after it is kept. Returns `None` when nothing remains. The result is
    /// always a subset of `self`.
    pub fn subtract(&self, cut: &Interval) -> Option<Interval> {
        if self.is_empty() {
            return None;
        }
        if !self.overlaps(cut) {
            return Some(*self);
        }
        if self.start < cut.start {
            return Some(Interval {
                start: self.start,
                end: Some(cut.start),
            });
        }
        let cut_end = cut.end?;
        let after = Interval {
            start: cut_end,
            end: self.end,
        };
        (!after.is_empty()).then_some(after)
    }

    /// Every piece of this window left over once all `cuts` are removed,
    /// in time order. The pieces are disjoint subsets of `self`.
    pub fn subtract_all(&self, cuts: &[Interval]) -> Vec<Interval> {
        let mut cuts: Vec<&Interval> = cuts.iter().filter(|cut| !cut.is_empty()).collect();
        cuts.sort_by_key(|cut| cut.start);

        let mut pieces = Vec::new();
        let mut rest = (!self.is_empty()).then_some(*self);
        for cut in cuts {
            let Some(window) = rest else { break };
            if !window.overlaps(cut) {
                continue;
            }
            if window.start < cut.start {
                pieces.push(Interval {
                    start: window.start,
                    end: Some(cut.start),
                });
            }
            rest = cut.end.and_then(|cut_end| {
                let after = Interval {
                    start: cut_end,
                    end: window.end,
                };
                (!after.is_empty()).then_some(after)
            });
        }
        pieces.extend(rest);
        pieces
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start.to_rfc3339(), end.to_rfc3339()),
            None => write!(f, "[{}, ∞)", self.start.to_rfc3339()),
        }
    }
}

/// Who vouched for an entry, and their signature over the message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub origin: PublicKey,
    #[serde(with = "signature_hex")]
    pub signature: Signature,
}

/// "This key is believed valid within this window"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub key: ContentKey,
    pub interval: Interval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl TrustEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.interval.contains(now)
    }
}
