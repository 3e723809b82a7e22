//! Handle identifiers.
//!
//! Every element, text and raw node of the live tree carries a [`Hid`]. Hids
//! come from one monotonic counter per session and are never handed out
//! twice; releasing one only updates bookkeeping.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Stable identity of a live node. `h0` is the client's mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hid(u64);

impl Hid {
    /// The container the session's root nodes are mounted into.
    pub const ROOT: Hid = Hid(0);

    /// Placeholder carried by freshly built nodes before diffing.
    pub const UNASSIGNED: Hid = Hid(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_assigned(&self) -> bool {
        *self != Self::UNASSIGNED
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

impl FromStr for Hid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('h')
            .and_then(|digits| digits.parse::<u64>().ok())
            .filter(|raw| *raw != u64::MAX)
            .map(Hid)
            .ok_or_else(|| ProtocolError::InvalidHid(s.to_string()))
    }
}

/// Monotonic hid source for one session.
#[derive(Debug, Clone)]
pub struct HidAllocator {
    next: u64,
    live: u64,
}

impl Default for HidAllocator {
    fn default() -> Self {
        Self { next: 1, live: 0 }
    }
}

impl HidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first hid is `next`, for sessions rebuilt from saved
    /// state. Never starts below `h1`.
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: next.max(1),
            live: 0,
        }
    }

    pub fn allocate(&mut self) -> Hid {
        let hid = Hid(self.next);
        self.next += 1;
        self.live += 1;
        hid
    }

    pub fn release(&mut self, _hid: Hid) {
        self.live = self.live.saturating_sub(1);
    }

    /// Hids allocated and not yet released.
    pub fn live(&self) -> u64 {
        self.live
    }

    /// Total hids ever handed out.
    pub fn issued(&self) -> u64 {
        self.next - 1
    }

    /// The hid the next allocation will return.
    pub fn peek(&self) -> Hid {
        Hid(self.next)
    }
}
