//! Half-open validity periods
//!
//! A `Period` is `[lower, upper)` over commit timestamps. `u64::MAX` as the
//! upper bound stands for +inf: the value is still valid today and will stay
//! valid until someone writes the key again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound used for periods that are still open
pub const INFINITE: u64 = u64::MAX;

/// A half-open timestamp interval `[lower, upper)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    lower: u64,
    upper: u64,
}

impl Period {
    /// Create a period; `lower` must not exceed `upper`
    pub fn new(lower: u64, upper: u64) -> Self {
        debug_assert!(lower <= upper, "period lower bound {} > upper {}", lower, upper);
        Period { lower, upper }
    }

    /// `[0, +inf)`
    pub const fn eternal() -> Self {
        Period {
            lower: 0,
            upper: INFINITE,
        }
    }

    /// `[lower, +inf)`
    pub const fn starting_at(lower: u64) -> Self {
        Period {
            lower,
            upper: INFINITE,
        }
    }

    /// Inclusive lower bound
    #[inline]
    pub fn lower(&self) -> u64 {
        self.lower
    }

    /// Exclusive upper bound, `INFINITE` when open
    #[inline]
    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Whether the period has no upper bound
    pub fn is_open_ended(&self) -> bool {
        self.upper == INFINITE
    }

    /// Whether the period contains no timestamp at all
    pub fn is_empty(&self) -> bool {
        self.lower == self.upper
    }

    /// Whether `timestamp` is inside `[lower, upper)`
    pub fn contains(&self, timestamp: u64) -> bool {
        timestamp >= self.lower && timestamp < self.upper
    }

    /// Shrink the upper bound to `upper` if that is earlier
    pub fn cap_upper(self, upper: u64) -> Self {
        Period {
            lower: self.lower,
            upper: self.upper.min(upper.max(self.lower)),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open_ended() {
            write!(f, "[{}; +inf)", self.lower)
        } else {
            write!(f, "[{}; {})", self.lower, self.upper)
        }
    }
}
