//! Numeric values carried by scalars, statistics and boundaries.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A long or a double. Mixed arithmetic widens to double.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Numeric {
    Long(i64),
    Double(f64),
}

impl Numeric {
    pub const ZERO: Numeric = Numeric::Long(0);

    pub fn as_f64(self) -> f64 {
        match self {
            Numeric::Long(v) => v as f64,
            Numeric::Double(v) => v,
        }
    }

    pub fn is_long(self) -> bool {
        matches!(self, Numeric::Long(_))
    }

    /// Divide by `n`, rounding towards negative infinity for longs.
    ///
    /// A non-positive divisor leaves the value unchanged.
    pub fn floor_div(self, n: i64) -> Numeric {
        if n <= 0 {
            return self;
        }
        match self {
            Numeric::Long(v) => Numeric::Long(v.div_euclid(n)),
            Numeric::Double(v) => Numeric::Double(v / n as f64),
        }
    }

    /// Total order over both representations; NaN sorts last.
    pub fn compare(self, other: Numeric) -> Ordering {
        match (self, other) {
            (Numeric::Long(a), Numeric::Long(b)) => a.cmp(&b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }

    pub fn min(self, other: Numeric) -> Numeric {
        if other.compare(self) == Ordering::Less {
            other
        } else {
            self
        }
    }

    pub fn max(self, other: Numeric) -> Numeric {
        if other.compare(self) == Ordering::Greater {
            other
        } else {
            self
        }
    }
}

impl Default for Numeric {
    fn default() -> Self {
        Numeric::ZERO
    }
}

impl Add for Numeric {
    type Output = Numeric;

    fn add(self, rhs: Numeric) -> Numeric {
        match (self, rhs) {
            (Numeric::Long(a), Numeric::Long(b)) => match a.checked_add(b) {
                Some(v) => Numeric::Long(v),
                None => Numeric::Double(a as f64 + b as f64),
            },
            (a, b) => Numeric::Double(a.as_f64() + b.as_f64()),
        }
    }
}

impl Sub for Numeric {
    type Output = Numeric;

    fn sub(self, rhs: Numeric) -> Numeric {
        match (self, rhs) {
            (Numeric::Long(a), Numeric::Long(b)) => match a.checked_sub(b) {
                Some(v) => Numeric::Long(v),
                None => Numeric::Double(a as f64 - b as f64),
            },
            (a, b) => Numeric::Double(a.as_f64() - b.as_f64()),
        }
    }
}

impl PartialEq for Numeric {
    fn eq(&self, other: &Self) -> bool {
        self.compare(*other) == Ordering::Equal
    }
}

impl PartialOrd for Numeric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(*other))
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric::Long(v)
    }
}

impl From<f64> for Numeric {
    fn from(v: f64) -> Self {
        Numeric::Double(v)
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::Long(v) => write!(f, "{v}"),
            Numeric::Double(v) => write!(f, "{v}"),
        }
    }
}

impl std::str::FromStr for Numeric {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(v) => Ok(Numeric::Long(v)),
            Err(_) => s.trim().parse::<f64>().map(Numeric::Double),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_arithmetic_widens() {
        assert_eq!(Numeric::Long(2) + Numeric::Long(3), Numeric::Long(5));
        assert!(!(Numeric::Long(2) + Numeric::Double(0.5)).is_long());
        assert_eq!(Numeric::Long(2) + Numeric::Double(0.5), Numeric::Double(2.5));
        assert_eq!(Numeric::Double(1.5) - Numeric::Long(1), Numeric::Double(0.5));
    }

    #[test]
    fn long_overflow_widens_to_double() {
        let sum = Numeric::Long(i64::MAX) + Numeric::Long(1);
        assert!(!sum.is_long());
    }

    #[test]
    fn floor_div_rounds_down() {
        assert_eq!(Numeric::Long(10).floor_div(3), Numeric::Long(3));
        assert_eq!(Numeric::Long(-7).floor_div(2), Numeric::Long(-4));
        assert_eq!(Numeric::Double(10.5).floor_div(2), Numeric::Double(5.25));
        assert_eq!(Numeric::Long(10).floor_div(0), Numeric::Long(10));
    }

    #[test]
    fn parse_prefers_long() {
        assert!("42".parse::<Numeric>().unwrap().is_long());
        assert_eq!("10.5".parse::<Numeric>().unwrap(), Numeric::Double(10.5));
        assert!("ten".parse::<Numeric>().is_err());
    }

    #[test]
    fn compare_across_representations() {
        assert_eq!(Numeric::Long(3).compare(Numeric::Double(3.0)), Ordering::Equal);
        assert_eq!(Numeric::Long(3).max(Numeric::Double(3.5)), Numeric::Double(3.5));
        assert_eq!(Numeric::Long(3).min(Numeric::Double(3.5)), Numeric::Long(3));
    }
}
