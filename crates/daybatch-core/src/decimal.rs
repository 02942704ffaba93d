//! Precision-safe price type.
//!
//! Uses `rust_decimal` for exact decimal arithmetic, avoiding
//! floating-point rounding errors in fill-average bookkeeping.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::str::FromStr;

/// Price with exact decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Lossy conversion for persistence in REAL columns.
    #[inline]
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Build from a REAL column value.
    #[inline]
    pub fn from_f64(value: f64) -> Option<Self> {
        Decimal::from_f64(value).map(Self)
    }

    /// Qty-weighted running average: the price a new fill of `delta_qty`
    /// must have had for the aggregate `(new_cum, new_avg)` to hold given
    /// the prior aggregate `(old_cum, old_avg)`.
    pub fn solve_fill_price(
        old_cum: i64,
        old_avg: Price,
        new_cum: i64,
        new_avg: Price,
    ) -> Option<Price> {
        let delta = new_cum - old_cum;
        if delta <= 0 {
            return None;
        }
        let total_new = new_avg.0 * Decimal::from(new_cum);
        let total_old = old_avg.0 * Decimal::from(old_cum);
        Some(Price((total_new - total_old) / Decimal::from(delta)))
    }

    /// Weighted average over `(qty, price)` pairs. `None` when total qty is zero.
    pub fn weighted_average(fills: &[(i64, Price)]) -> Option<Price> {
        let total_qty: i64 = fills.iter().map(|(q, _)| q).sum();
        if total_qty <= 0 {
            return None;
        }
        let total: Decimal = fills
            .iter()
            .map(|(q, p)| p.0 * Decimal::from(*q))
            .sum();
        Some(Price(total / Decimal::from(total_qty)))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Price {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Mul<Decimal> for Price {
    type Output = Self;

    fn mul(self, rhs: Decimal) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Div<Decimal> for Price {
    type Output = Self;

    fn div(self, rhs: Decimal) -> Self::Output {
        Self(self.0 / rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_solve_fill_price_from_aggregates() {
        // 100 @ 500, then broker reports cum=300 avg=500.6666...
        // The synthetic 200-share fill must come out at ~501.
        let old_avg = Price::new(dec!(500));
        let new_avg = Price::new(dec!(500.666666666666666666666667));
        let fill = Price::solve_fill_price(100, old_avg, 300, new_avg).unwrap();
        let diff = (fill.0 - dec!(501)).abs();
        assert!(diff < dec!(0.0001), "fill price {fill} not near 501");
    }

    #[test]
    fn test_solve_fill_price_first_observation() {
        let fill = Price::solve_fill_price(0, Price::ZERO, 100, Price::new(dec!(950))).unwrap();
        assert_eq!(fill, Price::new(dec!(950)));
    }

    #[test]
    fn test_solve_fill_price_rejects_non_increase() {
        assert!(Price::solve_fill_price(100, Price::ZERO, 100, Price::ZERO).is_none());
        assert!(Price::solve_fill_price(100, Price::ZERO, 50, Price::ZERO).is_none());
    }

    #[test]
    fn test_weighted_average() {
        let avg = Price::weighted_average(&[
            (100, Price::new(dec!(500))),
            (200, Price::new(dec!(501))),
        ])
        .unwrap();
        let diff = (avg.0 - dec!(500.6666)).abs();
        assert!(diff < dec!(0.001));
    }

    #[test]
    fn test_weighted_average_empty() {
        assert!(Price::weighted_average(&[]).is_none());
    }

    #[test]
    fn test_f64_round_trip() {
        let p = Price::new(dec!(1234.5));
        assert_eq!(Price::from_f64(p.to_f64()).unwrap(), p);
    }
}
