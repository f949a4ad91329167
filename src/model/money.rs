//! Fixed-precision money helpers.
//!
//! Batch and PO values drive priority-queue scoring and must never be
//! compared or summed as binary floating point. `Money` wraps `rust_decimal`
//! at a fixed 2-decimal-place scale.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::Add;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value.round_dp(2))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Negated value, used as the primary-queue sort score (`-totalValue`).
    pub fn negated(&self) -> Decimal {
        -self.0
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl From<Decimal> for Money {
    fn from(d: Decimal) -> Self {
        Money::new(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sums_without_float_drift() {
        let values = vec![Money::new(dec!(10000.10)), Money::new(dec!(5000.05)), Money::new(dec!(2000.00))];
        let total: Money = values.into_iter().sum();
        assert_eq!(total.as_decimal(), dec!(17000.15));
    }

    #[test]
    fn negated_is_used_for_priority_score() {
        let m = Money::new(dec!(250.00));
        assert_eq!(m.negated(), dec!(-250.00));
    }
}
