//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::{Decimal, MathematicalOps};

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Relative gap between two notionals, measured against the larger one.
pub fn relative_gap(a: Decimal, b: Decimal) -> Decimal {
    safe_div((a - b).abs(), a.abs().max(b.abs()))
}

/// Square root, zero for negative or unrepresentable input.
pub fn sqrt_or_zero(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    value.sqrt().unwrap_or(Decimal::ZERO)
}
