/// filters.rs — PRICE_FILTER / LOT_SIZE / MIN_NOTIONAL arithmetic
///
/// Binance rejects any price that is not a multiple of tickSize and any
/// quantity that is not a multiple of stepSize.  Rounding is always DOWN
/// so a rounded value never exceeds what the caller computed.  All maths
/// runs in `Decimal` so 0.1 + 0.2 style float noise never reaches the wire.
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

use crate::error::FilterError;

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub tick_size:    Decimal,
    pub step_size:    Decimal,
    pub min_qty:      Decimal,
    pub max_qty:      Decimal,
    pub min_notional: Decimal,
}

/// Grid of a typical USDT-M contract: 0.01 tick, 0.001 step, 5 USDT notional.
impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size:    Decimal::new(1, 2),
            step_size:    Decimal::new(1, 3),
            min_qty:      Decimal::new(1, 3),
            max_qty:      Decimal::new(1_000_000, 0),
            min_notional: Decimal::new(5, 0),
        }
    }
}

impl SymbolFilters {
    /// Round a price down to the tick grid.
    pub fn round_price(&self, price: f64) -> Result<Decimal, FilterError> {
        if self.tick_size <= Decimal::ZERO {
            return Err(FilterError::NoTickSize);
        }
        Ok(floor_to(to_decimal(price), self.tick_size))
    }

    /// Round a quantity down to the step grid.
    pub fn round_quantity(&self, qty: f64) -> Decimal {
        let qty = to_decimal(qty);
        if self.step_size <= Decimal::ZERO {
            return qty.normalize();
        }
        floor_to(qty, self.step_size)
    }

    /// Smallest step-aligned quantity whose notional at `price` meets
    /// MIN_NOTIONAL (and MIN_QTY).
    pub fn min_qty_for_notional(&self, price: f64) -> Decimal {
        let price = to_decimal(price);
        if price <= Decimal::ZERO {
            return self.min_qty;
        }
        let raw = self.min_notional / price;
        let qty = if self.step_size > Decimal::ZERO {
            ((raw / self.step_size).round_dp_with_strategy(0, RoundingStrategy::AwayFromZero)
                * self.step_size)
                .normalize()
        } else {
            raw
        };
        qty.max(self.min_qty)
    }

    /// Validate an already-rounded quantity against LOT_SIZE and MIN_NOTIONAL.
    pub fn check(&self, qty: Decimal, price: f64) -> Result<(), FilterError> {
        if qty <= Decimal::ZERO {
            return Err(FilterError::ZeroQuantity);
        }
        if qty < self.min_qty {
            return Err(FilterError::MinQty { qty: qty.to_string(), min: self.min_qty.to_string() });
        }
        if self.max_qty > Decimal::ZERO && qty > self.max_qty {
            return Err(FilterError::MaxQty { qty: qty.to_string(), max: self.max_qty.to_string() });
        }
        let notional = qty * to_decimal(price);
        if notional < self.min_notional {
            return Err(FilterError::MinNotional {
                notional: notional.round_dp(4).to_string(),
                min:      self.min_notional.to_string(),
            });
        }
        Ok(())
    }
}

fn floor_to(value: Decimal, grid: Decimal) -> Decimal {
    ((value / grid).round_dp_with_strategy(0, RoundingStrategy::ToZero) * grid).normalize()
}

/// Float → Decimal through the shortest round-trip repr, so 0.3 stays 0.3.
pub fn to_decimal(v: f64) -> Decimal {
    if !v.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&v.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(v))
        .unwrap_or(Decimal::ZERO)
}

pub fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Parse the string decimals Binance sends ("0.00100000").
pub fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s.trim()).map(|d| d.normalize()).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> SymbolFilters {
        SymbolFilters {
            tick_size:    Decimal::new(10, 2),   // 0.10
            step_size:    Decimal::new(1, 3),    // 0.001
            min_qty:      Decimal::new(1, 3),
            max_qty:      Decimal::new(1000, 0),
            min_notional: Decimal::new(100, 0),
        }
    }

    #[test]
    fn prices_round_down_to_tick() {
        let f = btc();
        assert_eq!(f.round_price(50_123.456).unwrap(), Decimal::from_str("50123.4").unwrap());
        assert_eq!(f.round_price(0.3).unwrap(), Decimal::from_str("0.3").unwrap());
    }

    #[test]
    fn quantities_round_down_to_step() {
        let f = btc();
        assert_eq!(f.round_quantity(0.0129), Decimal::from_str("0.012").unwrap());
        assert_eq!(f.round_quantity(0.0009), Decimal::ZERO);
    }

    #[test]
    fn rounding_never_exceeds_input() {
        let f = btc();
        for raw in [0.0011, 0.5555, 1.2345678, 3.0, 7.0001] {
            let q = to_f64(f.round_quantity(raw));
            assert!(q <= raw + 1e-12, "{q} > {raw}");
            assert!(raw - q < 0.001 + 1e-12);
        }
    }

    #[test]
    fn missing_tick_size_is_an_error() {
        let f = SymbolFilters { tick_size: Decimal::ZERO, ..btc() };
        assert_eq!(f.round_price(1.0), Err(FilterError::NoTickSize));
    }

    #[test]
    fn notional_check_and_bump() {
        let f = btc();
        // 0.001 BTC at 50 000 = 50 USDT < 100
        let err = f.check(Decimal::from_str("0.001").unwrap(), 50_000.0).unwrap_err();
        assert!(matches!(err, FilterError::MinNotional { .. }));
        let bumped = f.min_qty_for_notional(50_000.0);
        assert_eq!(bumped, Decimal::from_str("0.002").unwrap());
        assert!(f.check(bumped, 50_000.0).is_ok());
        // 100 / 30 000 = 0.00333.. → 0.004
        assert_eq!(f.min_qty_for_notional(30_000.0), Decimal::from_str("0.004").unwrap());
    }

    #[test]
    fn binance_strings_parse() {
        assert_eq!(parse_decimal("0.00100000"), Decimal::from_str("0.001").unwrap());
        assert_eq!(parse_decimal("garbage"), Decimal::ZERO);
    }
}
