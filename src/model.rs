use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

impl PricePoint {
    pub fn mid(&self) -> Decimal {
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            (self.bid + self.ask) / Decimal::TWO
        } else {
            self.last
        }
    }
}

/// Direction of the spread position.
///
/// `Long` buys the primary leg and sells the secondary one; it is opened when
/// the spread is cheap (negative z). `Short` is the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Direction in which z moves away from zero for this side.
    pub fn z_sign(self) -> f64 {
        match self {
            Side::Long => -1.0,
            Side::Short => 1.0,
        }
    }

    /// Side that fades the rich leg for a given z.
    pub fn fading(z: f64) -> Self {
        if z > 0.0 {
            Side::Short
        } else {
            Side::Long
        }
    }

    pub fn order_side(self, leg: Leg) -> OrderSide {
        match (self, leg) {
            (Side::Long, Leg::Primary) | (Side::Short, Leg::Secondary) => OrderSide::Buy,
            (Side::Long, Leg::Secondary) | (Side::Short, Leg::Primary) => OrderSide::Sell,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Primary,
    Secondary,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Primary => write!(f, "primary"),
            Leg::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Entry,
    Exit,
    Scale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub side: Side,
    pub z_score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    MeanReversion,
    StopLoss,
    RiskLimit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::MeanReversion => "mean_reversion",
            ExitReason::StopLoss => "stop_loss_z",
            ExitReason::RiskLimit => "risk_limit",
            ExitReason::Manual => "manual",
        }
    }
}

/// Rebalance bookkeeping of one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadEntryState {
    pub position_id: String,
    pub side: Side,
    pub last_z_entry: f64,
    pub next_z_entry: f64,
    pub entry_count: u32,
    pub total_primary_lots: Decimal,
    pub total_secondary_lots: Decimal,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub position_id: String,
    pub primary_symbol: String,
    pub secondary_symbol: String,
    pub side: Side,
    pub primary_lots: Decimal,
    pub secondary_lots: Decimal,
    pub primary_entry_price: Option<Decimal>,
    pub secondary_entry_price: Option<Decimal>,
    pub hedge_ratio: f64,
    pub opened_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn lots(&self, leg: Leg) -> Decimal {
        match leg {
            Leg::Primary => self.primary_lots,
            Leg::Secondary => self.secondary_lots,
        }
    }

    pub fn entry_price(&self, leg: Leg) -> Option<Decimal> {
        match leg {
            Leg::Primary => self.primary_entry_price,
            Leg::Secondary => self.secondary_entry_price,
        }
    }

    /// P&L of `lots` of one leg valued at `price`.
    pub fn leg_pnl(&self, leg: Leg, price: Decimal, lots: Decimal) -> Option<Decimal> {
        let entry = self.entry_price(leg)?;
        let diff = match self.side.order_side(leg) {
            OrderSide::Buy => price - entry,
            OrderSide::Sell => entry - price,
        };
        Some(diff * lots)
    }

    /// Mark-to-market P&L of both legs at the given prices.
    pub fn unrealized_pnl(&self, price_a: Decimal, price_b: Decimal) -> Option<Decimal> {
        let pnl_a = self.leg_pnl(Leg::Primary, price_a, self.primary_lots)?;
        let pnl_b = self.leg_pnl(Leg::Secondary, price_b, self.secondary_lots)?;
        Some(pnl_a + pnl_b)
    }

    pub fn unrealized_pnl_f64(&self, price_a: Decimal, price_b: Decimal) -> f64 {
        self.unrealized_pnl(price_a, price_b)
            .and_then(|v| v.to_f64())
            .unwrap_or(0.0)
    }
}

/// One line of the position overview handed to presentation collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOverview {
    pub record: PositionRecord,
    pub state: SpreadEntryState,
    pub in_flight: bool,
    pub suspended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub filled_volume: Decimal,
    pub fill_price: Option<Decimal>,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn filled(volume: Decimal, price: Option<Decimal>) -> Self {
        Self {
            success: true,
            filled_volume: volume,
            fill_price: price,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            filled_volume: Decimal::ZERO,
            fill_price: None,
            error: Some(reason.into()),
        }
    }

    pub fn fully_filled(&self, requested: Decimal) -> bool {
        self.success && self.filled_volume >= requested
    }
}

/// Volume-weighted average of an existing fill and a new one.
pub fn blend_price(
    price: Option<Decimal>,
    lots: Decimal,
    add_price: Option<Decimal>,
    add_lots: Decimal,
) -> Option<Decimal> {
    match (price, add_price) {
        (Some(p), Some(q)) => {
            let total = lots + add_lots;
            if total.is_zero() {
                Some(q)
            } else {
                Some((p * lots + q * add_lots) / total)
            }
        }
        (None, Some(q)) => Some(q),
        (p, None) => p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(side: Side) -> PositionRecord {
        PositionRecord {
            position_id: "p1".to_string(),
            primary_symbol: "AAA".to_string(),
            secondary_symbol: "BBB".to_string(),
            side,
            primary_lots: dec!(2),
            secondary_lots: dec!(3),
            primary_entry_price: Some(dec!(100)),
            secondary_entry_price: Some(dec!(50)),
            hedge_ratio: 1.5,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn long_spread_pnl_gains_when_primary_rises() {
        let pnl = record(Side::Long).unrealized_pnl(dec!(101), dec!(50)).unwrap();
        assert_eq!(pnl, dec!(2));
    }

    #[test]
    fn short_spread_pnl_gains_when_secondary_rises() {
        let pnl = record(Side::Short).unrealized_pnl(dec!(100), dec!(51)).unwrap();
        assert_eq!(pnl, dec!(3));
    }

    #[test]
    fn order_sides_follow_spread_direction() {
        assert_eq!(Side::Long.order_side(Leg::Primary), OrderSide::Buy);
        assert_eq!(Side::Long.order_side(Leg::Secondary), OrderSide::Sell);
        assert_eq!(Side::Short.order_side(Leg::Primary), OrderSide::Sell);
        assert_eq!(Side::Short.order_side(Leg::Secondary), OrderSide::Buy);
    }

    #[test]
    fn blend_price_weights_by_lots() {
        let blended = blend_price(Some(dec!(100)), dec!(1), Some(dec!(110)), dec!(1));
        assert_eq!(blended, Some(dec!(105)));
        assert_eq!(blend_price(None, dec!(0), Some(dec!(7)), dec!(1)), Some(dec!(7)));
    }
}
