use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{AccountInfo, Leg, OrderResult, OrderSide, PricePoint};

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    RateLimited(String),
    Rejected(String),
    Unavailable(String),
    Other(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GatewayError::RateLimited(e) => write!(f, "429 Too Many Requests: {}", e),
            GatewayError::Rejected(e) => write!(f, "Rejected: {}", e),
            GatewayError::Unavailable(e) => write!(f, "Unavailable: {}", e),
            GatewayError::Other(e) => write!(f, "Other: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn is_rate_limit(&self) -> bool {
        match self {
            GatewayError::RateLimited(_) => true,
            other => {
                let text = other.to_string();
                text.contains("429") || text.contains("Too Many Requests")
            }
        }
    }
}

/// The venue's view of one spread position, keyed by the id the engine tagged
/// its orders with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub position_id: String,
    pub primary_lots: Decimal,
    pub secondary_lots: Decimal,
}

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<PricePoint, GatewayError>;

    async fn place_order(
        &self,
        position_id: &str,
        symbol: &str,
        leg: Leg,
        side: OrderSide,
        volume: Decimal,
    ) -> Result<OrderResult, GatewayError>;

    async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, GatewayError>;

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError>;
}
