use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::alert::{Alert, AlertSink};
use crate::model::{AccountInfo, Leg, OrderResult, OrderSide, PricePoint};
use crate::trade::execution::gateway::{ExecutionGateway, GatewayError, VenuePosition};

/// Wraps a venue connection and raises an alert whenever the venue throttles
/// a call.
pub struct GatewayBox {
    pub inner: Arc<dyn ExecutionGateway>,
    alerts: Arc<dyn AlertSink>,
}

impl GatewayBox {
    pub fn new(inner: Arc<dyn ExecutionGateway>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { inner, alerts }
    }

    fn report_rate_limit(&self, operation: &str, detail: &str, err: &GatewayError) {
        if err.is_rate_limit() {
            self.alerts.notify(&Alert::RateLimited {
                context: format!("{} ({})", operation, detail),
                detail: err.to_string(),
            });
        }
    }
}

#[async_trait]
impl ExecutionGateway for GatewayBox {
    async fn get_quote(&self, symbol: &str) -> Result<PricePoint, GatewayError> {
        let result = self.inner.get_quote(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_quote", symbol, err);
        }
        result
    }

    async fn place_order(
        &self,
        position_id: &str,
        symbol: &str,
        leg: Leg,
        side: OrderSide,
        volume: Decimal,
    ) -> Result<OrderResult, GatewayError> {
        let result = self
            .inner
            .place_order(position_id, symbol, leg, side, volume)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "place_order",
                &format!("{} | {} {:?} {}", position_id, symbol, side, volume),
                err,
            );
        }
        result
    }

    async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, GatewayError> {
        let result = self.inner.get_open_positions().await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_open_positions", "ALL", err);
        }
        result
    }

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
        let result = self.inner.get_account_info().await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_account_info", "account", err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;

    struct ThrottledGateway;

    #[async_trait]
    impl ExecutionGateway for ThrottledGateway {
        async fn get_quote(&self, symbol: &str) -> Result<PricePoint, GatewayError> {
            Err(GatewayError::RateLimited(symbol.to_string()))
        }

        async fn place_order(
            &self,
            _position_id: &str,
            _symbol: &str,
            _leg: Leg,
            _side: OrderSide,
            _volume: Decimal,
        ) -> Result<OrderResult, GatewayError> {
            Err(GatewayError::Rejected("market closed".to_string()))
        }

        async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, GatewayError> {
            Err(GatewayError::Other("HTTP 429".to_string()))
        }

        async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
            Ok(AccountInfo {
                balance: 1.0,
                equity: 1.0,
                margin: 0.0,
            })
        }
    }

    #[tokio::test]
    async fn rate_limits_are_alerted_other_errors_are_not() {
        let alerts = Arc::new(MemoryAlertSink::default());
        let gateway = GatewayBox::new(Arc::new(ThrottledGateway), alerts.clone());
        assert!(gateway.get_quote("XAUUSD").await.is_err());
        assert!(gateway
            .place_order("p1", "XAUUSD", Leg::Primary, OrderSide::Buy, Decimal::ONE)
            .await
            .is_err());
        assert!(gateway.get_open_positions().await.is_err());
        assert!(gateway.get_account_info().await.is_ok());

        let raised = alerts.alerts();
        assert_eq!(raised.len(), 2);
        assert!(raised
            .iter()
            .all(|a| matches!(a, Alert::RateLimited { .. })));
    }
}
