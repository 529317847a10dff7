//! Exchange access through the order gateway service.
//!
//! The gateway holds the operators' exchange API keys. Each request names the
//! exchange and the account (owner uuid) in headers; responses are JSON and
//! failures come back as `{"error": "..."}`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::exchange::{Exchange, ExchangeConnector, ExchangeError, ExchangeResult};
use crate::models::{AccountInfo, Fill, PositionInfo, Side};

const ACCOUNT_HEADER: &str = "X-Account";
const EXCHANGE_HEADER: &str = "X-Exchange";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    order_id: i64,
}

#[derive(Debug, Serialize)]
struct CloseRequest<'a> {
    symbol: &'a str,
    side: Side,
    size: Decimal,
    reduce_only: bool,
}

#[derive(Debug, Serialize)]
struct StopOrderRequest<'a> {
    symbol: &'a str,
    side: Side,
    trigger_price: Decimal,
    size: Decimal,
    reduce_only: bool,
}

/// Map a gateway error message onto the exchange error taxonomy
fn classify(status: StatusCode, message: String) -> ExchangeError {
    let lowered = message.to_lowercase();
    if lowered.contains("invalid reduce-only order") {
        ExchangeError::InvalidReduceOnly
    } else if lowered.contains("order not found") {
        ExchangeError::NotFound
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ExchangeError::Transient(message)
    } else {
        ExchangeError::Rejected(message)
    }
}

/// One operator's session on one exchange
pub struct GatewayExchange {
    client: Client,
    base_url: String,
    exchange: String,
    owner_uuid: Uuid,
}

impl GatewayExchange {
    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(ACCOUNT_HEADER, self.owner_uuid.to_string())
            .header(EXCHANGE_HEADER, &self.exchange)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, builder: RequestBuilder) -> ExchangeResult<Response> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("status code: {}", status.as_u16()));
        tracing::warn!("{} gateway error ({}): {}", self.exchange, status, message);
        Err(classify(status, message))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ExchangeResult<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::Transient(format!("failed to decode gateway response: {}", e)))
    }
}

#[async_trait]
impl Exchange for GatewayExchange {
    fn name(&self) -> &str {
        &self.exchange
    }

    async fn account_info(&self) -> ExchangeResult<AccountInfo> {
        self.send_json(self.client.get(self.url("/account"))).await
    }

    async fn position(&self, symbol: &str) -> ExchangeResult<PositionInfo> {
        self.send_json(self.client.get(self.url(&format!("/positions/{}", symbol))))
            .await
    }

    async fn close_position(&self, symbol: &str, side: Side, size: Decimal) -> ExchangeResult<i64> {
        let body = CloseRequest {
            symbol,
            side,
            size,
            reduce_only: true,
        };
        let created: OrderCreated = self
            .send_json(self.client.post(self.url("/orders/close")).json(&body))
            .await?;
        Ok(created.order_id)
    }

    async fn order_fills(&self, order_id: i64) -> ExchangeResult<Vec<Fill>> {
        self.send_json(self.client.get(self.url(&format!("/orders/{}/fills", order_id))))
            .await
    }

    async fn cancel_stop_order(&self, order_id: i64) -> ExchangeResult<()> {
        self.send(self.client.delete(self.url(&format!("/stop-orders/{}", order_id))))
            .await
            .map(|_| ())
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
    ) -> ExchangeResult<i64> {
        let body = StopOrderRequest {
            symbol,
            side,
            trigger_price,
            size,
            reduce_only: true,
        };
        let created: OrderCreated = self
            .send_json(self.client.post(self.url("/stop-orders")).json(&body))
            .await?;
        Ok(created.order_id)
    }
}

/// Opens gateway sessions; all sessions share one HTTP connection pool
#[derive(Clone)]
pub struct GatewayConnector {
    client: Client,
    base_url: String,
}

impl GatewayConnector {
    pub fn new(base_url: &str, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ExchangeConnector for GatewayConnector {
    async fn connect(&self, exchange: &str, owner_uuid: Uuid) -> ExchangeResult<Arc<dyn Exchange>> {
        Ok(Arc::new(GatewayExchange {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            exchange: exchange.to_string(),
            owner_uuid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    async fn session(server: &mockito::Server, owner: Uuid) -> Arc<dyn Exchange> {
        GatewayConnector::new(&server.url(), Duration::from_secs(2))
            .unwrap()
            .connect("FTX", owner)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_account_info_sends_account_header() {
        let mut server = mockito::Server::new_async().await;
        let owner = Uuid::new_v4();
        let mock = server
            .mock("GET", "/account")
            .match_header("x-account", owner.to_string().as_str())
            .match_header("x-exchange", "FTX")
            .with_status(200)
            .with_body(r#"{"collateral": "1000.5", "leverage": 3, "free_collateral": "400"}"#)
            .create_async()
            .await;

        let info = session(&server, owner).await.account_info().await.unwrap();
        assert_eq!(info.collateral, dec("1000.5"));
        assert_eq!(info.leverage, dec("3"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_close_position_posts_reduce_only_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders/close")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "symbol": "BTC-PERP",
                "side": "LONG",
                "size": "2.5",
                "reduce_only": true
            })))
            .with_status(200)
            .with_body(r#"{"order_id": 777}"#)
            .create_async()
            .await;

        let exchange = session(&server, Uuid::new_v4()).await;
        let order_id = exchange.close_position("BTC-PERP", Side::Long, dec("2.5")).await.unwrap();
        assert_eq!(order_id, 777);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_classification() {
        let mut server = mockito::Server::new_async().await;
        let exchange = session(&server, Uuid::new_v4()).await;

        let _m = server
            .mock("POST", "/orders/close")
            .with_status(400)
            .with_body(r#"{"error": "Invalid reduce-only order"}"#)
            .create_async()
            .await;
        assert_eq!(
            exchange.close_position("BTC-PERP", Side::Short, dec("1")).await,
            Err(ExchangeError::InvalidReduceOnly)
        );

        let _m = server
            .mock("DELETE", "/stop-orders/555")
            .with_status(404)
            .with_body(r#"{"error": "Order not found"}"#)
            .create_async()
            .await;
        assert_eq!(exchange.cancel_stop_order(555).await, Err(ExchangeError::NotFound));

        let _m = server
            .mock("GET", "/positions/BTC-PERP")
            .with_status(502)
            .create_async()
            .await;
        assert!(matches!(
            exchange.position("BTC-PERP").await,
            Err(ExchangeError::Transient(_))
        ));

        let _m = server
            .mock("POST", "/stop-orders")
            .with_status(400)
            .with_body(r#"{"error": "Not enough balances"}"#)
            .create_async()
            .await;
        assert_eq!(
            exchange.place_stop_order("BTC-PERP", Side::Long, dec("19000"), dec("1")).await,
            Err(ExchangeError::Rejected("Not enough balances".to_string()))
        );
    }

    #[tokio::test]
    async fn test_order_fills() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/orders/777/fills")
            .with_status(200)
            .with_body(r#"[{"order_id": 777, "price": "21000", "size": "2.5", "fee": "36.75"}]"#)
            .create_async()
            .await;

        let fills = session(&server, Uuid::new_v4()).await.order_fills(777).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].fee, dec("36.75"));
    }

    #[test]
    fn test_classify_rate_limit_as_transient() {
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            ExchangeError::Transient(_)
        ));
    }
}
