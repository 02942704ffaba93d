//! REST client for the brokerage endpoint.
//!
//! Owns the auth token lifecycle (lazy fetch, serialized refresh on 401),
//! the retry/backoff policy, and the market-code fallback for submits.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{BoxFuture, Broker};
use crate::error::{BrokerError, BrokerResult};
use crate::wire::{
    ErrorBody, OrderAck, OrderPayload, OrderSnapshot, PositionWire, SendOrderResponse, SymbolInfo,
    TokenRequest, TokenResponse,
};

/// Broker error code for a market-code parameter conversion failure.
const MARKET_CODE_REJECTED: &str = "4001005";

/// Retry schedule for transient failures: `max_attempts` retries after
/// the initial try, with exponential backoff starting at `base_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): 0.5s, 1s, 2s...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

/// Configuration for [`RestBroker`].
#[derive(Debug, Clone)]
pub struct RestBrokerConfig {
    pub base_url: String,
    pub api_password: String,
    /// Default market code for submits (1 is refused for new orders since
    /// the 2026-02-28 exchange change; 9 and 27 are current).
    pub market_code: i32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// Market codes to try when a submit is refused with `4001005`.
pub(crate) fn alternate_market_codes(code: i32) -> [i32; 2] {
    match code {
        1 => [9, 27],
        9 => [27, 1],
        27 => [9, 1],
        _ => [9, 27],
    }
}

/// Map a non-success HTTP response to a broker error.
pub(crate) fn classify_http_error(
    status: StatusCode,
    body: &str,
    retry_after_ms: Option<u64>,
) -> BrokerError {
    if status == StatusCode::UNAUTHORIZED {
        return BrokerError::AuthExpired;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return BrokerError::RateLimited { retry_after_ms };
    }
    if status.is_server_error() {
        let snippet: String = body.chars().take(200).collect();
        return BrokerError::Unavailable(format!("HTTP {status}: {snippet}"));
    }
    let parsed = ErrorBody::parse(body);
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| body.chars().take(200).collect());
    BrokerError::Rejected {
        code: parsed.code_string(),
        message,
    }
}

/// REST implementation of [`Broker`].
pub struct RestBroker {
    http: Client,
    cfg: RestBrokerConfig,
    token: RwLock<Option<String>>,
    /// Serializes token refresh; concurrent 401s await one refresh.
    refresh_gate: Mutex<()>,
}

impl RestBroker {
    pub fn new(cfg: RestBrokerConfig) -> BrokerResult<Self> {
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            cfg,
            token: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        })
    }

    /// Default market code from configuration.
    pub fn market_code(&self) -> i32 {
        self.cfg.market_code
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    /// `POST /token`. Only called under the refresh gate.
    async fn authenticate(&self) -> BrokerResult<String> {
        let request = TokenRequest {
            api_password: &self.cfg.api_password,
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| BrokerError::InvalidRequest(format!("token request: {e}")))?;
        let response: TokenResponse = self
            .raw_call(Method::POST, "token", None, Some(body))
            .await?;
        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BrokerError::InvalidResponse("token endpoint returned no Token".into()))?;
        info!("Broker token refreshed");
        Ok(token)
    }

    async fn current_token(&self) -> BrokerResult<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.refresh_token(None).await
    }

    /// Refresh the shared token. `observed` is the token the caller saw
    /// rejected; when another task already replaced it, the replacement is
    /// returned without a second round trip.
    async fn refresh_token(&self, observed: Option<&str>) -> BrokerResult<String> {
        let _gate = self.refresh_gate.lock().await;
        if let Some(current) = self.token.read().await.clone() {
            if observed != Some(current.as_str()) {
                return Ok(current);
            }
        }
        let fresh = self.authenticate().await?;
        *self.token.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// One HTTP round trip with the retry policy applied; no auth handling.
    async fn raw_call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> BrokerResult<T> {
        let url = self.url(path);
        let mut last_err = BrokerError::Unavailable("no attempt made".into());
        // Wait for the next retry when the broker dictates one (429
        // Retry-After); otherwise the backoff schedule applies.
        let mut explicit_wait: Option<Duration> = None;

        // Initial try plus `max_attempts` retries, backing off before
        // each retry: 0.5s, 1s, 2s under the defaults.
        for attempt in 0..=self.cfg.retry.max_attempts {
            if attempt > 0 {
                let wait = explicit_wait
                    .take()
                    .unwrap_or_else(|| self.cfg.retry.backoff(attempt - 1));
                tokio::time::sleep(wait).await;
            }

            let mut request = self.http.request(method.clone(), &url);
            if let Some(token) = token {
                request = request.header("X-API-KEY", token);
            }
            if let Some(ref body) = payload {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(%url, attempt, error = %e, "Broker request failed to send");
                    last_err = BrokerError::Unavailable(format!("{method} {path}: {e}"));
                    continue;
                }
            };

            let status = response.status();
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();

            if status.is_success() {
                return serde_json::from_str(&body).map_err(|e| {
                    BrokerError::InvalidResponse(format!("{method} {path}: {e}"))
                });
            }

            let err = classify_http_error(status, &body, retry_after_ms);
            match &err {
                BrokerError::RateLimited { retry_after_ms } => {
                    debug!(%url, attempt, "Broker rate limited");
                    explicit_wait = retry_after_ms.map(Duration::from_millis);
                    last_err = err;
                    continue;
                }
                BrokerError::Unavailable(_) => {
                    warn!(%url, attempt, %status, "Broker server error");
                    last_err = err;
                    continue;
                }
                // 4xx (including 401) is final for this helper.
                _ => return Err(err),
            }
        }

        Err(last_err)
    }

    /// Authenticated call with one silent re-authentication on 401.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> BrokerResult<T> {
        let token = self.current_token().await?;
        match self
            .raw_call(method.clone(), path, Some(&token), payload.clone())
            .await
        {
            Err(BrokerError::AuthExpired) => {
                debug!(path, "401 from broker, re-authenticating once");
                let fresh = self.refresh_token(Some(&token)).await?;
                self.raw_call(method, path, Some(&fresh), payload).await
            }
            other => other,
        }
    }

    async fn post_send(&self, payload: &OrderPayload) -> BrokerResult<OrderAck> {
        let body = serde_json::to_value(payload)
            .map_err(|e| BrokerError::InvalidRequest(format!("order payload: {e}")))?;
        let response: SendOrderResponse = self
            .call(Method::POST, "sendorder", Some(body))
            .await?;
        let order_id = response.order_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            BrokerError::InvalidResponse("sendorder returned no OrderId".to_string())
        })?;
        Ok(OrderAck {
            order_id,
            exchange: payload.exchange,
        })
    }
}

impl Broker for RestBroker {
    fn send_order(&self, payload: OrderPayload) -> BoxFuture<'_, BrokerResult<OrderAck>> {
        Box::pin(async move {
            match self.post_send(&payload).await {
                Err(BrokerError::Rejected { code: Some(code), message })
                    if code == MARKET_CODE_REJECTED =>
                {
                    warn!(
                        symbol = %payload.symbol,
                        exchange = payload.exchange,
                        %message,
                        "Market code refused, trying alternates"
                    );
                    let mut last = BrokerError::Rejected {
                        code: Some(code),
                        message,
                    };
                    for alt in alternate_market_codes(payload.exchange) {
                        if alt == payload.exchange {
                            continue;
                        }
                        let mut retry_payload = payload.clone();
                        retry_payload.exchange = alt;
                        match self.post_send(&retry_payload).await {
                            Ok(ack) => {
                                info!(
                                    symbol = %retry_payload.symbol,
                                    exchange = alt,
                                    "Submit accepted on alternate market code"
                                );
                                return Ok(ack);
                            }
                            Err(e) => last = e,
                        }
                    }
                    Err(last)
                }
                other => other,
            }
        })
    }

    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            let body = serde_json::json!({ "OrderID": broker_order_id });
            let result: BrokerResult<serde_json::Value> =
                self.call(Method::PUT, "cancelorder", Some(body)).await;
            match result {
                Ok(_) => Ok(()),
                // The only 4xx causes on cancel are an unknown or already
                // finished order; both reconcile through the next poll.
                Err(BrokerError::Rejected { code, message }) => {
                    debug!(broker_order_id, ?code, %message, "Cancel refused by broker");
                    Err(BrokerError::OrderNotFound(broker_order_id.to_string()))
                }
                Err(e) => Err(e),
            }
        })
    }

    fn list_orders(&self) -> BoxFuture<'_, BrokerResult<Vec<OrderSnapshot>>> {
        Box::pin(async move { self.call(Method::GET, "orders", None).await })
    }

    fn list_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<PositionWire>>> {
        Box::pin(async move { self.call(Method::GET, "positions", None).await })
    }

    fn symbol_name<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, BrokerResult<Option<String>>> {
        Box::pin(async move {
            let path = format!("symbol/{}?Exchange={}", symbol, self.cfg.market_code);
            let info: SymbolInfo = self.call(Method::GET, &path, None).await?;
            Ok(info.name().map(str::to_string))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_alternate_market_codes() {
        assert_eq!(alternate_market_codes(1), [9, 27]);
        assert_eq!(alternate_market_codes(9), [27, 1]);
        assert_eq!(alternate_market_codes(27), [9, 1]);
        assert_eq!(alternate_market_codes(42), [9, 27]);
    }

    #[test]
    fn test_classify_rate_limited() {
        let err = classify_http_error(StatusCode::TOO_MANY_REQUESTS, "", Some(2000));
        assert!(matches!(
            err,
            BrokerError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_server_error() {
        let err = classify_http_error(StatusCode::BAD_GATEWAY, "upstream down", None);
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_rejection_with_body() {
        let err = classify_http_error(
            StatusCode::BAD_REQUEST,
            r#"{"Code": 4001005, "Message": "parameter conversion"}"#,
            None,
        );
        match err {
            BrokerError::Rejected { code, message } => {
                assert_eq!(code.as_deref(), Some("4001005"));
                assert_eq!(message, "parameter conversion");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_unauthorized() {
        let err = classify_http_error(StatusCode::UNAUTHORIZED, "", None);
        assert!(matches!(err, BrokerError::AuthExpired));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_url_join() {
        let broker = RestBroker::new(RestBrokerConfig {
            base_url: "http://localhost:18080/kabusapi/".to_string(),
            api_password: "pw".to_string(),
            market_code: 9,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        })
        .unwrap();
        assert_eq!(broker.url("orders"), "http://localhost:18080/kabusapi/orders");
    }
}
