//! The commerce platform's order API, as seen by the booking engine.

use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError(pub String);

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "platform call failed: {}", self.0)
    }
}

impl std::error::Error for GatewayError {}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn cancel_order(&self, shop: &str, order_id: i64, reason: &str) -> Result<(), GatewayError>;
    async fn fulfill_order(&self, shop: &str, order_id: i64) -> Result<(), GatewayError>;
}

/// Logs each call and reports success. Used when no platform credentials are set.
pub struct LogOnlyGateway;

#[async_trait]
impl OrderGateway for LogOnlyGateway {
    async fn cancel_order(&self, shop: &str, order_id: i64, reason: &str) -> Result<(), GatewayError> {
        tracing::info!("cancel order {order_id} on {shop}: {reason}");
        Ok(())
    }

    async fn fulfill_order(&self, shop: &str, order_id: i64) -> Result<(), GatewayError> {
        tracing::info!("fulfill order {order_id} on {shop}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Cancel { shop: String, order_id: i64, reason: String },
    Fulfill { shop: String, order_id: i64 },
}

/// Records every call; optionally fails them all.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    failing: Mutex<Option<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call fail with `message`; `None` restores success.
    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut failing) = self.failing.lock() {
            *failing = message.map(str::to_string);
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: GatewayCall) -> Result<(), GatewayError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        match self.failing.lock().ok().and_then(|f| f.clone()) {
            Some(message) => Err(GatewayError(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OrderGateway for RecordingGateway {
    async fn cancel_order(&self, shop: &str, order_id: i64, reason: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Cancel {
            shop: shop.to_string(),
            order_id,
            reason: reason.to_string(),
        })
    }

    async fn fulfill_order(&self, shop: &str, order_id: i64) -> Result<(), GatewayError> {
        self.record(GatewayCall::Fulfill {
            shop: shop.to_string(),
            order_id,
        })
    }
}
