use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::entities::order;
use crate::errors::ServiceError;

/// Tracking details attached to a shipped order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub tracking_number: String,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
}

/// Customer-facing notifications. Delivery failures are logged by the
/// caller and never roll back the state change that triggered them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn order_shipped(
        &self,
        order: &order::Model,
        tracking: &TrackingInfo,
    ) -> Result<(), ServiceError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn order_shipped(
        &self,
        order: &order::Model,
        tracking: &TrackingInfo,
    ) -> Result<(), ServiceError> {
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            tracking_number = %tracking.tracking_number,
            carrier = ?tracking.carrier,
            "Order shipped notification"
        );
        Ok(())
    }
}
