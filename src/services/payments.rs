use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, OrderStatus},
        payment::{self, Entity as PaymentEntity, Model as PaymentModel, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{CaptureResult, CaptureStatus, PaymentGateway},
    services::{
        cart::CartService,
        fulfillment::{FulfillmentDispatcher, FulfillmentReport},
        orders::find_order,
        promotion_usage::{PromotionUsageRecorder, UsageOutcome},
    },
};

type HmacSha256 = Hmac<Sha256>;

/// Verifies an `x-signature` header: hex HMAC-SHA256 of `"{timestamp}.{body}"`.
pub fn verify_webhook_signature(
    secret: &str,
    timestamp: &str,
    signature: &str,
    body: &[u8],
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| ServiceError::Unauthorized("invalid webhook timestamp".to_string()))?;
    if (now - ts).unsigned_abs() > tolerance_secs {
        return Err(ServiceError::Unauthorized(
            "webhook timestamp outside tolerance".to_string(),
        ));
    }

    let expected = hex::decode(signature.trim())
        .map_err(|_| ServiceError::Unauthorized("malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.trim().as_bytes());
    mac.update(b".");
    mac.update(body);
    // verify_slice compares in constant time
    mac.verify_slice(&expected)
        .map_err(|_| ServiceError::Unauthorized("invalid webhook signature".to_string()))
}

/// Extracts the provider order id and capture from a payment webhook.
/// `None` for event types that do not affect payments.
pub fn capture_from_webhook(payload: &Value) -> Option<(String, CaptureResult)> {
    let event_type = payload.get("event_type").and_then(Value::as_str)?;
    let resource = payload.get("resource")?;

    let status = match event_type {
        "PAYMENT.CAPTURE.COMPLETED" => CaptureStatus::Completed,
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => CaptureStatus::Declined,
        _ => return None,
    };

    let external_id = resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(Value::as_str)?
        .to_string();
    let capture_id = resource.get("id").and_then(Value::as_str)?.to_string();
    let payer_email = resource
        .pointer("/payer/email_address")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some((
        external_id,
        CaptureResult {
            id: capture_id,
            payer_email,
            status,
            raw: payload.clone(),
        },
    ))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureOutcome {
    pub payment: PaymentModel,
    pub order_status: OrderStatus,
    pub promotion_usage: UsageOutcome,
    /// `None` when fulfillment could not be started; the order stays retryable
    pub fulfillment: Option<FulfillmentReport>,
}

/// Drives payments from initiation through capture and the follow-up steps
/// a cleared payment triggers.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    usage: PromotionUsageRecorder,
    fulfillment: FulfillmentDispatcher,
    carts: CartService,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        usage: PromotionUsageRecorder,
        fulfillment: FulfillmentDispatcher,
        carts: CartService,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            usage,
            fulfillment,
            carts,
        }
    }

    /// Creates the provider order for a PENDING order. Re-initiating returns
    /// the payment that is still pending.
    #[instrument(skip(self))]
    pub async fn initiate_payment(&self, order_id: Uuid) -> Result<PaymentModel, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is {} and cannot be paid",
                order.order_number, order.status
            )));
        }

        if let Some(existing) = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
        {
            return Ok(existing);
        }

        let external_id = self
            .gateway
            .create_order(order.total_amount, &order.currency, &order.order_number)
            .await?;

        let now = Utc::now();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            provider: Set(self.gateway.provider().to_string()),
            external_payment_id: Set(Some(external_id)),
            capture_id: Set(None),
            amount: Set(order.total_amount),
            currency: Set(order.currency.clone()),
            status: Set(PaymentStatus::Pending),
            payer_email: Set(None),
            raw_response: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, payment_id = %payment.id, "Payment initiated");
        Ok(payment)
    }

    /// Captures a payment the customer approved. A payment that already
    /// completed skips the provider call and only re-runs the follow-up steps.
    #[instrument(skip(self))]
    pub async fn capture_payment(
        &self,
        order_id: Uuid,
        external_id: &str,
    ) -> Result<CaptureOutcome, ServiceError> {
        let payment = self.find_by_external_id(external_id).await?;
        if payment.order_id != order_id {
            return Err(ServiceError::ValidationError(format!(
                "Payment {} does not belong to order {}",
                external_id, order_id
            )));
        }
        if payment.status == PaymentStatus::Completed {
            return self.after_capture(payment).await;
        }

        let order = find_order(&*self.db, order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is {} and its payment cannot be captured",
                order.order_number, order.status
            )));
        }

        let capture = match self.gateway.capture_payment(external_id).await {
            Ok(capture) => capture,
            Err(ServiceError::PaymentFailed(reason)) => {
                self.mark_failed(&payment, None, &reason).await?;
                return Err(ServiceError::PaymentFailed(reason));
            }
            Err(e) => return Err(e),
        };

        self.handle_capture_event(external_id, capture).await
    }

    /// Applies a capture result reported by the provider, either from the
    /// capture call or from a webhook. Safe to call again with the same
    /// capture.
    #[instrument(skip(self, capture), fields(capture_id = %capture.id, status = ?capture.status))]
    pub async fn handle_capture_event(
        &self,
        external_id: &str,
        capture: CaptureResult,
    ) -> Result<CaptureOutcome, ServiceError> {
        let payment = self.find_by_external_id(external_id).await?;

        if capture.status != CaptureStatus::Completed {
            if payment.status == PaymentStatus::Completed {
                warn!(payment_id = %payment.id, "Ignoring failed capture for a completed payment");
                return self.after_capture(payment).await;
            }
            let reason = format!("capture {} reported {:?}", capture.id, capture.status);
            self.mark_failed(&payment, Some(capture.raw), &reason).await?;
            return Err(ServiceError::PaymentFailed(reason));
        }

        let now = Utc::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let completed = PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Completed))
            .col_expr(payment::Column::CaptureId, Expr::value(Some(capture.id.clone())))
            .col_expr(payment::Column::PayerEmail, Expr::value(capture.payer_email.clone()))
            .col_expr(payment::Column::RawResponse, Expr::value(Some(capture.raw.clone())))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.ne(PaymentStatus::Completed))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let promoted = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Processing))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(payment.order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let order_status = find_order(&txn, payment.order_id).await?.status;

        txn.commit().await.map_err(ServiceError::db_error)?;

        if order_status == OrderStatus::Cancelled {
            // The provider holds the money; nothing downstream may run.
            if completed.rows_affected == 1 {
                counter!("storefront.payments.refund_required", 1);
                warn!(
                    order_id = %payment.order_id,
                    payment_id = %payment.id,
                    "Payment captured for a cancelled order"
                );
                self.event_sender
                    .send_or_log(Event::RefundRequired {
                        order_id: payment.order_id,
                        payment_id: payment.id,
                        reason: "order was cancelled before capture".to_string(),
                    })
                    .await;
            }
            return Err(cancelled_order(payment.order_id));
        }

        if completed.rows_affected == 1 {
            counter!("storefront.payments.captured", 1);
            info!(order_id = %payment.order_id, payment_id = %payment.id, "Payment captured");
            self.event_sender
                .send_or_log(Event::PaymentCaptured {
                    order_id: payment.order_id,
                    payment_id: payment.id,
                })
                .await;
        }
        if promoted.rows_affected == 1 {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id: payment.order_id,
                    old_status: OrderStatus::Pending.to_string(),
                    new_status: OrderStatus::Processing.to_string(),
                })
                .await;
        }

        let payment = self.find_by_external_id(external_id).await?;
        self.after_capture(payment).await
    }

    /// Steps that follow a cleared payment; each is idempotent.
    async fn after_capture(&self, payment: PaymentModel) -> Result<CaptureOutcome, ServiceError> {
        if find_order(&*self.db, payment.order_id).await?.status == OrderStatus::Cancelled {
            return Err(cancelled_order(payment.order_id));
        }
        let promotion_usage = self.usage.record_usage(payment.order_id).await?;

        let order = find_order(&*self.db, payment.order_id).await?;
        let fulfillment = if order.status == OrderStatus::Processing {
            match self.fulfillment.process_order(order.id).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Fulfillment could not be started");
                    None
                }
            }
        } else {
            None
        };

        if let Some(cart_id) = order.cart_id {
            match self.carts.delete_cart(cart_id).await {
                Ok(()) | Err(ServiceError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            order::Entity::update_many()
                .col_expr(order::Column::CartId, Expr::value(Option::<Uuid>::None))
                .filter(order::Column::Id.eq(order.id))
                .exec(&*self.db)
                .await
                .map_err(ServiceError::db_error)?;
        }

        let order = find_order(&*self.db, payment.order_id).await?;
        Ok(CaptureOutcome {
            payment,
            order_status: order.status,
            promotion_usage,
            fulfillment,
        })
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<PaymentModel, ServiceError> {
        PaymentEntity::find()
            .filter(payment::Column::ExternalPaymentId.eq(external_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", external_id)))
    }

    async fn mark_failed(
        &self,
        payment: &PaymentModel,
        raw: Option<Value>,
        reason: &str,
    ) -> Result<(), ServiceError> {
        PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(payment::Column::RawResponse, Expr::value(raw))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        counter!("storefront.payments.failed", 1);
        warn!(order_id = %payment.order_id, reason, "Payment failed");
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id: payment.order_id,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }
}

fn cancelled_order(order_id: Uuid) -> ServiceError {
    ServiceError::InvalidStatus(format!(
        "Order {} was cancelled; the captured payment must be refunded",
        order_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sign(secret: &str, ts: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", ts).as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature_within_tolerance() {
        let body = br#"{"event_type":"PAYMENT.CAPTURE.COMPLETED"}"#;
        let sig = sign("whsec", "1700000000", body);
        assert!(verify_webhook_signature("whsec", "1700000000", &sig, body, 300, 1700000100).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_stale_timestamp() {
        let body = br#"{"amount":"10.00"}"#;
        let sig = sign("whsec", "1700000000", body);

        assert_matches!(
            verify_webhook_signature("whsec", "1700000000", &sig, br#"{"amount":"99.00"}"#, 300, 1700000000),
            Err(ServiceError::Unauthorized(_))
        );
        assert_matches!(
            verify_webhook_signature("whsec", "1700000000", &sig, body, 300, 1700000301),
            Err(ServiceError::Unauthorized(_))
        );
        assert_matches!(
            verify_webhook_signature("whsec", "1700000000", "not-hex", body, 300, 1700000000),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn parses_capture_webhooks() {
        let payload = json!({
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAP-1",
                "supplementary_data": { "related_ids": { "order_id": "PP-ORDER-1" } }
            }
        });
        let (external_id, capture) = capture_from_webhook(&payload).unwrap();
        assert_eq!(external_id, "PP-ORDER-1");
        assert_eq!(capture.id, "CAP-1");
        assert_eq!(capture.status, CaptureStatus::Completed);

        let ignored = json!({ "event_type": "CHECKOUT.ORDER.APPROVED", "resource": {} });
        assert!(capture_from_webhook(&ignored).is_none());
    }
}
