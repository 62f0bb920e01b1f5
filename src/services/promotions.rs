use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        promotion::{self, Entity as Promotion, Model as PromotionModel, PromotionType},
        promotion_usage, user,
    },
    errors::{is_unique_violation, PromotionError, ServiceError},
    services::round_money,
};

/// A priced cart or order line as seen by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub category: Option<String>,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricedLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// How the caller names the promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionRef {
    Code(String),
    Id(Uuid),
}

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub promotion: PromotionRef,
    pub lines: Vec<PricedLine>,
    pub subtotal: Decimal,
    pub user_id: Option<Uuid>,
    pub guest_email: Option<String>,
    /// Promotions already attached to the cart
    pub applied_promotion_ids: Vec<Uuid>,
    pub now: DateTime<Utc>,
}

/// Outcome of a successful evaluation. Never mutates usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionEvaluation {
    pub promotion_id: Uuid,
    pub coupon_code: Option<String>,
    pub discount: Decimal,
    pub display_name: String,
}

/// Request-independent facts the rule check needs.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub subtotal: Decimal,
    pub authenticated: bool,
    pub applied_promotion_ids: Vec<Uuid>,
}

/// Checks every rule that does not need the database, in the order the
/// checkout reports them.
pub fn validate_rules(
    promo: &PromotionModel,
    ctx: &RuleContext,
    now: DateTime<Utc>,
) -> Result<(), PromotionError> {
    if !promo.is_active {
        return Err(PromotionError::Inactive);
    }
    if now < promo.start_date {
        return Err(PromotionError::NotYetActive);
    }
    if now > promo.end_date {
        return Err(PromotionError::Expired);
    }
    if let Some(minimum) = promo.minimum_order_value {
        if ctx.subtotal < minimum {
            return Err(PromotionError::BelowMinimum);
        }
    }
    if let Some(limit) = promo.usage_limit {
        if promo.usage_count >= limit {
            return Err(PromotionError::Exhausted);
        }
    }
    if promo.requires_authentication && !ctx.authenticated {
        return Err(PromotionError::RequiresAuth);
    }
    if ctx.applied_promotion_ids.contains(&promo.id) {
        return Err(PromotionError::AlreadyApplied);
    }
    Ok(())
}

fn is_applicable(promo: &PromotionModel, line: &PricedLine) -> bool {
    if promo.apply_to_all_items {
        return true;
    }
    if promo.scoped_products().contains(&line.product_id) {
        return true;
    }
    match &line.category {
        Some(category) => promo
            .scoped_categories()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category)),
        None => false,
    }
}

/// Computes the discount for `lines`, capped at the cart subtotal.
pub fn compute_discount(promo: &PromotionModel, lines: &[PricedLine], subtotal: Decimal) -> Decimal {
    let applicable: Vec<&PricedLine> = lines.iter().filter(|l| is_applicable(promo, l)).collect();
    let applicable_subtotal = if promo.apply_to_all_items {
        subtotal
    } else {
        applicable.iter().map(|l| l.line_total()).sum()
    };

    let discount = match promo.promotion_type {
        PromotionType::PercentageDiscount => {
            promo.value / Decimal::ONE_HUNDRED * applicable_subtotal
        }
        PromotionType::FixedAmount => promo.value.min(applicable_subtotal),
        PromotionType::FreeItem => match promo.free_item_product_id {
            Some(free_id) => lines
                .iter()
                .find(|l| l.product_id == free_id)
                .map(|l| l.unit_price)
                .unwrap_or(Decimal::ZERO),
            None => applicable
                .iter()
                .map(|l| l.unit_price)
                .min()
                .unwrap_or(Decimal::ZERO),
        },
        PromotionType::BuyOneGetOne => applicable
            .iter()
            .filter(|l| l.quantity >= 2)
            .map(|l| l.unit_price)
            .min()
            .unwrap_or(Decimal::ZERO),
    };

    round_money(discount.max(Decimal::ZERO).min(subtotal))
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePromotionInput {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub description: Option<String>,
    pub promotion_type: PromotionType,
    pub value: Decimal,
    pub minimum_order_value: Option<Decimal>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[validate(length(min = 3, max = 64))]
    pub coupon_code: Option<String>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub per_user_limit: Option<i32>,
    #[serde(default)]
    pub requires_authentication: bool,
    #[serde(default = "default_true")]
    pub apply_to_all_items: bool,
    #[serde(default)]
    pub applicable_categories: Vec<String>,
    #[serde(default)]
    pub applicable_products: Vec<Uuid>,
    pub free_item_product_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone)]
pub struct PromotionService {
    db: Arc<DatabaseConnection>,
}

impl PromotionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Validates a promotion against a cart and computes its discount.
    #[instrument(skip(self, request), fields(promotion = ?request.promotion))]
    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<PromotionEvaluation, ServiceError> {
        evaluate_in(&*self.db, request).await
    }

    #[instrument(skip(self))]
    pub async fn get_promotion(&self, id: Uuid) -> Result<PromotionModel, ServiceError> {
        Promotion::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::PromotionInvalid(PromotionError::NotFound))
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_promotion(
        &self,
        input: CreatePromotionInput,
    ) -> Result<PromotionModel, ServiceError> {
        input.validate()?;

        if input.start_date >= input.end_date {
            return Err(ServiceError::ValidationError(
                "start_date must be before end_date".to_string(),
            ));
        }
        if input.value <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "value must be positive".to_string(),
            ));
        }
        if input.promotion_type == PromotionType::PercentageDiscount
            && input.value > Decimal::ONE_HUNDRED
        {
            return Err(ServiceError::ValidationError(
                "percentage value cannot exceed 100".to_string(),
            ));
        }
        if !input.apply_to_all_items
            && input.applicable_categories.is_empty()
            && input.applicable_products.is_empty()
        {
            return Err(ServiceError::ValidationError(
                "scoped promotions need at least one category or product".to_string(),
            ));
        }

        let coupon_code = input.coupon_code.as_deref().map(normalize_code);
        if let Some(code) = &coupon_code {
            let clash = Promotion::find()
                .filter(promotion::Column::CouponCode.eq(code.as_str()))
                .filter(promotion::Column::IsActive.eq(true))
                .count(&*self.db)
                .await
                .map_err(ServiceError::db_error)?;
            if clash > 0 {
                return Err(coupon_code_taken(code));
            }
        }

        let now = Utc::now();
        let model = promotion::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            description: Set(input.description),
            promotion_type: Set(input.promotion_type),
            value: Set(input.value),
            minimum_order_value: Set(input.minimum_order_value),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            is_active: Set(true),
            coupon_code: Set(coupon_code.clone()),
            usage_limit: Set(input.usage_limit),
            usage_count: Set(0),
            per_user_limit: Set(input.per_user_limit),
            requires_authentication: Set(input.requires_authentication),
            apply_to_all_items: Set(input.apply_to_all_items),
            applicable_categories: Set(serde_json::to_value(&input.applicable_categories)?),
            applicable_products: Set(serde_json::to_value(&input.applicable_products)?),
            free_item_product_id: Set(input.free_item_product_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| match coupon_code.as_deref() {
            // A concurrent create won the unique active-code index
            Some(code) if is_unique_violation(&e) => coupon_code_taken(code),
            _ => ServiceError::db_error(e),
        })?;

        info!(promotion_id = %model.id, "Promotion created");
        Ok(model)
    }

    #[instrument(skip(self))]
    pub async fn deactivate_promotion(&self, id: Uuid) -> Result<PromotionModel, ServiceError> {
        let existing = self.get_promotion(id).await?;
        let mut active: promotion::ActiveModel = existing.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now());
        let updated = active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        info!(promotion_id = %id, "Promotion deactivated");
        Ok(updated)
    }

    /// Recomputes `usage_count` from the usage ledger.
    #[instrument(skip(self))]
    pub async fn recount_usage(&self, id: Uuid) -> Result<i32, ServiceError> {
        self.get_promotion(id).await?;

        let count = promotion_usage::Entity::find()
            .filter(promotion_usage::Column::PromotionId.eq(id))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)? as i32;

        Promotion::update_many()
            .col_expr(promotion::Column::UsageCount, Expr::value(count))
            .col_expr(promotion::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promotion::Column::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        info!(promotion_id = %id, usage_count = count, "Promotion usage recounted");
        Ok(count)
    }
}

async fn find_promotion<C: ConnectionTrait>(
    conn: &C,
    reference: &PromotionRef,
) -> Result<PromotionModel, ServiceError> {
    let found = match reference {
        PromotionRef::Id(id) => Promotion::find_by_id(*id).one(conn).await,
        PromotionRef::Code(code) => {
            // Prefer the active promotion when an old one shares the code
            let mut matches = Promotion::find()
                .filter(promotion::Column::CouponCode.eq(normalize_code(code)))
                .all(conn)
                .await
                .map_err(ServiceError::db_error)?;
            matches.sort_by_key(|p| !p.is_active);
            Ok(matches.into_iter().next())
        }
    }
    .map_err(ServiceError::db_error)?;

    found.ok_or(ServiceError::PromotionInvalid(PromotionError::NotFound))
}

/// Number of orders the customer already used `promotion_id` on. Guests are
/// matched by the user record created for their email.
async fn usages_by_customer<C: ConnectionTrait>(
    conn: &C,
    promotion_id: Uuid,
    user_id: Option<Uuid>,
    guest_email: Option<&str>,
) -> Result<u64, ServiceError> {
    let user_id = match (user_id, guest_email) {
        (Some(id), _) => Some(id),
        (None, Some(email)) => user::Entity::find()
            .filter(user::Column::Email.eq(email.trim().to_lowercase()))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .map(|u| u.id),
        (None, None) => None,
    };

    match user_id {
        Some(user_id) => promotion_usage::Entity::find()
            .filter(promotion_usage::Column::PromotionId.eq(promotion_id))
            .filter(promotion_usage::Column::UserId.eq(user_id))
            .count(conn)
            .await
            .map_err(ServiceError::db_error),
        None => Ok(0),
    }
}

fn coupon_code_taken(code: &str) -> ServiceError {
    ServiceError::ValidationError(format!(
        "An active promotion already uses coupon code {}",
        code
    ))
}

/// Evaluates a promotion on any connection, including an open transaction.
pub async fn evaluate_in<C: ConnectionTrait>(
    conn: &C,
    request: &EvaluationRequest,
) -> Result<PromotionEvaluation, ServiceError> {
    let promo = find_promotion(conn, &request.promotion).await?;

    let ctx = RuleContext {
        subtotal: request.subtotal,
        authenticated: request.user_id.is_some(),
        applied_promotion_ids: request.applied_promotion_ids.clone(),
    };
    validate_rules(&promo, &ctx, request.now)?;

    if let Some(limit) = promo.per_user_limit {
        let used = usages_by_customer(
            conn,
            promo.id,
            request.user_id,
            request.guest_email.as_deref(),
        )
        .await?;
        if used >= limit.max(0) as u64 {
            return Err(PromotionError::UserLimitReached.into());
        }
    }

    let discount = compute_discount(&promo, &request.lines, request.subtotal);
    debug!(promotion_id = %promo.id, %discount, "Promotion evaluated");

    Ok(PromotionEvaluation {
        promotion_id: promo.id,
        coupon_code: promo.coupon_code.clone(),
        discount,
        display_name: promo.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn promo(promotion_type: PromotionType, value: Decimal) -> PromotionModel {
        PromotionModel {
            id: Uuid::new_v4(),
            name: "Test Promo".to_string(),
            description: None,
            promotion_type,
            value,
            minimum_order_value: None,
            start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap(),
            is_active: true,
            coupon_code: Some("TEST20".to_string()),
            usage_limit: None,
            usage_count: 0,
            per_user_limit: None,
            requires_authentication: false,
            apply_to_all_items: true,
            applicable_categories: serde_json::json!([]),
            applicable_products: serde_json::json!([]),
            free_item_product_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn line(price: Decimal, quantity: i32, category: Option<&str>) -> PricedLine {
        PricedLine {
            product_id: Uuid::new_v4(),
            category: category.map(str::to_string),
            unit_price: price,
            quantity,
        }
    }

    fn mid_2025() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn ctx(subtotal: Decimal) -> RuleContext {
        RuleContext {
            subtotal,
            ..Default::default()
        }
    }

    #[test]
    fn twenty_percent_of_fifty_is_ten() {
        let p = promo(PromotionType::PercentageDiscount, dec!(20));
        let lines = vec![line(dec!(25.00), 2, None)];

        assert!(validate_rules(&p, &ctx(dec!(50.00)), mid_2025()).is_ok());
        assert_eq!(compute_discount(&p, &lines, dec!(50.00)), dec!(10.00));
    }

    #[test]
    fn percentage_rounds_half_away_from_zero() {
        let p = promo(PromotionType::PercentageDiscount, dec!(15));
        let lines = vec![line(dec!(3.30), 1, None)];
        // 15% of 3.30 = 0.495
        assert_eq!(compute_discount(&p, &lines, dec!(3.30)), dec!(0.50));
    }

    #[test]
    fn fixed_amount_never_exceeds_applicable_subtotal() {
        let p = promo(PromotionType::FixedAmount, dec!(30));
        let lines = vec![line(dec!(12.00), 1, None)];
        assert_eq!(compute_discount(&p, &lines, dec!(12.00)), dec!(12.00));
    }

    #[test]
    fn scoped_promotion_counts_only_matching_lines() {
        let mut p = promo(PromotionType::PercentageDiscount, dec!(50));
        p.apply_to_all_items = false;
        p.applicable_categories = serde_json::json!(["Posters"]);
        let lines = vec![
            line(dec!(20.00), 1, Some("posters")),
            line(dec!(40.00), 1, Some("mugs")),
        ];
        assert_eq!(compute_discount(&p, &lines, dec!(60.00)), dec!(10.00));
    }

    #[test]
    fn free_item_uses_designated_product_price() {
        let mut p = promo(PromotionType::FreeItem, dec!(1));
        let freebie = line(dec!(7.50), 1, None);
        p.free_item_product_id = Some(freebie.product_id);
        let lines = vec![line(dec!(30.00), 1, None), freebie];
        assert_eq!(compute_discount(&p, &lines, dec!(37.50)), dec!(7.50));

        p.free_item_product_id = Some(Uuid::new_v4());
        assert_eq!(compute_discount(&p, &lines, dec!(37.50)), Decimal::ZERO);
    }

    #[test]
    fn bogo_needs_two_of_the_same_line() {
        let p = promo(PromotionType::BuyOneGetOne, dec!(1));
        let single = vec![line(dec!(10.00), 1, None)];
        assert_eq!(compute_discount(&p, &single, dec!(10.00)), Decimal::ZERO);

        let pair = vec![line(dec!(10.00), 2, None), line(dec!(4.00), 3, None)];
        assert_eq!(compute_discount(&p, &pair, dec!(32.00)), dec!(4.00));
    }

    #[test]
    fn rule_failures_map_to_specific_reasons() {
        let mut p = promo(PromotionType::PercentageDiscount, dec!(20));
        let late = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();

        assert_eq!(
            validate_rules(&p, &ctx(dec!(50)), late),
            Err(PromotionError::Expired)
        );
        assert_eq!(
            validate_rules(&p, &ctx(dec!(50)), early),
            Err(PromotionError::NotYetActive)
        );

        p.minimum_order_value = Some(dec!(75));
        assert_eq!(
            validate_rules(&p, &ctx(dec!(50)), mid_2025()),
            Err(PromotionError::BelowMinimum)
        );

        p.minimum_order_value = None;
        p.usage_limit = Some(5);
        p.usage_count = 5;
        assert_eq!(
            validate_rules(&p, &ctx(dec!(50)), mid_2025()),
            Err(PromotionError::Exhausted)
        );

        p.usage_limit = None;
        p.requires_authentication = true;
        assert_eq!(
            validate_rules(&p, &ctx(dec!(50)), mid_2025()),
            Err(PromotionError::RequiresAuth)
        );

        let signed_in = RuleContext {
            subtotal: dec!(50),
            authenticated: true,
            applied_promotion_ids: vec![p.id],
        };
        assert_eq!(
            validate_rules(&p, &signed_in, mid_2025()),
            Err(PromotionError::AlreadyApplied)
        );

        p.is_active = false;
        assert_eq!(
            validate_rules(&p, &signed_in, mid_2025()),
            Err(PromotionError::Inactive)
        );
    }
}
