use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(30))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionType {
    #[sea_orm(string_value = "PERCENTAGE_DISCOUNT")]
    PercentageDiscount,
    #[sea_orm(string_value = "FIXED_AMOUNT")]
    FixedAmount,
    #[sea_orm(string_value = "FREE_ITEM")]
    FreeItem,
    #[sea_orm(string_value = "BUY_ONE_GET_ONE")]
    BuyOneGetOne,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "promotions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub promotion_type: PromotionType,
    pub value: Decimal,
    pub minimum_order_value: Option<Decimal>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    /// Stored upper-cased; unique among active promotions.
    pub coupon_code: Option<String>,
    pub usage_limit: Option<i32>,
    pub usage_count: i32,
    pub per_user_limit: Option<i32>,
    pub requires_authentication: bool,
    pub apply_to_all_items: bool,
    /// JSON array of category names the promotion is scoped to
    pub applicable_categories: Json,
    /// JSON array of product ids the promotion is scoped to
    pub applicable_products: Json,
    /// Product given away by FREE_ITEM promotions
    pub free_item_product_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn scoped_categories(&self) -> Vec<String> {
        serde_json::from_value(self.applicable_categories.clone()).unwrap_or_default()
    }

    pub fn scoped_products(&self) -> Vec<Uuid> {
        serde_json::from_value(self.applicable_products.clone()).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::promotion_usage::Entity")]
    PromotionUsage,
    #[sea_orm(has_many = "super::cart_promotion::Entity")]
    CartPromotion,
}

impl Related<super::promotion_usage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PromotionUsage.def()
    }
}

impl Related<super::cart_promotion::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartPromotion.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
