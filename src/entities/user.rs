use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Customer account. Guest checkouts get a record keyed by email so
/// per-customer promotion limits apply across their orders.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub email: String,
    pub name: Option<String>,
    pub is_guest: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::promotion_usage::Entity")]
    PromotionUsage,
}

impl Related<super::promotion_usage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PromotionUsage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
