pub mod cart;
pub mod cart_item;
pub mod cart_promotion;
pub mod inventory_unit;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod promotion;
pub mod promotion_usage;
pub mod user;
