use rust_decimal::{Decimal, RoundingStrategy};

// Stock and carts
pub mod cart;
pub mod stock_ledger;

// Promotions
pub mod promotion_usage;
pub mod promotions;

// Orders, payments and fulfillment
pub mod fulfillment;
pub mod orders;
pub mod payments;

// Collaborators
pub mod notifications;

/// Rounds a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
