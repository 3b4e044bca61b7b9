use rust_decimal::Decimal;
use tracing::warn;

use crate::price::Price;

pub fn oneshot_usage_value(count: i64) -> i64 {
    count
}

/// `instance_type` is accepted for reporting only; per the resolved open
/// question in SPEC_FULL.md §9 it never enters the cost formula.
pub fn longrun_usage_value(instances: i64, instance_type: Option<&str>, duration_seconds: i64) -> i64 {
    if instance_type.is_some_and(|value| !value.is_empty()) {
        warn!(instance_type, "instance_type is ignored in the longrun cost formula");
    }
    instances * duration_seconds
}

pub fn storage_usage_value(size_bytes: i64, duration_seconds: i64) -> i64 {
    size_bytes * duration_seconds
}

/// `cost = fixed_cost + multiplier * usage_value`, optionally discounted.
/// `include_fixed_cost` is false for storage (§4.6) and for non-terminal
/// longrun re-charges of an already-billed fixed cost (§4.5).
pub fn calculate_cost(price: &Price, discount: Option<Decimal>, usage_value: i64, include_fixed_cost: bool) -> Decimal {
    let fixed_cost = if include_fixed_cost { price.fixed_cost } else { Decimal::ZERO };
    let variable_cost = price.multiplier * Decimal::from(usage_value);
    let total = fixed_cost + variable_cost;
    match discount {
        Some(discount) => total * (Decimal::ONE - discount),
        None => total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceType;
    use chrono::Utc;

    fn price(fixed_cost: Decimal, multiplier: Decimal) -> Price {
        Price {
            id: 1,
            service_type: ServiceType::Oneshot,
            service_subtype: "cpu".to_string(),
            valid_from: Utc::now(),
            valid_to: None,
            fixed_cost,
            multiplier,
            vlab_id: None,
        }
    }

    #[test]
    fn longrun_ignores_instance_type() {
        assert_eq!(longrun_usage_value(2, Some("gpu.large"), 10), 20);
        assert_eq!(longrun_usage_value(2, None, 10), 20);
    }

    #[test]
    fn cost_applies_discount_after_fixed_and_variable() {
        let price = price(Decimal::new(2, 0), Decimal::new(1, 5));
        let cost = calculate_cost(&price, Some(Decimal::new(10, 2)), 1_000_000, true);
        // fixed 2 + 1_000_000 * 0.00001 = 12, discounted 10% => 10.8
        assert_eq!(cost, Decimal::new(108, 1));
    }

    #[test]
    fn scenario_2_oneshot_reservation_amount() {
        let price = price(Decimal::ZERO, Decimal::new(1, 5));
        let cost = calculate_cost(&price, None, 1_000_000, true);
        assert_eq!(cost, Decimal::new(1000000, 5));
    }
}
