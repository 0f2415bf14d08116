//! Static plan catalog served to the pricing page

use lexfam_shared::BillingInterval;
use serde::Serialize;

use crate::client::PriceIds;

/// Percentage taken off by the yearly promotions
pub const DISCOUNT_PERCENT: f64 = 20.0;

/// Name of the one-time coupon attached to discounted checkouts
pub const CHECKOUT_COUPON_NAME: &str = "20% off first year";

/// Description of the credit item issued on discounted upgrades
pub const UPGRADE_CREDIT_DESCRIPTION: &str = "20% discount for yearly subscription upgrade";

const PRO_FEATURES: &[&str] = &[
    "Unlimited conversations",
    "Advanced AI models",
    "Priority support",
    "Custom integrations",
    "Team collaboration",
    "Advanced analytics",
];

/// A purchasable plan
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    /// Whole currency units, for display
    pub price: u32,
    pub interval: BillingInterval,
    pub price_id: String,
    pub description: &'static str,
    pub features: Vec<&'static str>,
    pub popular: bool,
}

/// Build the catalog from configured price ids
pub fn plan_catalog(price_ids: &PriceIds) -> Vec<Plan> {
    let mut yearly_features = PRO_FEATURES.to_vec();
    yearly_features.push("20% discount");

    vec![
        Plan {
            id: "monthly",
            name: "Pro Monthly",
            price: 39,
            interval: BillingInterval::Month,
            price_id: price_ids.monthly.clone(),
            description: "Perfect for getting started with pro features",
            features: PRO_FEATURES.to_vec(),
            popular: false,
        },
        Plan {
            id: "yearly",
            name: "Pro Yearly",
            price: 374,
            interval: BillingInterval::Year,
            price_id: price_ids.yearly.clone(),
            description: "Best value - save 20% per year",
            features: yearly_features,
            popular: true,
        },
    ]
}

/// Credit for a discounted upgrade, as a negative amount in minor units.
/// Fractions of a cent are dropped.
pub fn upgrade_credit(unit_amount: i64) -> i64 {
    -((unit_amount as f64 * DISCOUNT_PERCENT / 100.0).trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> PriceIds {
        PriceIds {
            monthly: "price_m".to_string(),
            yearly: "price_y".to_string(),
        }
    }

    #[test]
    fn test_catalog_shape() {
        let plans = plan_catalog(&ids());
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].price_id, "price_m");
        assert!(!plans[0].popular);
        assert_eq!(plans[1].interval, BillingInterval::Year);
        assert!(plans[1].popular);
        assert_eq!(plans[1].features.last(), Some(&"20% discount"));
        assert_eq!(plans[0].features.len() + 1, plans[1].features.len());
    }

    #[test]
    fn test_catalog_serializes_camel_case() {
        let json = serde_json::to_value(&plan_catalog(&ids())[0]).unwrap();
        assert_eq!(json["priceId"], "price_m");
        assert_eq!(json["interval"], "month");
    }

    #[test]
    fn test_upgrade_credit() {
        assert_eq!(upgrade_credit(46800), -9360);
        assert_eq!(upgrade_credit(3999), -799);
        assert_eq!(upgrade_credit(4), 0);
        assert_eq!(upgrade_credit(0), 0);
    }
}
