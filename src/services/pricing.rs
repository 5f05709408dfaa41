//! Shipping, tax and total computation for checkout.
//!
//! Everything here is pure: the calculator holds only the injected
//! [`CheckoutConfig`] and performs no I/O.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::CheckoutConfig;
use crate::errors::ServiceError;

/// Currencies the gateway charges in whole units (no minor unit).
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Monetary breakdown of a checkout, all values rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceBreakdown {
    #[schema(value_type = String, example = "45.00")]
    pub subtotal: Decimal,
    #[schema(value_type = String, example = "5.99")]
    pub shipping_cost: Decimal,
    #[schema(value_type = String, example = "4.34")]
    pub tax: Decimal,
    #[schema(value_type = String, example = "55.33")]
    pub total: Decimal,
}

#[derive(Debug, Clone)]
pub struct PricingCalculator {
    config: CheckoutConfig,
}

impl PricingCalculator {
    pub fn new(config: CheckoutConfig) -> Self {
        Self { config }
    }

    pub fn currency(&self) -> &str {
        &self.config.currency
    }

    /// Free at or above the threshold, flat rate below it.
    pub fn shipping_cost(&self, subtotal: Decimal) -> Result<Decimal, ServiceError> {
        ensure_non_negative("subtotal", subtotal)?;
        if subtotal >= self.config.free_shipping_threshold {
            Ok(Decimal::ZERO)
        } else {
            Ok(self.config.flat_shipping_cost)
        }
    }

    /// Tax on `taxable_amount`, rounded half-cents and fractions up to the next cent.
    pub fn tax(&self, taxable_amount: Decimal) -> Result<Decimal, ServiceError> {
        ensure_non_negative("taxable amount", taxable_amount)?;
        Ok((taxable_amount * self.config.tax_rate)
            .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero))
    }

    /// Shipping is taxed together with the goods.
    pub fn breakdown(&self, subtotal: Decimal) -> Result<PriceBreakdown, ServiceError> {
        let subtotal = subtotal.round_dp(2);
        let shipping_cost = self.shipping_cost(subtotal)?;
        let tax = self.tax(subtotal + shipping_cost)?;
        Ok(PriceBreakdown {
            subtotal,
            shipping_cost,
            tax,
            total: subtotal + shipping_cost + tax,
        })
    }
}

fn ensure_non_negative(what: &str, amount: Decimal) -> Result<(), ServiceError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(ServiceError::InvalidInput(format!(
            "{} must not be negative, got {}",
            what, amount
        )));
    }
    Ok(())
}

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str())
}

fn minor_unit_exponent(currency: &str) -> u32 {
    if is_zero_decimal(currency) {
        0
    } else {
        2
    }
}

/// Converts a decimal amount to the gateway's integer minor units (cents for USD).
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    ensure_non_negative("amount", amount)?;
    let exponent = minor_unit_exponent(currency);
    let scaled = (amount * Decimal::from(10i64.pow(exponent)))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled.to_i64().ok_or_else(|| {
        ServiceError::InvalidInput(format!("amount {} {} is out of range", amount, currency))
    })
}

pub fn from_minor_units(amount: i64, currency: &str) -> Decimal {
    Decimal::new(amount, minor_unit_exponent(currency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn calculator() -> PricingCalculator {
        PricingCalculator::new(CheckoutConfig {
            flat_shipping_cost: dec!(5.99),
            free_shipping_threshold: dec!(50.00),
            tax_rate: dec!(0.085),
            currency: "usd".into(),
        })
    }

    #[test]
    fn below_threshold_pays_flat_shipping() {
        let b = calculator().breakdown(dec!(45.00)).unwrap();
        assert_eq!(b.shipping_cost, dec!(5.99));
        assert_eq!(b.tax, dec!(4.34));
        assert_eq!(b.total, dec!(55.33));
    }

    #[test]
    fn above_threshold_ships_free() {
        let b = calculator().breakdown(dec!(60.00)).unwrap();
        assert_eq!(b.shipping_cost, Decimal::ZERO);
        assert_eq!(b.tax, dec!(5.10));
        assert_eq!(b.total, dec!(65.10));
    }

    #[rstest]
    #[case(dec!(49.99), dec!(5.99))]
    #[case(dec!(50.00), dec!(0))]
    #[case(dec!(50.01), dec!(0))]
    #[case(dec!(0), dec!(5.99))]
    fn shipping_threshold_boundary(#[case] subtotal: Decimal, #[case] expected: Decimal) {
        assert_eq!(calculator().shipping_cost(subtotal).unwrap(), expected);
    }

    #[test]
    fn negative_input_is_rejected() {
        assert!(matches!(
            calculator().shipping_cost(dec!(-1)),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(calculator().tax(dec!(-0.01)).is_err());
    }

    #[rstest]
    #[case(dec!(55.33), "usd", 5533)]
    #[case(dec!(10), "USD", 1000)]
    #[case(dec!(1200), "jpy", 1200)]
    #[case(dec!(0.005), "usd", 1)]
    fn minor_units(#[case] amount: Decimal, #[case] currency: &str, #[case] expected: i64) {
        assert_eq!(to_minor_units(amount, currency).unwrap(), expected);
    }

    #[test]
    fn minor_units_back_to_decimal() {
        assert_eq!(from_minor_units(5533, "usd"), dec!(55.33));
        assert_eq!(from_minor_units(1200, "jpy"), dec!(1200));
    }

    proptest! {
        #[test]
        fn total_is_sum_of_parts(cents in 0i64..10_000_000) {
            let b = calculator().breakdown(Decimal::new(cents, 2)).unwrap();
            prop_assert_eq!(b.total, b.subtotal + b.shipping_cost + b.tax);
            prop_assert!(b.tax >= Decimal::ZERO);
        }

        #[test]
        fn shipping_is_free_iff_at_or_above_threshold(cents in 0i64..20_000) {
            let subtotal = Decimal::new(cents, 2);
            let shipping = calculator().shipping_cost(subtotal).unwrap();
            if subtotal >= dec!(50.00) {
                prop_assert_eq!(shipping, Decimal::ZERO);
            } else {
                prop_assert_eq!(shipping, dec!(5.99));
            }
        }

        #[test]
        fn tax_is_within_one_cent_of_exact(cents in 0i64..10_000_000) {
            let taxable = Decimal::new(cents, 2);
            let exact = taxable * dec!(0.085);
            let rounded = calculator().tax(taxable).unwrap();
            prop_assert!(rounded >= exact);
            prop_assert!(rounded - exact < dec!(0.01));
        }
    }
}
