//! Tax computation for a billing amount.
//!
//! Every derived field is rounded to the cent (half-up) as soon as it is
//! computed, and later fields are derived from the rounded values. This keeps
//! `gross = fee + vat` and `net = gross - withholding` exact to the cent.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::BillingError;
use crate::models::VatPolicy;

/// Statutory VAT rate (12%).
pub const STANDARD_VAT_RATE: Decimal = Decimal::from_parts(12, 0, 0, false, 2);

/// Decimal places kept on every monetary amount.
pub const MONEY_SCALE: u32 = 2;

/// Whether the configured billing amount already contains VAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountBasis {
    /// The service fee is backed out of the amount.
    VatInclusive,
    /// The amount is the service fee; VAT is added on top.
    VatExclusive,
}

impl AmountBasis {
    pub fn from_inclusive_flag(amount_is_vat_inclusive: bool) -> Self {
        if amount_is_vat_inclusive {
            AmountBasis::VatInclusive
        } else {
            AmountBasis::VatExclusive
        }
    }
}

/// Input to the tax computation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxInput {
    pub billing_amount: Decimal,
    pub basis: AmountBasis,
    pub vat_policy: VatPolicy,
    pub has_withholding: bool,
    /// Fraction in `[0, 1)`; required when `has_withholding` is set.
    pub withholding_rate: Option<Decimal>,
}

/// Financial breakdown of a billing amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub service_fee: Decimal,
    pub vat_amount: Decimal,
    pub gross_amount: Decimal,
    pub withholding_tax: Decimal,
    pub net_amount: Decimal,
}

impl TaxBreakdown {
    pub fn zero() -> Self {
        Self {
            service_fee: Decimal::ZERO,
            vat_amount: Decimal::ZERO,
            gross_amount: Decimal::ZERO,
            withholding_tax: Decimal::ZERO,
            net_amount: Decimal::ZERO,
        }
    }

    /// Field-wise sum, used to total line items.
    pub fn add(&self, other: &TaxBreakdown) -> TaxBreakdown {
        TaxBreakdown {
            service_fee: self.service_fee + other.service_fee,
            vat_amount: self.vat_amount + other.vat_amount,
            gross_amount: self.gross_amount + other.gross_amount,
            withholding_tax: self.withholding_tax + other.withholding_tax,
            net_amount: self.net_amount + other.net_amount,
        }
    }
}

/// Round a monetary amount to the cent, half-up.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute the breakdown at the statutory VAT rate.
pub fn compute(input: &TaxInput) -> Result<TaxBreakdown, BillingError> {
    compute_with_vat_rate(input, STANDARD_VAT_RATE)
}

/// Compute the breakdown at an explicit VAT rate (from settings).
pub fn compute_with_vat_rate(
    input: &TaxInput,
    vat_rate: Decimal,
) -> Result<TaxBreakdown, BillingError> {
    if input.billing_amount <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "billing amount must be positive, got {}",
            input.billing_amount
        )));
    }
    if vat_rate < Decimal::ZERO {
        return Err(BillingError::InvalidRate(format!(
            "VAT rate must not be negative, got {}",
            vat_rate
        )));
    }

    let withholding_rate = if input.has_withholding {
        let rate = input.withholding_rate.ok_or_else(|| {
            BillingError::InvalidRate("withholding rate is required".to_string())
        })?;
        validate_withholding_rate(rate)?;
        Some(rate)
    } else {
        None
    };

    let (service_fee, vat_amount) = match (input.vat_policy, input.basis) {
        (VatPolicy::NonVat, _) => (round_money(input.billing_amount), Decimal::ZERO),
        (VatPolicy::Vat, AmountBasis::VatInclusive) => {
            let fee = round_money(input.billing_amount / (Decimal::ONE + vat_rate));
            (fee, round_money(fee * vat_rate))
        }
        (VatPolicy::Vat, AmountBasis::VatExclusive) => {
            let fee = round_money(input.billing_amount);
            (fee, round_money(fee * vat_rate))
        }
    };

    let gross_amount = service_fee + vat_amount;
    let withholding_tax = match withholding_rate {
        Some(rate) => round_money(service_fee * rate),
        None => Decimal::ZERO,
    };
    let net_amount = gross_amount - withholding_tax;

    Ok(TaxBreakdown {
        service_fee,
        vat_amount,
        gross_amount,
        withholding_tax,
        net_amount,
    })
}

/// Withholding rates are fractions in `[0, 1)`.
pub fn validate_withholding_rate(rate: Decimal) -> Result<(), BillingError> {
    if rate < Decimal::ZERO || rate >= Decimal::ONE {
        return Err(BillingError::InvalidRate(format!(
            "withholding rate must be in [0, 1), got {}",
            rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn input(amount: &str, inclusive: bool, policy: VatPolicy, rate: Option<&str>) -> TaxInput {
        TaxInput {
            billing_amount: dec(amount),
            basis: AmountBasis::from_inclusive_flag(inclusive),
            vat_policy: policy,
            has_withholding: rate.is_some(),
            withholding_rate: rate.map(dec),
        }
    }

    #[test]
    fn test_vat_inclusive_backs_out_fee() {
        let b = compute(&input("11200", true, VatPolicy::Vat, None)).unwrap();
        assert_eq!(b.service_fee, dec("10000.00"));
        assert_eq!(b.vat_amount, dec("1200.00"));
        assert_eq!(b.gross_amount, dec("11200.00"));
        assert_eq!(b.withholding_tax, Decimal::ZERO);
        assert_eq!(b.net_amount, dec("11200.00"));
    }

    #[test]
    fn test_vat_inclusive_with_withholding() {
        let b = compute(&input("11200", true, VatPolicy::Vat, Some("0.02"))).unwrap();
        assert_eq!(b.withholding_tax, dec("200.00"));
        assert_eq!(b.net_amount, dec("11000.00"));
    }

    #[test]
    fn test_non_vat_ignores_inclusive_flag() {
        for inclusive in [true, false] {
            let b = compute(&input("10000", inclusive, VatPolicy::NonVat, Some("0.02"))).unwrap();
            assert_eq!(b.service_fee, dec("10000"));
            assert_eq!(b.vat_amount, Decimal::ZERO);
            assert_eq!(b.withholding_tax, dec("200.00"));
            assert_eq!(b.net_amount, dec("9800.00"));
        }
    }

    #[test]
    fn test_vat_exclusive_adds_vat() {
        let b = compute(&input("10000", false, VatPolicy::Vat, None)).unwrap();
        assert_eq!(b.service_fee, dec("10000"));
        assert_eq!(b.vat_amount, dec("1200.00"));
        assert_eq!(b.gross_amount, dec("11200.00"));
    }

    #[test]
    fn test_inclusive_rounds_each_field() {
        // 1000 / 1.12 = 892.857..., VAT on the rounded fee = 107.1432
        let b = compute(&input("1000", true, VatPolicy::Vat, None)).unwrap();
        assert_eq!(b.service_fee, dec("892.86"));
        assert_eq!(b.vat_amount, dec("107.14"));
        assert_eq!(b.gross_amount, dec("1000.00"));
    }

    #[test]
    fn test_withholding_midpoint_rounds_half_up() {
        // 10.10 * 0.05 = 0.505
        let b = compute(&input("10.10", false, VatPolicy::NonVat, Some("0.05"))).unwrap();
        assert_eq!(b.withholding_tax, dec("0.51"));
        assert_eq!(b.net_amount, dec("9.59"));
    }

    #[test]
    fn test_totals_hold_to_the_cent() {
        let amounts = [
            "0.01", "1", "99.99", "100", "333.33", "1234.56", "5000.05", "77777.77", "99999.99",
        ];
        let rates = [None, Some("0.01"), Some("0.02"), Some("0.05"), Some("0.10"), Some("0.15")];
        for amount in amounts {
            for rate in rates {
                for inclusive in [true, false] {
                    for policy in [VatPolicy::Vat, VatPolicy::NonVat] {
                        let b = compute(&input(amount, inclusive, policy, rate)).unwrap();
                        assert_eq!(b.gross_amount, b.service_fee + b.vat_amount);
                        assert_eq!(b.net_amount, b.gross_amount - b.withholding_tax);
                        assert!(b.service_fee.scale() <= MONEY_SCALE);
                        assert!(b.vat_amount.scale() <= MONEY_SCALE);
                        assert!(b.withholding_tax.scale() <= MONEY_SCALE);
                        if policy == VatPolicy::NonVat {
                            assert_eq!(b.vat_amount, Decimal::ZERO);
                        }
                        if rate.is_none() {
                            assert_eq!(b.withholding_tax, Decimal::ZERO);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        for amount in ["0", "-1", "-0.01"] {
            let err = compute(&input(amount, true, VatPolicy::Vat, None)).unwrap_err();
            assert!(matches!(err, BillingError::InvalidAmount(_)));
        }
    }

    #[test]
    fn test_withholding_rate_bounds() {
        for rate in ["1", "1.5", "-0.01"] {
            let err = compute(&input("100", true, VatPolicy::Vat, Some(rate))).unwrap_err();
            assert!(matches!(err, BillingError::InvalidRate(_)));
        }
        assert!(compute(&input("100", true, VatPolicy::Vat, Some("0"))).is_ok());
        assert!(compute(&input("100", true, VatPolicy::Vat, Some("0.99"))).is_ok());
    }

    #[test]
    fn test_missing_withholding_rate_rejected() {
        let mut i = input("100", true, VatPolicy::Vat, None);
        i.has_withholding = true;
        let err = compute(&i).unwrap_err();
        assert!(matches!(err, BillingError::InvalidRate(_)));
    }

    #[test]
    fn test_rate_ignored_without_withholding_flag() {
        let mut i = input("100", false, VatPolicy::Vat, None);
        i.withholding_rate = Some(dec("5"));
        let b = compute(&i).unwrap();
        assert_eq!(b.withholding_tax, Decimal::ZERO);
    }
}
