#![forbid(unsafe_code)]

use rust_decimal::Decimal;

use crate::{ContractViolation, Validate};

// ISO 4217 codes the gateway reports without a minor unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Upper-case ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Accepts any case; stored upper-case.
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let c = Self(v.into().trim().to_ascii_uppercase());
        c.validate()?;
        Ok(c)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn minor_unit_exponent(&self) -> u32 {
        if ZERO_DECIMAL_CURRENCIES.contains(&self.0.as_str()) {
            0
        } else {
            2
        }
    }

    /// Converts an integer amount in minor units (pence, cents) into major units.
    pub fn from_minor_units(&self, minor: i64) -> Result<Decimal, ContractViolation> {
        if minor < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "amount_minor_units",
                reason: "must be >= 0",
            });
        }
        Ok(Decimal::new(minor, self.minor_unit_exponent()))
    }
}

impl Validate for CurrencyCode {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() != 3 || !self.0.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ContractViolation::InvalidValue {
                field: "currency",
                reason: "must be a 3-letter ISO 4217 code",
            });
        }
        Ok(())
    }
}

pub fn validate_positive_amount(field: &'static str, v: Decimal) -> Result<(), ContractViolation> {
    if v <= Decimal::ZERO {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be > 0",
        });
    }
    Ok(())
}

pub fn validate_non_negative_amount(
    field: &'static str,
    v: Decimal,
) -> Result<(), ContractViolation> {
    if v.is_sign_negative() && !v.is_zero() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be >= 0",
        });
    }
    Ok(())
}
