//! Money and currency types
//!
//! Amounts are carried in the currency's minor unit (cents for USD, whole yen
//! for JPY). Decimal major-unit values only appear at the HTTP edge and in the
//! PayPal wire format.

use crate::error::{PaymentError, PaymentResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currency codes (ISO 4217) accepted by the storefront
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    USD,
    EUR,
    GBP,
    CAD,
    AUD,
    JPY,
}

impl Currency {
    /// Get currency code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::CAD => "CAD",
            Self::AUD => "AUD",
            Self::JPY => "JPY",
        }
    }

    /// Number of digits after the decimal point in the major unit
    pub fn decimals(&self) -> u32 {
        match self {
            Self::JPY => 0,
            _ => 2,
        }
    }

    /// Parse from a three-letter code, case-insensitive
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_uppercase().as_str() {
            "USD" => Some(Self::USD),
            "EUR" => Some(Self::EUR),
            "GBP" => Some(Self::GBP),
            "CAD" => Some(Self::CAD),
            "AUD" => Some(Self::AUD),
            "JPY" => Some(Self::JPY),
            _ => None,
        }
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 3 {
            return Err(PaymentError::Validation(format!(
                "currency must be a 3-letter ISO 4217 code, got '{}'",
                s
            )));
        }
        Self::from_code(s)
            .ok_or_else(|| PaymentError::Validation(format!("unsupported currency '{}'", s)))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Money amount with currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in smallest currency unit
    pub amount: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: i64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    /// Convert a major-unit decimal (e.g. `100.00`) into minor units.
    ///
    /// Rejects values with more fractional digits than the currency allows.
    pub fn from_major(value: Decimal, currency: Currency) -> PaymentResult<Self> {
        let factor = Decimal::from(10i64.pow(currency.decimals()));
        let minor = value
            .checked_mul(factor)
            .ok_or_else(|| PaymentError::Validation("amount is out of range".to_string()))?;
        if !minor.fract().is_zero() {
            return Err(PaymentError::Validation(format!(
                "{} supports at most {} decimal places",
                currency,
                currency.decimals()
            )));
        }
        let amount = minor
            .to_i64()
            .ok_or_else(|| PaymentError::Validation("amount is out of range".to_string()))?;
        Ok(Self::new(amount, currency))
    }

    /// Major-unit decimal value
    pub fn to_major(&self) -> Decimal {
        Decimal::new(self.amount, self.currency.decimals())
    }

    /// Major-unit string in the provider wire format, e.g. `"100.00"`
    pub fn to_major_string(&self) -> String {
        self.to_major().to_string()
    }

    /// Parse a provider major-unit string such as `"60.00"`
    pub fn parse_major(value: &str, currency: Currency) -> PaymentResult<Self> {
        let decimal = Decimal::from_str(value.trim())
            .map_err(|e| PaymentError::Validation(format!("invalid amount '{}': {}", value, e)))?;
        Self::from_major(decimal, currency)
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        if self.currency != other.currency {
            return None;
        }
        self.amount
            .checked_sub(other.amount)
            .map(|amount| Money::new(amount, self.currency))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_major(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_major_two_decimals() {
        let money = Money::from_major(Decimal::new(10000, 2), Currency::USD).unwrap();
        assert_eq!(money.amount, 10000);
        assert_eq!(money.to_major_string(), "100.00");
    }

    #[test]
    fn test_from_major_rejects_extra_precision() {
        let result = Money::from_major(Decimal::new(1001, 3), Currency::USD);
        assert!(matches!(result, Err(PaymentError::Validation(_))));
    }

    #[test]
    fn test_from_major_rejects_huge_amounts() {
        let huge = Decimal::from_str("79228162514264337593543950335").unwrap();
        assert!(matches!(
            Money::from_major(huge, Currency::USD),
            Err(PaymentError::Validation(_))
        ));
        // Fits in a decimal but not in i64 minor units
        let big = Decimal::from_str("100000000000000000").unwrap();
        assert!(matches!(
            Money::from_major(big, Currency::USD),
            Err(PaymentError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_decimal_currency() {
        let money = Money::parse_major("500", Currency::JPY).unwrap();
        assert_eq!(money.amount, 500);
        assert_eq!(money.to_major_string(), "500");
        assert!(Money::parse_major("500.5", Currency::JPY).is_err());
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!("usd".parse::<Currency>().unwrap(), Currency::USD);
        assert!("US".parse::<Currency>().is_err());
        assert!("XYZ".parse::<Currency>().is_err());
    }

    #[test]
    fn test_checked_sub_requires_same_currency() {
        let usd = Money::new(100, Currency::USD);
        assert_eq!(usd.checked_sub(Money::new(40, Currency::USD)).unwrap().amount, 60);
        assert!(usd.checked_sub(Money::new(40, Currency::EUR)).is_none());
    }
}
