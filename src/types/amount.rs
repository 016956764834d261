//! Monetary amounts
//!
//! An [`Amount`] is the triple `(currency, value, fraction)` where
//! `fraction` counts units of `1 / FRACTION_BASE`. All arithmetic is
//! checked: mixing currencies, overflowing [`MAX_AMOUNT_VALUE`] or going
//! below zero is an error rather than a silent wrap.
//!
//! The text form is `CUR:V.F` (for example `EUR:4.90`); the decimal part
//! is parsed and printed through `rust_decimal`, so there is exactly one
//! place where decimal notation is interpreted.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fraction units in one unit of currency
pub const FRACTION_BASE: u32 = 100_000_000;

/// Number of decimal digits representable in the fraction
pub const FRACTION_DIGITS: u32 = 8;

/// Largest whole value an amount may carry
pub const MAX_AMOUNT_VALUE: u64 = 1 << 52;

/// Maximum currency name length (the NBO field is 12 bytes, NUL-terminated)
pub const CURRENCY_LEN: usize = 12;

/// Errors from amount parsing and arithmetic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    /// Operands are denominated in different currencies
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    /// Result exceeds the representable range
    #[error("amount overflow")]
    Overflow,

    /// Result would be negative
    #[error("amount underflow")]
    Underflow,

    /// Text could not be parsed as `CUR:V.F`
    #[error("malformed amount '{input}'")]
    Malformed { input: String },

    /// Currency name is empty, too long or not alphabetic
    #[error("invalid currency '{currency}'")]
    InvalidCurrency { currency: String },
}

/// A non-negative amount of a single currency
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Amount {
    currency: String,
    value: u64,
    fraction: u32,
}

fn check_currency(currency: &str) -> Result<(), AmountError> {
    let valid = !currency.is_empty()
        && currency.len() < CURRENCY_LEN
        && currency.chars().all(|c| c.is_ascii_alphabetic());
    if valid {
        Ok(())
    } else {
        Err(AmountError::InvalidCurrency {
            currency: currency.to_string(),
        })
    }
}

impl Amount {
    /// Create an amount from its parts
    ///
    /// # Errors
    ///
    /// Returns `InvalidCurrency` for a bad currency name and `Overflow`
    /// when `value` exceeds [`MAX_AMOUNT_VALUE`] or `fraction` is not
    /// below [`FRACTION_BASE`].
    pub fn new(currency: &str, value: u64, fraction: u32) -> Result<Self, AmountError> {
        check_currency(currency)?;
        if value > MAX_AMOUNT_VALUE || fraction >= FRACTION_BASE {
            return Err(AmountError::Overflow);
        }
        Ok(Self {
            currency: currency.to_ascii_uppercase(),
            value,
            fraction,
        })
    }

    /// The zero amount in `currency`
    pub fn zero(currency: &str) -> Result<Self, AmountError> {
        Self::new(currency, 0, 0)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    fn same_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(AmountError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            })
        }
    }

    /// Total number of fraction units, used for exact comparison
    fn units(&self) -> u128 {
        u128::from(self.value) * u128::from(FRACTION_BASE) + u128::from(self.fraction)
    }

    fn from_units(currency: &str, units: u128) -> Result<Self, AmountError> {
        let value = units / u128::from(FRACTION_BASE);
        let fraction = (units % u128::from(FRACTION_BASE)) as u32;
        let value = u64::try_from(value).map_err(|_| AmountError::Overflow)?;
        Self::new(currency, value, fraction)
    }

    /// Add two amounts of the same currency
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.same_currency(other)?;
        Self::from_units(&self.currency, self.units() + other.units())
    }

    /// Subtract `other` from `self`
    ///
    /// # Errors
    ///
    /// `Underflow` if `other > self`.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.same_currency(other)?;
        let units = self
            .units()
            .checked_sub(other.units())
            .ok_or(AmountError::Underflow)?;
        Self::from_units(&self.currency, units)
    }

    /// Subtract, clamping at zero
    pub fn saturating_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.same_currency(other)?;
        Self::from_units(&self.currency, self.units().saturating_sub(other.units()))
    }

    /// Compare two amounts of the same currency
    pub fn checked_cmp(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.same_currency(other)?;
        Ok(self.units().cmp(&other.units()))
    }

    /// The smaller of two amounts of the same currency
    pub fn checked_min(&self, other: &Amount) -> Result<Amount, AmountError> {
        Ok(match self.checked_cmp(other)? {
            Ordering::Greater => other.clone(),
            _ => self.clone(),
        })
    }

    /// Divide by `divisor`, rounding down to the nearest fraction unit
    ///
    /// A divisor of zero yields the amount unchanged.
    pub fn divide(&self, divisor: u32) -> Amount {
        if divisor <= 1 {
            return self.clone();
        }
        let units = self.units() / u128::from(divisor);
        Self {
            currency: self.currency.clone(),
            value: (units / u128::from(FRACTION_BASE)) as u64,
            fraction: (units % u128::from(FRACTION_BASE)) as u32,
        }
    }

    /// Sum a sequence of amounts, starting from zero in `currency`
    pub fn sum<'a, I>(currency: &str, amounts: I) -> Result<Amount, AmountError>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::zero(currency)?, |acc, a| acc.checked_add(a))
    }

    /// Decimal view of the amount (without currency)
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.value) + Decimal::new(i64::from(self.fraction), FRACTION_DIGITS)
    }

    /// Build an amount from a non-negative decimal
    pub fn from_decimal(currency: &str, decimal: Decimal) -> Result<Self, AmountError> {
        let malformed = || AmountError::Malformed {
            input: format!("{}:{}", currency, decimal),
        };
        if decimal.is_sign_negative() || decimal.scale() > FRACTION_DIGITS {
            return Err(malformed());
        }
        let value = decimal.trunc().to_u64().ok_or(AmountError::Overflow)?;
        let fraction = (decimal.fract() * Decimal::from(FRACTION_BASE))
            .to_u32()
            .ok_or_else(malformed)?;
        Self::new(currency, value, fraction)
    }

    /// Network byte order encoding used inside signed structures
    ///
    /// Layout: value (u64 BE), fraction (u32 BE), currency (12 bytes,
    /// zero padded).
    pub fn to_nbo(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..8].copy_from_slice(&self.value.to_be_bytes());
        out[8..12].copy_from_slice(&self.fraction.to_be_bytes());
        let cur = self.currency.as_bytes();
        let n = cur.len().min(CURRENCY_LEN - 1);
        out[12..12 + n].copy_from_slice(&cur[..n]);
        out
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.currency, self.to_decimal().normalize())
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AmountError::Malformed {
            input: s.to_string(),
        };
        let (currency, number) = s.split_once(':').ok_or_else(malformed)?;
        check_currency(currency)?;
        // Decimal accepts forms such as "+1" or "1e3" that are not amounts
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(malformed());
        }
        let decimal = Decimal::from_str(number).map_err(|_| malformed())?;
        Self::from_decimal(currency, decimal)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn eur(s: &str) -> Amount {
        format!("EUR:{}", s).parse().unwrap()
    }

    #[rstest]
    #[case::whole("EUR:5", 5, 0)]
    #[case::two_digits("EUR:4.90", 4, 90_000_000)]
    #[case::max_digits("EUR:0.00000001", 0, 1)]
    #[case::lowercase_currency("eur:1.5", 1, 50_000_000)]
    fn test_parse_valid(#[case] input: &str, #[case] value: u64, #[case] fraction: u32) {
        let amount: Amount = input.parse().unwrap();
        assert_eq!(amount.currency(), "EUR");
        assert_eq!(amount.value(), value);
        assert_eq!(amount.fraction(), fraction);
    }

    #[rstest]
    #[case::no_colon("EUR5")]
    #[case::empty_number("EUR:")]
    #[case::negative("EUR:-1")]
    #[case::exponent("EUR:1e3")]
    #[case::too_precise("EUR:0.000000001")]
    #[case::bad_currency("E1R:1")]
    #[case::long_currency("ABCDEFGHIJKL:1")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<Amount>().is_err());
    }

    #[rstest]
    #[case::whole("5", "EUR:5")]
    #[case::trailing_zero("4.90", "EUR:4.9")]
    #[case::zero("0", "EUR:0")]
    fn test_display(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(eur(input).to_string(), expected);
    }

    #[test]
    fn test_add_carries_fraction() {
        let sum = eur("0.6").checked_add(&eur("0.7")).unwrap();
        assert_eq!(sum, eur("1.3"));
    }

    #[test]
    fn test_sub_underflow() {
        assert_eq!(eur("1").checked_sub(&eur("2")), Err(AmountError::Underflow));
        assert_eq!(eur("1").saturating_sub(&eur("2")).unwrap(), eur("0"));
    }

    #[test]
    fn test_currency_mismatch() {
        let usd: Amount = "USD:1".parse().unwrap();
        assert!(matches!(
            eur("1").checked_add(&usd),
            Err(AmountError::CurrencyMismatch { .. })
        ));
        assert!(eur("1").checked_cmp(&usd).is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        let max = Amount::new("EUR", MAX_AMOUNT_VALUE, 0).unwrap();
        assert_eq!(max.checked_add(&eur("1")), Err(AmountError::Overflow));
    }

    #[test]
    fn test_divide_rounds_down() {
        assert_eq!(eur("1").divide(3), Amount::new("EUR", 0, 33_333_333).unwrap());
        assert_eq!(eur("1").divide(0), eur("1"));
    }

    #[test]
    fn test_sum_and_min() {
        let parts = [eur("1.5"), eur("2.5"), eur("1")];
        assert_eq!(Amount::sum("EUR", parts.iter()).unwrap(), eur("5"));
        assert_eq!(eur("3").checked_min(&eur("2")).unwrap(), eur("2"));
    }

    #[test]
    fn test_nbo_layout() {
        let nbo = eur("4.90").to_nbo();
        assert_eq!(&nbo[..8], &4u64.to_be_bytes());
        assert_eq!(&nbo[8..12], &90_000_000u32.to_be_bytes());
        assert_eq!(&nbo[12..15], b"EUR");
        assert!(nbo[15..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&eur("4.90")).unwrap();
        assert_eq!(json, "\"EUR:4.9\"");
        let back: Amount = serde_json::from_str("\"EUR:4.90\"").unwrap();
        assert_eq!(back, eur("4.9"));
    }
}
