use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;
use std::{num::ParseIntError, sync::OnceLock};

#[allow(non_camel_case_types)]
enum QuantitySuffix {
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
    k,
    M,
    G,
    T,
    P,
    E,
    m,
    None,
    Invalid,
}

impl QuantitySuffix {
    fn new(suffix: &str) -> Self {
        match suffix {
            "Ki" => Self::Ki,
            "Mi" => Self::Mi,
            "Gi" => Self::Gi,
            "Ti" => Self::Ti,
            "Pi" => Self::Pi,
            "Ei" => Self::Ei,
            "k" => Self::k,
            "M" => Self::M,
            "G" => Self::G,
            "T" => Self::T,
            "P" => Self::P,
            "E" => Self::E,
            "m" => Self::m,
            "" => Self::None,
            _ => Self::Invalid,
        }
    }

    /// Multiplier that converts an amount with this suffix into milli units
    fn milli_multiplier(&self) -> Option<i128> {
        let multiplier = match self {
            Self::Ki => 1_000 * (1 << 10),
            Self::Mi => 1_000 * (1 << 20),
            Self::Gi => 1_000 * (1 << 30),
            Self::Ti => 1_000 * (1 << 40),
            Self::Pi => 1_000 * (1 << 50),
            Self::Ei => 1_000 * (1 << 60),
            Self::k => 1_000 * 1_000,
            Self::M => 1_000 * 1_000_000,
            Self::G => 1_000 * 1_000_000_000,
            Self::T => 1_000 * 1_000_000_000_000,
            Self::P => 1_000 * 1_000_000_000_000_000,
            Self::E => 1_000 * 1_000_000_000_000_000_000,
            Self::m => 1,
            Self::None => 1_000,
            Self::Invalid => return None,
        };
        Some(multiplier)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseIntError(#[from] ParseIntError),
    #[error("Invalid quantity format: {0}")]
    InvalidFormat(String),
    #[error("Invalid quantity suffix in {0}")]
    InvalidSuffix(String),
    #[error("Quantity {0} is out of range")]
    Overflow(String),
}

/// Parses resource quota quantities into an exactly comparable integer.
///
/// Object count quotas (`count/configmaps`, `configmaps`) are integral in practice but the
/// API server may still render them with SI suffixes (`1k`) or exponents (`1e3`), so all
/// values are normalised to milli units.
pub trait QuantityParser {
    /// Returns the quantity in milli units, so `Quantity("2")` yields `2000`.
    ///
    /// # Errors
    ///
    /// Fails on fractional amounts, unknown suffixes and values that do not fit into an i128.
    fn to_milli_value(&self) -> Result<i128, ParseError>;
}

impl QuantityParser for Quantity {
    fn to_milli_value(&self) -> Result<i128, ParseError> {
        let value = self.0.trim();
        static REGEX: OnceLock<Regex> = OnceLock::new();
        let cap = REGEX
            .get_or_init(|| {
                Regex::new(r"^([+-]?[0-9]+)(?:[eE]([+-]?[0-9]+)|([[:alpha:]]{0,2}))$")
                    .expect("static quantity regex is valid")
            })
            .captures(value)
            .ok_or_else(|| ParseError::InvalidFormat(value.to_string()))?;

        let amount = cap[1].parse::<i128>()?;

        if let Some(exponent) = cap.get(2) {
            let exponent = exponent.as_str().parse::<i32>()?;
            if exponent < 0 {
                return Err(ParseError::InvalidFormat(value.to_string()));
            }
            return 10i128
                .checked_pow(exponent as u32)
                .and_then(|scale| scale.checked_mul(1_000))
                .and_then(|scale| amount.checked_mul(scale))
                .ok_or_else(|| ParseError::Overflow(value.to_string()));
        }

        let suffix = cap.get(3).map(|m| m.as_str()).unwrap_or_default();
        let multiplier = QuantitySuffix::new(suffix)
            .milli_multiplier()
            .ok_or_else(|| ParseError::InvalidSuffix(value.to_string()))?;

        amount
            .checked_mul(multiplier)
            .ok_or_else(|| ParseError::Overflow(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milli(q: &str) -> i128 {
        Quantity(q.into()).to_milli_value().unwrap()
    }

    #[test]
    fn plain_counts() {
        assert_eq!(milli("0"), 0);
        assert_eq!(milli("2"), 2_000);
        assert_eq!(milli(" 12345 "), 12_345_000);
    }

    #[test]
    fn decimal_and_binary_suffixes() {
        assert_eq!(milli("1k"), 1_000_000);
        assert_eq!(milli("1Ki"), 1_024_000);
        assert_eq!(milli("3M"), 3_000_000_000);
    }

    #[test]
    fn milli_suffix() {
        assert_eq!(milli("1500m"), 1_500);
        assert!(milli("1500m") < milli("2"));
    }

    #[test]
    fn exponent_notation() {
        assert_eq!(milli("1e3"), milli("1k"));
        assert!(Quantity("1e-3".into()).to_milli_value().is_err());
    }

    #[test]
    fn invalid_unit_fails() {
        assert!(matches!(
            Quantity("12345r".into()).to_milli_value(),
            Err(ParseError::InvalidSuffix(_))
        ));
    }

    #[test]
    fn fractional_amount_fails() {
        assert!(matches!(
            Quantity("123.123".into()).to_milli_value(),
            Err(ParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn overflow_is_reported() {
        assert!(matches!(
            Quantity("999999999999999999999E".into()).to_milli_value(),
            Err(ParseError::Overflow(_))
        ));
    }
}
