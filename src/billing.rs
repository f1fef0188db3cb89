//! Billing-mode selection for randomness requests.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Which currency a subscription is debited in for a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingType {
    /// Always pay in LINK.
    Link,
    /// Always pay in native token.
    Native,
    /// Pick per request via an injected distribution.
    LinkAndNative,
}

impl FromStr for BillingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_uppercase().as_str() {
            "LINK" => Ok(Self::Link),
            "NATIVE" => Ok(Self::Native),
            "LINK_AND_NATIVE" => Ok(Self::LinkAndNative),
            _ => Err(Error::InvalidBillingMode(s.to_string())),
        }
    }
}

impl fmt::Display for BillingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Link => "LINK",
            Self::Native => "NATIVE",
            Self::LinkAndNative => "LINK_AND_NATIVE",
        };
        f.write_str(s)
    }
}

/// Decide whether the next request is paid in native token.
///
/// The fixed modes ignore `distribution` entirely; the mixed mode delegates
/// to it, so tests can inject deterministic or skewed distributions without
/// touching the selector.
pub fn select_billing_type(billing: BillingType, distribution: impl FnOnce() -> bool) -> bool {
    match billing {
        BillingType::Link => false,
        BillingType::Native => true,
        BillingType::LinkAndNative => distribution(),
    }
}

/// Fair-coin distribution used when nothing else is injected.
pub fn fair_coin() -> bool {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_mode_follows_the_injected_distribution() {
        assert!(select_billing_type(BillingType::LinkAndNative, || true));
        assert!(!select_billing_type(BillingType::LinkAndNative, || false));
    }

    #[test]
    fn fixed_modes_ignore_the_distribution() {
        assert!(!select_billing_type(BillingType::Link, || true));
        assert!(select_billing_type(BillingType::Native, || false));
    }

    #[test]
    fn parses_known_modes_case_insensitively() {
        assert_eq!("link".parse::<BillingType>().unwrap(), BillingType::Link);
        assert_eq!("NATIVE".parse::<BillingType>().unwrap(), BillingType::Native);
        assert_eq!(
            "Link_And_Native".parse::<BillingType>().unwrap(),
            BillingType::LinkAndNative
        );
    }

    #[test]
    fn unknown_mode_fails_fast() {
        let err = "DOGE".parse::<BillingType>().unwrap_err();
        assert!(matches!(err, Error::InvalidBillingMode(s) if s == "DOGE"));
    }
}
