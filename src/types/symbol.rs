use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Quote assets recognised when a pair arrives without a separator ("BTCUSDT").
/// Longest suffixes first so "USDT" wins over "USD".
pub const KNOWN_QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "EUR", "USD", "BTC", "ETH", "BNB", "TRY",
];

/// Canonical trading pair, always stored as "BASE/QUOTE" in upper case.
///
/// Construction goes through [`Symbol::parse`], so a `Symbol` value is always an
/// unambiguous pair. Exchange-native spellings are produced by
/// [`crate::exchanges::symbols::SymbolMapper`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    base: String,
    quote: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot interpret '{0}' as a BASE/QUOTE pair")]
pub struct SymbolParseError(pub String);

impl Symbol {
    /// Build a symbol from its two assets
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().trim().to_uppercase(),
            quote: quote.into().trim().to_uppercase(),
        }
    }

    /// Parse "BTC/USDT", "btc-usdt", "BTC_USDT" or a separator-less "BTCUSDT".
    ///
    /// Separator-less input is only accepted when it ends in a known quote asset;
    /// anything else is rejected rather than guessed.
    pub fn parse(input: &str) -> Result<Self, SymbolParseError> {
        let upper = input.trim().to_uppercase();
        if let Some((base, quote)) = upper.split_once(|c: char| matches!(c, '/' | '-' | '_')) {
            if is_asset(base) && is_asset(quote) {
                return Ok(Self::new(base, quote));
            }
            return Err(SymbolParseError(input.to_string()));
        }

        Self::split_known_quote(&upper).ok_or_else(|| SymbolParseError(input.to_string()))
    }

    /// Split a concatenated pair on a known quote suffix
    pub fn split_known_quote(concatenated: &str) -> Option<Self> {
        let upper = concatenated.to_uppercase();
        KNOWN_QUOTE_ASSETS.iter().find_map(|quote| {
            let base = upper.strip_suffix(*quote)?;
            is_asset(base).then(|| Self::new(base, *quote))
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Concatenated form without separator ("BTCUSDT")
    pub fn concatenated(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Pair joined with a custom separator ("BTC-USDT")
    pub fn joined(&self, separator: &str) -> String {
        format!("{}{}{}", self.base, separator, self.quote)
    }
}

fn is_asset(s: &str) -> bool {
    !s.is_empty() && s.len() <= 12 && s.chars().all(|c| c.is_ascii_alphanumeric())
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl std::str::FromStr for Symbol {
    type Err = SymbolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::parse(s)
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Symbol::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_separated_forms() {
        let expected = Symbol::new("BTC", "USDT");
        assert_eq!(Symbol::parse("BTC/USDT").unwrap(), expected);
        assert_eq!(Symbol::parse("btc-usdt").unwrap(), expected);
        assert_eq!(Symbol::parse(" BTC_USDT ").unwrap(), expected);
    }

    #[test]
    fn test_parse_concatenated_uses_known_quote() {
        assert_eq!(Symbol::parse("ETHUSDT").unwrap(), Symbol::new("ETH", "USDT"));
        assert_eq!(Symbol::parse("ETHBTC").unwrap(), Symbol::new("ETH", "BTC"));
        assert_eq!(Symbol::parse("SOLFDUSD").unwrap(), Symbol::new("SOL", "FDUSD"));
    }

    #[test]
    fn test_parse_rejects_ambiguous_input() {
        assert!(Symbol::parse("BTCXYZ").is_err());
        assert!(Symbol::parse("").is_err());
        assert!(Symbol::parse("/USDT").is_err());
        assert!(Symbol::parse("USDT").is_err());
    }

    #[test]
    fn test_display_and_forms() {
        let symbol = Symbol::new("eth", "usdc");
        assert_eq!(symbol.to_string(), "ETH/USDC");
        assert_eq!(symbol.concatenated(), "ETHUSDC");
        assert_eq!(symbol.joined("-"), "ETH-USDC");
    }

    #[test]
    fn test_symbol_serialization() {
        let symbol = Symbol::new("BTC", "USDT");
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"BTC/USDT\"");

        let back: Symbol = serde_json::from_str("\"BTCUSDT\"").unwrap();
        assert_eq!(back, symbol);
    }
}
