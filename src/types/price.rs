use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Price quoted in the quote asset of a pair.
/// Kept distinct from `Size` so a quantity can never be passed where a price is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price(pub Decimal);

impl Price {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Parse a price from the string form exchanges send on the wire
    pub fn from_str(s: &str) -> Result<Self, rust_decimal::Error> {
        Decimal::from_str(s.trim()).map(Self)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Serialized as a string so no precision is lost through f64
impl Serialize for Price {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decimal = Decimal::from_str(&s).map_err(serde::de::Error::custom)?;
        Ok(Price(decimal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_from_wire_string() {
        let price = Price::from_str(" 67500.10 ").unwrap();
        assert_eq!(price.value(), Decimal::new(6750010, 2));
        assert!(price.is_positive());
        assert!(Price::from_str("not-a-number").is_err());
    }

    #[test]
    fn test_price_serializes_as_string() {
        let price = Price::new(Decimal::new(6750000, 2));
        let json = serde_json::to_string(&price).unwrap();
        assert_eq!(json, "\"67500.00\"");

        let back: Price = serde_json::from_str(&json).unwrap();
        assert_eq!(back, price);
    }
}
