use crate::types::Symbol;
use std::collections::HashMap;

/// How an exchange spells a pair when the explicit table has no entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeStyle {
    /// "BTCUSDT"
    Concatenated,
    /// "BTC-USDT", "BTC_USDT", ...
    Separated(&'static str),
}

/// Canonical "BASE/QUOTE" ⇄ exchange-native symbol translation.
///
/// The explicit table always wins; the style rule is the deterministic fallback.
/// Native strings that cannot be split unambiguously map to `None`.
#[derive(Debug, Clone)]
pub struct SymbolMapper {
    style: NativeStyle,
    to_native: HashMap<Symbol, String>,
    from_native: HashMap<String, Symbol>,
}

impl SymbolMapper {
    pub fn new(style: NativeStyle) -> Self {
        Self {
            style,
            to_native: HashMap::new(),
            from_native: HashMap::new(),
        }
    }

    /// Register an explicit mapping
    pub fn with(mut self, canonical: &str, native: &str) -> Self {
        if let Ok(symbol) = Symbol::parse(canonical) {
            self.insert(symbol, native);
        }
        self
    }

    pub fn insert(&mut self, canonical: Symbol, native: &str) {
        self.from_native
            .insert(native.to_uppercase(), canonical.clone());
        self.to_native.insert(canonical, native.to_string());
    }

    pub fn to_native(&self, symbol: &Symbol) -> String {
        if let Some(native) = self.to_native.get(symbol) {
            return native.clone();
        }
        match self.style {
            NativeStyle::Concatenated => symbol.concatenated(),
            NativeStyle::Separated(separator) => symbol.joined(separator),
        }
    }

    pub fn from_native(&self, native: &str) -> Option<Symbol> {
        let upper = native.trim().to_uppercase();
        if let Some(symbol) = self.from_native.get(&upper) {
            return Some(symbol.clone());
        }
        match self.style {
            NativeStyle::Concatenated => Symbol::split_known_quote(&upper),
            NativeStyle::Separated(separator) => {
                let (base, quote) = upper.split_once(separator)?;
                Symbol::parse(&format!("{}/{}", base, quote)).ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_entry_wins_over_rule() {
        let mapper = SymbolMapper::new(NativeStyle::Concatenated).with("BTC/USD", "XBTUSD");
        let btc_usd = Symbol::new("BTC", "USD");
        assert_eq!(mapper.to_native(&btc_usd), "XBTUSD");
        assert_eq!(mapper.from_native("xbtusd"), Some(btc_usd));
    }

    #[test]
    fn test_concatenated_rule() {
        let mapper = SymbolMapper::new(NativeStyle::Concatenated);
        assert_eq!(mapper.to_native(&Symbol::new("ETH", "USDT")), "ETHUSDT");
        assert_eq!(mapper.from_native("ETHUSDT"), Some(Symbol::new("ETH", "USDT")));
        // unknown quote asset is not guessed
        assert_eq!(mapper.from_native("ETHXYZ"), None);
    }

    #[test]
    fn test_separated_rule() {
        let mapper = SymbolMapper::new(NativeStyle::Separated("-"));
        assert_eq!(mapper.to_native(&Symbol::new("SOL", "USDC")), "SOL-USDC");
        assert_eq!(mapper.from_native("SOL-USDC"), Some(Symbol::new("SOL", "USDC")));
        assert_eq!(mapper.from_native("SOLUSDC"), None);
    }
}
