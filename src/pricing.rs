//! Pricing policy: maps a JSON-RPC `(method, params)` pair to a price in the
//! billing token.
//!
//! Quotes are deterministic. Every method has a base price (from the default
//! table, overridable per method through configuration, falling back to the
//! default per-query price for unknown methods), and exactly one multiplier
//! applies on top:
//!
//! - `deepHistorical` ×1.5 — `getBlock`/`getTransaction` with a first
//!   positional parameter below slot 100 000,
//! - `bulkQuery` ×1.3 — `getSignaturesForAddress` with a `limit` above 10,
//! - `realTime` ×0.8 — `getSlot`/`getBlockHeight`.
//!
//! The result is rounded to 6 decimal places, the billing token's precision.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::collections::HashMap;

/// Slots below this count as deep-historical for `getBlock`/`getTransaction`.
const DEEP_HISTORICAL_SLOT_CUTOFF: u64 = 100_000;
/// `getSignaturesForAddress` limits above this count as bulk queries.
const BULK_QUERY_LIMIT: u64 = 10;

/// Number of fractional digits in a quoted amount; matches the billing
/// token's base-unit precision.
pub const AMOUNT_SCALE: u32 = 6;

fn deep_historical_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn bulk_query_multiplier() -> Decimal {
    Decimal::new(13, 1) // 1.3
}

fn real_time_multiplier() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

/// Default base price when neither the table nor configuration knows the
/// method.
pub fn default_price_per_query() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

/// Immutable after construction; shared read-only across requests.
#[derive(Debug, Clone)]
pub struct PricingTable {
    /// Base prices keyed by lowercased method name.
    base: HashMap<String, Decimal>,
    default_price: Decimal,
}

impl PricingTable {
    /// Builds the table from the default per-method prices, a configured
    /// default, and per-method overrides (method names matched
    /// case-insensitively).
    pub fn new(default_price: Decimal, overrides: &HashMap<String, Decimal>) -> Self {
        let mut base: HashMap<String, Decimal> = [
            ("getblock", Decimal::new(1, 3)),
            ("gettransaction", Decimal::new(1, 3)),
            ("getsignaturesforaddress", Decimal::new(1, 3)),
            ("getslot", Decimal::new(1, 3)),
            ("getblockheight", Decimal::new(1, 3)),
            ("getaccountinfo", Decimal::new(5, 4)),
            ("getbalance", Decimal::new(5, 4)),
        ]
        .into_iter()
        .map(|(method, price)| (method.to_string(), price))
        .collect();
        for (method, price) in overrides {
            base.insert(method.to_ascii_lowercase(), *price);
        }
        PricingTable {
            base,
            default_price,
        }
    }

    /// Quotes a price for a call, rounded to [`AMOUNT_SCALE`] decimal places.
    pub fn quote(&self, method: &str, params: Option<&Value>) -> Decimal {
        let base = self
            .base
            .get(&method.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_price);
        (base * multiplier(method, params)).round_dp(AMOUNT_SCALE)
    }

    /// Quotes a price and renders it as the wire amount string with exactly
    /// [`AMOUNT_SCALE`] fractional digits, e.g. `"0.001000"`.
    pub fn quote_amount(&self, method: &str, params: Option<&Value>) -> String {
        format_amount(self.quote(method, params))
    }
}

/// Renders an amount with exactly [`AMOUNT_SCALE`] fractional digits.
pub fn format_amount(amount: Decimal) -> String {
    let mut amount = amount.round_dp(AMOUNT_SCALE);
    amount.rescale(AMOUNT_SCALE);
    amount.to_string()
}

/// Converts a token amount to base units (10^[`AMOUNT_SCALE`] per whole token).
pub fn to_base_units(amount: Decimal) -> Option<u64> {
    (amount * Decimal::from(10u64.pow(AMOUNT_SCALE))).trunc().to_u64()
}

fn multiplier(method: &str, params: Option<&Value>) -> Decimal {
    match method {
        "getBlock" | "getTransaction" => {
            let first_slot = params
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(Value::as_u64);
            match first_slot {
                Some(slot) if slot < DEEP_HISTORICAL_SLOT_CUTOFF => deep_historical_multiplier(),
                _ => Decimal::ONE,
            }
        }
        "getSignaturesForAddress" => {
            let limit = params.and_then(find_limit);
            match limit {
                Some(limit) if limit > BULK_QUERY_LIMIT => bulk_query_multiplier(),
                _ => Decimal::ONE,
            }
        }
        "getSlot" | "getBlockHeight" => real_time_multiplier(),
        _ => Decimal::ONE,
    }
}

/// Pulls the `limit` option out of positional params (`[address, {limit: N}]`)
/// or a bare options object.
fn find_limit(params: &Value) -> Option<u64> {
    match params {
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("limit"))
            .and_then(Value::as_u64),
        Value::Object(_) => params.get("limit").and_then(Value::as_u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn table() -> PricingTable {
        PricingTable::new(default_price_per_query(), &HashMap::new())
    }

    #[test]
    fn deep_historical_applies_below_the_slot_cutoff() {
        let params = json!([50_000]);
        assert_eq!(table().quote_amount("getBlock", Some(&params)), "0.001500");
    }

    #[test]
    fn slot_99999_is_deep_historical_but_100000_is_not() {
        let deep = json!([99_999]);
        let shallow = json!([100_000]);
        assert_eq!(table().quote_amount("getBlock", Some(&deep)), "0.001500");
        assert_eq!(table().quote_amount("getBlock", Some(&shallow)), "0.001000");
    }

    #[test]
    fn recent_blocks_are_priced_at_base() {
        let params = json!([14_000_000]);
        assert_eq!(table().quote_amount("getBlock", Some(&params)), "0.001000");
    }

    #[test]
    fn bulk_query_needs_limit_above_ten() {
        let at_limit = json!(["addr", {"limit": 10}]);
        let over_limit = json!(["addr", {"limit": 11}]);
        assert_eq!(
            table().quote_amount("getSignaturesForAddress", Some(&at_limit)),
            "0.001000"
        );
        assert_eq!(
            table().quote_amount("getSignaturesForAddress", Some(&over_limit)),
            "0.001300"
        );
    }

    #[test]
    fn real_time_methods_get_a_discount() {
        assert_eq!(table().quote_amount("getSlot", None), "0.000800");
        assert_eq!(table().quote_amount("getBlockHeight", None), "0.000800");
    }

    #[test]
    fn unknown_methods_fall_back_to_the_default_price() {
        assert_eq!(table().quote_amount("getLatestBlockhash", None), "0.001000");
    }

    #[test]
    fn overrides_replace_base_prices_case_insensitively() {
        let mut overrides = HashMap::new();
        overrides.insert("GETBLOCK".to_string(), Decimal::from_str("0.002").unwrap());
        let table = PricingTable::new(default_price_per_query(), &overrides);
        let params = json!([14_000_000]);
        assert_eq!(table.quote_amount("getBlock", Some(&params)), "0.002000");
        // The multiplier still applies on top of the override.
        let deep = json!([1]);
        assert_eq!(table.quote_amount("getBlock", Some(&deep)), "0.003000");
    }

    #[test]
    fn quotes_are_deterministic() {
        let params = json!([50_000]);
        let first = table().quote("getTransaction", Some(&params));
        let second = table().quote("getTransaction", Some(&params));
        assert_eq!(first, second);
    }

    #[test]
    fn base_unit_conversion_uses_six_decimals() {
        let amount = Decimal::from_str("0.001000").unwrap();
        assert_eq!(to_base_units(amount), Some(1_000));
        let amount = Decimal::from_str("1.5").unwrap();
        assert_eq!(to_base_units(amount), Some(1_500_000));
    }
}
