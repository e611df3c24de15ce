use alloy::primitives::U256;
use eyre::Context as _;
use rust_decimal::Decimal;
use std::str::FromStr as _;

/// Significant digits that always fit a `Decimal` mantissa.
const MAX_DIGITS: usize = 28;

/// Parse a non-negative base-unit integer as returned by quote APIs (`"1500000"`).
pub fn parse_base_units(s: &str) -> eyre::Result<U256> {
    let s = s.trim();
    if s.is_empty() {
        eyre::bail!("empty amount");
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        eyre::bail!("invalid base amount: {s}");
    }
    U256::from_str_radix(s, 10).context("parse base amount")
}

/// Format a base-unit integer amount into a decimal string without using floats.
///
/// Examples:
/// - raw=1500000, decimals=6 => "1.5"
/// - raw=1, decimals=6 => "0.000001"
pub fn format_base_units(raw: U256, decimals: u8) -> String {
    let digits = raw.to_string();
    let d = usize::from(decimals);
    if d == 0 {
        return digits;
    }
    let padded = if digits.len() <= d {
        format!("{}{digits}", "0".repeat(d - digits.len() + 1))
    } else {
        digits
    };
    let (whole, frac) = padded.split_at(padded.len() - d);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{frac}")
    }
}

/// Convert an on-chain integer amount to token units.
///
/// Fractional digits beyond what a `Decimal` can carry are truncated; an integer part that
/// does not fit is an error.
pub fn base_units_to_decimal(raw: U256, decimals: u8) -> eyre::Result<Decimal> {
    let text = format_base_units(raw, decimals);
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), ""));
    if whole.len() > MAX_DIGITS {
        eyre::bail!("amount too large for decimal: {text}");
    }
    let keep = MAX_DIGITS.saturating_sub(whole.len()).min(frac.len());
    let frac = frac.get(..keep).unwrap_or_default();
    let s = if frac.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{frac}")
    };
    Decimal::from_str(&s).with_context(|| format!("parse decimal {s}"))
}

/// [`parse_base_units`] followed by [`base_units_to_decimal`].
pub fn api_amount_to_decimal(s: &str, decimals: u8) -> eyre::Result<Decimal> {
    base_units_to_decimal(parse_base_units(s)?, decimals)
}
