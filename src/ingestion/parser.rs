//! Text extraction: pulls symbol, direction, entry (price or zone), TP
//! ladder, SL, and leverage out of a free-form signal message. Deliberately
//! tolerant of the handful of label variants real channels use — this is a
//! best-effort scrape, not a schema validator; [`super::SignalIngestion`]
//! owns rejecting what comes back incomplete.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;

use crate::models::Side;

#[derive(Debug, Clone, Default)]
pub struct ParsedFields {
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub entry: Option<Decimal>,
    pub tps: Vec<Decimal>,
    pub sl: Option<Decimal>,
    pub leverage: Option<Decimal>,
}

static SYMBOL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)#([A-Za-z]{2,10})(?:USDT|/USDT)?\b").unwrap(),
        Regex::new(r"(?i)\b([A-Za-z]{2,10})USDT\b").unwrap(),
        Regex::new(r"(?i)\b([A-Za-z]{2,10})/USDT\b").unwrap(),
        Regex::new(r"(?i)\b([A-Za-z]{2,10})\(USDT\)").unwrap(),
        Regex::new(r"(?i)(?:Symbol|COIN NAME|Asset)[:\s]+([A-Za-z]{2,10})(?:USDT|/USDT)?").unwrap(),
    ]
});

static LONG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLONG\b").unwrap());
static SHORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSHORT\b").unwrap());
static BUY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bBUY\b").unwrap());
static SELL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSELL\b").unwrap());

static ZONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Entry|Buy|Sell)\s*(?:zone|price)?\s*[:\-]?\s*\$?([\d.]+)\s*[-\x{2013}]\s*\$?([\d.]+)").unwrap());

static ENTRY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)Entry\s*(?:zone|Price|Targets?|Orders?)?\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)Entry\s*[:\-]\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)Entries?\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)Entry\s+price\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)Entry\s+Orders?\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)\bBuy\b\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)\bSell\b\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
    ]
});

static TP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:TP|Target)\s*(\d*)[:\-]?\s*\$?([\d.]+)").unwrap());
static TP_EMOJI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)[\x{FE0F}\x{20E3})\-]\s*\$?([\d.]+)").unwrap());

static SL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)Stop[- ]?Loss\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)\bSL\b[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)STOP\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
        Regex::new(r"(?i)Stoploss\s*[:\-]?\s*\$?([\d.]+)").unwrap(),
    ]
});

static LEVERAGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)Leverage[:\-]?\s*(\d+(?:\.\d+)?)x?").unwrap(),
        Regex::new(r"(?i)(\d+(?:\.\d+)?)x\s*Leverage").unwrap(),
    ]
});

pub struct SignalParser;

impl SignalParser {
    pub fn parse(text: &str) -> ParsedFields {
        ParsedFields {
            symbol: Self::extract_symbol(text),
            side: Self::extract_side(text),
            entry: Self::extract_entry(text),
            tps: Self::extract_take_profits(text),
            sl: Self::extract_stop_loss(text),
            leverage: Self::extract_leverage(text),
        }
    }

    fn extract_symbol(text: &str) -> Option<String> {
        for re in SYMBOL_PATTERNS.iter() {
            if let Some(caps) = re.captures(text) {
                let sym = caps.get(1)?.as_str();
                if (2..=10).contains(&sym.len()) && sym.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Some(format!("{}USDT", sym.to_ascii_uppercase()));
                }
            }
        }
        None
    }

    fn extract_side(text: &str) -> Option<Side> {
        if LONG_RE.is_match(text) {
            Some(Side::Long)
        } else if SHORT_RE.is_match(text) {
            Some(Side::Short)
        } else if BUY_RE.is_match(text) {
            Some(Side::Long)
        } else if SELL_RE.is_match(text) {
            Some(Side::Short)
        } else {
            None
        }
    }

    /// A price zone (`entry: 1.00 - 1.10`) collapses to its midpoint; a bare
    /// single price is used as-is.
    fn extract_entry(text: &str) -> Option<Decimal> {
        if let Some(caps) = ZONE_RE.captures(text) {
            let a: Decimal = caps.get(1)?.as_str().parse().ok()?;
            let b: Decimal = caps.get(2)?.as_str().parse().ok()?;
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            return Some((lo + hi) / Decimal::from(2));
        }
        for re in ENTRY_PATTERNS.iter() {
            if let Some(caps) = re.captures(text) {
                if let Some(m) = caps.get(1) {
                    if let Ok(price) = m.as_str().parse() {
                        return Some(price);
                    }
                }
            }
        }
        None
    }

    fn extract_take_profits(text: &str) -> Vec<Decimal> {
        let mut tps: Vec<(u32, Decimal)> = Vec::new();
        for caps in TP_RE.captures_iter(text) {
            let num: u32 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or((tps.len() + 1) as u32);
            if let Some(price) = caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                tps.push((num, price));
            }
        }
        for caps in TP_EMOJI_RE.captures_iter(text) {
            let Some(num) = caps.get(1).and_then(|m| m.as_str().parse().ok()) else { continue };
            if let Some(price) = caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                tps.push((num, price));
            }
        }
        tps.sort_by_key(|(num, _)| *num);
        tps.into_iter().map(|(_, price)| price).collect()
    }

    fn extract_stop_loss(text: &str) -> Option<Decimal> {
        for re in SL_PATTERNS.iter() {
            if let Some(caps) = re.captures(text) {
                if let Some(price) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                    return Some(price);
                }
            }
        }
        None
    }

    fn extract_leverage(text: &str) -> Option<Decimal> {
        for re in LEVERAGE_PATTERNS.iter() {
            if let Some(caps) = re.captures(text) {
                if let Some(lev) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                    return Some(lev);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_hash_symbol_and_long_direction() {
        let fields = SignalParser::parse("#BTC LONG Entry: 100.50 TP1: 105 TP2: 110 SL: 98 Leverage: 10x");
        assert_eq!(fields.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(fields.side, Some(Side::Long));
        assert_eq!(fields.entry, Some(dec!(100.50)));
        assert_eq!(fields.tps, vec![dec!(105), dec!(110)]);
        assert_eq!(fields.sl, Some(dec!(98)));
        assert_eq!(fields.leverage, Some(dec!(10)));
    }

    #[test]
    fn parses_entry_zone_as_midpoint() {
        let fields = SignalParser::parse("ETHUSDT SHORT\nEntry zone: 3000 - 3010\nTP 3050\nSL 3100");
        assert_eq!(fields.entry, Some(dec!(3005)));
        assert_eq!(fields.side, Some(Side::Short));
    }

    #[test]
    fn missing_symbol_returns_none() {
        let fields = SignalParser::parse("no coin mentioned here, just noise");
        assert!(fields.symbol.is_none());
    }

    #[test]
    fn numbered_targets_sort_by_index_not_appearance_order() {
        let fields = SignalParser::parse("TP2: 110 TP1: 105 TP3: 115");
        assert_eq!(fields.tps, vec![dec!(105), dec!(110), dec!(115)]);
    }
}
