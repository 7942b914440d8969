/// symbols.rs — Curated symbol lists
///
/// Liquid USDT-M perpetuals grouped by tier, for small accounts that should
/// not scan every listed contract.

pub const TIER_MAJORS: &[&str] = &["BTCUSDT", "ETHUSDT", "BNBUSDT"];

pub const TIER_LARGE_CAPS: &[&str] = &[
    "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "LINKUSDT", "DOTUSDT", "AVAXUSDT",
];

pub const TIER_MID_CAPS: &[&str] = &[
    "MATICUSDT", "LTCUSDT", "UNIUSDT", "ATOMUSDT", "NEARUSDT", "AAVEUSDT", "SUSHIUSDT", "SANDUSDT",
    "MANAUSDT", "AXSUSDT",
];

/// Higher volatility
pub const TIER_TRENDING: &[&str] = &[
    "1000PEPEUSDT", "1000SHIBUSDT", "WIFUSDT", "ORDIUSDT", "ARBUSDT", "OPUSDT", "SUIUSDT", "APTUSDT",
    "INJUSDT", "SEIUSDT",
];

/// Ten most liquid pairs, for the smallest balances.
pub const CONSERVATIVE: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT",
    "LINKUSDT", "DOTUSDT",
];

pub fn tiers() -> [(&'static str, &'static [&'static str]); 4] {
    [
        ("Tier 1: majors", TIER_MAJORS),
        ("Tier 2: large caps", TIER_LARGE_CAPS),
        ("Tier 3: mid caps", TIER_MID_CAPS),
        ("Tier 4: trending", TIER_TRENDING),
    ]
}

/// Every tier, in order.
pub fn recommended() -> Vec<&'static str> {
    tiers().iter().flat_map(|(_, syms)| syms.iter().copied()).collect()
}

/// Recommended symbols that are actually listed (keeps tier order).
pub fn listed_recommended(listed: &[String]) -> Vec<&'static str> {
    recommended()
        .into_iter()
        .filter(|s| listed.iter().any(|l| l == s))
        .collect()
}
