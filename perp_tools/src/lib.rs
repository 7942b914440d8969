/// lib.rs — Maintenance tooling around the perp engine
///
/// Kline downloads, trade-log analysis, open-order housekeeping and symbol
/// lists.  The binary in `main.rs` is a thin clap front end.
pub mod symbols;

pub use symbols::{listed_recommended, recommended, CONSERVATIVE};
