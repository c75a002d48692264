//! Daily routing keys
//!
//! The netDb key space rotates once a day: the routing key of an identity
//! is `SHA256(ident || yyyymmdd)`. Distances are measured between routing
//! keys, so the floodfill set responsible for an entry migrates at UTC
//! midnight; stores issued near the boundary also go to the next day's
//! closest floodfills.

use garlicnet_core::{now_ms, IdentHash};
use garlicnet_crypto::hash2;

/// Days since epoch → (year, month, day), civil calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u32, d as u32)
}

/// `yyyymmdd` digits for a given day number since the epoch
fn date_string(days_since_epoch: u64) -> [u8; 8] {
    let (y, m, d) = civil_from_days(days_since_epoch as i64);
    let mut out = [0u8; 8];
    let s = format!("{:04}{:02}{:02}", y, m, d);
    out.copy_from_slice(s.as_bytes());
    out
}

/// Routing key for `ident` on a specific day number since the epoch
pub fn routing_key_for_day(ident: &IdentHash, days_since_epoch: u64) -> IdentHash {
    hash2(ident, &date_string(days_since_epoch))
}

/// Routing key for `ident` today (UTC)
pub fn routing_key(ident: &IdentHash) -> IdentHash {
    routing_key_for_day(ident, now_ms() / 86_400_000)
}

/// Milliseconds until the next UTC midnight; under this threshold stores
/// are also flooded to the next day's closest floodfills.
pub fn ms_until_midnight() -> u64 {
    86_400_000 - now_ms() % 86_400_000
}
