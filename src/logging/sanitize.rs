/// Log sanitization
///
/// Prevents full correlation of trades and on-chain transfers via logs
/// while keeping enough of each identifier for debugging.

// ============================================================================
// ID Sanitization
// ============================================================================

/// Sanitize a trade/user row id for logs
///
/// Format: "abc12345...90ef" (first 8 + last 4 chars)
pub fn sanitize_trade_id(id: &str) -> String {
    if id.len() < 12 {
        return "<invalid-id>".to_string();
    }
    format!("{}...{}", &id[..8], &id[id.len() - 4..])
}

/// Sanitize a sender address for logs
///
/// Format: "Tx...abc" (first 2 + last 3 chars)
pub fn sanitize_address(address: &str) -> String {
    if address.len() < 6 {
        return "<invalid-address>".to_string();
    }
    format!("{}...{}", &address[..2], &address[address.len() - 3..])
}

/// Sanitize a stablecoin amount (minor units)
///
/// Rounds to whole units so exact amounts cannot be matched to chain data.
pub fn sanitize_amount(minor_units: i64) -> String {
    let units = minor_units as f64 / 1_000_000.0;
    format!("~{:.0} units", units)
}

// ============================================================================
// Transaction Sanitization
// ============================================================================

/// Sanitize a transaction hash (txid) for logs
///
/// Format: "abc12345...90ef" (first 8 + last 4 chars)
///
/// TX hashes are 64 hex chars - revealing the full hash allows chain correlation
pub fn sanitize_txid(txid: &str) -> String {
    if txid.len() < 16 {
        return "[invalid_txid]".to_string();
    }
    format!("{}...{}", &txid[..8], &txid[txid.len() - 4..])
}

/// Sanitize a deposit memo for logs
///
/// Memos carry the escrow correlation key; only the length is logged for
/// unparsable ones so garbage chain data never lands verbatim in log files.
pub fn sanitize_memo(memo: &str) -> String {
    format!("[memo: {} bytes]", memo.len())
}
