//! Hex quantity helpers shared by the wire types and the transaction decoder.

use alloy_primitives::U256;
use log::error;
use std::time::{SystemTime, UNIX_EPOCH};

/// Address used as the sender of minted tokens.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

fn strip_prefix(hex: &str) -> &str {
    hex.strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex)
}

/// Decode a `0x`-prefixed JSON-RPC quantity into a `u64`.
///
/// Malformed input is logged and decoded as zero.
pub fn decode_hex(hex: &str) -> u64 {
    let digits = strip_prefix(hex);
    if digits.is_empty() {
        return 0;
    }
    match u64::from_str_radix(digits, 16) {
        Ok(value) => value,
        Err(e) => {
            error!("Couldn't decode hex quantity {:?}: {}", hex, e);
            0
        }
    }
}

/// Decode a `0x`-prefixed quantity of arbitrary size (balances, values, fees).
pub fn decode_value_hex(hex: &str) -> U256 {
    let digits = strip_prefix(hex);
    if digits.is_empty() {
        return U256::ZERO;
    }
    match U256::from_str_radix(digits, 16) {
        Ok(value) => value,
        Err(e) => {
            error!("Couldn't decode hex value {:?}: {}", hex, e);
            U256::ZERO
        }
    }
}

/// Encode a height as a JSON-RPC quantity.
pub fn encode_quantity(value: u64) -> String {
    format!("{:#x}", value)
}

/// Turn a 32-byte ABI word into a lowercase `0x` address (its last 20 bytes).
pub fn input_param_to_address(word: &str) -> String {
    match word.get(24..) {
        Some(tail) => format!("0x{}", tail.to_lowercase()),
        None => {
            error!("ABI word too short for an address: {:?}", word);
            ZERO_ADDRESS.to_string()
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
