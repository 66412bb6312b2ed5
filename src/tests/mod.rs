//! End-to-end tests for the chain sync engine

use alloy_primitives::U256;
use spectrum_sync::SyncConfig;
use std::time::Duration;


pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Base block reward before the first step-down.
pub fn base_reward() -> U256 {
    U256::from(8_000_000_000_000_000_000u64)
}

/// Engine settings for tests: no genesis allocation, fast ticks.
pub fn test_config(max_routines: usize) -> SyncConfig {
    SyncConfig {
        max_routines,
        genesis_supply: U256::ZERO,
        interval: Duration::from_millis(10),
        log_interval: Duration::from_secs(1),
        ..Default::default()
    }
}
