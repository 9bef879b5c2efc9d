//! Timeouts command implementation.

use resync_core::{PoolConfig, ProviderConfig, Timeouts};
use std::path::Path;
use std::time::Duration;

/// Builds the timeout table, including the pool prefill budget.
pub fn table(timeouts: &Timeouts, pool: &PoolConfig) -> Vec<(&'static str, Duration)> {
    let mut rows = timeouts.rows();
    rows.insert(0, ("pool_init", pool.init_timeout));
    rows
}

/// Runs the timeouts command.
pub fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let rows = match path {
        Some(path) => {
            let config = ProviderConfig::from_file(path)?;
            table(&config.timeouts, &config.pool)
        }
        None => table(&Timeouts::default(), &PoolConfig::default()),
    };

    println!("{:<16} {:>8}", "operation", "budget");
    println!("{}", "-".repeat(25));
    for (name, budget) in rows {
        println!("{:<16} {:>7}s", name, budget.as_secs());
    }

    Ok(())
}
