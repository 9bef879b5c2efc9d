//! Config command implementation.

use resync_core::ProviderConfig;
use std::path::Path;

/// Renders a validated configuration without secrets.
pub fn describe(config: &ProviderConfig) -> Vec<String> {
    let retry = &config.retry;
    let mut lines = vec![
        format!("Base URL: {}", config.base_url),
        format!("Client ID: {}", config.credentials.client_id),
        format!("User agent: {}", config.user_agent),
        format!("Request timeout: {}s", config.request_timeout.as_secs()),
        format!("Pool capacity: {}", config.pool.capacity),
        format!("Pool init timeout: {}s", config.pool.init_timeout.as_secs()),
        match config.pool.acquire_timeout {
            Some(t) => format!("Acquire timeout: {}s", t.as_secs()),
            None => "Acquire timeout: none".to_string(),
        },
        format!(
            "Backoff: {}ms x{} up to {}ms{}",
            retry.initial_delay.as_millis(),
            retry.backoff_multiplier,
            retry.max_delay.as_millis(),
            if retry.add_jitter { " (+25% jitter)" } else { "" }
        ),
        format!("Attempt budget: {}", retry.max_attempts),
    ];
    for (name, budget) in config.timeouts.rows() {
        lines.push(format!("Timeout {}: {}s", name, budget.as_secs()));
    }
    lines
}

/// Runs the config command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No configuration found at {:?}", path).into());
    }

    let config = ProviderConfig::from_file(path)?;

    println!("Configuration OK: {}", path.display());
    for line in describe(&config) {
        println!("  {}", line);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_file_passes() {
        let file = write_config(
            r#"{
                "base_url": "https://api.example.test",
                "credentials": {"client_id": "id", "client_secret": "hunter2"},
                "pool": {"capacity": 4, "acquire_timeout_secs": 5},
                "timeouts": {"slow_delete_secs": 240}
            }"#,
        );
        assert!(run(file.path()).is_ok());

        let config = ProviderConfig::from_file(file.path()).unwrap();
        let lines = describe(&config);
        assert!(lines.contains(&"Pool capacity: 4".to_string()));
        assert!(lines.contains(&"Acquire timeout: 5s".to_string()));
        assert!(lines.contains(&"Timeout slow_delete: 240s".to_string()));
        assert!(!lines.iter().any(|l| l.contains("hunter2")));
    }

    #[test]
    fn invalid_capacity_fails() {
        let file = write_config(
            r#"{
                "base_url": "https://api.example.test",
                "credentials": {"client_id": "id", "client_secret": "s"},
                "pool": {"capacity": 0}
            }"#,
        );
        let err = run(file.path()).unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent.json")).is_err());
    }
}
