//! Config command - show or initialize configuration.

use anyhow::Result;
use podtunnel_core::ConfigStore;

pub async fn show(store: &ConfigStore, init: bool, json: bool) -> Result<()> {
    let config = store.load().await?;

    if init {
        store.save(&config).await?;
        eprintln!("Wrote {}", store.config_path().display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let retry = &config.retry;
    let attempts = if retry.max_attempts == 0 {
        "unlimited".to_string()
    } else {
        retry.max_attempts.to_string()
    };

    println!("Config file: {}", store.config_path().display());
    println!();
    println!("Bind address:        {}", config.bind_address);
    println!(
        "Retry backoff:       {}ms .. {}ms{}",
        retry.base_delay_ms,
        retry.max_delay().as_millis(),
        if retry.jitter { " (jittered)" } else { "" }
    );
    println!("Retry attempts:      {}", attempts);
    println!("Liveness poll:       {}ms", config.liveness_poll_interval_ms);
    println!("Connection wait:     {}ms", config.connection_wait_timeout_ms);
    println!("Resolve timeout:     {}ms", config.resolve_timeout_ms);
    println!("Shutdown timeout:    {}ms", config.shutdown_timeout_ms);

    Ok(())
}
