use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub upstream_timeout_ms: u64,
    pub quote_ttl_ms: u64,
    pub min_update_interval_ms: u64,
    pub max_update_interval_ms: u64,
    pub idle_grace_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub max_batch_symbols: usize,
    pub depth_window_ticks: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
            .trim()
            .to_string();

        let port = match std::env::var("PORT") {
            Ok(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value: {value}"))?,
            Err(_) => 8080,
        };

        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://quotes.example.com".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let upstream_timeout_ms = parse_env_u64("UPSTREAM_TIMEOUT_MS", 2_000)?;
        let quote_ttl_ms = parse_env_u64("QUOTE_TTL_MS", 5_000)?;
        let min_update_interval_ms = parse_env_u64("MIN_UPDATE_INTERVAL_MS", 500)?;
        let max_update_interval_ms = parse_env_u64("MAX_UPDATE_INTERVAL_MS", 5_000)?;
        let idle_grace_ms = parse_env_u64("IDLE_GRACE_MS", 2_000)?;
        let subscriber_queue_capacity =
            parse_env_u64("SUBSCRIBER_QUEUE_CAPACITY", 64)? as usize;
        let max_batch_symbols = parse_env_u64("MAX_BATCH_SYMBOLS", 50)? as usize;
        let depth_window_ticks = parse_env_u64("DEPTH_WINDOW_TICKS", 10)? as u32;

        let config = Self {
            host,
            port,
            upstream_base_url,
            upstream_timeout_ms,
            quote_ttl_ms,
            min_update_interval_ms,
            max_update_interval_ms,
            idle_grace_ms,
            subscriber_queue_capacity,
            max_batch_symbols,
            depth_window_ticks,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_update_interval_ms == 0 {
            return Err(anyhow!("MIN_UPDATE_INTERVAL_MS must be greater than 0"));
        }
        if self.min_update_interval_ms > self.max_update_interval_ms {
            return Err(anyhow!(
                "MIN_UPDATE_INTERVAL_MS ({}) cannot exceed MAX_UPDATE_INTERVAL_MS ({})",
                self.min_update_interval_ms,
                self.max_update_interval_ms
            ));
        }
        // A hung upstream call must not outlive the tick that issued it.
        if self.upstream_timeout_ms >= self.min_update_interval_ms {
            return Err(anyhow!(
                "UPSTREAM_TIMEOUT_MS ({}) must be shorter than MIN_UPDATE_INTERVAL_MS ({})",
                self.upstream_timeout_ms,
                self.min_update_interval_ms
            ));
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(anyhow!("SUBSCRIBER_QUEUE_CAPACITY must be greater than 0"));
        }
        if self.max_batch_symbols == 0 {
            return Err(anyhow!("MAX_BATCH_SYMBOLS must be greater than 0"));
        }
        Ok(())
    }

    /// Clamp a subscriber-requested cadence to the server-enforced bounds.
    pub fn clamp_interval_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.min_update_interval_ms)
            .clamp(self.min_update_interval_ms, self.max_update_interval_ms)
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {name} value: {value}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            upstream_base_url: "http://localhost:9000".to_string(),
            upstream_timeout_ms: 200,
            quote_ttl_ms: 5_000,
            min_update_interval_ms: 500,
            max_update_interval_ms: 5_000,
            idle_grace_ms: 2_000,
            subscriber_queue_capacity: 64,
            max_batch_symbols: 50,
            depth_window_ticks: 10,
        }
    }

    #[test]
    fn clamp_interval_enforces_bounds() {
        let config = base_config();
        assert_eq!(config.clamp_interval_ms(None), 500);
        assert_eq!(config.clamp_interval_ms(Some(50)), 500);
        assert_eq!(config.clamp_interval_ms(Some(1_000)), 1_000);
        assert_eq!(config.clamp_interval_ms(Some(60_000)), 5_000);
    }

    #[test]
    fn timeout_must_fit_inside_tick() {
        let mut config = base_config();
        config.upstream_timeout_ms = 500;
        assert!(config.validate().is_err());
        config.upstream_timeout_ms = 499;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_interval_bounds_rejected() {
        let mut config = base_config();
        config.min_update_interval_ms = 6_000;
        assert!(config.validate().is_err());
    }
}
