//! Process configuration
//!
//! Read once at startup from environment variables, after loading a
//! `.env` file from the working directory if there is one.

use std::env;

use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Per-subscription delivery queue capacity
pub const DEFAULT_DELIVERY_QUEUE: usize = 64;

/// Per-connection outbound frame buffer
pub const DEFAULT_OUTBOUND_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub delivery_queue: usize,
    pub outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            delivery_queue: DEFAULT_DELIVERY_QUEUE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl Config {
    /// Load from `CHAT_BIND_ADDR`, `CHAT_DELIVERY_QUEUE` and `CHAT_OUTBOUND_BUFFER`
    ///
    /// Variables already set in the environment win over `.env` entries.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            bind_addr: lookup("CHAT_BIND_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            delivery_queue: capacity(&lookup, "CHAT_DELIVERY_QUEUE", DEFAULT_DELIVERY_QUEUE)?,
            outbound_buffer: capacity(&lookup, "CHAT_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?,
        })
    }
}

fn capacity<F>(lookup: &F, key: &str, default: usize) -> Result<usize, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.parse::<usize>() {
        // tokio channels panic on zero capacity
        Ok(0) => Err(AppError::Config(format!("{} must be greater than zero", key))),
        Ok(n) => Ok(n),
        Err(e) => Err(AppError::Config(format!("Invalid {}: {}", key, e))),
    }
}
