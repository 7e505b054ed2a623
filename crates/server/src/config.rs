//! Environment configuration

use std::env;

/// Chat completion settings; the suggestion features stay disabled unless
/// both the endpoint and the API key are present.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub bind_addr: String,
    pub chat: Option<ChatConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let chat = match (
            non_empty(get("CHAT_COMPLETION_ENDPOINT")),
            non_empty(get("CHAT_COMPLETION_API_KEY")),
        ) {
            (Some(endpoint), Some(api_key)) => Some(ChatConfig {
                endpoint,
                api_key,
                model: non_empty(get("CHAT_COMPLETION_MODEL"))
                    .unwrap_or_else(|| "gpt-4".to_string()),
            }),
            _ => None,
        };

        Self {
            database_url: non_empty(get("DATABASE_URL")).unwrap_or_else(|| "huddle.db".to_string()),
            redis_url: non_empty(get("REDIS_URL")),
            bind_addr: non_empty(get("BIND_ADDR")).unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            chat,
        }
    }
}
