use std::env;

fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(fallback)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// When unset the server runs on the in-memory store.
    pub database_url: Option<String>,
    pub gateway_api_base: String,
    pub gateway_phone_number_id: String,
    pub gateway_access_token: String,
    pub webhook_verify_token: String,
    pub webhook_app_secret: String,
    pub overdue_warn_minutes: i64,
    pub overdue_urgent_minutes: i64,
    pub overdue_escalate_minutes: i64,
    pub overdue_scan_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        Self {
            port: env_parse("PORT", 4000),
            database_url,
            gateway_api_base: env_or("WA_API_BASE", "https://graph.facebook.com/v21.0"),
            gateway_phone_number_id: env_or("WA_PHONE_NUMBER_ID", ""),
            gateway_access_token: env_or("WA_ACCESS_TOKEN", ""),
            webhook_verify_token: env_or("WEBHOOK_VERIFY_TOKEN", ""),
            webhook_app_secret: env_or("WEBHOOK_APP_SECRET", ""),
            overdue_warn_minutes: env_parse("OVERDUE_WARN_MINUTES", 30),
            overdue_urgent_minutes: env_parse("OVERDUE_URGENT_MINUTES", 120),
            overdue_escalate_minutes: env_parse("OVERDUE_ESCALATE_MINUTES", 240),
            overdue_scan_secs: env_parse("OVERDUE_SCAN_SECS", 300),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            gateway_api_base: "https://graph.facebook.com/v21.0".to_string(),
            gateway_phone_number_id: String::new(),
            gateway_access_token: String::new(),
            webhook_verify_token: String::new(),
            webhook_app_secret: String::new(),
            overdue_warn_minutes: 30,
            overdue_urgent_minutes: 120,
            overdue_escalate_minutes: 240,
            overdue_scan_secs: 300,
        }
    }
}
