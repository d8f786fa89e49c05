use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub log_level: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_api_root: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".into()));

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            backups_dir: PathBuf::from(
                std::env::var("BACKUPS_DIR").unwrap_or_else(|_| "data/backups".into()),
            ),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            telegram_token: std::env::var("TELEGRAM_TOKEN").ok().filter(|v| !v.is_empty()),
            telegram_chat_id: std::env::var("CHAT_ID").ok().filter(|v| !v.is_empty()),
            telegram_api_root: std::env::var("TELEGRAM_API_ROOT")
                .unwrap_or_else(|_| "https://api.telegram.org".into()),
        }
    }

    /// Upload is enabled only when both halves of the credential are set.
    pub fn telegram_target(&self) -> Option<(&str, &str)> {
        match (&self.telegram_token, &self.telegram_chat_id) {
            (Some(token), Some(chat)) => Some((token.as_str(), chat.as_str())),
            _ => None,
        }
    }
}
