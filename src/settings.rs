use std::path::PathBuf;
use std::time::Duration;

use voice_session::{Configuration, ReconnectPolicy};

use crate::errors::AppError;

pub const USER_ID_VAR: &str = "USER_ID";
pub const RECONNECT_DELAY_VAR: &str = "RECONNECT_DELAY_MS";
pub const RECONNECT_MAX_ATTEMPTS_VAR: &str = "RECONNECT_MAX_ATTEMPTS";
pub const MIC_WAV_PATH_VAR: &str = "MIC_WAV_PATH";

/// Everything the native client reads from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Configuration,
    pub user_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub microphone: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Configuration::from_lookup(&lookup)?;

        let user_id = lookup(USER_ID_VAR)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let mut reconnect = ReconnectPolicy::default();
        if let Some(raw) = lookup(RECONNECT_DELAY_VAR) {
            let ms = parse_number::<u64>(RECONNECT_DELAY_VAR, &raw)?;
            reconnect = ReconnectPolicy::fixed(Duration::from_millis(ms))
                .with_max_attempts(reconnect.max_attempts);
        }
        if let Some(raw) = lookup(RECONNECT_MAX_ATTEMPTS_VAR) {
            let attempts = parse_number::<u32>(RECONNECT_MAX_ATTEMPTS_VAR, &raw)?;
            reconnect = reconnect.with_max_attempts(attempts);
        }

        let microphone = lookup(MIC_WAV_PATH_VAR)
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self { config, user_id, reconnect, microphone })
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::InvalidSetting { name, value: raw.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.config, Configuration::default());
        assert_eq!(settings.user_id, None);
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
        assert!(settings.microphone.is_none());
    }

    #[test]
    fn test_reads_all_variables() {
        let settings = Settings::from_lookup(lookup(&[
            ("BACKEND_URL", "api.example.com"),
            ("USE_HTTPS", "1"),
            ("USER_ID", " alice "),
            ("RECONNECT_DELAY_MS", "250"),
            ("RECONNECT_MAX_ATTEMPTS", "4"),
            ("MIC_WAV_PATH", "/tmp/in.wav"),
        ]))
        .unwrap();

        assert_eq!(settings.config.ws_base(), "wss://api.example.com");
        assert_eq!(settings.user_id.as_deref(), Some("alice"));
        assert_eq!(settings.reconnect.delay_for(1), Duration::from_millis(250));
        assert_eq!(settings.reconnect.max_attempts, 4);
        assert_eq!(settings.microphone, Some(PathBuf::from("/tmp/in.wav")));
    }

    #[test]
    fn test_blank_user_id_is_absent() {
        let settings = Settings::from_lookup(lookup(&[("USER_ID", "   ")])).unwrap();
        assert_eq!(settings.user_id, None);
    }

    #[test]
    fn test_rejects_malformed_numbers() {
        let err = Settings::from_lookup(lookup(&[("RECONNECT_DELAY_MS", "soon")])).unwrap_err();
        assert!(matches!(err, AppError::InvalidSetting { name: "RECONNECT_DELAY_MS", .. }));
    }

    #[test]
    fn test_rejects_bad_https_flag() {
        let err = Settings::from_lookup(lookup(&[("USE_HTTPS", "yes")])).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
