use std::{collections::HashMap, fs, time::Duration};

/// Engine tunables. The dispatch window and typing deadlines are validated by
/// the coalescing and expiry tests rather than fixed contracts.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Idle delay before an automatic "stopped typing" signal.
    pub typing_stop_delay: Duration,
    /// How long a remote typist stays visible without a refresh.
    pub typing_expiry: Duration,
    /// Buffering window for coalescing notification pushes.
    pub dispatch_window: Duration,
    /// Grace period before a staged notification deletion becomes real.
    pub undo_grace: Duration,
    /// Capacity of the broadcast channels feeding UI surfaces.
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            typing_stop_delay: Duration::from_millis(1000),
            typing_expiry: Duration::from_millis(1200),
            dispatch_window: Duration::from_millis(150),
            undo_grace: Duration::from_millis(5000),
            event_capacity: 1024,
        }
    }
}

pub fn load_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();

    if let Ok(raw) = fs::read_to_string("realtime.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_overrides(&mut settings, &file_cfg);
        }
    }

    let mut env_cfg = HashMap::new();
    for key in [
        "typing_stop_delay_ms",
        "typing_expiry_ms",
        "dispatch_window_ms",
        "undo_grace_ms",
        "event_capacity",
    ] {
        let var = format!("APP__{}", key.to_ascii_uppercase());
        if let Ok(value) = std::env::var(&var) {
            env_cfg.insert(key.to_string(), value);
        }
    }
    apply_overrides(&mut settings, &env_cfg);

    settings
}

fn apply_overrides(settings: &mut EngineSettings, cfg: &HashMap<String, String>) {
    if let Some(delay) = millis_entry(cfg, "typing_stop_delay_ms") {
        settings.typing_stop_delay = delay;
    }
    if let Some(expiry) = millis_entry(cfg, "typing_expiry_ms") {
        settings.typing_expiry = expiry;
    }
    if let Some(window) = millis_entry(cfg, "dispatch_window_ms") {
        settings.dispatch_window = window;
    }
    if let Some(grace) = millis_entry(cfg, "undo_grace_ms") {
        settings.undo_grace = grace;
    }
    if let Some(capacity) = cfg
        .get("event_capacity")
        .and_then(|raw| raw.parse::<usize>().ok())
    {
        if capacity > 0 {
            settings.event_capacity = capacity;
        }
    }
}

fn millis_entry(cfg: &HashMap<String, String>, key: &str) -> Option<Duration> {
    cfg.get(key)
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let settings = EngineSettings::default();
        assert_eq!(settings.typing_stop_delay, Duration::from_millis(1000));
        assert_eq!(settings.typing_expiry, Duration::from_millis(1200));
        assert_eq!(settings.dispatch_window, Duration::from_millis(150));
        assert_eq!(settings.undo_grace, Duration::from_millis(5000));
    }

    #[test]
    fn overrides_replace_only_named_keys() {
        let mut settings = EngineSettings::default();
        let cfg = HashMap::from([
            ("dispatch_window_ms".to_string(), "40".to_string()),
            ("undo_grace_ms".to_string(), "250".to_string()),
        ]);
        apply_overrides(&mut settings, &cfg);
        assert_eq!(settings.dispatch_window, Duration::from_millis(40));
        assert_eq!(settings.undo_grace, Duration::from_millis(250));
        assert_eq!(settings.typing_expiry, Duration::from_millis(1200));
    }

    #[test]
    fn malformed_and_zero_values_are_ignored() {
        let mut settings = EngineSettings::default();
        let cfg = HashMap::from([
            ("dispatch_window_ms".to_string(), "soon".to_string()),
            ("event_capacity".to_string(), "0".to_string()),
        ]);
        apply_overrides(&mut settings, &cfg);
        assert_eq!(settings.dispatch_window, Duration::from_millis(150));
        assert_eq!(settings.event_capacity, 1024);
    }
}
