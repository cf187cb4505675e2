use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent::NameWords;
use crate::store::atomic;

/// On-disk configuration shape. Every field optional; merging applies the
/// fields that are present, highest layer last.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub auto_register: Option<bool>,
    pub auto_register_paths: Option<Vec<String>>,
    pub scope_to_folder: Option<bool>,
    pub context_mode: Option<String>,
    pub registration_context: Option<bool>,
    pub reply_hint: Option<bool>,
    pub sender_details_on_first_contact: Option<bool>,
    pub stuck_threshold: Option<u64>,
    pub stuck_notify: Option<bool>,
    pub auto_status: Option<bool>,
    pub name_theme: Option<String>,
    pub name_words: Option<RawNameWords>,
    pub feed_retention: Option<usize>,
    pub crew: Option<RawCrew>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNameWords {
    #[serde(default)]
    pub adjectives: Vec<String>,
    #[serde(default)]
    pub nouns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCrew {
    pub concurrency: Option<RawCrewConcurrency>,
    pub work: Option<RawCrewWork>,
    pub artifacts: Option<RawCrewArtifacts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCrewConcurrency {
    pub scouts: Option<usize>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCrewWork {
    pub max_attempts_per_task: Option<u32>,
    pub max_waves: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCrewArtifacts {
    pub enabled: Option<bool>,
    pub cleanup_days: Option<u32>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub auto_register: bool,
    pub auto_register_paths: Vec<String>,
    pub scope_to_folder: bool,
    pub registration_context: bool,
    pub reply_hint: bool,
    pub sender_details_on_first_contact: bool,
    pub stuck_threshold_secs: u64,
    pub stuck_notify: bool,
    pub auto_status: bool,
    pub name_theme: String,
    pub name_words: NameWords,
    pub feed_retention: usize,
    pub crew: CrewConfig,
}

#[derive(Debug, Clone)]
pub struct CrewConfig {
    pub scout_concurrency: usize,
    pub worker_concurrency: usize,
    pub max_attempts_per_task: u32,
    pub max_waves: u32,
    pub artifacts_enabled: bool,
    pub artifacts_cleanup_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_register: false,
            auto_register_paths: vec![],
            scope_to_folder: false,
            registration_context: true,
            reply_hint: true,
            sender_details_on_first_contact: true,
            stuck_threshold_secs: 900,
            stuck_notify: true,
            auto_status: true,
            name_theme: "default".into(),
            name_words: NameWords::default(),
            feed_retention: 200,
            crew: CrewConfig::default(),
        }
    }
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            scout_concurrency: 3,
            worker_concurrency: 2,
            max_attempts_per_task: 5,
            max_waves: 50,
            artifacts_enabled: true,
            artifacts_cleanup_days: 14,
        }
    }
}

impl Config {
    /// Load and merge the configuration layers for a working directory.
    ///
    /// Precedence (lowest to highest): built-in defaults, the `messenger`
    /// key of `~/.pi/agent/settings.json`, `~/.pi/agent/pi-messenger.json`,
    /// `P/.pi/pi-messenger.json`.
    pub fn load(cwd: &Path) -> Self {
        let mut config = Self::default();

        if let Some(agent_dir) = user_agent_dir() {
            if let Some(raw) = settings_messenger_key(&agent_dir.join("settings.json")) {
                config.apply(&raw);
            }
            if let Some(raw) = atomic::read_json::<RawConfig>(&agent_dir.join("pi-messenger.json"))
            {
                config.apply(&raw);
            }
        }
        if let Some(raw) = atomic::read_json::<RawConfig>(&cwd.join(".pi").join("pi-messenger.json"))
        {
            config.apply(&raw);
        }

        config
    }

    /// Apply one layer onto the resolved config.
    pub fn apply(&mut self, raw: &RawConfig) {
        // contextMode is shorthand for the three booleans below it;
        // explicit booleans in the same layer win.
        if let Some(mode) = raw.context_mode.as_deref() {
            let (registration, reply, details) = match mode {
                "full" => (true, true, true),
                "minimal" => (true, false, false),
                "none" => (false, false, false),
                _ => (
                    self.registration_context,
                    self.reply_hint,
                    self.sender_details_on_first_contact,
                ),
            };
            self.registration_context = registration;
            self.reply_hint = reply;
            self.sender_details_on_first_contact = details;
        }

        if let Some(v) = raw.auto_register {
            self.auto_register = v;
        }
        if let Some(ref v) = raw.auto_register_paths {
            self.auto_register_paths = v.clone();
        }
        if let Some(v) = raw.scope_to_folder {
            self.scope_to_folder = v;
        }
        if let Some(v) = raw.registration_context {
            self.registration_context = v;
        }
        if let Some(v) = raw.reply_hint {
            self.reply_hint = v;
        }
        if let Some(v) = raw.sender_details_on_first_contact {
            self.sender_details_on_first_contact = v;
        }
        if let Some(v) = raw.stuck_threshold {
            self.stuck_threshold_secs = v;
        }
        if let Some(v) = raw.stuck_notify {
            self.stuck_notify = v;
        }
        if let Some(v) = raw.auto_status {
            self.auto_status = v;
        }
        if let Some(ref v) = raw.name_theme {
            self.name_theme = v.clone();
        }
        if let Some(ref words) = raw.name_words {
            if !words.adjectives.is_empty() {
                self.name_words.adjectives = words.adjectives.clone();
            }
            if !words.nouns.is_empty() {
                self.name_words.nouns = words.nouns.clone();
            }
        }
        if let Some(v) = raw.feed_retention {
            self.feed_retention = v.max(1);
        }
        if let Some(ref crew) = raw.crew {
            if let Some(ref c) = crew.concurrency {
                if let Some(v) = c.scouts {
                    self.crew.scout_concurrency = v;
                }
                if let Some(v) = c.workers {
                    self.crew.worker_concurrency = v.max(1);
                }
            }
            if let Some(ref w) = crew.work {
                if let Some(v) = w.max_attempts_per_task {
                    self.crew.max_attempts_per_task = v.max(1);
                }
                if let Some(v) = w.max_waves {
                    self.crew.max_waves = v.max(1);
                }
            }
            if let Some(ref a) = crew.artifacts {
                if let Some(v) = a.enabled {
                    self.crew.artifacts_enabled = v;
                }
                if let Some(v) = a.cleanup_days {
                    self.crew.artifacts_cleanup_days = v;
                }
            }
        }
    }

    /// True when `cwd` matches one of the auto-register path patterns.
    pub fn auto_register_matches(&self, cwd: &Path) -> bool {
        if !self.auto_register && self.auto_register_paths.is_empty() {
            return false;
        }
        if self.auto_register && self.auto_register_paths.is_empty() {
            return true;
        }
        let cwd = cwd.to_string_lossy();
        self.auto_register_paths
            .iter()
            .any(|pattern| path_pattern_matches(pattern, &cwd))
    }
}

fn user_agent_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pi").join("agent"))
}

fn settings_messenger_key(path: &Path) -> Option<RawConfig> {
    let value: serde_json::Value = atomic::read_json(path)?;
    let messenger = value.get("messenger")?.clone();
    serde_json::from_value(messenger).ok()
}

/// Match an auto-register pattern against an absolute path.
///
/// `~` expands to the home directory. A trailing `*` or `/*` makes the
/// pattern a prefix match on the directory tree; otherwise the match is
/// exact (trailing slash ignored).
pub fn path_pattern_matches(pattern: &str, path: &str) -> bool {
    let expanded = if let Some(rest) = pattern.strip_prefix("~") {
        match dirs::home_dir() {
            Some(home) => format!("{}{}", home.display(), rest),
            None => pattern.to_string(),
        }
    } else {
        pattern.to_string()
    };

    if let Some(prefix) = expanded.strip_suffix("/*").or_else(|| expanded.strip_suffix('*')) {
        let prefix = prefix.trim_end_matches('/');
        path == prefix || path.starts_with(&format!("{prefix}/"))
    } else {
        path.trim_end_matches('/') == expanded.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(!config.auto_register);
        assert_eq!(config.stuck_threshold_secs, 900);
        assert_eq!(config.crew.max_attempts_per_task, 5);
        assert_eq!(config.crew.max_waves, 50);
        assert_eq!(config.feed_retention, 200);
    }

    #[test]
    fn later_layers_override_earlier() {
        let mut config = Config::default();
        config.apply(&raw(r#"{"stuckThreshold": 300, "scopeToFolder": true}"#));
        config.apply(&raw(r#"{"stuckThreshold": 120}"#));
        assert_eq!(config.stuck_threshold_secs, 120);
        assert!(config.scope_to_folder);
    }

    #[test]
    fn context_mode_expands_to_booleans() {
        let mut config = Config::default();
        config.apply(&raw(r#"{"contextMode": "none"}"#));
        assert!(!config.registration_context);
        assert!(!config.reply_hint);
        assert!(!config.sender_details_on_first_contact);

        config.apply(&raw(r#"{"contextMode": "minimal"}"#));
        assert!(config.registration_context);
        assert!(!config.reply_hint);
    }

    #[test]
    fn explicit_boolean_beats_context_mode_in_same_layer() {
        let mut config = Config::default();
        config.apply(&raw(r#"{"contextMode": "none", "replyHint": true}"#));
        assert!(config.reply_hint);
        assert!(!config.registration_context);
    }

    #[test]
    fn crew_options_merge() {
        let mut config = Config::default();
        config.apply(&raw(
            r#"{"crew": {"concurrency": {"workers": 4}, "work": {"maxWaves": 10}}}"#,
        ));
        assert_eq!(config.crew.worker_concurrency, 4);
        assert_eq!(config.crew.max_waves, 10);
        assert_eq!(config.crew.scout_concurrency, 3);
    }

    #[test]
    fn name_words_replace_defaults() {
        let mut config = Config::default();
        config.apply(&raw(
            r#"{"nameWords": {"adjectives": ["red"], "nouns": ["panda"]}}"#,
        ));
        assert_eq!(config.name_words.adjectives, vec!["red"]);
        assert_eq!(config.name_words.nouns, vec!["panda"]);
    }

    #[test]
    fn pattern_exact_match() {
        assert!(path_pattern_matches("/work/repo", "/work/repo"));
        assert!(path_pattern_matches("/work/repo/", "/work/repo"));
        assert!(!path_pattern_matches("/work/repo", "/work/repo/sub"));
    }

    #[test]
    fn pattern_wildcard_prefix() {
        assert!(path_pattern_matches("/work/*", "/work/repo"));
        assert!(path_pattern_matches("/work/*", "/work/repo/sub"));
        assert!(path_pattern_matches("/work*", "/work"));
        assert!(!path_pattern_matches("/work/*", "/elsewhere"));
        // Prefix matching is per path component, not per character.
        assert!(!path_pattern_matches("/work/*", "/workspace"));
    }

    #[test]
    fn auto_register_matching() {
        let mut config = Config::default();
        assert!(!config.auto_register_matches(Path::new("/anywhere")));

        config.auto_register = true;
        assert!(config.auto_register_matches(Path::new("/anywhere")));

        config.auto_register = false;
        config.auto_register_paths = vec!["/work/*".into()];
        assert!(config.auto_register_matches(Path::new("/work/repo")));
        assert!(!config.auto_register_matches(Path::new("/home/other")));
    }
}
