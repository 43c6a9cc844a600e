use std::collections::BTreeMap;

use log::info;
use serde::Serialize;

/// Manifest keys that are handed on to the launched game.
const ALLOWED_KEYS: [&str; 6] = [
    "GAME_WHITELIST_URL",
    "GAME_IN_GAME_NEWS_URL",
    "GAME_SERVER",
    "ACCOUNT_SERVER",
    "PANDA_DOWNLOAD_URL",
    "PATCHER_BASE_URL_HEAVY_LIFTING",
];

const RENAMED_KEYS: [(&str, &str); 1] = [("PATCHER_BASE_URL_HEAVY_LIFTING", "DOWNLOAD_SERVER")];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentBinding {
    pub key: String,
    pub value: String,
}

/// Environment bindings published by the manifest.
///
/// The process environment is never touched; callers apply the bindings to
/// the child process they launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchEnvironment {
    vars: BTreeMap<String, String>,
}

impl LaunchEnvironment {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vars = BTreeMap::new();
        for line in lines {
            let Some((key, value)) = line.as_ref().split_once('=') else {
                continue;
            };
            let key = key.trim();
            if !ALLOWED_KEYS.contains(&key) {
                continue;
            }
            let key = RENAMED_KEYS
                .iter()
                .find_map(|(from, to)| (*from == key).then_some(*to))
                .unwrap_or(key);
            info!("Bound environment variable: {key} = {}", value.trim());
            vars.insert(key.to_string(), value.trim().to_string());
        }
        Self { vars }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = EnvironmentBinding> + '_ {
        self.vars.iter().map(|(key, value)| EnvironmentBinding {
            key: key.clone(),
            value: value.clone(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn apply_to<'c>(
        &self,
        command: &'c mut std::process::Command,
    ) -> &'c mut std::process::Command {
        command.envs(&self.vars)
    }
}
