use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::conflict::ConflictPolicy;
use crate::sync::discovery::RenameDetection;
use crate::sync::engine::EngineOptions;
use crate::sync::item::ChecksumAlgorithm;
use crate::sync::vfs::VfsMode;

const DEFAULT_SYNC_DIR_NAME: &str = "CloudSync";
const DEFAULT_REMOTE_ROOT: &str = "/";
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_DEBOUNCE_MS: u64 = 1500;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub local_root: PathBuf,
    pub remote_url: String,
    pub remote_root: String,
    pub token: String,
    pub journal_path: PathBuf,
    pub poll_interval: Duration,
    /// Quiet time after a local change before a run starts.
    pub watch_debounce: Duration,
    pub enable_local_watcher: bool,
    pub engine: EngineOptions,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let local_root = var("CLOUDSYNC_LOCAL_ROOT")
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let journal_path = match var("CLOUDSYNC_JOURNAL") {
            Some(value) => expand_with_home(&value, &home),
            None => default_journal_path()?,
        };
        let remote_url = var("CLOUDSYNC_REMOTE_URL").context("CLOUDSYNC_REMOTE_URL is not set")?;
        let token = var("CLOUDSYNC_TOKEN").unwrap_or_default();
        let remote_root =
            var("CLOUDSYNC_REMOTE_ROOT").unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string());

        let mut engine = EngineOptions::default();
        engine.parallelism = read_u64(&var, "CLOUDSYNC_PARALLELISM", engine.parallelism as u64) as usize;
        engine.transfer.chunk_size =
            read_u64(&var, "CLOUDSYNC_CHUNK_SIZE", engine.transfer.chunk_size);
        engine.transfer.chunk_threshold =
            read_u64(&var, "CLOUDSYNC_CHUNK_THRESHOLD", engine.transfer.chunk_threshold);
        engine.free_space_margin =
            read_u64(&var, "CLOUDSYNC_FREE_SPACE_MARGIN", engine.free_space_margin);
        if let Some(value) = var("CLOUDSYNC_CONFLICT_POLICY") {
            engine.conflict_policy = ConflictPolicy::parse(&value)
                .with_context(|| format!("unknown conflict policy: {value}"))?;
        }
        if let Some(value) = var("CLOUDSYNC_VFS") {
            engine.vfs =
                VfsMode::parse(&value).with_context(|| format!("unknown vfs mode: {value}"))?;
        }
        if let Some(value) = var("CLOUDSYNC_RENAME_DETECTION") {
            engine.rename_detection = RenameDetection::parse(&value)
                .with_context(|| format!("unknown rename detection: {value}"))?;
        }
        if let Some(value) = var("CLOUDSYNC_CHECKSUM") {
            engine.transfer.algorithm = ChecksumAlgorithm::parse(&value)
                .with_context(|| format!("unknown checksum algorithm: {value}"))?;
        }
        engine.case_insensitive =
            read_bool(&var, "CLOUDSYNC_CASE_INSENSITIVE", engine.case_insensitive);
        engine.move_to_trash = read_bool(&var, "CLOUDSYNC_MOVE_TO_TRASH", engine.move_to_trash);
        engine.upload_conflict_copies = read_bool(
            &var,
            "CLOUDSYNC_UPLOAD_CONFLICT_COPIES",
            engine.upload_conflict_copies,
        );
        engine.ignore_file = var("CLOUDSYNC_IGNORE_FILE").map(|value| expand_with_home(&value, &home));

        Ok(Self {
            local_root,
            remote_url,
            remote_root,
            token,
            journal_path,
            poll_interval: Duration::from_secs(read_u64(&var, "CLOUDSYNC_POLL_SECS", DEFAULT_POLL_SECS)),
            watch_debounce: Duration::from_millis(read_u64(
                &var,
                "CLOUDSYNC_WATCH_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE_MS,
            )),
            enable_local_watcher: read_bool(&var, "CLOUDSYNC_ENABLE_LOCAL_WATCHER", true),
            engine,
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_journal_path() -> anyhow::Result<PathBuf> {
    let data = dirs::data_dir().context("data directory is unavailable")?;
    Ok(data.join("cloudsync").join("journal.db"))
}

fn read_u64(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    var(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool(var: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    var(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn expands_tilde_to_home() {
        let home = PathBuf::from("/tmp/home-user");
        assert_eq!(
            expand_with_home("~/CloudSync", &home),
            PathBuf::from("/tmp/home-user/CloudSync")
        );
        assert_eq!(expand_with_home("/srv/sync", &home), PathBuf::from("/srv/sync"));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[(
            "CLOUDSYNC_REMOTE_URL",
            "https://files.example.com",
        )]))
        .unwrap();
        assert_eq!(config.remote_root, "/");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.engine.parallelism, 6);
        assert_eq!(config.engine.conflict_policy, ConflictPolicy::Ask);
        assert!(config.local_root.ends_with("CloudSync"));
        assert!(config.enable_local_watcher);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CLOUDSYNC_REMOTE_URL", "https://files.example.com"),
            ("CLOUDSYNC_PARALLELISM", "2"),
            ("CLOUDSYNC_CONFLICT_POLICY", "keep-remote"),
            ("CLOUDSYNC_VFS", "suffix"),
            ("CLOUDSYNC_RENAME_DETECTION", "off"),
            ("CLOUDSYNC_MOVE_TO_TRASH", "yes"),
            ("CLOUDSYNC_CHUNK_SIZE", "0"),
        ]))
        .unwrap();
        assert_eq!(config.engine.parallelism, 2);
        assert_eq!(config.engine.conflict_policy, ConflictPolicy::KeepRemote);
        assert_eq!(config.engine.vfs, VfsMode::Suffix);
        assert_eq!(config.engine.rename_detection, RenameDetection::Off);
        assert!(config.engine.move_to_trash);
        assert_eq!(config.engine.transfer.chunk_size, 10 * 1024 * 1024);
    }

    #[test]
    fn rejects_unknown_policy_and_missing_url() {
        assert!(SyncConfig::from_lookup(lookup(&[])).is_err());
        assert!(
            SyncConfig::from_lookup(lookup(&[
                ("CLOUDSYNC_REMOTE_URL", "https://files.example.com"),
                ("CLOUDSYNC_CONFLICT_POLICY", "coin-flip"),
            ]))
            .is_err()
        );
    }
}
