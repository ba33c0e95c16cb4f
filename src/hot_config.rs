// =============================================================================
// Hot Config — runtime-reloadable threshold overrides
// =============================================================================
//
// Watches a `.env`-style file plus an optional JSON overlay and republishes a
// consistent snapshot whenever either file's mtime moves.  Readers grab an
// `Arc<ConfigSnapshot>` once per tick and hold it for the duration of that
// tick, so a reload mid-computation never mixes old and new values.
//
// A reload never tears down connections: only registered callbacks run.  An
// unparseable value keeps the prior snapshot's entry and logs a warning.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the mtime poller checks for changes.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// An immutable view of the merged key/value config at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    values: HashMap<String, String>,
}

impl ConfigSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.values.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(key, raw = %raw, "hot-config value is not a float, keeping default");
                default
            }),
            None => default,
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(key, raw = %raw, "hot-config value is not an integer, keeping default");
                default
            }),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(raw) => matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type ChangeCallback = Box<dyn Fn(&ConfigSnapshot) + Send + Sync>;

/// File-backed hot configuration with mtime polling and explicit reload.
pub struct HotConfig {
    env_path: Option<PathBuf>,
    json_path: Option<PathBuf>,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    last_modified: RwLock<Option<SystemTime>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl HotConfig {
    /// Create a hot config over the given files and perform the initial load.
    /// Missing files are tolerated (the snapshot is simply empty).
    pub fn new(env_path: Option<PathBuf>, json_path: Option<PathBuf>) -> Self {
        let cfg = Self {
            env_path,
            json_path,
            snapshot: RwLock::new(Arc::new(ConfigSnapshot::default())),
            last_modified: RwLock::new(None),
            callbacks: RwLock::new(Vec::new()),
        };
        cfg.reload();
        cfg
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().clone()
    }

    /// Register a callback invoked after every applied change.
    pub fn on_change(&self, cb: impl Fn(&ConfigSnapshot) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(cb));
    }

    /// Re-read both files unconditionally and swap the snapshot if the
    /// contents differ.
    pub fn reload(&self) {
        let mut values = HashMap::new();
        let mut newest: Option<SystemTime> = None;

        if let Some(path) = &self.env_path {
            if path.exists() {
                match std::fs::read_to_string(path) {
                    Ok(content) => {
                        parse_env_format(&content, &mut values);
                        newest = max_mtime(newest, path);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to read env config"),
                }
            }
        }

        // JSON overlay wins over .env entries.
        if let Some(path) = &self.json_path {
            if path.exists() {
                match std::fs::read_to_string(path) {
                    Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                        Ok(serde_json::Value::Object(map)) => {
                            for (k, v) in map {
                                let rendered = match v {
                                    serde_json::Value::String(s) => s,
                                    other => other.to_string(),
                                };
                                values.insert(k, rendered);
                            }
                            newest = max_mtime(newest, path);
                        }
                        Ok(_) => warn!(path = %path.display(), "json config root is not an object"),
                        Err(e) => {
                            // Keep the previous snapshot's values on a parse
                            // failure rather than dropping to defaults.
                            warn!(path = %path.display(), error = %e, "failed to parse json config, keeping prior values");
                            return;
                        }
                    },
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to read json config"),
                }
            }
        }

        let new_snapshot = Arc::new(ConfigSnapshot { values });
        let changed = {
            let current = self.snapshot.read();
            current.values != new_snapshot.values
        };

        *self.last_modified.write() = newest;

        if changed {
            info!(entries = new_snapshot.len(), "hot config updated");
            *self.snapshot.write() = new_snapshot.clone();
            for cb in self.callbacks.read().iter() {
                cb(&new_snapshot);
            }
        } else {
            debug!("hot config unchanged");
        }
    }

    /// Reload only if a watched file's mtime advanced past the recorded one.
    fn check_for_updates(&self) {
        let mut current: Option<SystemTime> = None;
        if let Some(path) = &self.env_path {
            current = max_mtime(current, path);
        }
        if let Some(path) = &self.json_path {
            current = max_mtime(current, path);
        }

        let last = *self.last_modified.read();
        match (current, last) {
            (Some(cur), Some(prev)) if cur > prev => {
                info!("config file change detected, reloading");
                self.reload();
            }
            (Some(_), None) => {
                info!("config file appeared, loading");
                self.reload();
            }
            _ => {}
        }
    }

    /// Run the mtime poller plus (on unix) a SIGHUP listener until cancelled.
    pub async fn run_watcher(self: Arc<Self>, cancel: CancellationToken) {
        #[cfg(unix)]
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable");
                None
            }
        };

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            #[cfg(unix)]
            {
                let hup_recv = async {
                    match hup.as_mut() {
                        Some(sig) => {
                            sig.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.check_for_updates(),
                    _ = hup_recv => {
                        info!("SIGHUP received, reloading config");
                        self.reload();
                    }
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.check_for_updates(),
                }
            }
        }
        debug!("hot-config watcher stopped");
    }
}

fn max_mtime(current: Option<SystemTime>, path: &Path) -> Option<SystemTime> {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    match (current, mtime) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Parse `KEY=value` lines, skipping comments and blanks; strips quotes.
fn parse_env_format(content: &str, out: &mut HashMap<String, String>) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
            if !key.is_empty() {
                out.insert(key, value);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_env_format() {
        let mut map = HashMap::new();
        parse_env_format(
            "# comment\nSLIPPAGE_THRESHOLD_LOW=0.7\nNAME=\"quoted\"\n\nBAD_LINE\n",
            &mut map,
        );
        assert_eq!(map.get("SLIPPAGE_THRESHOLD_LOW").unwrap(), "0.7");
        assert_eq!(map.get("NAME").unwrap(), "quoted");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn typed_getters_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let env = write_file(&dir, ".env", "A=1.5\nB=42\nC=true\nBROKEN=abc\n");
        let cfg = HotConfig::new(Some(env), None);
        let snap = cfg.snapshot();
        assert!((snap.get_f64("A", 0.0) - 1.5).abs() < f64::EPSILON);
        assert_eq!(snap.get_i64("B", 0), 42);
        assert!(snap.get_bool("C", false));
        // Unparseable value falls back to the default.
        assert!((snap.get_f64("BROKEN", 9.0) - 9.0).abs() < f64::EPSILON);
        assert_eq!(snap.get_i64("MISSING", 7), 7);
    }

    #[test]
    fn json_overlay_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = write_file(&dir, ".env", "THRESHOLD=1.0\nONLY_ENV=yes\n");
        let json = write_file(&dir, "overlay.json", r#"{"THRESHOLD": 2.5}"#);
        let cfg = HotConfig::new(Some(env), Some(json));
        let snap = cfg.snapshot();
        assert!((snap.get_f64("THRESHOLD", 0.0) - 2.5).abs() < f64::EPSILON);
        assert_eq!(snap.get("ONLY_ENV"), Some("yes"));
    }

    #[test]
    fn reload_fires_callbacks_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let env = write_file(&dir, ".env", "K=1\n");
        let cfg = HotConfig::new(Some(env.clone()), None);

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        cfg.on_change(move |_| {
            fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        // Unchanged content does not fire.
        cfg.reload();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);

        std::fs::write(&env, "K=2\n").unwrap();
        cfg.reload();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cfg.snapshot().get("K"), Some("2"));
    }

    #[test]
    fn broken_json_keeps_prior_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_file(&dir, "overlay.json", r#"{"K": 1}"#);
        let cfg = HotConfig::new(None, Some(json.clone()));
        assert_eq!(cfg.snapshot().get("K"), Some("1"));

        std::fs::write(&json, "{not valid json").unwrap();
        cfg.reload();
        // Prior value survives the bad reload.
        assert_eq!(cfg.snapshot().get("K"), Some("1"));
    }

    #[test]
    fn snapshot_is_consistent_across_swap() {
        let dir = tempfile::tempdir().unwrap();
        let env = write_file(&dir, ".env", "X=1\nY=1\n");
        let cfg = HotConfig::new(Some(env.clone()), None);

        let held = cfg.snapshot();
        std::fs::write(&env, "X=2\nY=2\n").unwrap();
        cfg.reload();

        // The held snapshot still shows the old consistent pair.
        assert_eq!(held.get("X"), Some("1"));
        assert_eq!(held.get("Y"), Some("1"));
        let fresh = cfg.snapshot();
        assert_eq!(fresh.get("X"), Some("2"));
        assert_eq!(fresh.get("Y"), Some("2"));
    }
}
