// =============================================================================
// Rule Store: concurrent registry of exit rules with durable persistence
// =============================================================================
//
// A single mutex guards the `position_id -> ExitRule` map. The map itself is
// never handed out: callers get clones, key lists, or run a closure under
// the lock. Nothing here awaits, so the lock can never be held across an
// external call.
//
// File format (version 1):
//
//   {
//     "version": 1,
//     "saved_at": "2026-01-01T00:00:00Z",
//     "rules": { "<position_id>": { ...ExitRule... } },
//     "released": [ <position_id>, ... ]
//   }
//
// `released` lists positions whose rule was deleted or handed to another
// manager; the monitor does not adopt them again while they stay open.
//
// Load policy:
//   missing file                → empty store
//   invalid record              → skipped and logged
//   structurally invalid file   → renamed to <name>.corrupt-<timestamp>,
//                                 store starts empty
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::exit::rule::ExitRule;
use crate::types::PositionId;

/// Current persisted schema version.
pub const RULES_FILE_VERSION: u32 = 1;

#[derive(Serialize)]
struct RulesFileOut<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    rules: BTreeMap<String, &'a ExitRule>,
    released: Vec<PositionId>,
}

#[derive(Deserialize)]
struct RulesFileIn {
    version: u32,
    #[serde(default)]
    #[allow(dead_code)]
    saved_at: Option<DateTime<Utc>>,
    rules: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    released: Vec<PositionId>,
}

/// A record dropped during load.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    pub key: String,
    pub reason: String,
}

/// What `load` found on disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedRecord>,
    /// Where a structurally invalid file was moved.
    pub quarantined: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Mutex<HashMap<PositionId, ExitRule>>,
    /// Positions not to be adopted again while open. Locked after `rules`.
    released: Mutex<HashSet<PositionId>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    /// Insert `rule` unless one already exists for its position. Returns
    /// `true` if inserted. An inserted position is no longer released.
    pub fn insert_if_absent(&self, rule: ExitRule) -> bool {
        let mut map = self.rules.lock();
        if map.contains_key(&rule.position_id) {
            return false;
        }
        self.released.lock().remove(&rule.position_id);
        map.insert(rule.position_id, rule);
        true
    }

    /// Insert or replace. Returns the previous rule, if any.
    pub fn upsert(&self, rule: ExitRule) -> Option<ExitRule> {
        self.rules.lock().insert(rule.position_id, rule)
    }

    pub fn get(&self, position_id: PositionId) -> Option<ExitRule> {
        self.rules.lock().get(&position_id).cloned()
    }

    /// Run `f` on the stored rule under the lock. `None` if the rule is gone.
    pub fn update<R>(
        &self,
        position_id: PositionId,
        f: impl FnOnce(&mut ExitRule) -> R,
    ) -> Option<R> {
        self.rules.lock().get_mut(&position_id).map(f)
    }

    pub fn remove(&self, position_id: PositionId) -> Option<ExitRule> {
        self.rules.lock().remove(&position_id)
    }

    /// Remove the rule and mark the position released, so rule
    /// synchronisation leaves it alone until it closes. Nothing is marked
    /// when there was no rule.
    pub fn release(&self, position_id: PositionId) -> Option<ExitRule> {
        let mut map = self.rules.lock();
        let removed = map.remove(&position_id)?;
        self.released.lock().insert(position_id);
        Some(removed)
    }

    pub fn is_released(&self, position_id: PositionId) -> bool {
        self.released.lock().contains(&position_id)
    }

    /// Drop release marks for which `keep` returns false.
    pub fn retain_released(&self, mut keep: impl FnMut(PositionId) -> bool) {
        self.released.lock().retain(|id| keep(*id));
    }

    /// Sorted list of released position ids.
    pub fn released(&self) -> Vec<PositionId> {
        let mut ids: Vec<PositionId> = self.released.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, position_id: PositionId) -> bool {
        self.rules.lock().contains_key(&position_id)
    }

    /// Sorted list of tracked position ids.
    pub fn keys(&self) -> Vec<PositionId> {
        let mut keys: Vec<PositionId> = self.rules.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Clones of every rule, sorted by position id.
    pub fn snapshot(&self) -> Vec<ExitRule> {
        let mut rules: Vec<ExitRule> = self.rules.lock().values().cloned().collect();
        rules.sort_by_key(|r| r.position_id);
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write every rule to `path` atomically (tmp sibling + rename).
    /// Returns the number of rules written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let rules = self.snapshot();

        let doc = RulesFileOut {
            version: RULES_FILE_VERSION,
            saved_at: Utc::now(),
            rules: rules.iter().map(|r| (r.position_id.to_string(), r)).collect(),
            released: self.released(),
        };
        let content =
            serde_json::to_string_pretty(&doc).context("failed to serialise exit rules to JSON")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp rules to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp rules to {}", path.display()))?;

        info!(path = %path.display(), count = rules.len(), "exit rules saved (atomic)");
        Ok(rules.len())
    }

    /// Replace the store contents with the rules in `path`.
    ///
    /// Only I/O failures (other than a missing file) and a failed quarantine
    /// rename are returned as errors; bad content never is.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no persisted exit rules, starting empty");
                self.clear();
                return Ok(LoadReport::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let doc: RulesFileIn = match serde_json::from_str::<RulesFileIn>(&content) {
            Ok(doc) if doc.version == RULES_FILE_VERSION => doc,
            Ok(doc) => {
                let reason = format!("unsupported version {}", doc.version);
                return self.quarantine(path, &reason);
            }
            Err(e) => return self.quarantine(path, &e.to_string()),
        };

        let mut report = LoadReport::default();
        let mut decoded = HashMap::with_capacity(doc.rules.len());

        for (key, value) in doc.rules {
            match decode_record(&key, value) {
                Ok(rule) => {
                    decoded.insert(rule.position_id, rule);
                }
                Err(reason) => {
                    warn!(
                        path = %path.display(),
                        key = %key,
                        reason = %reason,
                        "skipping invalid exit rule record"
                    );
                    report.skipped.push(SkippedRecord { key, reason });
                }
            }
        }

        report.loaded = decoded.len();
        {
            let mut map = self.rules.lock();
            *map = decoded;
            *self.released.lock() = doc
                .released
                .into_iter()
                .filter(|id| !map.contains_key(id))
                .collect();
        }

        info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "exit rules loaded"
        );
        Ok(report)
    }

    fn clear(&self) {
        let mut map = self.rules.lock();
        map.clear();
        self.released.lock().clear();
    }

    fn quarantine(&self, path: &Path, reason: &str) -> Result<LoadReport> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "exit_rules.json".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let target = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));

        std::fs::rename(path, &target).with_context(|| {
            format!("failed to quarantine {} to {}", path.display(), target.display())
        })?;

        error!(
            path = %path.display(),
            quarantined = %target.display(),
            reason,
            "exit rules file is structurally invalid, quarantined; starting empty"
        );

        self.clear();
        Ok(LoadReport {
            quarantined: Some(target),
            ..LoadReport::default()
        })
    }
}

/// Single validating decode of one persisted record.
fn decode_record(key: &str, value: serde_json::Value) -> Result<ExitRule, String> {
    let rule: ExitRule = serde_json::from_value(value).map_err(|e| e.to_string())?;
    let rule = rule.validated()?;
    if key.parse::<PositionId>().ok() != Some(rule.position_id) {
        return Err(format!("key does not match position_id {}", rule.position_id));
    }
    Ok(rule)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::rule::RuleOrigin;
    use crate::runtime_config::RuleThresholds;
    use crate::types::Direction;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn rule(id: PositionId) -> ExitRule {
        ExitRule::new(
            id,
            "XAUUSD",
            Direction::Long,
            100.0,
            99.0,
            102.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        )
    }

    #[test]
    fn insert_if_absent_keeps_existing() {
        let store = RuleStore::new();
        let mut first = rule(1);
        first.breakeven_triggered = true;
        assert!(store.insert_if_absent(first));
        assert!(!store.insert_if_absent(rule(1)));
        assert!(store.get(1).unwrap().breakeven_triggered);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_on_missing_rule_is_none() {
        let store = RuleStore::new();
        assert!(store.update(9, |r| r.trailing_active = true).is_none());
        store.upsert(rule(9));
        assert_eq!(store.update(9, |r| r.position_id), Some(9));
        assert_eq!(store.keys(), vec![9]);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = RuleStore::new();
        let mut r = rule(7);
        r.trailing_active = true;
        r.last_trailing_stop = Some(100.4);
        store.upsert(r.clone());
        store.upsert(rule(8));
        assert_eq!(store.save(&path).unwrap(), 2);
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = RuleStore::new();
        let report = loaded.load(&path).unwrap();
        assert_eq!(report.loaded, 2);
        assert!(report.skipped.is_empty());
        let back = loaded.get(7).unwrap();
        assert_eq!(back.symbol, r.symbol);
        assert_eq!(back.direction, r.direction);
        assert_eq!(back.entry_price, r.entry_price);
        assert_eq!(back.initial_stop, r.initial_stop);
        assert_eq!(back.initial_target, r.initial_target);
        assert_eq!(back.risk_distance, r.risk_distance);
        assert!(back.trailing_active);
        assert_eq!(back.last_trailing_stop, Some(100.4));
    }

    #[test]
    fn released_position_survives_save_and_clears_on_insert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = RuleStore::new();
        store.upsert(rule(1));
        store.upsert(rule(2));
        assert!(store.release(1).is_some());
        assert!(store.release(3).is_none());
        assert!(store.is_released(1));
        assert!(!store.is_released(3));
        assert!(!store.contains(1));
        store.save(&path).unwrap();

        let loaded = RuleStore::new();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.released(), vec![1]);
        assert_eq!(loaded.keys(), vec![2]);

        assert!(loaded.insert_if_absent(rule(1)));
        assert!(!loaded.is_released(1));

        loaded.release(2);
        loaded.retain_released(|id| id != 2);
        assert!(loaded.released().is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new();
        let report = store.load(dir.path().join("absent.json")).unwrap();
        assert_eq!(report, LoadReport::default());
        assert!(store.is_empty());
    }

    #[test]
    fn one_bad_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let json = r#"{
            "version": 1,
            "saved_at": "2026-01-01T00:00:00Z",
            "rules": {
                "1": { "position_id": 1, "symbol": "EURUSD", "direction": "long",
                       "entry_price": 1.10, "initial_stop": 1.09, "initial_target": 1.12 },
                "2": { "position_id": 2, "symbol": "EURUSD", "direction": "long",
                       "entry_price": 1.10, "initial_target": 1.12 },
                "3": { "position_id": 4, "symbol": "EURUSD", "direction": "short",
                       "entry_price": 1.10, "initial_stop": 1.11, "initial_target": 1.08 }
            }
        }"#;
        std::fs::write(&path, json).unwrap();

        let store = RuleStore::new();
        let report = store.load(&path).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped.len(), 2);
        let r = store.get(1).unwrap();
        assert!((r.risk_distance - 0.01).abs() < 1e-9);
        assert!(!r.trailing_active);
    }

    #[test]
    fn structurally_invalid_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "{ not json at all").unwrap();

        let store = RuleStore::new();
        store.upsert(rule(1));
        let report = store.load(&path).unwrap();
        assert!(store.is_empty());
        let moved = report.quarantined.unwrap();
        assert!(moved.exists());
        assert!(!path.exists());
        assert!(moved
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("rules.json.corrupt-"));
    }

    #[test]
    fn unknown_version_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"version": 99, "rules": {}}"#).unwrap();
        let report = RuleStore::new().load(&path).unwrap();
        assert!(report.quarantined.is_some());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(PositionId),
        Remove(PositionId),
        Read(PositionId),
        Bump,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..16).prop_map(Op::Add),
            (0u64..16).prop_map(Op::Remove),
            (0u64..16).prop_map(Op::Read),
            Just(Op::Bump),
        ]
    }

    const COUNTER_ID: PositionId = 1_000;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_ops_lose_no_updates(
            batches in prop::collection::vec(prop::collection::vec(op(), 1..64), 2..6)
        ) {
            let store = Arc::new(RuleStore::new());
            store.upsert(rule(COUNTER_ID));

            let expected_bumps: usize = batches
                .iter()
                .map(|b| b.iter().filter(|o| matches!(o, Op::Bump)).count())
                .sum();

            let handles: Vec<_> = batches
                .into_iter()
                .map(|ops| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || {
                        for op in ops {
                            match op {
                                Op::Add(id) => {
                                    store.insert_if_absent(rule(id));
                                }
                                Op::Remove(id) => {
                                    store.remove(id);
                                }
                                Op::Read(id) => {
                                    if let Some(r) = store.get(id) {
                                        assert_eq!(r.position_id, id);
                                    }
                                }
                                Op::Bump => {
                                    store.update(COUNTER_ID, |r| {
                                        r.last_trailing_stop =
                                            Some(r.last_trailing_stop.unwrap_or(0.0) + 1.0);
                                    });
                                }
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            let keys = store.keys();
            let mut deduped = keys.clone();
            deduped.dedup();
            prop_assert_eq!(&keys, &deduped);
            prop_assert_eq!(keys.len(), store.len());
            let bumps = store.get(COUNTER_ID).unwrap().last_trailing_stop.unwrap_or(0.0);
            prop_assert_eq!(bumps as usize, expected_bumps);
        }
    }
}
