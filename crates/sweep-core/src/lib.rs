use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("malformed prediction json: {path}: {message}")]
    MalformedPrediction { path: PathBuf, message: String },
    #[error("missing transcript for {instance_id}: {path}")]
    MissingTranscript { instance_id: String, path: PathBuf },
    #[error("prediction path not found: {path}")]
    MissingPath { path: PathBuf },
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// One observed quality signal. `Unknown` covers both "never measured" and
/// "infrastructure could not complete the measurement"; the classifier treats
/// it like `No`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Signal {
    #[default]
    Unknown,
    No,
    Yes,
}

impl Signal {
    pub fn is_yes(self) -> bool {
        matches!(self, Signal::Yes)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Signal::Unknown)
    }

    pub fn from_passed(passed: Option<bool>) -> Self {
        match passed {
            None => Signal::Unknown,
            Some(false) => Signal::No,
            Some(true) => Signal::Yes,
        }
    }
}

impl Serialize for Signal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Signal::Unknown => serializer.serialize_none(),
            Signal::No => serializer.serialize_bool(false),
            Signal::Yes => serializer.serialize_bool(true),
        }
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let passed = Option::<bool>::deserialize(deserializer)?;
        Ok(Signal::from_passed(passed))
    }
}

/// One candidate fix for a task instance, in the on-disk prediction format.
/// `resolved` is ground truth filled in by the external evaluation pass;
/// nothing in the classifier or selector reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name_or_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_patch: Option<String>,
    #[serde(default, skip_serializing_if = "Signal::is_unknown")]
    pub edit_outcome: Signal,
    #[serde(default, skip_serializing_if = "Signal::is_unknown")]
    pub lint_outcome: Signal,
    #[serde(default, skip_serializing_if = "Signal::is_unknown")]
    pub test_outcome: Signal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(rename = "try", default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tries: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gold_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edited_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_results: Vec<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<String>,
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Prediction {
    pub fn has_patch(&self) -> bool {
        self.model_patch.as_deref().map_or(false, |p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    ModelPatch,
    EditOutcome,
    LintOutcome,
    TestOutcome,
}

// Strictest first; the order encodes which signal is sacrificed first
// (test, then edit, then lint). Reordering changes selection everywhere.
pub const PRIORITY: &[&[Criterion]] = &[
    &[
        Criterion::ModelPatch,
        Criterion::EditOutcome,
        Criterion::LintOutcome,
        Criterion::TestOutcome,
    ],
    &[
        Criterion::ModelPatch,
        Criterion::EditOutcome,
        Criterion::LintOutcome,
    ],
    &[Criterion::ModelPatch, Criterion::LintOutcome],
    &[Criterion::ModelPatch, Criterion::EditOutcome],
    &[Criterion::ModelPatch],
];

pub fn check_criteria(pred: &Prediction, criteria: &[Criterion]) -> bool {
    criteria.iter().all(|criterion| match criterion {
        Criterion::ModelPatch => pred.has_patch(),
        Criterion::EditOutcome => pred.edit_outcome.is_yes(),
        Criterion::LintOutcome => pred.lint_outcome.is_yes(),
        Criterion::TestOutcome => pred.test_outcome.is_yes(),
    })
}

pub fn is_plausible(pred: &Prediction) -> bool {
    check_criteria(pred, PRIORITY[0])
}

pub fn plausible_instances(preds: &BTreeMap<String, Prediction>) -> BTreeSet<String> {
    preds
        .iter()
        .filter(|(_, pred)| is_plausible(pred))
        .map(|(inst, _)| inst.clone())
        .collect()
}

/// Select the strongest candidate, weakening the criteria one step at a time.
/// Ties within a step go to the earlier candidate, so callers must supply
/// candidates in priority order. A non-empty list always yields a winner:
/// the first candidate is the last resort.
pub fn pick_winner(results: &[Prediction]) -> Option<&Prediction> {
    for criteria in PRIORITY {
        for res in results {
            if check_criteria(res, criteria) {
                return Some(res);
            }
        }
    }
    results.first()
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    ids: BTreeSet<String>,
}

impl InstanceFilter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("cannot read instance filter {}: {}", path.display(), e))?;
        let ids: BTreeSet<String> = match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(list) => list.into_iter().collect(),
            Err(_) => raw
                .lines()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(|l| l.to_string())
                .collect(),
        };
        if ids.is_empty() {
            return Err(anyhow!("instance filter {} is empty", path.display()));
        }
        Ok(Self { ids })
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.ids.contains(instance_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Load prediction records from files and/or run directories (every `*.json`
/// directly inside a directory). Valid JSON without an `instance_id` (stats
/// files, manifests) is skipped with a warning; JSON that does not parse at
/// all aborts the load.
pub fn load_predictions(
    paths: &[PathBuf],
    filter: Option<&InstanceFilter>,
) -> Result<BTreeMap<String, Prediction>> {
    let mut prediction_paths = Vec::new();
    for path in paths {
        if path.is_file() {
            prediction_paths.push(path.clone());
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry?;
                let p = entry.path();
                if entry.file_type().is_file()
                    && p.extension().and_then(|e| e.to_str()) == Some("json")
                {
                    prediction_paths.push(p.to_path_buf());
                }
            }
        } else {
            return Err(DataError::MissingPath { path: path.clone() }.into());
        }
    }

    let mut predictions = BTreeMap::new();
    for fname in prediction_paths {
        let raw = fs::read_to_string(&fname)?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| DataError::MalformedPrediction {
                path: fname.clone(),
                message: e.to_string(),
            })?;
        let inst = match value.get("instance_id").and_then(|v| v.as_str()) {
            Some(inst) => inst.to_string(),
            None => {
                warn!("skipping json without instance_id: {}", fname.display());
                continue;
            }
        };
        if let Some(filter) = filter {
            if !filter.contains(&inst) {
                continue;
            }
        }
        let mut pred: Prediction =
            serde_json::from_value(value).map_err(|e| DataError::MalformedPrediction {
                path: fname.clone(),
                message: e.to_string(),
            })?;
        pred.source_path = Some(fname);
        predictions.insert(inst, pred);
    }

    Ok(predictions)
}

fn dir_label(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn choose_pred(
    inst: &str,
    all_preds: &[BTreeMap<String, Prediction>],
    dnames: &[PathBuf],
) -> Option<Prediction> {
    let mut results = Vec::new();
    for (preds, dname) in all_preds.iter().zip(dnames) {
        if let Some(pred) = preds.get(inst) {
            let mut pred = pred.clone();
            pred.run_dir = Some(dir_label(dname));
            results.push(pred);
        }
    }
    pick_winner(&results).cloned()
}

/// Merge per-directory predictions into one record per instance. `dnames` is
/// in descending priority order. When `transcripts_to` is set, the chosen
/// record's chat transcript is copied from its source directory; a missing
/// transcript aborts the merge because it means the run directory's
/// bookkeeping is corrupted.
pub fn choose_predictions(
    dnames: &[PathBuf],
    out_label: &str,
    transcripts_to: Option<&Path>,
    filter: Option<&InstanceFilter>,
) -> Result<BTreeMap<String, Prediction>> {
    let mut all_preds = Vec::new();
    for dname in dnames {
        all_preds.push(load_predictions(std::slice::from_ref(dname), filter)?);
    }

    let mut all_instances = BTreeSet::new();
    for preds in &all_preds {
        all_instances.extend(preds.keys().cloned());
    }

    let mut chosen = BTreeMap::new();
    for inst in &all_instances {
        let Some(mut res) = choose_pred(inst, &all_preds, dnames) else {
            continue;
        };

        if let Some(out_dir) = transcripts_to {
            let source = res
                .run_dir
                .as_deref()
                .and_then(|label| dnames.iter().find(|d| dir_label(d) == label))
                .ok_or_else(|| anyhow!("no source directory recorded for {}", inst))?;
            let md_fname = source.join(format!("{}.md", inst));
            if !md_fname.exists() {
                return Err(DataError::MissingTranscript {
                    instance_id: inst.clone(),
                    path: md_fname,
                }
                .into());
            }
            ensure_dir(out_dir)?;
            fs::copy(&md_fname, out_dir.join(format!("{}.md", inst)))?;
        }

        res.model_name_or_path = Some(out_label.to_string());
        chosen.insert(inst.clone(), res);
    }

    info!("chose {} predictions from {} dirs", chosen.len(), dnames.len());
    Ok(chosen)
}

/// Digest of the canonical JSON form of a chosen-prediction mapping. Two
/// merges over unchanged run directories produce the same digest.
pub fn chosen_digest(chosen: &BTreeMap<String, Prediction>) -> Result<String> {
    let bytes = serde_json::to_vec(chosen)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

pub fn files_in_patch(patch: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in patch.lines() {
        if line.starts_with("--- a/") || line.starts_with("+++ b/") {
            if let Some((_, fname)) = line.split_once('/') {
                if !files.iter().any(|f| f == fname) {
                    files.push(fname.to_string());
                }
            }
        }
    }
    files
}

/// Drop every hunk of `model_patch` that touches a test path. The submission
/// patch must not disturb the repository's tests: the acceptance test patch
/// is applied on top of it during evaluation.
pub fn remove_patches_to_tests(model_patch: &str) -> String {
    let mut filtered = String::new();
    let mut is_tests = false;
    for line in model_patch.split_inclusive('\n') {
        if line.starts_with("diff --git a/") {
            let to = line.split_whitespace().last().unwrap_or("");
            is_tests = to.starts_with("b/")
                && (to.contains("/test/")
                    || to.contains("/tests/")
                    || to.contains("/testing/")
                    || to.contains("/test_")
                    || to.contains("/tox.ini"));
        }
        if !is_tests {
            filtered.push_str(line);
        }
    }
    filtered
}

/// Write the consolidated submission: one JSON line per instance with the
/// minimal fields the evaluation harness consumes.
pub fn write_submission(out_dir: &Path, chosen: &BTreeMap<String, Prediction>) -> Result<PathBuf> {
    let mut buf = Vec::new();
    for pred in chosen.values() {
        let patch = pred.model_patch.as_deref().unwrap_or("");
        let minimal = json!({
            "model_name_or_path": pred.model_name_or_path,
            "model_patch": remove_patches_to_tests(patch),
            "instance_id": pred.instance_id,
        });
        serde_json::to_writer(&mut buf, &minimal)?;
        buf.push(b'\n');
    }
    let out_fname = out_dir.join("all_preds.jsonl");
    atomic_write_bytes(&out_fname, &buf)?;
    Ok(out_fname)
}

/// Aggregate counts over a chosen-prediction mapping. Built fresh per call;
/// `resolved: null` counts as unevaluated, never as a failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportStats {
    pub total: usize,
    pub generated: usize,
    pub no_generation: usize,
    pub plausible: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub unevaluated: usize,
    pub cost_spent: f64,
    pub cost_avg: f64,
    pub by_run_dir: BTreeMap<String, usize>,
}

impl ReportStats {
    pub fn from_predictions(preds: &BTreeMap<String, Prediction>) -> Self {
        let mut stats = ReportStats::default();
        let mut costs = Vec::new();
        for pred in preds.values() {
            stats.total += 1;
            if pred.has_patch() {
                stats.generated += 1;
            } else {
                stats.no_generation += 1;
            }
            if is_plausible(pred) {
                stats.plausible += 1;
            }
            match pred.resolved {
                Some(true) => stats.resolved += 1,
                Some(false) => stats.unresolved += 1,
                None => stats.unevaluated += 1,
            }
            if let Some(cost) = pred.cost {
                if cost > 0.0 {
                    costs.push(cost);
                }
            }
            if let Some(dname) = &pred.run_dir {
                *stats.by_run_dir.entry(dname.clone()).or_default() += 1;
            }
        }
        stats.cost_spent = costs.iter().sum();
        if !costs.is_empty() {
            stats.cost_avg = stats.cost_spent / costs.len() as f64;
        }
        stats
    }

    pub fn resolved_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.resolved as f64 * 100.0 / self.total as f64
        }
    }

    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.insert("resolved_percent".to_string(), json!(self.resolved_percent()));
        }
        value
    }
}
