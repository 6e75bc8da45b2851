use anyhow::{anyhow, bail, Result};
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use sweep_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, files_in_patch, is_plausible,
    load_predictions, pick_winner, plausible_instances, remove_patches_to_tests, Prediction,
    Signal,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sweep: SweepSection,
    #[serde(default)]
    pub dataset: DatasetSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub testbed: TestbedSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepSection {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_num_tries")]
    pub num_tries: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            models: Vec::new(),
            num_tries: default_num_tries(),
            temperature: 0.0,
            threads: default_threads(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetSection {
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestbedSection {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TestbedSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_predictions_dir")]
    pub predictions: PathBuf,
    #[serde(default = "default_repos_dir")]
    pub repos: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            predictions: default_predictions_dir(),
            repos: default_repos_dir(),
        }
    }
}

fn default_num_tries() -> u32 {
    1
}

fn default_threads() -> usize {
    1
}

fn default_namespace() -> String {
    "aorwall".to_string()
}

fn default_timeout_seconds() -> u64 {
    900
}

fn default_predictions_dir() -> PathBuf {
    PathBuf::from("predictions")
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("repos")
}

pub fn load_config(path: &Path) -> Result<SweepConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read sweep config {}: {}", path.display(), e))?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let json: Value = serde_json::to_value(yaml)?;
    validate_required_fields(&json)?;
    let cfg: SweepConfig = serde_json::from_value(json)?;
    Ok(cfg)
}

fn validate_required_fields(json: &Value) -> Result<()> {
    let non_empty_str = |ptr: &str| {
        json.pointer(ptr)
            .and_then(|v| v.as_str())
            .map_or(false, |s| !s.is_empty())
    };
    let non_empty_array = |ptr: &str| {
        json.pointer(ptr)
            .and_then(|v| v.as_array())
            .map_or(false, |a| !a.is_empty())
    };

    let mut missing = Vec::new();
    if !non_empty_str("/sweep/prefix") {
        missing.push("/sweep/prefix");
    }
    if !non_empty_array("/sweep/models") {
        missing.push("/sweep/models");
    }
    if !non_empty_str("/dataset/path") {
        missing.push("/dataset/path");
    }
    if !non_empty_array("/agent/command") {
        missing.push("/agent/command");
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "sweep config missing required fields: {}",
            missing.join(", ")
        ))
    }
}

impl SweepConfig {
    pub fn models_slug(&self) -> String {
        self.sweep
            .models
            .iter()
            .map(|m| m.replace('/', "-"))
            .collect::<Vec<_>>()
            .join("--")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.paths
            .predictions
            .join(format!("{}--{}", self.sweep.prefix, self.models_slug()))
    }

    pub fn model_name_or_path(&self) -> String {
        format!("sweep--{}", self.models_slug())
    }
}

#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub prefix: String,
    pub models: Vec<String>,
    pub num_tries: u32,
    pub temperature: f64,
    pub threads: usize,
    pub dataset_path: PathBuf,
    pub task_count: usize,
    pub out_dir: PathBuf,
    pub model_name_or_path: String,
    pub agent_command: Vec<String>,
    pub testbed_namespace: String,
    pub timeout_seconds: u64,
}

pub fn describe_sweep(cfg: &SweepConfig) -> Result<SweepSummary> {
    let task_count = if cfg.dataset.path.exists() {
        load_dataset(&cfg.dataset.path)?.len()
    } else {
        0
    };
    Ok(SweepSummary {
        prefix: cfg.sweep.prefix.clone(),
        models: cfg.sweep.models.clone(),
        num_tries: cfg.sweep.num_tries,
        temperature: cfg.sweep.temperature,
        threads: cfg.sweep.threads,
        dataset_path: cfg.dataset.path.clone(),
        task_count,
        out_dir: cfg.out_dir(),
        model_name_or_path: cfg.model_name_or_path(),
        agent_command: cfg.agent.command.clone(),
        testbed_namespace: cfg.testbed.namespace.clone(),
        timeout_seconds: cfg.testbed.timeout_seconds,
    })
}

/// One benchmark problem: a repository state plus the issue filed against it.
/// `patch` is the gold fix and is only ever consulted for its file list;
/// `test_patch` carries the hidden acceptance tests and is withheld from
/// candidate generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInstance {
    pub instance_id: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub fn load_dataset(path: &Path) -> Result<BTreeMap<String, TaskInstance>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read dataset cache {}: {}", path.display(), e))?;
    let entries: Vec<TaskInstance> = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("malformed dataset cache {}: {}", path.display(), e))?;
    let mut dataset = BTreeMap::new();
    for entry in entries {
        dataset.insert(entry.instance_id.clone(), entry);
    }
    Ok(dataset)
}

pub fn fetch_dataset(url: &str, path: &Path) -> Result<()> {
    info!("fetching dataset from {}", url);
    let body = reqwest::blocking::get(url)?.error_for_status()?.bytes()?;
    serde_json::from_slice::<Vec<TaskInstance>>(&body)
        .map_err(|e| anyhow!("dataset from {} is malformed: {}", url, e))?;
    atomic_write_bytes(path, &body)?;
    Ok(())
}

pub fn ensure_dataset(cfg: &SweepConfig) -> Result<BTreeMap<String, TaskInstance>> {
    if !cfg.dataset.path.exists() {
        match &cfg.dataset.source_url {
            Some(url) => fetch_dataset(url, &cfg.dataset.path)?,
            None => bail!(
                "dataset cache {} is missing and no dataset.source_url is configured",
                cfg.dataset.path.display()
            ),
        }
    }
    load_dataset(&cfg.dataset.path)
}

pub fn show_problems(dataset: &BTreeMap<String, TaskInstance>) -> Vec<(String, String)> {
    dataset
        .iter()
        .map(|(inst, entry)| {
            let headline = entry
                .problem_statement
                .lines()
                .next()
                .unwrap_or("")
                .to_string();
            (inst.clone(), headline)
        })
        .collect()
}

pub trait Vcs: Send + Sync {
    fn checkout(&self, instance: &TaskInstance, dest: &Path) -> Result<()>;
    fn diff(&self, repo_dir: &Path, commit: &str) -> Result<String>;
}

pub struct GitVcs {
    repos_dir: PathBuf,
}

impl GitVcs {
    pub fn new(repos_dir: PathBuf) -> Self {
        Self { repos_dir }
    }

    /// Clone-once cache of bare repositories, so attempts pull from local
    /// disk instead of hitting the forge for every checkout.
    fn bare_repo(&self, repo: &str) -> Result<PathBuf> {
        let name = repo
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow!("invalid repository name: {}", repo))?;
        let bare = self.repos_dir.join(format!("{}.git", name));
        if bare.exists() {
            return Ok(bare);
        }
        ensure_dir(&self.repos_dir)?;
        let url = format!("https://github.com/{}", repo);
        // Clone to a private path first so concurrent workers never observe
        // a half-written cache entry.
        let tmp = self.repos_dir.join(format!(
            ".{}.git.tmp.{}.{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        run_git(&["clone", "--bare", url.as_str(), tmp.to_string_lossy().as_ref()])?;
        if bare.exists() {
            let _ = fs::remove_dir_all(&tmp);
        } else if fs::rename(&tmp, &bare).is_err() {
            let _ = fs::remove_dir_all(&tmp);
        }
        Ok(bare)
    }
}

fn run_git(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .map_err(|e| anyhow!("cannot run git: {}", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl Vcs for GitVcs {
    fn checkout(&self, instance: &TaskInstance, dest: &Path) -> Result<()> {
        let bare = self.bare_repo(&instance.repo)?;
        run_git(&[
            "clone",
            bare.to_string_lossy().as_ref(),
            dest.to_string_lossy().as_ref(),
        ])?;
        run_git(&[
            "-c",
            "advice.detachedHead=false",
            "-C",
            dest.to_string_lossy().as_ref(),
            "checkout",
            instance.base_commit.as_str(),
        ])?;
        Ok(())
    }

    fn diff(&self, repo_dir: &Path, commit: &str) -> Result<String> {
        run_git(&["-C", repo_dir.to_string_lossy().as_ref(), "diff", commit])
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub model: String,
    pub temperature: f64,
    pub problem_statement: String,
    pub repo_dir: PathBuf,
    pub io_dir: PathBuf,
    pub transcript_path: PathBuf,
    pub test_command: String,
    pub clarify_files: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentReport {
    #[serde(default)]
    pub edit_ok: Signal,
    #[serde(default)]
    pub lint_ok: Signal,
    #[serde(default)]
    pub added_files: Vec<String>,
    #[serde(default)]
    pub cost: f64,
}

/// The editing agent. Faults are ordinary `Err` values the caller inspects;
/// an implementation must never panic its way out of an attempt.
pub trait Agent: Send + Sync {
    fn attempt(&self, req: &AgentRequest) -> Result<AgentReport>;
}

/// Runs the configured agent command once per attempt: request JSON on stdin
/// and in `attempt_input.json`, report expected in `attempt_output.json`
/// (last stdout line accepted as a fallback).
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn invoke(&self, req: &AgentRequest) -> Result<AgentReport> {
        if self.command.is_empty() {
            bail!("agent command is empty");
        }
        let input_path = req.io_dir.join("attempt_input.json");
        let output_path = req.io_dir.join("attempt_output.json");
        if output_path.exists() {
            fs::remove_file(&output_path)?;
        }

        let payload = json!({
            "model": req.model,
            "temperature": req.temperature,
            "problem_statement": req.problem_statement,
            "repo_dir": req.repo_dir.to_string_lossy(),
            "transcript_path": req.transcript_path.to_string_lossy(),
            "test_command": req.test_command,
            "clarify_files": req.clarify_files,
            "report_path": output_path.to_string_lossy(),
        });
        let input_bytes = serde_json::to_vec_pretty(&payload)?;
        atomic_write_bytes(&input_path, &input_bytes)?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.current_dir(&req.repo_dir);
        cmd.env("SWEEP_ATTEMPT_INPUT", &input_path);
        cmd.env("SWEEP_ATTEMPT_OUTPUT", &output_path);
        cmd.env("SWEEP_TRANSCRIPT", &req.transcript_path);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("cannot spawn agent command {:?}: {}", self.command, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&input_bytes);
        }
        let output = child.wait_with_output()?;

        if !output_path.exists() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
                if serde_json::from_str::<Value>(line.trim()).is_ok() {
                    atomic_write_bytes(&output_path, line.trim().as_bytes())?;
                }
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("agent exited without diagnostics");
            bail!("agent command exited with {}: {}", output.status, tail);
        }
        if !output_path.exists() {
            bail!(
                "agent exited without writing a report: {}",
                output_path.display()
            );
        }
        let report: AgentReport = serde_json::from_slice(&fs::read(&output_path)?)
            .map_err(|e| anyhow!("malformed agent report {}: {}", output_path.display(), e))?;
        Ok(report)
    }
}

impl Agent for CommandAgent {
    fn attempt(&self, req: &AgentRequest) -> Result<AgentReport> {
        let first = self.invoke(req)?;
        if !first.added_files.is_empty() || req.clarify_files {
            return Ok(first);
        }
        // The agent named no files to edit; ask once more with the
        // clarification flag set before giving up on this attempt.
        let mut follow = req.clone();
        follow.clarify_files = true;
        let second = self.invoke(&follow)?;
        Ok(AgentReport {
            edit_ok: first.edit_ok,
            lint_ok: first.lint_ok,
            added_files: second.added_files,
            cost: first.cost + second.cost,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TestVerdict {
    /// None when the testbed could not complete the run at all (infra
    /// failure, timeout, missing log), as opposed to a determinate failure.
    pub passed: Option<bool>,
    pub log: String,
}

pub trait Testbed: Send + Sync {
    fn run_tests(
        &self,
        instance: &TaskInstance,
        model_patch: Option<&str>,
        with_gold_tests: bool,
    ) -> TestVerdict;
    fn test_command(&self, instance: &TaskInstance) -> String;
}

pub const TEST_PASSED_MARKER: &str = ">>>>> All Tests Passed";
pub const APPLIED_TEST_PATCH_MARKER: &str = ">>>>> Applied Patch (test)";

const CONTAINER_LOG_DIR: &str = "/opt/logs";
const NON_TEST_EXTS: &[&str] = &[
    ".json", ".png", ".csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

/// Stands in for a withheld model or test patch so the container entrypoint
/// always has something to apply.
pub fn noop_patch(nonce: &str) -> String {
    format!(
        "diff --git a/empty.file.{nonce}.ignore b/empty.file.{nonce}.ignore\n\
         new file mode 100644\n\
         index 0000000..e69de29\n"
    )
}

fn test_framework(repo: &str) -> &'static str {
    match repo {
        "django/django" => "./tests/runtests.py --verbosity 2",
        "sympy/sympy" => "bin/test -C --verbose",
        _ => "pytest --no-header -rA --tb=no -p no:cacheprovider",
    }
}

fn test_directives(instance: &TaskInstance) -> Vec<String> {
    let mut directives: Vec<String> = Vec::new();
    for line in instance.test_patch.lines() {
        let Some(rest) = line.strip_prefix("diff --git a/") else {
            continue;
        };
        let Some((_, target)) = rest.split_once(" b/") else {
            continue;
        };
        if NON_TEST_EXTS.iter().any(|ext| target.ends_with(ext)) {
            continue;
        }
        let mut directive = target.to_string();
        if instance.repo == "django/django" {
            if let Some(stripped) = directive.strip_suffix(".py") {
                directive = stripped.to_string();
            }
            if let Some(stripped) = directive.strip_prefix("tests/") {
                directive = stripped.to_string();
            }
            directive = directive.replace('/', ".");
        }
        if !directives.contains(&directive) {
            directives.push(directive);
        }
    }
    directives
}

/// The text of the actual test run: everything after the container's
/// applied-test-patch marker.
pub fn pre_existing_test_failure(log_text: &str) -> String {
    log_text
        .rsplit(APPLIED_TEST_PATCH_MARKER)
        .next()
        .unwrap_or(log_text)
        .trim()
        .to_string()
}

pub struct DockerTestbed {
    namespace: String,
    timeout: Duration,
}

impl DockerTestbed {
    pub fn new(namespace: String, timeout: Duration) -> Self {
        Self { namespace, timeout }
    }

    pub fn docker_image(&self, instance: &TaskInstance) -> String {
        if let Some(image) = &instance.image {
            return image.clone();
        }
        format!(
            "{}/swe-bench-{}-testbed:{}",
            self.namespace,
            instance.repo.replace('/', "_"),
            instance.version
        )
    }

    fn run_tests_inner(
        &self,
        instance: &TaskInstance,
        model_patch: Option<&str>,
        with_gold_tests: bool,
    ) -> Result<TestVerdict> {
        let model_patch = match model_patch {
            Some(p) if !p.is_empty() => {
                if with_gold_tests {
                    // The acceptance tests are applied on top; the candidate
                    // patch must not be allowed to touch test files.
                    remove_patches_to_tests(p)
                } else {
                    p.to_string()
                }
            }
            _ => noop_patch("model_patch"),
        };
        let test_patch = if with_gold_tests && !instance.test_patch.is_empty() {
            instance.test_patch.clone()
        } else {
            noop_patch("test_patch")
        };
        let directives = test_directives(instance);
        let payload = json!({
            "repo": instance.repo,
            "version": instance.version,
            "base_commit": instance.base_commit,
            "instance_id": instance.instance_id,
            "model_name_or_path": "none",
            "model_patch": model_patch,
            "test_patch": test_patch,
            "test_directives": directives,
            "test_cmd": format!("{} {}", test_framework(&instance.repo), directives.join(" ")),
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&payload)?);

        let log_dir = fresh_scratch_dir("sweep_eval")?;
        let image = self.docker_image(instance);

        let mut cmd = Command::new("docker");
        cmd.arg("run").arg("--rm");
        cmd.args(["-v", &format!("{}:{}", log_dir.display(), CONTAINER_LOG_DIR)]);
        cmd.arg("-e").arg(format!("INSTANCE={}", encoded));
        cmd.arg("-e").arg(format!("LOG_DIR={}", CONTAINER_LOG_DIR));
        cmd.arg("-e")
            .arg(format!("TIMEOUT={}", self.timeout.as_secs()));
        cmd.arg("-e").arg("LOG_SUFFIX=");
        cmd.arg(&image);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("cannot start testbed container {}: {}", image, e))?;

        // The container enforces its own test timeout; the host deadline only
        // guards against a wedged container eating a worker slot forever.
        let deadline = Instant::now() + self.timeout + Duration::from_secs(60);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        warn!(
                            "testbed container for {} exited with {}",
                            instance.instance_id, status
                        );
                    }
                    break;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = fs::remove_dir_all(&log_dir);
                        return Ok(TestVerdict {
                            passed: None,
                            log: format!(
                                "testbed timed out after {}s",
                                self.timeout.as_secs() + 60
                            ),
                        });
                    }
                    thread::sleep(Duration::from_millis(250));
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = fs::remove_dir_all(&log_dir);
                    return Err(e.into());
                }
            }
        }

        let log_fname = log_dir.join(format!("{}.none.eval.log", instance.instance_id));
        if !log_fname.exists() {
            let _ = fs::remove_dir_all(&log_dir);
            return Ok(TestVerdict {
                passed: None,
                log: String::new(),
            });
        }
        let log_text = fs::read_to_string(&log_fname)?;
        let _ = fs::remove_dir_all(&log_dir);
        Ok(TestVerdict {
            passed: Some(log_text.contains(TEST_PASSED_MARKER)),
            log: log_text,
        })
    }
}

impl Testbed for DockerTestbed {
    fn run_tests(
        &self,
        instance: &TaskInstance,
        model_patch: Option<&str>,
        with_gold_tests: bool,
    ) -> TestVerdict {
        match self.run_tests_inner(instance, model_patch, with_gold_tests) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    "testbed run for {} could not complete: {:#}",
                    instance.instance_id, err
                );
                TestVerdict {
                    passed: None,
                    log: format!("{err:#}"),
                }
            }
        }
    }

    fn test_command(&self, instance: &TaskInstance) -> String {
        let directives = test_directives(instance);
        format!(
            "{} {}",
            test_framework(&instance.repo),
            directives.join(" ")
        )
    }
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn fresh_scratch_dir(tag: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "{}_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros(),
        SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    ensure_dir(&dir)?;
    Ok(dir)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    AlreadyDone,
    Succeeded { tries: u32 },
    Exhausted { candidates: usize },
    NoCandidates,
    Failed,
}

pub struct AttemptController<'a> {
    pub models: &'a [String],
    pub num_tries: u32,
    pub temperature: f64,
    pub model_name_or_path: &'a str,
    pub out_dir: &'a Path,
    pub vcs: &'a dyn Vcs,
    pub agent: &'a dyn Agent,
    pub testbed: &'a dyn Testbed,
}

impl AttemptController<'_> {
    /// Drive one instance to a terminal state: try every (attempt, model)
    /// pair in order, attempts outer and models inner, stopping at the first
    /// fully-plausible candidate and otherwise falling back to the strongest
    /// candidate seen. At most one prediction file is written.
    pub fn process_instance(&self, instance: &TaskInstance) -> Result<InstanceOutcome> {
        let out_fname = self.out_dir.join(format!("{}.json", instance.instance_id));
        if out_fname.exists() {
            info!("skipping {}: already done", instance.instance_id);
            return Ok(InstanceOutcome::AlreadyDone);
        }
        ensure_dir(self.out_dir)?;

        let transcript = self.out_dir.join(format!("{}.md", instance.instance_id));
        if transcript.exists() {
            // Leftover from an aborted run; the agent appends to it.
            fs::remove_file(&transcript)?;
        }

        let gold_files = files_in_patch(&instance.patch);
        let mut results: Vec<Prediction> = Vec::new();
        let mut total_cost = 0.0;
        let mut plausible_found = false;
        let mut tries_used = 0;

        'attempts: for attempt in 1..=self.num_tries {
            for model in self.models {
                tries_used = attempt;
                info!(
                    "trying {} attempt {} with {}",
                    instance.instance_id, attempt, model
                );
                let attempt_dir = fresh_scratch_dir("sweep_attempt")?;
                let outcome =
                    self.run_attempt(instance, model, attempt, &gold_files, &attempt_dir, &transcript);
                let _ = fs::remove_dir_all(&attempt_dir);
                let candidate = match outcome {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        warn!(
                            "attempt {} with {} failed for {}: {:#}",
                            attempt, model, instance.instance_id, err
                        );
                        continue;
                    }
                };
                total_cost += candidate.cost.unwrap_or(0.0);
                results.push(candidate);
                if is_plausible(results.last().expect("candidate just recorded")) {
                    plausible_found = true;
                    break 'attempts;
                }
            }
        }

        let winner = if plausible_found {
            results.last().cloned()
        } else {
            pick_winner(&results).cloned()
        };
        let Some(mut winner) = winner else {
            warn!("no candidates produced for {}", instance.instance_id);
            return Ok(InstanceOutcome::NoCandidates);
        };

        winner.tries = Some(tries_used);
        winner.cost = Some(total_cost);
        winner.model_name_or_path = Some(self.model_name_or_path.to_string());
        winner.all_results = results.clone();
        atomic_write_json_pretty(&out_fname, &serde_json::to_value(&winner)?)?;

        Ok(if plausible_found {
            InstanceOutcome::Succeeded { tries: tries_used }
        } else {
            InstanceOutcome::Exhausted {
                candidates: results.len(),
            }
        })
    }

    fn run_attempt(
        &self,
        instance: &TaskInstance,
        model: &str,
        attempt: u32,
        gold_files: &[String],
        attempt_dir: &Path,
        transcript: &Path,
    ) -> Result<Prediction> {
        let repo_dir = attempt_dir.join("repo");
        self.vcs.checkout(instance, &repo_dir)?;

        let req = AgentRequest {
            model: model.to_string(),
            temperature: self.temperature,
            problem_statement: instance.problem_statement.clone(),
            repo_dir: repo_dir.clone(),
            io_dir: attempt_dir.to_path_buf(),
            transcript_path: transcript.to_path_buf(),
            test_command: self.testbed.test_command(instance),
            clarify_files: false,
        };
        let report = self.agent.attempt(&req)?;

        let model_patch = self.vcs.diff(&repo_dir, &instance.base_commit)?;
        let verdict = self.testbed.run_tests(
            instance,
            if model_patch.is_empty() {
                None
            } else {
                Some(&model_patch)
            },
            false,
        );
        if verdict.passed == Some(false) {
            let failure = pre_existing_test_failure(&verdict.log);
            let head: String = failure.lines().take(20).collect::<Vec<_>>().join("\n");
            info!(
                "pre-existing tests failed for {}:\n{}",
                instance.instance_id, head
            );
        }

        Ok(Prediction {
            instance_id: instance.instance_id.clone(),
            model_patch: Some(model_patch.clone()),
            edit_outcome: report.edit_ok,
            lint_outcome: report.lint_ok,
            test_outcome: Signal::from_passed(verdict.passed),
            cost: Some(report.cost),
            attempt: Some(attempt),
            model: Some(model.to_string()),
            temperature: Some(self.temperature),
            added_files: report.added_files,
            gold_files: gold_files.to_vec(),
            edited_files: files_in_patch(&model_patch),
            ..Prediction::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub out_dir: PathBuf,
    pub model_name_or_path: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub no_candidates: usize,
    pub failed: usize,
    pub skipped_done: usize,
    pub skipped_plausible: usize,
}

/// Run the configured sweep. `prior_dirs` are earlier runs in descending
/// priority: an instance already plausible in any of them is not re-attempted,
/// and when prior runs are given they define the instance universe.
pub fn run_sweep(cfg: &SweepConfig, prior_dirs: &[PathBuf]) -> Result<SweepOutcome> {
    let dataset = ensure_dataset(cfg)?;
    let out_dir = cfg.out_dir();
    ensure_dir(&out_dir)?;

    let done: BTreeSet<String> = load_predictions(std::slice::from_ref(&out_dir), None)?
        .keys()
        .cloned()
        .collect();
    let prior = load_predictions(prior_dirs, None)?;
    let plausible = plausible_instances(&prior);

    let universe: BTreeSet<String> = if prior.is_empty() {
        dataset.keys().cloned().collect()
    } else {
        prior.keys().cloned().collect()
    };

    let (remaining, skipped_done, skipped_plausible) =
        partition_instances(&universe, &done, &plausible);
    info!(
        "{} instances to attempt ({} already done, {} plausible upstream)",
        remaining.len(),
        skipped_done,
        skipped_plausible
    );

    let model_name_or_path = cfg.model_name_or_path();
    let agent = CommandAgent::new(cfg.agent.command.clone());
    let testbed = DockerTestbed::new(
        cfg.testbed.namespace.clone(),
        Duration::from_secs(cfg.testbed.timeout_seconds),
    );
    let vcs = GitVcs::new(cfg.paths.repos.clone());
    let controller = AttemptController {
        models: &cfg.sweep.models,
        num_tries: cfg.sweep.num_tries,
        temperature: cfg.sweep.temperature,
        model_name_or_path: &model_name_or_path,
        out_dir: &out_dir,
        vcs: &vcs,
        agent: &agent,
        testbed: &testbed,
    };

    let outcomes = run_pool(&controller, &dataset, &remaining, cfg.sweep.threads);

    let mut result = SweepOutcome {
        out_dir,
        model_name_or_path,
        attempted: remaining.len(),
        succeeded: 0,
        exhausted: 0,
        no_candidates: 0,
        failed: 0,
        skipped_done,
        skipped_plausible,
    };
    for outcome in outcomes {
        match outcome {
            InstanceOutcome::Succeeded { .. } => result.succeeded += 1,
            InstanceOutcome::Exhausted { .. } => result.exhausted += 1,
            InstanceOutcome::NoCandidates => result.no_candidates += 1,
            InstanceOutcome::Failed => result.failed += 1,
            InstanceOutcome::AlreadyDone => {}
        }
    }
    Ok(result)
}

fn partition_instances(
    universe: &BTreeSet<String>,
    done: &BTreeSet<String>,
    plausible: &BTreeSet<String>,
) -> (Vec<String>, usize, usize) {
    let mut skipped_done = 0;
    let mut skipped_plausible = 0;
    let mut remaining = Vec::new();
    for inst in universe {
        if done.contains(inst) {
            skipped_done += 1;
        } else if plausible.contains(inst) {
            skipped_plausible += 1;
        } else {
            remaining.push(inst.clone());
        }
    }
    (remaining, skipped_done, skipped_plausible)
}

// Each worker owns one instance at a time; completed instances were already
// persisted by the controller, so a failure loses at most the one in flight.
fn run_pool(
    controller: &AttemptController<'_>,
    dataset: &BTreeMap<String, TaskInstance>,
    remaining: &[String],
    threads: usize,
) -> Vec<InstanceOutcome> {
    if remaining.is_empty() {
        return Vec::new();
    }
    let (task_tx, task_rx) = crossbeam_channel::unbounded::<String>();
    for inst in remaining {
        let _ = task_tx.send(inst.clone());
    }
    drop(task_tx);

    let (done_tx, done_rx) = crossbeam_channel::unbounded::<InstanceOutcome>();
    let workers = threads.max(1).min(remaining.len());
    thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok(inst) = task_rx.recv() {
                    let Some(entry) = dataset.get(&inst) else {
                        warn!("instance {} is not in the dataset cache", inst);
                        let _ = done_tx.send(InstanceOutcome::Failed);
                        continue;
                    };
                    match controller.process_instance(entry) {
                        Ok(outcome) => {
                            let _ = done_tx.send(outcome);
                        }
                        Err(err) => {
                            warn!("instance {} failed: {:#}", inst, err);
                            let _ = done_tx.send(InstanceOutcome::Failed);
                        }
                    }
                }
            });
        }
    });
    drop(done_tx);
    done_rx.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeVcs {
        patches: Mutex<VecDeque<String>>,
    }

    impl FakeVcs {
        fn with_patches(patches: &[&str]) -> Self {
            Self {
                patches: Mutex::new(patches.iter().map(|p| p.to_string()).collect()),
            }
        }
    }

    impl Vcs for FakeVcs {
        fn checkout(&self, _instance: &TaskInstance, dest: &Path) -> Result<()> {
            ensure_dir(dest)
        }

        fn diff(&self, _repo_dir: &Path, _commit: &str) -> Result<String> {
            Ok(self
                .patches
                .lock()
                .expect("patch script")
                .pop_front()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct FakeAgent {
        script: Mutex<VecDeque<Option<AgentReport>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeAgent {
        fn scripted(script: Vec<Option<AgentReport>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("call log").clone()
        }
    }

    impl Agent for FakeAgent {
        fn attempt(&self, req: &AgentRequest) -> Result<AgentReport> {
            self.calls.lock().expect("call log").push(req.model.clone());
            match self.script.lock().expect("agent script").pop_front() {
                Some(Some(report)) => Ok(report),
                Some(None) => Err(anyhow!("scripted agent fault")),
                None => Ok(AgentReport::default()),
            }
        }
    }

    struct FakeTestbed {
        passed: Mutex<VecDeque<Option<bool>>>,
    }

    impl FakeTestbed {
        fn always_passing() -> Self {
            Self {
                passed: Mutex::new(VecDeque::new()),
            }
        }

        fn scripted(passed: Vec<Option<bool>>) -> Self {
            Self {
                passed: Mutex::new(passed.into()),
            }
        }
    }

    impl Testbed for FakeTestbed {
        fn run_tests(
            &self,
            _instance: &TaskInstance,
            _model_patch: Option<&str>,
            _with_gold_tests: bool,
        ) -> TestVerdict {
            TestVerdict {
                passed: self
                    .passed
                    .lock()
                    .expect("testbed script")
                    .pop_front()
                    .unwrap_or(Some(true)),
                log: String::new(),
            }
        }

        fn test_command(&self, _instance: &TaskInstance) -> String {
            "true".to_string()
        }
    }

    fn good_report() -> AgentReport {
        AgentReport {
            edit_ok: Signal::Yes,
            lint_ok: Signal::Yes,
            added_files: vec!["src/app.py".to_string()],
            cost: 0.25,
        }
    }

    fn instance(id: &str) -> TaskInstance {
        TaskInstance {
            instance_id: id.to_string(),
            repo: "owner/project".to_string(),
            version: "2.1".to_string(),
            base_commit: "deadbeef".to_string(),
            problem_statement: "Widget crashes on empty input\nMore detail here.".to_string(),
            patch: "--- a/src/app.py\n+++ b/src/app.py\n".to_string(),
            ..TaskInstance::default()
        }
    }

    fn temp_out_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp out dir");
        dir
    }

    fn controller<'a>(
        models: &'a [String],
        num_tries: u32,
        out_dir: &'a Path,
        vcs: &'a dyn Vcs,
        agent: &'a dyn Agent,
        testbed: &'a dyn Testbed,
    ) -> AttemptController<'a> {
        AttemptController {
            models,
            num_tries,
            temperature: 0.0,
            model_name_or_path: "sweep--test",
            out_dir,
            vcs,
            agent,
            testbed,
        }
    }

    #[test]
    fn enumeration_is_attempts_outer_models_inner_with_early_stop() {
        let out_dir = temp_out_dir("enum");
        let models = vec!["m1".to_string(), "m2".to_string()];
        // First two attempts produce empty diffs; the third produces a patch
        // and every signal is positive, so (2, m1) must be the last call.
        let vcs = FakeVcs::with_patches(&["", "", "diff --git a/f b/f\n+fix\n"]);
        let agent = FakeAgent::scripted(vec![
            Some(good_report()),
            Some(good_report()),
            Some(good_report()),
        ]);
        let testbed = FakeTestbed::always_passing();
        let ctl = controller(&models, 2, &out_dir, &vcs, &agent, &testbed);

        let outcome = ctl.process_instance(&instance("inst_enum")).expect("run");
        assert_eq!(outcome, InstanceOutcome::Succeeded { tries: 2 });
        assert_eq!(agent.calls(), vec!["m1", "m2", "m1"]);

        let raw = fs::read_to_string(out_dir.join("inst_enum.json")).expect("winner file");
        let winner: Value = serde_json::from_str(&raw).expect("winner json");
        assert_eq!(winner["try"], json!(2));
        assert_eq!(winner["model"], json!("m1"));
        assert_eq!(winner["tries"], json!(2));
        assert_eq!(winner["all_results"].as_array().expect("results").len(), 3);
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn exhausted_instance_falls_back_to_strongest_candidate() {
        let out_dir = temp_out_dir("exhausted");
        let models = vec!["m1".to_string(), "m2".to_string()];
        let vcs = FakeVcs::with_patches(&["p1", "", "p2", ""]);
        let lint_only = AgentReport {
            edit_ok: Signal::No,
            lint_ok: Signal::Yes,
            added_files: vec!["src/app.py".to_string()],
            cost: 0.1,
        };
        let hopeless = AgentReport {
            edit_ok: Signal::No,
            lint_ok: Signal::No,
            added_files: vec!["src/app.py".to_string()],
            cost: 0.1,
        };
        let agent = FakeAgent::scripted(vec![
            Some(hopeless.clone()),
            Some(hopeless.clone()),
            Some(lint_only),
            Some(hopeless),
        ]);
        // Tests never pass, so nothing reaches full plausibility.
        let testbed = FakeTestbed::scripted(vec![Some(false); 4]);
        let ctl = controller(&models, 2, &out_dir, &vcs, &agent, &testbed);

        let outcome = ctl.process_instance(&instance("inst_exh")).expect("run");
        assert_eq!(outcome, InstanceOutcome::Exhausted { candidates: 4 });

        let raw = fs::read_to_string(out_dir.join("inst_exh.json")).expect("winner file");
        let winner: Value = serde_json::from_str(&raw).expect("winner json");
        // Rung patch+lint beats the earlier patch-only candidates.
        assert_eq!(winner["model_patch"], json!("p2"));
        assert_eq!(winner["try"], json!(2));
        assert_eq!(winner["model"], json!("m1"));
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn agent_faults_are_contained_and_leave_no_artifact() {
        let out_dir = temp_out_dir("faults");
        let models = vec!["m1".to_string(), "m2".to_string()];
        let vcs = FakeVcs::with_patches(&[]);
        let agent = FakeAgent::scripted(vec![None, None, None, None]);
        let testbed = FakeTestbed::always_passing();
        let ctl = controller(&models, 2, &out_dir, &vcs, &agent, &testbed);

        let outcome = ctl.process_instance(&instance("inst_fault")).expect("run");
        assert_eq!(outcome, InstanceOutcome::NoCandidates);
        assert_eq!(agent.calls().len(), 4);
        assert!(!out_dir.join("inst_fault.json").exists());
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn existing_artifact_short_circuits_the_instance() {
        let out_dir = temp_out_dir("resume");
        let models = vec!["m1".to_string()];
        fs::write(out_dir.join("inst_done.json"), "{}").expect("pre-existing artifact");
        let vcs = FakeVcs::with_patches(&["diff"]);
        let agent = FakeAgent::scripted(vec![Some(good_report())]);
        let testbed = FakeTestbed::always_passing();
        let ctl = controller(&models, 1, &out_dir, &vcs, &agent, &testbed);

        let outcome = ctl.process_instance(&instance("inst_done")).expect("run");
        assert_eq!(outcome, InstanceOutcome::AlreadyDone);
        assert!(agent.calls().is_empty());
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn stale_transcript_is_removed_before_retrying() {
        let out_dir = temp_out_dir("stale_md");
        let models = vec!["m1".to_string()];
        fs::write(out_dir.join("inst_md.md"), "old chat").expect("stale transcript");
        let vcs = FakeVcs::with_patches(&[]);
        let agent = FakeAgent::scripted(vec![None]);
        let testbed = FakeTestbed::always_passing();
        let ctl = controller(&models, 1, &out_dir, &vcs, &agent, &testbed);

        let outcome = ctl.process_instance(&instance("inst_md")).expect("run");
        assert_eq!(outcome, InstanceOutcome::NoCandidates);
        assert!(!out_dir.join("inst_md.md").exists());
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn infra_failure_records_unknown_test_signal() {
        let out_dir = temp_out_dir("infra");
        let models = vec!["m1".to_string()];
        let vcs = FakeVcs::with_patches(&["diff --git a/f b/f\n+fix\n"]);
        let agent = FakeAgent::scripted(vec![Some(good_report())]);
        let testbed = FakeTestbed::scripted(vec![None]);
        let ctl = controller(&models, 1, &out_dir, &vcs, &agent, &testbed);

        let outcome = ctl.process_instance(&instance("inst_infra")).expect("run");
        assert_eq!(outcome, InstanceOutcome::Exhausted { candidates: 1 });

        let raw = fs::read_to_string(out_dir.join("inst_infra.json")).expect("winner file");
        let winner: Value = serde_json::from_str(&raw).expect("winner json");
        assert!(winner.get("test_outcome").is_none());
        assert_eq!(winner["edit_outcome"], json!(true));
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn docker_image_combines_namespace_repo_and_version() {
        let testbed = DockerTestbed::new("aorwall".to_string(), Duration::from_secs(60));
        let inst = instance("inst_img");
        assert_eq!(
            testbed.docker_image(&inst),
            "aorwall/swe-bench-owner_project-testbed:2.1"
        );

        let mut pinned = inst;
        pinned.image = Some("example/custom:latest".to_string());
        assert_eq!(testbed.docker_image(&pinned), "example/custom:latest");
    }

    #[test]
    fn test_directives_come_from_the_test_patch() {
        let mut inst = instance("inst_dir");
        inst.test_patch = "\
diff --git a/tests/test_app.py b/tests/test_app.py
+new test
diff --git a/docs/notes.md b/docs/notes.md
+ignored
"
        .to_string();
        assert_eq!(test_directives(&inst), vec!["tests/test_app.py"]);
    }

    #[test]
    fn django_directives_become_module_paths() {
        let mut inst = instance("inst_django");
        inst.repo = "django/django".to_string();
        inst.test_patch =
            "diff --git a/tests/queries/test_qs.py b/tests/queries/test_qs.py\n+x\n".to_string();
        assert_eq!(test_directives(&inst), vec!["queries.test_qs"]);
    }

    #[test]
    fn noop_patch_carries_its_nonce() {
        let patch = noop_patch("model_patch");
        assert!(patch.starts_with("diff --git a/empty.file.model_patch.ignore"));
        assert!(patch.contains("new file mode 100644"));
    }

    #[test]
    fn failure_output_is_the_text_after_the_marker() {
        let log = format!(
            "setup noise\n{}\npartial\n{}\nFAILED tests/test_app.py\n",
            APPLIED_TEST_PATCH_MARKER, APPLIED_TEST_PATCH_MARKER
        );
        assert_eq!(pre_existing_test_failure(&log), "FAILED tests/test_app.py");
    }

    #[test]
    fn config_reports_every_missing_required_field_at_once() {
        let json: Value = json!({
            "version": "1",
            "sweep": {"models": []},
            "dataset": {},
            "agent": {},
        });
        let err = validate_required_fields(&json).expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("/sweep/prefix"), "{}", msg);
        assert!(msg.contains("/sweep/models"), "{}", msg);
        assert!(msg.contains("/dataset/path"), "{}", msg);
        assert!(msg.contains("/agent/command"), "{}", msg);
    }

    #[test]
    fn config_defaults_and_slug_are_applied() {
        let root = temp_out_dir("config");
        let cfg_path = root.join("sweep.yaml");
        fs::write(
            &cfg_path,
            "\
version: '1'
sweep:
  prefix: lite
  models: [openrouter/vendor/model-a, model-b]
dataset:
  path: datasets/bench.json
agent:
  command: [python, ./agent.py]
",
        )
        .expect("config file");
        let cfg = load_config(&cfg_path).expect("load config");
        assert_eq!(cfg.sweep.num_tries, 1);
        assert_eq!(cfg.sweep.threads, 1);
        assert_eq!(cfg.testbed.namespace, "aorwall");
        assert_eq!(cfg.testbed.timeout_seconds, 900);
        assert_eq!(
            cfg.models_slug(),
            "openrouter-vendor-model-a--model-b"
        );
        assert_eq!(
            cfg.out_dir(),
            PathBuf::from("predictions/lite--openrouter-vendor-model-a--model-b")
        );
        assert_eq!(
            cfg.model_name_or_path(),
            "sweep--openrouter-vendor-model-a--model-b"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn partitioning_skips_done_and_upstream_plausible_instances() {
        let universe: BTreeSet<String> = ["a", "b", "c", "d"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let done: BTreeSet<String> = ["b"].iter().map(|s| s.to_string()).collect();
        // An instance both done and plausible counts as done.
        let plausible: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();

        let (remaining, skipped_done, skipped_plausible) =
            partition_instances(&universe, &done, &plausible);
        assert_eq!(remaining, vec!["a".to_string(), "d".to_string()]);
        assert_eq!(skipped_done, 1);
        assert_eq!(skipped_plausible, 1);
    }

    #[test]
    fn dataset_round_trips_and_lists_problem_headlines() {
        let root = temp_out_dir("dataset");
        let path = root.join("bench.json");
        let entries = json!([
            {
                "instance_id": "proj__proj-1",
                "repo": "owner/project",
                "version": "2.1",
                "base_commit": "deadbeef",
                "problem_statement": "Crash on empty input\ndetails",
                "patch": "",
                "test_patch": "",
                "FAIL_TO_PASS": ["tests/test_app.py::test_empty"],
            }
        ]);
        fs::write(&path, serde_json::to_vec_pretty(&entries).expect("bytes")).expect("dataset");
        let dataset = load_dataset(&path).expect("load dataset");
        assert_eq!(dataset.len(), 1);
        let entry = dataset.get("proj__proj-1").expect("entry");
        assert_eq!(entry.repo, "owner/project");
        assert!(entry.extra.contains_key("FAIL_TO_PASS"));

        let problems = show_problems(&dataset);
        assert_eq!(
            problems,
            vec![(
                "proj__proj-1".to_string(),
                "Crash on empty input".to_string()
            )]
        );
        let _ = fs::remove_dir_all(root);
    }
}
