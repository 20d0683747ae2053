#![forbid(unsafe_code)]

//! Load and validate `.engram/config.yaml`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SESSION_FORMATS: [&str; 2] = ["claude-code", "codex"];

#[derive(Debug)]
pub enum ConfigError {
    NotFound(PathBuf),
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "config not found: {}", path.display()),
            Self::Io(err) => write!(f, "config io: {err}"),
            Self::Yaml(err) => write!(f, "config yaml: {err}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivingDocs {
    #[serde(default = "default_timeline")]
    pub timeline: String,
    #[serde(default = "default_concepts")]
    pub concepts: String,
    #[serde(default = "default_epistemic")]
    pub epistemic: String,
    #[serde(default = "default_workflows")]
    pub workflows: String,
}

impl Default for LivingDocs {
    fn default() -> Self {
        Self {
            timeline: default_timeline(),
            concepts: default_concepts(),
            epistemic: default_epistemic(),
            workflows: default_workflows(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Graveyard {
    #[serde(default = "default_concept_graveyard")]
    pub concepts: String,
    #[serde(default = "default_epistemic_graveyard")]
    pub epistemic: String,
}

impl Default for Graveyard {
    fn default() -> Self {
        Self {
            concepts: default_concept_graveyard(),
            epistemic: default_epistemic_graveyard(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Briefing {
    #[serde(default = "default_briefing_file")]
    pub file: String,
    #[serde(default = "default_briefing_section")]
    pub section: String,
}

impl Default for Briefing {
    fn default() -> Self {
        Self {
            file: default_briefing_file(),
            section: default_briefing_section(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sessions {
    #[serde(default = "default_session_format")]
    pub format: String,
    #[serde(default = "default_session_path")]
    pub path: String,
    #[serde(default)]
    pub project_match: Vec<String>,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            format: default_session_format(),
            path: default_session_path(),
            project_match: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sources {
    #[serde(default = "default_issues_dir")]
    pub issues: String,
    #[serde(default = "default_true")]
    pub refresh_issues: bool,
    #[serde(default)]
    pub github_repo: Option<String>,
    #[serde(default = "default_doc_dirs")]
    pub docs: Vec<String>,
    #[serde(default)]
    pub sessions: Sessions,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            issues: default_issues_dir(),
            refresh_issues: true,
            github_repo: None,
            docs: default_doc_dirs(),
            sessions: Sessions::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    /// Orphaned-concept count above which a concept triage chunk fires.
    #[serde(default = "default_orphan_triage")]
    pub orphan_triage: usize,
    /// Age in days after which a contested claim is due for review.
    #[serde(default = "default_contested_review_days")]
    pub contested_review_days: i64,
    /// Contested-claim count above which a review chunk fires.
    #[serde(default = "default_contested_review_threshold")]
    pub contested_review_threshold: usize,
    /// Age in days after which an unverified claim counts as stale.
    #[serde(default = "default_stale_unverified_days")]
    pub stale_unverified_days: i64,
    /// Stale-unverified count above which a triage chunk fires.
    #[serde(default = "default_stale_unverified_threshold")]
    pub stale_unverified_threshold: usize,
    /// CURRENT workflow count above which synthesis fires.
    #[serde(default = "default_workflow_repetition")]
    pub workflow_repetition: usize,
    /// Chunk-id distance during which synthesis is suppressed while the
    /// workflow registry hash is unchanged.
    #[serde(default = "default_synthesis_cooldown")]
    pub workflow_synthesis_cooldown_chunks: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            orphan_triage: default_orphan_triage(),
            contested_review_days: default_contested_review_days(),
            contested_review_threshold: default_contested_review_threshold(),
            stale_unverified_days: default_stale_unverified_days(),
            stale_unverified_threshold: default_stale_unverified_threshold(),
            workflow_repetition: default_workflow_repetition(),
            workflow_synthesis_cooldown_chunks: default_synthesis_cooldown(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Budget {
    #[serde(default = "default_context_limit")]
    pub context_limit_chars: usize,
    #[serde(default = "default_instructions_overhead")]
    pub instructions_overhead: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Buffer fill (chars) at which the server loop triggers a dispatch.
    #[serde(default = "default_dispatch_threshold")]
    pub dispatch_threshold_chars: usize,
    /// Cap on pre-assigned identifiers per category per chunk.
    #[serde(default = "default_max_new_ids")]
    pub max_new_ids_per_category: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            context_limit_chars: default_context_limit(),
            instructions_overhead: default_instructions_overhead(),
            max_chunk_chars: default_max_chunk_chars(),
            dispatch_threshold_chars: default_dispatch_threshold(),
            max_new_ids_per_category: default_max_new_ids(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub living_docs: LivingDocs,
    #[serde(default)]
    pub graveyard: Graveyard,
    #[serde(default)]
    pub briefing: Briefing,
    #[serde(default)]
    pub sources: Sources,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub budget: Budget,
    /// Earliest plausible artifact date; frontmatter dates before this are
    /// treated as typos and discarded.
    #[serde(default)]
    pub project_start: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Fold agent argv. When unset, `["claude", "--print", "--model", model]`.
    #[serde(default)]
    pub agent_command: Option<Vec<String>>,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            living_docs: LivingDocs::default(),
            graveyard: Graveyard::default(),
            briefing: Briefing::default(),
            sources: Sources::default(),
            thresholds: Thresholds::default(),
            budget: Budget::default(),
            project_start: None,
            poll_interval_secs: default_poll_interval(),
            agent_command: None,
            model: default_model(),
        }
    }
}

/// Resolved absolute paths of the living docs and graveyards.
#[derive(Clone, Debug)]
pub struct DocPaths {
    pub timeline: PathBuf,
    pub concepts: PathBuf,
    pub epistemic: PathBuf,
    pub workflows: PathBuf,
    pub concept_graveyard: PathBuf,
    pub epistemic_graveyard: PathBuf,
}

impl DocPaths {
    pub fn living(&self) -> [(&'static str, &Path); 4] {
        [
            ("timeline", self.timeline.as_path()),
            ("concepts", self.concepts.as_path()),
            ("epistemic", self.epistemic.as_path()),
            ("workflows", self.workflows.as_path()),
        ]
    }

    pub fn graveyards(&self) -> [(&'static str, &Path); 2] {
        [
            ("concept_graveyard", self.concept_graveyard.as_path()),
            ("epistemic_graveyard", self.epistemic_graveyard.as_path()),
        ]
    }

    /// Read living doc contents keyed by doc type; missing files read as "".
    pub fn read_living(&self) -> BTreeMap<String, String> {
        self.living()
            .iter()
            .map(|(key, path)| ((*key).to_string(), read_or_empty(path)))
            .collect()
    }

    /// Read graveyard contents keyed by doc type; missing files read as "".
    pub fn read_graveyards(&self) -> BTreeMap<String, String> {
        self.graveyards()
            .iter()
            .map(|(key, path)| ((*key).to_string(), read_or_empty(path)))
            .collect()
    }
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

impl Config {
    /// Load `.engram/config.yaml` under `project_root`.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        let config_path = project_root.join(".engram").join("config.yaml");
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let raw = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let format = self.sources.sessions.format.as_str();
        if !SESSION_FORMATS.contains(&format) {
            return Err(ConfigError::Invalid(format!(
                "unsupported session format '{format}'; built-in: {}",
                SESSION_FORMATS.join(", ")
            )));
        }
        if let Some(cmd) = &self.agent_command {
            if cmd.is_empty() {
                return Err(ConfigError::Invalid(
                    "agent_command must not be an empty list".to_string(),
                ));
            }
        }
        for (name, value) in [
            ("living_docs.timeline", &self.living_docs.timeline),
            ("living_docs.concepts", &self.living_docs.concepts),
            ("living_docs.epistemic", &self.living_docs.epistemic),
            ("living_docs.workflows", &self.living_docs.workflows),
            ("graveyard.concepts", &self.graveyard.concepts),
            ("graveyard.epistemic", &self.graveyard.epistemic),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn doc_paths(&self, project_root: &Path) -> DocPaths {
        DocPaths {
            timeline: project_root.join(&self.living_docs.timeline),
            concepts: project_root.join(&self.living_docs.concepts),
            epistemic: project_root.join(&self.living_docs.epistemic),
            workflows: project_root.join(&self.living_docs.workflows),
            concept_graveyard: project_root.join(&self.graveyard.concepts),
            epistemic_graveyard: project_root.join(&self.graveyard.epistemic),
        }
    }

    pub fn agent_argv(&self) -> Vec<String> {
        match &self.agent_command {
            Some(cmd) => cmd.clone(),
            None => vec![
                "claude".to_string(),
                "--print".to_string(),
                "--model".to_string(),
                self.model.clone(),
            ],
        }
    }

    /// Config template written by `engram init`.
    pub fn template() -> &'static str {
        CONFIG_TEMPLATE
    }
}

const CONFIG_TEMPLATE: &str = "\
living_docs:
  timeline: docs/decisions/timeline.md
  concepts: docs/decisions/concept_registry.md
  epistemic: docs/decisions/epistemic_state.md
  workflows: docs/decisions/workflow_registry.md

graveyard:
  concepts: docs/decisions/concept_graveyard.md
  epistemic: docs/decisions/epistemic_graveyard.md

briefing:
  file: CLAUDE.md
  section: \"## Project Knowledge Briefing\"

sources:
  issues: local_data/issues/
  refresh_issues: true
  github_repo: null
  docs:
    - docs/working/
    - docs/archive/
    - docs/specs/
  sessions:
    format: claude-code
    path: ~/.claude/history.jsonl
    project_match: []

thresholds:
  orphan_triage: 50
  contested_review_days: 14
  contested_review_threshold: 5
  stale_unverified_days: 30
  stale_unverified_threshold: 10
  workflow_repetition: 3
  workflow_synthesis_cooldown_chunks: 3

budget:
  context_limit_chars: 600000
  instructions_overhead: 10000
  max_chunk_chars: 200000
  dispatch_threshold_chars: 50000
  max_new_ids_per_category: 8

poll_interval_secs: 60
model: sonnet
";

fn default_timeline() -> String {
    "docs/decisions/timeline.md".to_string()
}
fn default_concepts() -> String {
    "docs/decisions/concept_registry.md".to_string()
}
fn default_epistemic() -> String {
    "docs/decisions/epistemic_state.md".to_string()
}
fn default_workflows() -> String {
    "docs/decisions/workflow_registry.md".to_string()
}
fn default_concept_graveyard() -> String {
    "docs/decisions/concept_graveyard.md".to_string()
}
fn default_epistemic_graveyard() -> String {
    "docs/decisions/epistemic_graveyard.md".to_string()
}
fn default_briefing_file() -> String {
    "CLAUDE.md".to_string()
}
fn default_briefing_section() -> String {
    "## Project Knowledge Briefing".to_string()
}
fn default_session_format() -> String {
    "claude-code".to_string()
}
fn default_session_path() -> String {
    "~/.claude/history.jsonl".to_string()
}
fn default_issues_dir() -> String {
    "local_data/issues/".to_string()
}
fn default_doc_dirs() -> Vec<String> {
    vec![
        "docs/working/".to_string(),
        "docs/archive/".to_string(),
        "docs/specs/".to_string(),
    ]
}
fn default_true() -> bool {
    true
}
fn default_orphan_triage() -> usize {
    50
}
fn default_contested_review_days() -> i64 {
    14
}
fn default_contested_review_threshold() -> usize {
    5
}
fn default_stale_unverified_days() -> i64 {
    30
}
fn default_stale_unverified_threshold() -> usize {
    10
}
fn default_workflow_repetition() -> usize {
    3
}
fn default_synthesis_cooldown() -> i64 {
    3
}
fn default_context_limit() -> usize {
    600_000
}
fn default_instructions_overhead() -> usize {
    10_000
}
fn default_max_chunk_chars() -> usize {
    200_000
}
fn default_dispatch_threshold() -> usize {
    50_000
}
fn default_max_new_ids() -> usize {
    8
}
fn default_poll_interval() -> u64 {
    60
}
fn default_model() -> String {
    "sonnet".to_string()
}
