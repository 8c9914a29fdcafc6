use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use regex::Regex;

use crate::core::WeightColumn;

pub const DEFAULT_MIN_REVISIONS: i64 = 5;
pub const DEFAULT_MAX_CHANGESET_SIZE: usize = 50;
pub const DEFAULT_MAX_LOGICAL_CHANGESET_SIZE: usize = 100;
pub const DEFAULT_MIN_COOCCURRENCE: i64 = 2;
pub const DEFAULT_COMPONENT_DEPTH: usize = 2;
pub const DEFAULT_MIN_COMPONENT_COOCCURRENCE: i64 = 2;
pub const DEFAULT_TOPK_EDGES_PER_FILE: usize = 50;
pub const DEFAULT_AUTHOR_TIME_WINDOW_HOURS: i64 = 24;
pub const DEFAULT_RENAME_SIMILARITY: f64 = 0.9;
pub const DEFAULT_TICKET_ID_PATTERN: &str = r"[A-Z][A-Z0-9]+-\d+";

/// How raw changes are grouped into logical changesets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[derive(strum::Display, strum::EnumIs, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangesetMode {
    ByCommit,
    ByAuthorTimeWindow,
    ByTicketId,
}

/// Everything an analysis run is parameterized by. Serialized verbatim into
/// the task row so a run can always be explained after the fact.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Prune entities with fewer than this many changeset appearances before
    /// pair enumeration.
    pub min_revisions: i64,
    /// Raw commits touching more files than this are excluded from coupling
    /// math (but kept in the commits table and per-file stats).
    pub max_changeset_size: usize,
    /// Grouped changesets larger than this are dropped entirely.
    pub max_logical_changeset_size: usize,
    pub changeset_mode: ChangesetMode,
    pub author_time_window_hours: i64,
    /// Regex extracting a ticket id from the commit subject. The first
    /// capture group is used when present, otherwise the whole match.
    pub ticket_id_pattern: Option<String>,
    pub min_cooccurrence: i64,
    pub component_depth: usize,
    pub min_component_cooccurrence: i64,
    /// Consider only commits whose committer time is within the last N days.
    pub window_days: Option<i64>,
    /// Unix seconds, inclusive lower bound on committer time.
    pub since: Option<i64>,
    /// Unix seconds, inclusive upper bound on committer time.
    pub until: Option<i64>,
    /// When set, an exponentially decayed weight column is computed with
    /// this half-life.
    pub decay_half_life_days: Option<f64>,
    pub topk_edges_per_file: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Name+content similarity threshold for rename/copy detection.
    pub rename_similarity: f64,
    /// Spill the active-pair map to disk past this many live pairs.
    pub max_active_pairs: usize,
    /// Per-stage deadlines in seconds: extraction, edges, clustering.
    pub extraction_timeout_secs: u64,
    pub edges_timeout_secs: u64,
    pub clustering_timeout_secs: u64,
    /// When present, a completed run also clusters the graph and persists a
    /// snapshot.
    pub clustering: Option<ClusteringConfig>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_revisions: DEFAULT_MIN_REVISIONS,
            max_changeset_size: DEFAULT_MAX_CHANGESET_SIZE,
            max_logical_changeset_size: DEFAULT_MAX_LOGICAL_CHANGESET_SIZE,
            changeset_mode: ChangesetMode::ByCommit,
            author_time_window_hours: DEFAULT_AUTHOR_TIME_WINDOW_HOURS,
            ticket_id_pattern: None,
            min_cooccurrence: DEFAULT_MIN_COOCCURRENCE,
            component_depth: DEFAULT_COMPONENT_DEPTH,
            min_component_cooccurrence: DEFAULT_MIN_COMPONENT_COOCCURRENCE,
            window_days: None,
            since: None,
            until: None,
            decay_half_life_days: None,
            topk_edges_per_file: DEFAULT_TOPK_EDGES_PER_FILE,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            rename_similarity: DEFAULT_RENAME_SIMILARITY,
            max_active_pairs: 4_000_000,
            extraction_timeout_secs: 3600,
            edges_timeout_secs: 1800,
            clustering_timeout_secs: 600,
            clustering: None,
        }
    }
}

impl AnalysisConfig {
    /// Check everything that should fail the request before a task row is
    /// created: bad globs, bad regexes, unknown algorithms, nonsense bounds.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rename_similarity) {
            bail!("rename_similarity must be within [0, 1]");
        }

        if self.min_revisions < 0 || self.min_cooccurrence < 1 {
            bail!("min_revisions must be >= 0 and min_cooccurrence >= 1");
        }

        if self.component_depth == 0 {
            bail!("component_depth must be at least 1");
        }

        if let Some(days) = self.decay_half_life_days {
            if days <= 0.0 {
                bail!("decay_half_life_days must be positive");
            }
        }

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                bail!("'since' must not be later than 'until'");
            }
        }

        self.ticket_regex()?;
        self.path_filter()?;

        if let Some(clustering) = &self.clustering {
            clustering.validate()?;
        }

        Ok(())
    }

    pub fn ticket_regex(&self) -> Result<Regex> {
        let pattern = self.ticket_id_pattern.as_deref().unwrap_or(DEFAULT_TICKET_ID_PATTERN);
        Regex::new(pattern).with_context(|| format!("invalid ticket_id_pattern: '{}'", pattern))
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        PathFilter::new(&self.include_patterns, &self.exclude_patterns)
    }

    /// Effective committer-time lower bound, folding `window_days` into
    /// `since` relative to the given reference time.
    pub fn effective_since(&self, reference_ts: i64) -> Option<i64> {
        let window = self.window_days.map(|days| reference_ts - days * 86_400);
        match (self.since, window) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Parameters of a clustering pass over the persisted relationship graph.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub algorithm: String,
    pub weight_column: WeightColumn,
    pub min_weight: f64,
    /// Restrict the graph to entities whose current path starts with this
    /// folder.
    pub folder: Option<String>,
    pub resolution: f64,
    pub seed: u64,
    pub max_iterations: usize,
    pub linkage: Linkage,
    pub cut_threshold: f64,
    pub eps: f64,
    pub min_samples: usize,
    /// Optional snapshot name; defaults to one derived from the task id.
    pub snapshot_name: Option<String>,
    pub snapshot_tags: Vec<String>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            algorithm: "louvain".to_string(),
            weight_column: WeightColumn::Jaccard,
            min_weight: 0.1,
            folder: None,
            resolution: 1.0,
            seed: 0,
            max_iterations: 100,
            linkage: Linkage::Average,
            cut_threshold: 0.7,
            eps: 0.6,
            min_samples: 2,
            snapshot_name: None,
            snapshot_tags: Vec::new(),
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<()> {
        if !crate::clustering::ALGORITHM_NAMES.contains(&self.algorithm.as_str()) {
            bail!(
                "unknown clustering algorithm '{}' (expected one of: {})",
                self.algorithm,
                crate::clustering::ALGORITHM_NAMES.join(", ")
            );
        }

        if self.min_weight < 0.0 {
            bail!("min_weight must be non-negative");
        }

        if !(0.0..=1.0).contains(&self.eps) {
            bail!("eps is a distance on 1 - weight and must be within [0, 1]");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    Average,
    Complete,
}

/// Compiled include/exclude globs. An empty include set admits everything.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = if include.is_empty() { None } else { Some(Self::build(include)?) };
        Ok(Self { include, exclude: Self::build(exclude)? })
    }

    fn build(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob =
                Glob::new(pattern).with_context(|| format!("invalid glob: '{}'", pattern))?;
            builder.add(glob);
        }

        Ok(builder.build()?)
    }

    pub fn includes(&self, path: &str) -> bool {
        if self.exclude.is_match(path) {
            return false;
        }

        self.include.as_ref().map_or(true, |set| set.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AnalysisConfig::default();
        assert_eq!(config.min_revisions, 5);
        assert_eq!(config.max_changeset_size, 50);
        assert_eq!(config.max_logical_changeset_size, 100);
        assert_eq!(config.topk_edges_per_file, 50);
        assert_eq!(config.component_depth, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_glob_is_an_input_error() {
        let config = AnalysisConfig {
            include_patterns: vec!["src/[".to_string()],
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_ticket_pattern_is_an_input_error() {
        let config = AnalysisConfig {
            ticket_id_pattern: Some("(".to_string()),
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_algorithm_is_an_input_error() {
        let clustering =
            ClusteringConfig { algorithm: "kmeans".to_string(), ..ClusteringConfig::default() };
        let config =
            AnalysisConfig { clustering: Some(clustering), ..AnalysisConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn path_filter_defaults_to_everything() {
        let filter = PathFilter::new(&[], &[]).unwrap();
        assert!(filter.includes("any/path/at_all.rs"));
    }

    #[test]
    fn path_filter_applies_both_sides() {
        let include = vec!["src/**".to_string()];
        let exclude = vec!["src/generated/**".to_string()];
        let filter = PathFilter::new(&include, &exclude).unwrap();
        assert!(filter.includes("src/lib.rs"));
        assert!(!filter.includes("docs/readme.md"));
        assert!(!filter.includes("src/generated/schema.rs"));
    }

    #[test]
    fn window_days_folds_into_since() {
        let config =
            AnalysisConfig { window_days: Some(10), ..AnalysisConfig::default() };
        assert_eq!(config.effective_since(1_000_000), Some(1_000_000 - 10 * 86_400));

        let config = AnalysisConfig {
            window_days: Some(10),
            since: Some(999_999_999),
            ..AnalysisConfig::default()
        };
        assert_eq!(config.effective_since(1_000_000), Some(999_999_999));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = AnalysisConfig {
            changeset_mode: ChangesetMode::ByTicketId,
            decay_half_life_days: Some(90.0),
            clustering: Some(ClusteringConfig::default()),
            ..AnalysisConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: AnalysisConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.changeset_mode, ChangesetMode::ByTicketId);
        assert_eq!(back.decay_half_life_days, Some(90.0));
        assert!(back.clustering.is_some());
    }
}
