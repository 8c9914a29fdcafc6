use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub type EntityId = i64;
pub type AuthorId = i64;
pub type TaskId = i64;
pub type SnapshotId = i64;

/// Kind of thing an entity row identifies. Files and folders come from the
/// repository tree; modules and externals are reserved for other analyzers
/// that share the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::EnumIs, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    File,
    Folder,
    Module,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::EnumIs, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Rename,
    Copy,
}

impl ChangeKind {
    /// Stable code used in the changes parquet (`change_type INT8`).
    pub fn code(&self) -> i8 {
        match self {
            Self::Add => 0,
            Self::Modify => 1,
            Self::Delete => 2,
            Self::Rename => 3,
            Self::Copy => 4,
        }
    }

    pub fn from_code(code: i8) -> anyhow::Result<Self> {
        Ok(match code {
            0 => Self::Add,
            1 => Self::Modify,
            2 => Self::Delete,
            3 => Self::Rename,
            4 => Self::Copy,
            _ => anyhow::bail!("unknown change code: {}", code),
        })
    }
}

/// Pipeline stage tags surfaced through the task row. This is a closed set;
/// pollers are allowed to match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIs, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Extracting,
    BuildingEdges,
    ComputingMetrics,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIs, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Weight columns a relationship row carries. Queries sort by one of these
/// and the clusterer thresholds on one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WeightColumn {
    Jaccard,
    JaccardWeighted,
    PairCount,
    DecayedWeight,
}

impl WeightColumn {
    pub fn sql_column(&self) -> &'static str {
        match self {
            Self::Jaccard => "weight",
            Self::JaccardWeighted => "jaccard_weighted",
            Self::PairCount => "pair_count",
            Self::DecayedWeight => "decayed_weight",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub qualified_name: String,
    pub language: Option<String>,
    pub parent_id: Option<EntityId>,
    pub total_commits: i64,
    pub insertions: i64,
    pub deletions: i64,
    pub first_change_ts: Option<i64>,
    pub last_change_ts: Option<i64>,
    pub exists_at_head: bool,
}

impl EntityRecord {
    pub fn churn(&self) -> i64 {
        self.insertions + self.deletions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub name: String,
    pub email: String,
}

/// One row of the commits parquet. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommitRow {
    pub oid: String,
    pub author_id: AuthorId,
    pub author_ts: i64,
    pub committer_id: AuthorId,
    pub committer_ts: i64,
    pub subject: String,
    pub parent_oids: Vec<String>,
    pub file_count: i32,
    pub is_merge: bool,
}

/// One row of the changes parquet: a per-commit, per-file event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChangeRow {
    pub commit_oid: String,
    pub entity_id: EntityId,
    pub kind: ChangeKind,
    pub insertions: i32,
    pub deletions: i32,
    pub old_entity_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RelationshipRow {
    pub src_id: EntityId,
    pub dst_id: EntityId,
    pub weight: f64,
    pub support_src: i64,
    pub support_dst: i64,
    pub pair_count: i64,
    pub p_dst_given_src: f64,
    pub p_src_given_dst: f64,
    pub jaccard_weighted: f64,
    pub decayed_weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComponentEdgeRow {
    pub src_id: EntityId,
    pub dst_id: EntityId,
    pub pair_count: i64,
    pub cooccurrence: i64,
    pub jaccard: f64,
    pub file_edge_count: i64,
}

/// Shared flag observed by every stage at its suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Marker error for cooperative termination. Stages return this through
/// `anyhow::Error`; the orchestrator downcasts it to pick the task reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    Timeout,
}

impl Interrupt {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task interrupted ({})", self.reason())
    }
}

impl std::error::Error for Interrupt {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_codes_round_trip() {
        for kind in [
            ChangeKind::Add,
            ChangeKind::Modify,
            ChangeKind::Delete,
            ChangeKind::Rename,
            ChangeKind::Copy,
        ] {
            assert_eq!(ChangeKind::from_code(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::BuildingEdges.to_string(), "building_edges");
        assert_eq!("computing_metrics".parse::<Stage>().unwrap(), Stage::ComputingMetrics);
    }

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
