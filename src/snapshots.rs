use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::Context;
use anyhow::Result;
use itertools::Itertools;

use crate::clustering::smart_name;
use crate::core::EntityId;
use crate::core::SnapshotId;
use crate::storage::DataLayout;

const MAX_HOT_FILES: usize = 10;
const MAX_TOP_COMMITS: usize = 5;
const MAX_COMMON_AUTHORS: usize = 5;

/// Immutable recording of a clustering result plus its parameters. The
/// body lives in `snapshots/{id}.json`; only name and tags may change
/// afterwards, and those are index metadata.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub name: String,
    pub tags: Vec<String>,
    pub algorithm: String,
    pub parameters: serde_json::Value,
    pub created_at: i64,
    pub repo_head_oid: String,
    pub clusters: Vec<ClusterRecord>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClusterRecord {
    pub id: i64,
    pub name: String,
    pub size: usize,
    pub entity_ids: Vec<EntityId>,
    pub files: Vec<String>,
    pub total_churn: i64,
    pub avg_coupling: f64,
    pub hot_files: Vec<HotFile>,
    pub top_commits: Vec<TopCommit>,
    pub common_authors: Vec<CommonAuthor>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HotFile {
    pub path: String,
    pub churn: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TopCommit {
    pub oid: String,
    pub message: String,
    pub author: String,
    pub file_count: i32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommonAuthor {
    pub name: String,
    pub email: String,
    pub commit_count: i64,
}

pub fn save_snapshot(layout: &DataLayout, snapshot: &Snapshot) -> Result<()> {
    let path = layout.snapshot_json(snapshot.id);
    let text = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(&path, text)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    Ok(())
}

pub fn load_snapshot(layout: &DataLayout, id: SnapshotId) -> Result<Snapshot> {
    let path = layout.snapshot_json(id);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("snapshot {} not found", id))?;
    Ok(serde_json::from_str(&text)?)
}

pub fn delete_snapshot_file(layout: &DataLayout, id: SnapshotId) -> Result<()> {
    let path = layout.snapshot_json(id);
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Everything the aggregate builder needs, pre-fetched by the caller so
/// this stays pure and testable.
pub struct ClusterInputs<'a> {
    pub partition: &'a [Vec<EntityId>],
    /// Intra-cluster edge weights, canonical `(min, max)` keys.
    pub weights: &'a HashMap<(EntityId, EntityId), f64>,
    /// Display path per logical entity.
    pub paths: &'a HashMap<EntityId, String>,
    pub churn: &'a HashMap<EntityId, i64>,
    /// Commit oids touching each logical entity.
    pub commits_of: &'a HashMap<EntityId, Vec<String>>,
    pub commits: &'a HashMap<String, CommitSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub subject: String,
    pub author_name: String,
    pub author_email: String,
    pub file_count: i32,
    pub committer_ts: i64,
}

pub fn build_cluster_records(inputs: &ClusterInputs<'_>) -> Vec<ClusterRecord> {
    let mut records = Vec::with_capacity(inputs.partition.len());

    for (index, members) in inputs.partition.iter().enumerate() {
        let files: Vec<String> = members
            .iter()
            .filter_map(|id| inputs.paths.get(id).cloned())
            .sorted()
            .collect();

        let total_churn: i64 =
            members.iter().filter_map(|id| inputs.churn.get(id)).sum();

        let mut weight_sum = 0.0;
        let mut weight_count = 0usize;
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if let Some(&w) = inputs.weights.get(&(a.min(b), a.max(b))) {
                    weight_sum += w;
                    weight_count += 1;
                }
            }
        }
        let avg_coupling = if weight_count > 0 { weight_sum / weight_count as f64 } else { 0.0 };

        let hot_files: Vec<HotFile> = members
            .iter()
            .filter_map(|id| {
                let path = inputs.paths.get(id)?;
                Some(HotFile { path: path.clone(), churn: inputs.churn.get(id).copied().unwrap_or(0) })
            })
            .sorted_by(|a, b| b.churn.cmp(&a.churn).then_with(|| a.path.cmp(&b.path)))
            .take(MAX_HOT_FILES)
            .collect();

        // Commits ranked by how many cluster members they touched.
        let mut touched: HashMap<&str, usize> = HashMap::new();
        for member in members {
            if let Some(oids) = inputs.commits_of.get(member) {
                for oid in oids {
                    *touched.entry(oid.as_str()).or_default() += 1;
                }
            }
        }

        let top_commits: Vec<TopCommit> = touched
            .iter()
            .filter_map(|(&oid, &count)| {
                let summary = inputs.commits.get(oid)?;
                Some((oid, count, summary))
            })
            .sorted_by(|a, b| {
                b.1.cmp(&a.1)
                    .then_with(|| b.2.committer_ts.cmp(&a.2.committer_ts))
                    .then_with(|| a.0.cmp(b.0))
            })
            .take(MAX_TOP_COMMITS)
            .map(|(oid, _, summary)| TopCommit {
                oid: oid.to_string(),
                message: summary.subject.clone(),
                author: summary.author_name.clone(),
                file_count: summary.file_count,
            })
            .collect();

        let mut author_commits: HashMap<(&str, &str), HashSet<&str>> = HashMap::new();
        for (&oid, _) in &touched {
            if let Some(summary) = inputs.commits.get(oid) {
                author_commits
                    .entry((summary.author_name.as_str(), summary.author_email.as_str()))
                    .or_default()
                    .insert(oid);
            }
        }

        let common_authors: Vec<CommonAuthor> = author_commits
            .into_iter()
            .map(|((name, email), oids)| CommonAuthor {
                name: name.to_string(),
                email: email.to_string(),
                commit_count: oids.len() as i64,
            })
            .sorted_by(|a, b| b.commit_count.cmp(&a.commit_count).then_with(|| a.email.cmp(&b.email)))
            .take(MAX_COMMON_AUTHORS)
            .collect();

        let name = match smart_name(&files.iter().map(String::as_str).collect::<Vec<_>>()) {
            Some(name) => name,
            None => format!("Cluster {}", index + 1),
        };

        records.push(ClusterRecord {
            id: index as i64 + 1,
            name,
            size: members.len(),
            entity_ids: members.clone(),
            files,
            total_churn,
            avg_coupling,
            hot_files,
            top_commits,
            common_authors,
        });
    }

    records
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DriftClass {
    Stable,
    Drifted,
    Dissolved,
    New,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComparisonEntry {
    pub base_cluster: Option<i64>,
    pub head_cluster: Option<i64>,
    pub overlap: f64,
    pub classification: DriftClass,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SnapshotComparison {
    pub base_id: SnapshotId,
    pub head_id: SnapshotId,
    pub entries: Vec<ComparisonEntry>,
}

/// Match clusters between two snapshots by member-set jaccard overlap:
/// ≥ 0.7 stable, ≥ 0.3 drifted, below that dissolved; head clusters with
/// no qualifying predecessor are new.
pub fn compare(base: &Snapshot, head: &Snapshot) -> SnapshotComparison {
    let head_sets: Vec<(i64, HashSet<EntityId>)> = head
        .clusters
        .iter()
        .map(|c| (c.id, c.entity_ids.iter().copied().collect()))
        .collect();

    let mut entries = Vec::new();
    let mut claimed: HashSet<i64> = HashSet::new();

    for cluster in &base.clusters {
        let members: HashSet<EntityId> = cluster.entity_ids.iter().copied().collect();

        let best = head_sets
            .iter()
            .map(|(id, set)| (*id, overlap(&members, set)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .filter(|&(_, score)| score > 0.0);

        let entry = match best {
            Some((head_id, score)) if score >= 0.7 => {
                claimed.insert(head_id);
                ComparisonEntry {
                    base_cluster: Some(cluster.id),
                    head_cluster: Some(head_id),
                    overlap: score,
                    classification: DriftClass::Stable,
                }
            }
            Some((head_id, score)) if score >= 0.3 => {
                claimed.insert(head_id);
                ComparisonEntry {
                    base_cluster: Some(cluster.id),
                    head_cluster: Some(head_id),
                    overlap: score,
                    classification: DriftClass::Drifted,
                }
            }
            other => ComparisonEntry {
                base_cluster: Some(cluster.id),
                head_cluster: None,
                overlap: other.map_or(0.0, |(_, score)| score),
                classification: DriftClass::Dissolved,
            },
        };

        entries.push(entry);
    }

    for (head_id, set) in &head_sets {
        if claimed.contains(head_id) {
            continue;
        }

        let best = base
            .clusters
            .iter()
            .map(|c| overlap(&c.entity_ids.iter().copied().collect(), set))
            .fold(0.0f64, f64::max);

        if best < 0.3 {
            entries.push(ComparisonEntry {
                base_cluster: None,
                head_cluster: Some(*head_id),
                overlap: best,
                classification: DriftClass::New,
            });
        }
    }

    SnapshotComparison { base_id: base.id, head_id: head.id, entries }
}

fn overlap(a: &HashSet<EntityId>, b: &HashSet<EntityId>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
