use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use rusqlite::params;
use rusqlite::Connection;

use crate::changesets::Shaper;
use crate::clustering::AlgorithmRegistry;
use crate::clustering::ClusterParams;
use crate::clustering::CouplingGraph;
use crate::config::AnalysisConfig;
use crate::config::ClusteringConfig;
use crate::core::CancellationToken;
use crate::core::EntityId;
use crate::core::EntityKind;
use crate::core::Interrupt;
use crate::core::RelationshipRow;
use crate::core::SnapshotId;
use crate::core::Stage;
use crate::core::TaskId;
use crate::core::WeightColumn;
use crate::edges;
use crate::lineage::LineageMap;
use crate::snapshots;
use crate::snapshots::ClusterInputs;
use crate::snapshots::CommitSummary;
use crate::snapshots::Snapshot;
use crate::storage;
use crate::storage::DataLayout;
use crate::storage::Store;
use crate::tables;

pub const ANALYZER_TYPE: &str = "git_cochange";

/// Bounded hand-off between the shaper and the edge builder.
const CHANGESET_QUEUE: usize = 1_024;

pub type Observer<'a> = &'a (dyn Fn(Stage, f64, u64, u64) + Sync);

/// Run the four-stage pipeline as a single analysis task. Returns the task
/// id; the task row carries state, stage, progress and failure details.
///
/// A second call while a task is in flight returns the existing task id
/// without starting anything.
pub fn run_analysis(
    repo_root: &Path,
    data_root: &Path,
    config: &AnalysisConfig,
    token: CancellationToken,
    observer: Option<Observer<'_>>,
) -> Result<TaskId> {
    // Input errors fail the request before any task row exists.
    config.validate()?;
    git2::Repository::open(repo_root)
        .with_context(|| format!("no git repository at {}", repo_root.display()))?;

    let repo_id = storage::repo_id(repo_root)?;
    let layout = DataLayout::new(data_root, &repo_id);
    layout.ensure_dirs()?;
    tables::clean_partials(&layout.parquet_dir())?;

    let mut store = Store::open(layout.db_path())?;
    store.set_meta("repo_root", &repo_root.to_string_lossy())?;

    if let Some(task) = store.running_task()? {
        log::info!("task {} is already in flight for this repository", task.id);
        return Ok(task.id);
    }

    let config_json = serde_json::to_string(config)?;
    let task_id = store.create_task(ANALYZER_TYPE, &config_json)?;

    let mut ticker = TaskTicker::new(&layout.db_path(), task_id, token, observer)?;

    match run_stages(repo_root, config, task_id, &mut store, &layout, &mut ticker) {
        Ok(()) => Ok(task_id),
        Err(error) => {
            let stage = ticker.stage;
            tables::clean_partials(&layout.parquet_dir()).ok();

            let reason = match error.downcast_ref::<Interrupt>() {
                Some(interrupt) => interrupt.reason().to_string(),
                None => error.to_string(),
            };

            store.fail_task(task_id, stage, &reason)?;
            log::error!("task {} failed at {}: {}", task_id, stage, reason);
            Err(error)
        }
    }
}

fn run_stages(
    repo_root: &Path,
    config: &AnalysisConfig,
    task_id: TaskId,
    store: &mut Store,
    layout: &DataLayout,
    ticker: &mut TaskTicker<'_>,
) -> Result<()> {
    // Stage 1: history extraction.
    ticker.set_stage(Stage::Extracting, config.extraction_timeout_secs)?;
    let start = Instant::now();

    let summary = crate::extraction::extract(repo_root, config, task_id, store, layout, &mut |p, t| {
        ticker.tick(p, t)
    })?;

    log::info!(
        "Extracted {} commit(s), {} change(s) in {}ms.",
        summary.commit_count,
        summary.change_count,
        start.elapsed().as_millis()
    );
    ticker.set_counts(store.entity_count()?, 0)?;

    // Stage 2 + 3: changeset shaping and edge building.
    ticker.set_stage(Stage::BuildingEdges, config.edges_timeout_secs)?;
    let start = Instant::now();

    let lineage = LineageMap::new(&store.load_lineage()?);
    let commits = tables::read_commits(layout.commits_parquet())?;

    let mut shaper = Shaper::new(config, &lineage, commits)?;
    tables::scan_changes(layout.changes_parquet(), |change| {
        shaper.add(&change);
        Ok(())
    })?;
    let shaped = shaper.finish();

    if !shaped.log.is_empty() {
        store.append_validation(Some(task_id), &shaped.log)?;
    }

    let component_of = component_map(store, &lineage, config.component_depth)?;

    let (sender, receiver) = crossbeam_channel::bounded(CHANGESET_QUEUE);
    let changesets = shaped.changesets;
    let feeder = std::thread::spawn(move || {
        for changeset in changesets {
            if sender.send(changeset).is_err() {
                break;
            }
        }
    });

    let outcome = edges::build_edges(
        config,
        summary.max_committer_ts,
        receiver.into_iter(),
        &component_of,
        &mut |p, t| ticker.tick(p, t),
    );
    feeder.join().map_err(|_| anyhow!("changeset feeder thread panicked"))?;
    let outcome = outcome?;

    log::info!(
        "Built {} edge(s) from {} changeset(s) in {}ms ({} entities pruned below min_revisions).",
        outcome.relationships.len(),
        outcome.changeset_count,
        start.elapsed().as_millis(),
        outcome.pruned_entities
    );

    // Stage 4: clustering (when configured), then the single durable
    // relationship swap that completes the task.
    let snapshot = match &config.clustering {
        Some(clustering) => {
            ticker.set_stage(Stage::ComputingMetrics, config.clustering_timeout_secs)?;
            let snapshot = build_snapshot(
                store,
                layout,
                &lineage,
                clustering,
                &outcome.relationships,
                &format!("run {}", task_id),
            )?;
            Some(snapshot)
        }
        None => None,
    };

    store.commit_run(
        task_id,
        &outcome.relationships,
        &outcome.component_edges,
        store.entity_count()?,
    )?;

    if let Some(snapshot) = snapshot {
        let id = persist_snapshot(store, layout, snapshot)?;
        log::info!("Saved clustering snapshot {}.", id);
    }

    Ok(())
}

/// Map every logical file to its component: the folder entity at the
/// configured path-prefix depth of its current path. Root-level files have
/// no component and stay out of the projection.
fn component_map(
    store: &Store,
    lineage: &LineageMap,
    depth: usize,
) -> Result<HashMap<EntityId, EntityId>> {
    let mut map = HashMap::new();

    for entity in store.list_entities(EntityKind::File)? {
        if lineage.root_of(entity.id) != entity.id {
            continue;
        }

        let tip = lineage.tip_of(entity.id);
        let path = match store.entity(tip)? {
            Some(tip_entity) => tip_entity.qualified_name,
            None => continue,
        };

        let directories: Vec<&str> = match path.rsplit_once('/') {
            Some((dirs, _)) => dirs.split('/').collect(),
            None => continue,
        };

        let prefix = directories[..depth.min(directories.len())].join("/");

        if let Some(folder) = store.entity_by_name(EntityKind::Folder, &prefix)? {
            map.insert(entity.id, folder.id);
        }
    }

    Ok(map)
}

/// Cluster the persisted relationship graph without re-running the
/// pipeline and persist the result as a snapshot.
pub fn cluster_existing(
    repo_root: &Path,
    data_root: &Path,
    clustering: &ClusteringConfig,
    name: Option<&str>,
) -> Result<SnapshotId> {
    clustering.validate()?;

    let repo_id = storage::repo_id(repo_root)?;
    let layout = DataLayout::new(data_root, &repo_id);
    let store = Store::open(layout.db_path())?;

    let relationships = load_relationships(&store)?;
    if relationships.is_empty() {
        anyhow::bail!("no relationships persisted for this repository; run `analyze` first");
    }

    let lineage = LineageMap::new(&store.load_lineage()?);
    let fallback = format!("{} snapshot", clustering.algorithm);
    let snapshot = build_snapshot(
        &store,
        &layout,
        &lineage,
        clustering,
        &relationships,
        name.unwrap_or(&fallback),
    )?;

    persist_snapshot(&store, &layout, snapshot)
}

fn load_relationships(store: &Store) -> Result<Vec<RelationshipRow>> {
    let mut stmt = store.conn().prepare_cached(
        "SELECT src_id, dst_id, weight, support_src, support_dst, pair_count, \
         p_dst_given_src, p_src_given_dst, jaccard_weighted, decayed_weight \
         FROM relationships WHERE source_type = 'git' ORDER BY src_id, dst_id",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(RelationshipRow {
            src_id: row.get(0)?,
            dst_id: row.get(1)?,
            weight: row.get(2)?,
            support_src: row.get(3)?,
            support_dst: row.get(4)?,
            pair_count: row.get(5)?,
            p_dst_given_src: row.get(6)?,
            p_src_given_dst: row.get(7)?,
            jaccard_weighted: row.get(8)?,
            decayed_weight: row.get(9)?,
        })
    })?;

    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn selected_weight(row: &RelationshipRow, column: WeightColumn) -> f64 {
    match column {
        WeightColumn::Jaccard => row.weight,
        WeightColumn::JaccardWeighted => row.jaccard_weighted,
        WeightColumn::PairCount => row.pair_count as f64,
        WeightColumn::DecayedWeight => row.decayed_weight.unwrap_or(0.0),
    }
}

/// Run the configured algorithm over the relationship snapshot and build
/// the full snapshot record (aggregates included, not yet persisted).
fn build_snapshot(
    store: &Store,
    layout: &DataLayout,
    lineage: &LineageMap,
    clustering: &ClusteringConfig,
    relationships: &[RelationshipRow],
    default_name: &str,
) -> Result<Snapshot> {
    let mut paths: HashMap<EntityId, String> = HashMap::new();
    let mut churn: HashMap<EntityId, i64> = HashMap::new();

    for entity in store.list_entities(EntityKind::File)? {
        if lineage.root_of(entity.id) != entity.id {
            continue;
        }
        let tip = lineage.tip_of(entity.id);
        let path = match store.entity(tip)? {
            Some(tip_entity) => tip_entity.qualified_name,
            None => entity.qualified_name.clone(),
        };
        paths.insert(entity.id, path);
        churn.insert(entity.id, entity.churn());
    }

    let restricted = |id: EntityId| match &clustering.folder {
        Some(folder) => paths.get(&id).map_or(false, |p| p.starts_with(folder.as_str())),
        None => true,
    };

    let pairs: Vec<(EntityId, EntityId, f64)> = relationships
        .iter()
        .filter(|r| restricted(r.src_id) && restricted(r.dst_id))
        .map(|r| (r.src_id, r.dst_id, selected_weight(r, clustering.weight_column)))
        .collect();

    let graph = CouplingGraph::build(&pairs, clustering.min_weight);
    let registry = AlgorithmRegistry::standard();
    let algorithm = registry.get(&clustering.algorithm)?;
    let partition = algorithm.run(&graph, &ClusterParams::from(clustering))?;

    let weights: HashMap<(EntityId, EntityId), f64> = relationships
        .iter()
        .map(|r| ((r.src_id, r.dst_id), selected_weight(r, clustering.weight_column)))
        .collect();

    let members: std::collections::HashSet<EntityId> =
        partition.iter().flatten().copied().collect();

    let mut commits_of: HashMap<EntityId, Vec<String>> = HashMap::new();
    tables::scan_changes(layout.changes_parquet(), |change| {
        let root = lineage.root_of(change.entity_id);
        if members.contains(&root) {
            commits_of.entry(root).or_default().push(change.commit_oid);
        }
        Ok(())
    })?;

    let mut commits: HashMap<String, CommitSummary> = HashMap::new();
    tables::scan_commits(layout.commits_parquet(), |commit| {
        let author = store.author(commit.author_id)?;
        let (author_name, author_email) = match author {
            Some(author) => (author.name, author.email),
            None => (String::new(), String::new()),
        };
        commits.insert(
            commit.oid.clone(),
            CommitSummary {
                subject: commit.subject,
                author_name,
                author_email,
                file_count: commit.file_count,
                committer_ts: commit.committer_ts,
            },
        );
        Ok(())
    })?;

    let clusters = snapshots::build_cluster_records(&ClusterInputs {
        partition: &partition,
        weights: &weights,
        paths: &paths,
        churn: &churn,
        commits_of: &commits_of,
        commits: &commits,
    });

    let name = clustering.snapshot_name.clone().unwrap_or_else(|| default_name.to_string());
    let repo_head_oid = store.meta("head_oid")?.unwrap_or_default();

    Ok(Snapshot {
        id: 0,
        name,
        tags: clustering.snapshot_tags.clone(),
        algorithm: clustering.algorithm.clone(),
        parameters: serde_json::to_value(clustering)?,
        created_at: storage::now_ts(),
        repo_head_oid,
        clusters,
    })
}

fn persist_snapshot(store: &Store, layout: &DataLayout, mut snapshot: Snapshot) -> Result<SnapshotId> {
    let id = store.insert_snapshot_row(
        &snapshot.name,
        &snapshot.tags,
        &snapshot.algorithm,
        &serde_json::to_string(&snapshot.parameters)?,
        snapshot.created_at,
        &snapshot.repo_head_oid,
        snapshot.clusters.len() as i64,
    )?;

    snapshot.id = id;
    snapshots::save_snapshot(layout, &snapshot)?;
    Ok(id)
}

/// Writes task progress through its own connection so pollers see updates
/// while a stage holds the main write handle. Checks cancellation and the
/// per-stage deadline at every tick.
pub struct TaskTicker<'a> {
    conn: Connection,
    task_id: TaskId,
    token: CancellationToken,
    observer: Option<Observer<'a>>,
    stage: Stage,
    deadline: Instant,
    last_write: Instant,
    last_progress: f64,
}

impl<'a> TaskTicker<'a> {
    pub fn new(
        db_path: &PathBuf,
        task_id: TaskId,
        token: CancellationToken,
        observer: Option<Observer<'a>>,
    ) -> Result<Self> {
        let conn = Store::open_reader(db_path)?;
        Ok(Self {
            conn,
            task_id,
            token,
            observer,
            stage: Stage::Queued,
            deadline: Instant::now() + Duration::from_secs(3600),
            last_write: Instant::now(),
            last_progress: 0.0,
        })
    }

    pub fn set_stage(&mut self, stage: Stage, timeout_secs: u64) -> Result<()> {
        self.stage = stage;
        self.deadline = Instant::now() + Duration::from_secs(timeout_secs);
        self.last_progress = 0.0;
        self.last_write = Instant::now();

        self.conn.execute(
            "UPDATE analysis_tasks SET state = 'running', stage = ?2, progress = 0 WHERE id = ?1",
            params![self.task_id, stage.to_string()],
        )?;

        if let Some(observer) = self.observer {
            observer(stage, 0.0, 0, 0);
        }

        Ok(())
    }

    /// Suspension point: checks the cancellation flag and the stage
    /// deadline, then writes a throttled progress update (at most every
    /// 2 s and 1 % of progress).
    pub fn tick(&mut self, processed: u64, total: u64) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(anyhow::Error::new(Interrupt::Cancelled));
        }

        if Instant::now() > self.deadline {
            return Err(anyhow::Error::new(Interrupt::Timeout));
        }

        let progress = if total > 0 { processed as f64 / total as f64 } else { 0.0 };

        if let Some(observer) = self.observer {
            observer(self.stage, progress, processed, total);
        }

        let due = self.last_write.elapsed() >= Duration::from_secs(2)
            && progress - self.last_progress >= 0.01;

        if due {
            self.conn.execute(
                "UPDATE analysis_tasks SET progress = ?2, processed = ?3, total = ?4 WHERE id = ?1",
                params![self.task_id, progress, processed as i64, total as i64],
            )?;
            self.last_write = Instant::now();
            self.last_progress = progress;
        }

        Ok(())
    }

    pub fn set_counts(&mut self, entity_count: i64, relationship_count: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE analysis_tasks SET entity_count = ?2, relationship_count = ?3 WHERE id = ?1",
            params![self.task_id, entity_count, relationship_count],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_reports_cancellation_as_interrupt() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path(), "r1");
        layout.ensure_dirs().unwrap();
        let store = Store::open(layout.db_path()).unwrap();
        let task_id = store.create_task(ANALYZER_TYPE, "{}").unwrap();

        let token = CancellationToken::new();
        let mut ticker = TaskTicker::new(&layout.db_path(), task_id, token.clone(), None).unwrap();
        ticker.set_stage(Stage::Extracting, 3600).unwrap();

        assert!(ticker.tick(1, 10).is_ok());

        token.cancel();
        let error = ticker.tick(2, 10).unwrap_err();
        assert_eq!(error.downcast_ref::<Interrupt>(), Some(&Interrupt::Cancelled));
    }

    #[test]
    fn ticker_reports_deadline_as_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path(), "r1");
        layout.ensure_dirs().unwrap();
        let store = Store::open(layout.db_path()).unwrap();
        let task_id = store.create_task(ANALYZER_TYPE, "{}").unwrap();

        let mut ticker =
            TaskTicker::new(&layout.db_path(), task_id, CancellationToken::new(), None).unwrap();
        ticker.set_stage(Stage::BuildingEdges, 0).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let error = ticker.tick(1, 10).unwrap_err();
        assert_eq!(error.downcast_ref::<Interrupt>(), Some(&Interrupt::Timeout));
    }
}
