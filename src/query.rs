use std::collections::BTreeMap;
use std::collections::HashSet;

use anyhow::bail;
use anyhow::Result;
use itertools::Itertools;
use rusqlite::params;

use crate::core::EntityId;
use crate::core::EntityKind;
use crate::core::SnapshotId;
use crate::core::TaskId;
use crate::core::WeightColumn;
use crate::lineage::LineageMap;
use crate::snapshots;
use crate::snapshots::Snapshot;
use crate::snapshots::SnapshotComparison;
use crate::storage::DataLayout;
use crate::storage::SnapshotMetaRow;
use crate::storage::Store;
use crate::storage::TaskRow;
use crate::tables;

/// `limit`/`offset` page through every list endpoint; both always apply.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Page {
    fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[derive(strum::Display, strum::EnumString)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HotspotSort {
    Commits,
    Churn,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Hotspot {
    pub entity_id: EntityId,
    pub path: String,
    pub total_commits: i64,
    pub churn: i64,
    pub last_change_ts: Option<i64>,
    pub exists_at_head: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CouplingNeighbor {
    pub entity_id: EntityId,
    pub path: String,
    pub jaccard: f64,
    pub jaccard_weighted: f64,
    pub pair_count: i64,
    pub support: i64,
    pub p_neighbor_given_path: f64,
    pub p_path_given_neighbor: f64,
    pub decayed_weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CouplingResult {
    pub entity_id: EntityId,
    pub path: String,
    pub support: i64,
    pub neighbors: Vec<CouplingNeighbor>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GraphNode {
    pub entity_id: EntityId,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GraphEdge {
    pub src_id: EntityId,
    pub dst_id: EntityId,
    pub weight: f64,
    pub pair_count: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EvidenceCommit {
    pub oid: String,
    pub subject: String,
    pub author: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComponentCoupling {
    pub src: String,
    pub dst: String,
    pub pair_count: i64,
    pub cooccurrence: i64,
    pub jaccard: f64,
    pub file_edge_count: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub kind: EntityKind,
    pub entity_id: Option<EntityId>,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ValidationRow {
    pub id: i64,
    pub run_id: Option<TaskId>,
    pub commit_oid: Option<String>,
    pub stage: String,
    pub reason: String,
    pub severity: String,
    pub detail: Option<String>,
}

/// Read-only lookups over the committed artifacts. Nothing here mutates
/// state except snapshot CRUD, and snapshots only at the metadata level.
pub struct QueryApi<'a> {
    store: &'a Store,
    layout: &'a DataLayout,
    lineage: LineageMap,
}

impl<'a> QueryApi<'a> {
    pub fn new(store: &'a Store, layout: &'a DataLayout) -> Result<Self> {
        let lineage = LineageMap::new(&store.load_lineage()?);
        Ok(Self { store, layout, lineage })
    }

    // ---- path resolution ----

    fn resolve_path(&self, path: &str) -> Result<EntityId> {
        match self.store.entity_by_name(EntityKind::File, path)? {
            Some(entity) => Ok(self.lineage.root_of(entity.id)),
            None => bail!("path not found in this repository: '{}'", path),
        }
    }

    /// Display path for a logical file: the qualified name of the lineage
    /// chain tip (the path at HEAD, or the last known path if deleted).
    fn display_path(&self, root: EntityId) -> Result<(String, bool)> {
        let tip = self.lineage.tip_of(root);
        match self.store.entity(tip)? {
            Some(entity) => Ok((entity.qualified_name, entity.exists_at_head)),
            None => Ok((format!("<entity {}>", root), false)),
        }
    }

    fn ensure_completed_run(&self) -> Result<()> {
        let completed: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM analysis_tasks WHERE state = 'completed'",
            [],
            |row| row.get(0),
        )?;

        if completed == 0 {
            bail!("no completed analysis run for this repository; run `analyze` first");
        }

        Ok(())
    }

    // ---- hotspots ----

    /// Top entities by per-file commit count (or churn). This is the raw
    /// per-file count, which includes bulk commits; it is not the support
    /// used for edge pruning.
    pub fn hotspots(
        &self,
        sort: HotspotSort,
        search: Option<&str>,
        page: Page,
    ) -> Result<Vec<Hotspot>> {
        let mut hotspots = Vec::new();

        for entity in self.store.list_entities(EntityKind::File)? {
            if entity.total_commits == 0 || self.lineage.root_of(entity.id) != entity.id {
                continue;
            }

            let (path, exists_at_head) = self.display_path(entity.id)?;

            if let Some(needle) = search {
                if !path.contains(needle) {
                    continue;
                }
            }

            hotspots.push(Hotspot {
                entity_id: entity.id,
                path,
                total_commits: entity.total_commits,
                churn: entity.churn(),
                last_change_ts: entity.last_change_ts,
                exists_at_head,
            });
        }

        hotspots.sort_by(|a, b| {
            let key = match sort {
                HotspotSort::Commits => b.total_commits.cmp(&a.total_commits),
                HotspotSort::Churn => b.churn.cmp(&a.churn),
            };
            key.then_with(|| a.path.cmp(&b.path))
        });

        Ok(page.apply(hotspots))
    }

    // ---- file tree ----

    /// Nested folder structure of everything present at HEAD.
    pub fn file_tree(&self) -> Result<TreeNode> {
        let mut files: Vec<(String, EntityId)> = self
            .store
            .list_entities(EntityKind::File)?
            .into_iter()
            .filter(|e| e.exists_at_head)
            .map(|e| (e.qualified_name, e.id))
            .collect();
        files.sort();

        let mut root = TreeNode {
            name: String::new(),
            path: String::new(),
            kind: EntityKind::Folder,
            entity_id: None,
            children: Vec::new(),
        };

        for (path, entity_id) in files {
            insert_into_tree(&mut root, &path, entity_id);
        }

        Ok(root)
    }

    // ---- coupling ----

    pub fn coupling(
        &self,
        path: &str,
        metric: WeightColumn,
        min_weight: f64,
        page: Page,
    ) -> Result<CouplingResult> {
        self.ensure_completed_run()?;
        let root = self.resolve_path(path)?;
        let (display, _) = self.display_path(root)?;

        let rows = self.edges_of(root)?;
        let mut support = 0;
        let mut neighbors = Vec::new();

        for row in rows {
            let path_is_src = row.src_id == root;
            support = if path_is_src { row.support_src } else { row.support_dst };

            let sort_weight = metric_value(&row, metric);
            if sort_weight < min_weight {
                continue;
            }

            let neighbor = if path_is_src { row.dst_id } else { row.src_id };
            let (neighbor_path, _) = self.display_path(self.lineage.root_of(neighbor))?;

            neighbors.push((
                sort_weight,
                CouplingNeighbor {
                    entity_id: neighbor,
                    path: neighbor_path,
                    jaccard: row.weight,
                    jaccard_weighted: row.jaccard_weighted,
                    pair_count: row.pair_count,
                    support: if path_is_src { row.support_dst } else { row.support_src },
                    p_neighbor_given_path: if path_is_src {
                        row.p_dst_given_src
                    } else {
                        row.p_src_given_dst
                    },
                    p_path_given_neighbor: if path_is_src {
                        row.p_src_given_dst
                    } else {
                        row.p_dst_given_src
                    },
                    decayed_weight: row.decayed_weight,
                },
            ));
        }

        neighbors.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.path.cmp(&b.1.path))
        });

        Ok(CouplingResult {
            entity_id: root,
            path: display,
            support,
            neighbors: page.apply(neighbors.into_iter().map(|(_, n)| n).collect()),
        })
    }

    /// The coupling result shaped as nodes and edges for visualization,
    /// including edges among the selected neighbors.
    pub fn coupling_graph(
        &self,
        path: &str,
        metric: WeightColumn,
        min_weight: f64,
        page: Page,
    ) -> Result<GraphView> {
        let result = self.coupling(path, metric, min_weight, page)?;

        let mut nodes = vec![GraphNode { entity_id: result.entity_id, path: result.path.clone() }];
        let mut selected: HashSet<EntityId> = HashSet::from([result.entity_id]);

        for neighbor in &result.neighbors {
            let root = self.lineage.root_of(neighbor.entity_id);
            selected.insert(root);
            nodes.push(GraphNode { entity_id: root, path: neighbor.path.clone() });
        }

        let mut edges = Vec::new();
        let mut seen = HashSet::new();

        for &node in &selected {
            for row in self.edges_of(node)? {
                if !selected.contains(&row.src_id) || !selected.contains(&row.dst_id) {
                    continue;
                }
                if !seen.insert((row.src_id, row.dst_id)) {
                    continue;
                }
                edges.push(GraphEdge {
                    src_id: row.src_id,
                    dst_id: row.dst_id,
                    weight: metric_value(&row, metric),
                    pair_count: row.pair_count,
                });
            }
        }

        edges.sort_by(|a, b| (a.src_id, a.dst_id).cmp(&(b.src_id, b.dst_id)));
        Ok(GraphView { nodes, edges })
    }

    fn edges_of(&self, root: EntityId) -> Result<Vec<EdgeRow>> {
        let mut stmt = self.store.conn().prepare_cached(
            "SELECT src_id, dst_id, weight, support_src, support_dst, pair_count, \
             p_dst_given_src, p_src_given_dst, jaccard_weighted, decayed_weight \
             FROM relationships WHERE source_type = 'git' AND (src_id = ?1 OR dst_id = ?1)",
        )?;

        let rows = stmt.query_map(params![root], |row| {
            Ok(EdgeRow {
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

    // ---- evidence ----

    /// Commits that touched both files (anywhere along either rename
    /// chain), newest first.
    pub fn evidence(&self, src_path: &str, dst_path: &str) -> Result<Vec<EvidenceCommit>> {
        self.ensure_completed_run()?;
        let src_chain: HashSet<EntityId> =
            self.lineage.chain_of(self.resolve_path(src_path)?).into_iter().collect();
        let dst_chain: HashSet<EntityId> =
            self.lineage.chain_of(self.resolve_path(dst_path)?).into_iter().collect();

        let mut src_commits: HashSet<String> = HashSet::new();
        let mut dst_commits: HashSet<String> = HashSet::new();

        tables::scan_changes(self.layout.changes_parquet(), |change| {
            if src_chain.contains(&change.entity_id) {
                src_commits.insert(change.commit_oid.clone());
            }
            if dst_chain.contains(&change.entity_id) {
                dst_commits.insert(change.commit_oid);
            }
            Ok(())
        })?;

        let shared: HashSet<&String> = src_commits.intersection(&dst_commits).collect();
        let mut evidence = Vec::new();

        tables::scan_commits(self.layout.commits_parquet(), |commit| {
            if shared.contains(&commit.oid) {
                let author = self
                    .store
                    .author(commit.author_id)?
                    .map(|a| a.name)
                    .unwrap_or_default();
                evidence.push(EvidenceCommit {
                    oid: commit.oid,
                    subject: commit.subject,
                    author,
                    timestamp: commit.committer_ts,
                });
            }
            Ok(())
        })?;

        evidence.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.oid.cmp(&b.oid)));
        Ok(evidence)
    }

    // ---- components ----

    pub fn component_coupling(
        &self,
        component: Option<&str>,
        page: Page,
    ) -> Result<Vec<ComponentCoupling>> {
        self.ensure_completed_run()?;

        let mut stmt = self.store.conn().prepare_cached(
            "SELECT s.qualified_name, d.qualified_name, ce.pair_count, ce.cooccurrence, \
             ce.jaccard, ce.file_edge_count \
             FROM component_edges ce \
             JOIN entities s ON s.id = ce.src_id \
             JOIN entities d ON d.id = ce.dst_id \
             WHERE ?1 IS NULL OR s.qualified_name LIKE '%' || ?1 || '%' \
                OR d.qualified_name LIKE '%' || ?1 || '%' \
             ORDER BY ce.pair_count DESC, s.qualified_name, d.qualified_name",
        )?;

        let rows = stmt.query_map(params![component], |row| {
            Ok(ComponentCoupling {
                src: row.get(0)?,
                dst: row.get(1)?,
                pair_count: row.get(2)?,
                cooccurrence: row.get(3)?,
                jaccard: row.get(4)?,
                file_edge_count: row.get(5)?,
            })
        })?;

        Ok(page.apply(rows.collect::<rusqlite::Result<Vec<_>>>()?))
    }

    // ---- history ----

    /// Commits touching the path or any prior lineage path, newest first,
    /// without duplicates.
    pub fn file_history(&self, path: &str, page: Page) -> Result<Vec<EvidenceCommit>> {
        let root = self.resolve_path(path)?;
        let chain: HashSet<EntityId> = self.lineage.chain_of(root).into_iter().collect();

        let mut oids: HashSet<String> = HashSet::new();
        tables::scan_changes(self.layout.changes_parquet(), |change| {
            if chain.contains(&change.entity_id) {
                oids.insert(change.commit_oid);
            }
            Ok(())
        })?;

        let mut history: BTreeMap<String, EvidenceCommit> = BTreeMap::new();
        tables::scan_commits(self.layout.commits_parquet(), |commit| {
            if oids.contains(&commit.oid) {
                let author = self
                    .store
                    .author(commit.author_id)?
                    .map(|a| a.name)
                    .unwrap_or_default();
                history.insert(
                    commit.oid.clone(),
                    EvidenceCommit {
                        oid: commit.oid,
                        subject: commit.subject,
                        author,
                        timestamp: commit.committer_ts,
                    },
                );
            }
            Ok(())
        })?;

        let ordered = history
            .into_values()
            .sorted_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.oid.cmp(&b.oid)))
            .collect();
        Ok(page.apply(ordered))
    }

    // ---- validation log ----

    pub fn validation(&self, page: Page) -> Result<Vec<ValidationRow>> {
        let mut stmt = self.store.conn().prepare_cached(
            "SELECT id, run_id, commit_oid, stage, reason, severity, detail \
             FROM validation_log ORDER BY id LIMIT ?1 OFFSET ?2",
        )?;

        let rows = stmt.query_map(params![page.limit as i64, page.offset as i64], |row| {
            Ok(ValidationRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                commit_oid: row.get(2)?,
                stage: row.get(3)?,
                reason: row.get(4)?,
                severity: row.get(5)?,
                detail: row.get(6)?,
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- tasks ----

    pub fn task(&self, id: TaskId) -> Result<Option<TaskRow>> {
        self.store.task(id)
    }

    pub fn latest_task(&self) -> Result<Option<TaskRow>> {
        self.store.latest_task()
    }

    // ---- snapshots ----

    pub fn list_snapshots(
        &self,
        search: Option<&str>,
        page: Page,
    ) -> Result<Vec<SnapshotMetaRow>> {
        self.store.list_snapshot_rows(search, page.limit as i64, page.offset as i64)
    }

    pub fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot> {
        if self.store.snapshot_row(id)?.is_none() {
            bail!("snapshot {} not found", id);
        }
        snapshots::load_snapshot(self.layout, id)
    }

    pub fn update_snapshot(
        &self,
        id: SnapshotId,
        name: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<()> {
        if !self.store.update_snapshot_meta(id, name, tags)? {
            bail!("snapshot {} not found", id);
        }

        // Keep the JSON body in sync with the editable metadata.
        let mut snapshot = snapshots::load_snapshot(self.layout, id)?;
        if let Some(name) = name {
            snapshot.name = name.to_string();
        }
        if let Some(tags) = tags {
            snapshot.tags = tags.to_vec();
        }
        snapshots::save_snapshot(self.layout, &snapshot)
    }

    pub fn delete_snapshot(&self, id: SnapshotId) -> Result<()> {
        if !self.store.delete_snapshot_row(id)? {
            bail!("snapshot {} not found", id);
        }
        snapshots::delete_snapshot_file(self.layout, id)
    }

    pub fn compare_snapshots(
        &self,
        base_id: SnapshotId,
        head_id: SnapshotId,
    ) -> Result<SnapshotComparison> {
        let base = self.get_snapshot(base_id)?;
        let head = self.get_snapshot(head_id)?;
        Ok(snapshots::compare(&base, &head))
    }
}

struct EdgeRow {
    src_id: EntityId,
    dst_id: EntityId,
    weight: f64,
    support_src: i64,
    support_dst: i64,
    pair_count: i64,
    p_dst_given_src: f64,
    p_src_given_dst: f64,
    jaccard_weighted: f64,
    decayed_weight: Option<f64>,
}

fn metric_value(row: &EdgeRow, metric: WeightColumn) -> f64 {
    match metric {
        WeightColumn::Jaccard => row.weight,
        WeightColumn::JaccardWeighted => row.jaccard_weighted,
        WeightColumn::PairCount => row.pair_count as f64,
        WeightColumn::DecayedWeight => row.decayed_weight.unwrap_or(0.0),
    }
}

fn insert_into_tree(root: &mut TreeNode, path: &str, entity_id: EntityId) {
    let mut node = root;
    let segments: Vec<&str> = path.split('/').collect();

    for (index, segment) in segments.iter().enumerate() {
        let is_file = index + 1 == segments.len();
        let full_path = segments[..=index].join("/");

        let position = node.children.iter().position(|c| c.name == *segment);
        let position = match position {
            Some(position) => position,
            None => {
                let child = TreeNode {
                    name: (*segment).to_string(),
                    path: full_path,
                    kind: if is_file { EntityKind::File } else { EntityKind::Folder },
                    entity_id: if is_file { Some(entity_id) } else { None },
                    children: Vec::new(),
                };

                // Folders first, then alphabetical, mirroring what file
                // browsers show.
                let insert_at = node
                    .children
                    .iter()
                    .position(|c| {
                        (c.kind.is_file(), c.name.as_str()) > (child.kind.is_file(), *segment)
                    })
                    .unwrap_or(node.children.len());
                node.children.insert(insert_at, child);
                insert_at
            }
        };

        node = &mut node.children[position];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_insertion_nests_and_orders() {
        let mut root = TreeNode {
            name: String::new(),
            path: String::new(),
            kind: EntityKind::Folder,
            entity_id: None,
            children: Vec::new(),
        };

        insert_into_tree(&mut root, "src/b.rs", 1);
        insert_into_tree(&mut root, "src/a.rs", 2);
        insert_into_tree(&mut root, "README.md", 3);
        insert_into_tree(&mut root, "src/api/handler.rs", 4);

        // Folders first: src before README.md.
        assert_eq!(root.children[0].name, "src");
        assert_eq!(root.children[1].name, "README.md");

        let src = &root.children[0];
        assert_eq!(src.children[0].name, "api");
        assert_eq!(src.children[1].name, "a.rs");
        assert_eq!(src.children[2].name, "b.rs");
        assert_eq!(src.children[1].entity_id, Some(2));
        assert_eq!(src.children[0].children[0].path, "src/api/handler.rs");
    }

    #[test]
    fn pages_slice_stably() {
        let items: Vec<i32> = (0..10).collect();
        let page = Page { limit: 3, offset: 4 };
        assert_eq!(page.apply(items.clone()), vec![4, 5, 6]);

        let tail = Page { limit: 100, offset: 8 };
        assert_eq!(tail.apply(items), vec![8, 9]);
    }
}
