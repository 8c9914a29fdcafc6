use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use anyhow::Result;
use itertools::Itertools;
use regex::Regex;

use crate::config::AnalysisConfig;
use crate::config::ChangesetMode;
use crate::core::ChangeRow;
use crate::core::CommitRow;
use crate::core::EntityId;
use crate::lineage::LineageMap;
use crate::validation::ValidationEntry;

const STAGE: &str = "building_edges";

/// A group of file changes treated as one coupling event. Entities are
/// logical root ids, sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogicalChangeset {
    pub key: String,
    pub entities: Vec<EntityId>,
    pub weight: f64,
    /// Max committer timestamp among member commits; drives time decay.
    pub timestamp: i64,
}

impl LogicalChangeset {
    pub fn cardinality(&self) -> usize {
        self.entities.len()
    }
}

/// `1 / log2(n + 1)`: large changesets contribute sub-linearly, singletons
/// get weight 1.
pub fn changeset_weight(cardinality: usize) -> f64 {
    1.0 / ((cardinality as f64) + 1.0).log2()
}

#[derive(Debug, Default)]
pub struct ShapeResult {
    pub changesets: Vec<LogicalChangeset>,
    pub dropped_bulk: u64,
    pub dropped_oversized: u64,
    pub log: Vec<ValidationEntry>,
}

/// Streams raw change rows into per-commit entity sets, then groups them
/// into logical changesets under the configured mode.
pub struct Shaper<'a> {
    config: &'a AnalysisConfig,
    lineage: &'a LineageMap,
    ticket: Option<Regex>,
    commits: Vec<CommitRow>,
    by_oid: HashMap<String, usize>,
    bulk: Vec<bool>,
    sets: Vec<BTreeSet<EntityId>>,
    roots: HashMap<EntityId, EntityId>,
    log: Vec<ValidationEntry>,
    dropped_bulk: u64,
}

impl<'a> Shaper<'a> {
    pub fn new(
        config: &'a AnalysisConfig,
        lineage: &'a LineageMap,
        commits: Vec<CommitRow>,
    ) -> Result<Self> {
        let ticket = match config.changeset_mode {
            ChangesetMode::ByTicketId => Some(config.ticket_regex()?),
            _ => None,
        };

        let by_oid =
            commits.iter().enumerate().map(|(i, c)| (c.oid.clone(), i)).collect::<HashMap<_, _>>();

        let mut bulk = vec![false; commits.len()];
        let mut log = Vec::new();
        let mut dropped_bulk = 0;

        for (i, commit) in commits.iter().enumerate() {
            if commit.file_count as usize > config.max_changeset_size {
                bulk[i] = true;
                dropped_bulk += 1;
                log.push(ValidationEntry {
                    commit_oid: Some(commit.oid.clone()),
                    stage: STAGE.to_string(),
                    reason: "bulk_commit_excluded".to_string(),
                    severity: crate::core::Severity::Info,
                    detail: Some(format!("{} files changed", commit.file_count)),
                });
            }
        }

        let sets = vec![BTreeSet::new(); commits.len()];
        Ok(Self {
            config,
            lineage,
            ticket,
            commits,
            by_oid,
            bulk,
            sets,
            roots: HashMap::new(),
            log,
            dropped_bulk,
        })
    }

    /// Feed one raw change row. Rows from bulk or unknown commits are
    /// ignored here; they already counted toward per-file stats upstream.
    pub fn add(&mut self, change: &ChangeRow) {
        let index = match self.by_oid.get(&change.commit_oid) {
            Some(&index) => index,
            None => {
                log::debug!("change references unknown commit {}", change.commit_oid);
                return;
            }
        };

        if self.bulk[index] {
            return;
        }

        let lineage = self.lineage;
        let root = *self
            .roots
            .entry(change.entity_id)
            .or_insert_with(|| lineage.root_of(change.entity_id));
        self.sets[index].insert(root);
    }

    pub fn finish(mut self) -> ShapeResult {
        let groups: Vec<(String, Vec<usize>)> = match self.config.changeset_mode {
            ChangesetMode::ByCommit => self.group_by_commit(),
            ChangesetMode::ByAuthorTimeWindow => self.group_by_author_window(),
            ChangesetMode::ByTicketId => self.group_by_ticket(),
        };

        let mut result = ShapeResult {
            dropped_bulk: self.dropped_bulk,
            log: std::mem::take(&mut self.log),
            ..ShapeResult::default()
        };

        for (key, members) in groups {
            let mut entities = BTreeSet::new();
            let mut timestamp = i64::MIN;

            for &index in &members {
                entities.extend(self.sets[index].iter().copied());
                timestamp = timestamp.max(self.commits[index].committer_ts);
            }

            if entities.is_empty() {
                continue;
            }

            if entities.len() > self.config.max_logical_changeset_size {
                result.dropped_oversized += 1;
                result.log.push(ValidationEntry::warn(
                    members.first().map(|&i| self.commits[i].oid.clone()),
                    STAGE,
                    "oversized_changeset",
                    Some(format!("{} files in group '{}'", entities.len(), key)),
                ));
                continue;
            }

            let entities: Vec<EntityId> = entities.into_iter().collect();
            let weight = changeset_weight(entities.len());
            result.changesets.push(LogicalChangeset { key, entities, weight, timestamp });
        }

        result
    }

    fn group_by_commit(&self) -> Vec<(String, Vec<usize>)> {
        (0..self.commits.len())
            .filter(|&i| !self.bulk[i] && !self.sets[i].is_empty())
            .map(|i| (self.commits[i].oid.clone(), vec![i]))
            .collect()
    }

    /// Session chaining: consecutive commits by the same author merge into
    /// one changeset while the gap to the previous commit stays within the
    /// window.
    fn group_by_author_window(&self) -> Vec<(String, Vec<usize>)> {
        let window_secs = self.config.author_time_window_hours * 3600;

        let ordered: Vec<usize> = (0..self.commits.len())
            .filter(|&i| !self.bulk[i] && !self.sets[i].is_empty())
            .sorted_by_key(|&i| {
                (self.commits[i].author_id, self.commits[i].author_ts, self.commits[i].oid.clone())
            })
            .collect();

        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();

        for index in ordered {
            let commit = &self.commits[index];

            let chained = groups.last().map_or(false, |(_, members)| {
                let last = &self.commits[*members.last().expect("groups are never empty")];
                last.author_id == commit.author_id
                    && commit.author_ts - last.author_ts <= window_secs
            });

            if chained {
                groups.last_mut().expect("checked above").1.push(index);
            } else {
                groups.push((commit.oid.clone(), vec![index]));
            }
        }

        groups
    }

    /// Group all commits sharing a ticket id regardless of author or time;
    /// commits without one fall back to per-commit groups.
    fn group_by_ticket(&self) -> Vec<(String, Vec<usize>)> {
        let ticket = self.ticket.as_ref().expect("ticket regex is compiled for this mode");
        let mut by_ticket: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut singles: Vec<(String, Vec<usize>)> = Vec::new();

        for i in 0..self.commits.len() {
            if self.bulk[i] || self.sets[i].is_empty() {
                continue;
            }

            match extract_ticket(ticket, &self.commits[i].subject) {
                Some(id) => by_ticket.entry(id).or_default().push(i),
                None => singles.push((self.commits[i].oid.clone(), vec![i])),
            }
        }

        let mut groups: Vec<(String, Vec<usize>)> = by_ticket.into_iter().collect();
        groups.extend(singles);
        groups
    }
}

fn extract_ticket(pattern: &Regex, subject: &str) -> Option<String> {
    let captures = pattern.captures(subject)?;
    let matched = captures.get(1).or_else(|| captures.get(0))?;
    Some(matched.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChangeKind;

    fn commit(oid: &str, author_id: i64, author_ts: i64, subject: &str, file_count: i32) -> CommitRow {
        CommitRow {
            oid: oid.to_string(),
            author_id,
            author_ts,
            committer_id: author_id,
            committer_ts: author_ts,
            subject: subject.to_string(),
            parent_oids: vec![],
            file_count,
            is_merge: false,
        }
    }

    fn change(oid: &str, entity_id: EntityId) -> ChangeRow {
        ChangeRow {
            commit_oid: oid.to_string(),
            entity_id,
            kind: ChangeKind::Modify,
            insertions: 1,
            deletions: 0,
            old_entity_id: None,
        }
    }

    fn shape(
        config: &AnalysisConfig,
        commits: Vec<CommitRow>,
        changes: Vec<ChangeRow>,
    ) -> ShapeResult {
        let lineage = LineageMap::new(&[]);
        let mut shaper = Shaper::new(config, &lineage, commits).unwrap();
        for change in &changes {
            shaper.add(change);
        }
        shaper.finish()
    }

    #[test]
    fn weight_is_sublinear_in_cardinality() {
        assert!((changeset_weight(1) - 1.0).abs() < 1e-12);
        assert!((changeset_weight(3) - 0.5).abs() < 1e-12);
        assert!(changeset_weight(100) < changeset_weight(10));
    }

    #[test]
    fn by_commit_yields_one_group_per_commit() {
        let config = AnalysisConfig::default();
        let commits = vec![commit("c1", 1, 100, "one", 2), commit("c2", 1, 200, "two", 1)];
        let changes = vec![change("c1", 10), change("c1", 11), change("c2", 10)];

        let result = shape(&config, commits, changes);
        assert_eq!(result.changesets.len(), 2);

        let first = result.changesets.iter().find(|c| c.key == "c1").unwrap();
        assert_eq!(first.entities, vec![10, 11]);
        assert!((first.weight - changeset_weight(2)).abs() < 1e-12);

        let second = result.changesets.iter().find(|c| c.key == "c2").unwrap();
        assert_eq!(second.entities, vec![10]);
        assert!((second.weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bulk_commits_are_excluded() {
        let config = AnalysisConfig { max_changeset_size: 2, ..AnalysisConfig::default() };
        let commits = vec![commit("big", 1, 100, "huge refactor", 3), commit("ok", 1, 200, "fix", 1)];
        let changes = vec![change("big", 1), change("big", 2), change("big", 3), change("ok", 1)];

        let result = shape(&config, commits, changes);
        assert_eq!(result.dropped_bulk, 1);
        assert_eq!(result.changesets.len(), 1);
        assert_eq!(result.changesets[0].key, "ok");
        assert!(result.log.iter().any(|e| e.reason == "bulk_commit_excluded"));
    }

    #[test]
    fn author_window_chains_sessions() {
        let config = AnalysisConfig {
            changeset_mode: ChangesetMode::ByAuthorTimeWindow,
            author_time_window_hours: 1,
            ..AnalysisConfig::default()
        };

        // Author 1: two commits 30 minutes apart, then one 2 hours later.
        // Author 2: one commit in between.
        let commits = vec![
            commit("a1", 1, 0, "x", 1),
            commit("a2", 1, 1800, "y", 1),
            commit("a3", 1, 1800 + 7200, "z", 1),
            commit("b1", 2, 900, "w", 1),
        ];
        let changes =
            vec![change("a1", 1), change("a2", 2), change("a3", 3), change("b1", 4)];

        let result = shape(&config, commits, changes);
        assert_eq!(result.changesets.len(), 3);

        let session = result.changesets.iter().find(|c| c.key == "a1").unwrap();
        assert_eq!(session.entities, vec![1, 2]);
        assert_eq!(session.timestamp, 1800);
    }

    #[test]
    fn ticket_mode_groups_across_authors_and_falls_back() {
        let config = AnalysisConfig {
            changeset_mode: ChangesetMode::ByTicketId,
            ..AnalysisConfig::default()
        };

        let commits = vec![
            commit("t1", 1, 0, "PROJ-42: start feature", 1),
            commit("t2", 2, 999_999, "PROJ-42: finish feature", 1),
            commit("n1", 3, 50, "drive-by cleanup", 1),
        ];
        let changes = vec![change("t1", 1), change("t2", 2), change("n1", 3)];

        let result = shape(&config, commits, changes);
        assert_eq!(result.changesets.len(), 2);

        let ticket = result.changesets.iter().find(|c| c.key == "PROJ-42").unwrap();
        assert_eq!(ticket.entities, vec![1, 2]);
        assert_eq!(ticket.timestamp, 999_999);

        assert!(result.changesets.iter().any(|c| c.key == "n1"));
    }

    #[test]
    fn oversized_groups_are_dropped_and_logged() {
        let config = AnalysisConfig {
            max_logical_changeset_size: 2,
            ..AnalysisConfig::default()
        };
        let commits = vec![commit("c1", 1, 100, "wide", 3)];
        let changes = vec![change("c1", 1), change("c1", 2), change("c1", 3)];

        let result = shape(&config, commits, changes);
        assert!(result.changesets.is_empty());
        assert_eq!(result.dropped_oversized, 1);
        assert!(result.log.iter().any(|e| e.reason == "oversized_changeset"));
    }

    #[test]
    fn renamed_entities_collapse_to_one_logical_id() {
        let config = AnalysisConfig::default();
        let lineage = LineageMap::new(&[crate::storage::LineageRow {
            old_entity_id: 1,
            new_entity_id: 2,
            commit_oid: "r".to_string(),
            similarity: 0.9,
        }]);

        let commits = vec![commit("c1", 1, 100, "touch both names", 2)];
        let mut shaper = Shaper::new(&config, &lineage, commits).unwrap();
        shaper.add(&change("c1", 1));
        shaper.add(&change("c1", 2));
        let result = shaper.finish();

        assert_eq!(result.changesets.len(), 1);
        assert_eq!(result.changesets[0].entities, vec![1]);
        assert!((result.changesets[0].weight - 1.0).abs() < 1e-12);
    }
}
