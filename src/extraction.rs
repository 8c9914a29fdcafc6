use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use git2::Delta;
use git2::DiffFindOptions;
use git2::DiffLineType;
use git2::DiffOptions;
use git2::Oid;
use git2::Repository;
use git2::Sort;
use git2::TreeWalkMode;
use git2::TreeWalkResult;
use rayon::prelude::*;

use crate::config::AnalysisConfig;
use crate::config::PathFilter;
use crate::core::ChangeKind;
use crate::core::ChangeRow;
use crate::core::CommitRow;
use crate::core::EntityId;
use crate::core::EntityKind;
use crate::core::TaskId;
use crate::storage::DataLayout;
use crate::storage::Store;
use crate::tables::ChangeWriter;
use crate::tables::CommitWriter;
use crate::validation::PathValidator;
use crate::validation::ValidationEntry;

/// Commits resolved and diffed per suspension point.
const COMMIT_BATCH: usize = 512;

const STAGE: &str = "extracting";

#[derive(Debug, Clone, Default)]
pub struct ExtractionSummary {
    pub commit_count: u64,
    pub change_count: u64,
    pub skipped_commits: u64,
    pub head_oid: Option<String>,
    /// Reference instant for time-decayed weights. Never wall clock.
    pub max_committer_ts: i64,
}

struct RawDelta {
    kind: ChangeKind,
    old_path: Option<String>,
    new_path: Option<String>,
    insertions: i32,
    deletions: i32,
}

struct CommitData {
    oid: String,
    author_name: String,
    author_email: String,
    author_ts: i64,
    committer_name: String,
    committer_email: String,
    committer_ts: i64,
    subject: String,
    parent_oids: Vec<String>,
    is_merge: bool,
    deltas: Vec<RawDelta>,
}

/// Walk the commit history and produce the commits/changes parquet tables,
/// entity rows with per-file stats, and the rename lineage.
///
/// Diffs are computed in parallel per batch; entity and lineage resolution
/// is applied sequentially in topological order so that a rename always
/// sees its source entity already created.
pub fn extract(
    repo_root: &Path,
    config: &AnalysisConfig,
    run_id: TaskId,
    store: &mut Store,
    layout: &DataLayout,
    tick: &mut dyn FnMut(u64, u64) -> Result<()>,
) -> Result<ExtractionSummary> {
    let repo = Repository::open(repo_root)
        .with_context(|| format!("failed to open git repository at {}", repo_root.display()))?;

    let filter = config.path_filter()?;
    let validator = PathValidator::new();
    store.reset_entity_stats()?;

    let head = match repo.head() {
        Ok(reference) => Some(reference.peel_to_commit()?),
        Err(_) => None,
    };

    let mut summary = ExtractionSummary::default();
    let mut commit_writer = CommitWriter::create(layout.commits_parquet())?;
    let mut change_writer = ChangeWriter::create(layout.changes_parquet())?;

    let head = match head {
        Some(head) => head,
        None => {
            // Unborn HEAD: an empty history is a successful run with empty
            // tables.
            commit_writer.finish()?;
            change_writer.finish()?;
            tick(0, 0)?;
            return Ok(summary);
        }
    };

    summary.head_oid = Some(head.id().to_string());
    let since = config.effective_since(head.committer().when().seconds());
    let until = config.until;

    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    let oids = walk.collect::<std::result::Result<Vec<_>, _>>()?;
    let total = oids.len() as u64;
    log::info!("Walking {} commit(s)...", total);

    let mut state = ApplyState::new(store, validator, filter, config.rename_similarity);
    let mut processed = 0u64;
    let threshold = (config.rename_similarity * 100.0).round() as u16;

    for batch in oids.chunks(COMMIT_BATCH) {
        let chunk_size = num_per_thread(rayon::current_num_threads(), batch.len());

        let results: Vec<Vec<std::result::Result<Option<CommitData>, (Oid, String)>>> = batch
            .par_chunks(chunk_size)
            .map(|chunk| -> Result<Vec<_>> {
                let repo = Repository::open(repo_root)?;
                Ok(chunk
                    .iter()
                    .map(|&oid| {
                        read_commit(&repo, oid, threshold, since, until)
                            .map_err(|e| (oid, e.to_string()))
                    })
                    .collect())
            })
            .collect::<Result<Vec<_>>>()?;

        state.store.begin_batch()?;

        for result in results.into_iter().flatten() {
            match result {
                Ok(Some(data)) => {
                    summary.max_committer_ts = summary.max_committer_ts.max(data.committer_ts);
                    state.apply(&data, &mut commit_writer, &mut change_writer, &mut summary)?;
                    summary.commit_count += 1;
                }
                Ok(None) => {
                    summary.skipped_commits += 1;
                }
                Err((oid, message)) => {
                    summary.skipped_commits += 1;
                    state.log.push(ValidationEntry::warn(
                        Some(oid.to_string()),
                        STAGE,
                        "commit_parse_failure",
                        Some(message),
                    ));
                }
            }
        }

        state.store.commit_batch()?;
        processed += batch.len() as u64;
        tick(processed, total)?;
    }

    commit_writer.finish()?;
    change_writer.finish()?;

    mark_head_entities(&head, state.store)?;
    state.store.set_meta("head_oid", &head.id().to_string())?;

    let entries = std::mem::take(&mut state.log);
    if !entries.is_empty() {
        log::warn!("{} record(s) skipped during extraction; see the validation log", entries.len());
        state.store.append_validation(Some(run_id), &entries)?;
    }

    Ok(summary)
}

fn num_per_thread(num_threads: usize, total: usize) -> usize {
    ((total + num_threads - 1) / num_threads).max(1)
}

/// Read one commit and its first-parent diff. Returns `None` when the
/// commit falls outside the configured time bounds. Merge commits keep
/// their commit row but contribute no deltas.
fn read_commit(
    repo: &Repository,
    oid: Oid,
    rename_threshold: u16,
    since: Option<i64>,
    until: Option<i64>,
) -> Result<Option<CommitData>> {
    let commit = repo.find_commit(oid)?;
    let committer_ts = commit.committer().when().seconds();

    if since.map_or(false, |s| committer_ts < s) || until.map_or(false, |u| committer_ts > u) {
        return Ok(None);
    }

    let author = commit.author();
    let committer = commit.committer();

    let mut data = CommitData {
        oid: oid.to_string(),
        author_name: String::from_utf8_lossy(author.name_bytes()).to_string(),
        author_email: String::from_utf8_lossy(author.email_bytes()).to_string(),
        author_ts: author.when().seconds(),
        committer_name: String::from_utf8_lossy(committer.name_bytes()).to_string(),
        committer_email: String::from_utf8_lossy(committer.email_bytes()).to_string(),
        committer_ts,
        subject: commit.summary().unwrap_or("").to_string(),
        parent_oids: commit.parent_ids().map(|p| p.to_string()).collect(),
        is_merge: commit.parent_count() > 1,
        deltas: Vec::new(),
    };

    if data.is_merge {
        return Ok(Some(data));
    }

    let new_tree = commit.tree()?;
    let mut opts = DiffOptions::new();
    opts.ignore_filemode(true);
    opts.context_lines(0);

    let mut diff = match commit.parent_count() {
        0 => repo.diff_tree_to_tree(None, Some(&new_tree), Some(&mut opts))?,
        _ => {
            let old_tree = commit.parent(0)?.tree()?;
            repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?
        }
    };

    let mut find = DiffFindOptions::new();
    find.renames(true);
    find.copies(true);
    find.rename_threshold(rename_threshold);
    find.copy_threshold(rename_threshold);
    diff.find_similar(Some(&mut find))?;

    let mut line_stats: HashMap<(Option<String>, Option<String>), (i32, i32)> = HashMap::new();

    diff.foreach(
        &mut |_, _| true,
        None,
        None,
        Some(&mut |delta, _hunk, line| {
            let entry = line_stats.entry(delta_key(&delta)).or_default();
            match line.origin_value() {
                DiffLineType::Addition => entry.0 += 1,
                DiffLineType::Deletion => entry.1 += 1,
                _ => {}
            }
            true
        }),
    )?;

    for delta in diff.deltas() {
        let kind = match delta.status() {
            Delta::Added => ChangeKind::Add,
            Delta::Modified => ChangeKind::Modify,
            Delta::Deleted => ChangeKind::Delete,
            Delta::Renamed => ChangeKind::Rename,
            Delta::Copied => ChangeKind::Copy,
            status => {
                log::debug!("skipping unsupported diff status {:?} in {}", status, oid);
                continue;
            }
        };

        let (insertions, deletions) =
            line_stats.get(&delta_key(&delta)).copied().unwrap_or_default();

        data.deltas.push(RawDelta {
            kind,
            old_path: delta.old_file().path().map(path_to_string),
            new_path: delta.new_file().path().map(path_to_string),
            insertions,
            deletions,
        });
    }

    Ok(Some(data))
}

fn delta_key(delta: &git2::DiffDelta<'_>) -> (Option<String>, Option<String>) {
    (
        delta.old_file().path().map(path_to_string),
        delta.new_file().path().map(path_to_string),
    )
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Sequential half of extraction: entity/lineage bookkeeping and row
/// emission. Owns the incremental root map so per-file stats accumulate on
/// the logical (chain-root) entity as renames are discovered.
struct ApplyState<'a> {
    store: &'a mut Store,
    validator: PathValidator,
    filter: PathFilter,
    rename_similarity: f64,
    roots: HashMap<EntityId, EntityId>,
    log: Vec<ValidationEntry>,
}

impl<'a> ApplyState<'a> {
    fn new(
        store: &'a mut Store,
        validator: PathValidator,
        filter: PathFilter,
        rename_similarity: f64,
    ) -> Self {
        Self { store, validator, filter, rename_similarity, roots: HashMap::new(), log: Vec::new() }
    }

    fn root_of(&self, id: EntityId) -> EntityId {
        self.roots.get(&id).copied().unwrap_or(id)
    }

    fn apply(
        &mut self,
        data: &CommitData,
        commit_writer: &mut CommitWriter,
        change_writer: &mut ChangeWriter,
        summary: &mut ExtractionSummary,
    ) -> Result<()> {
        let author_id = self.store.get_or_create_author(&data.author_name, &data.author_email)?;
        let committer_id =
            self.store.get_or_create_author(&data.committer_name, &data.committer_email)?;

        commit_writer.append(&CommitRow {
            oid: data.oid.clone(),
            author_id,
            author_ts: data.author_ts,
            committer_id,
            committer_ts: data.committer_ts,
            subject: data.subject.clone(),
            parent_oids: data.parent_oids.clone(),
            file_count: data.deltas.len() as i32,
            is_merge: data.is_merge,
        })?;

        for delta in &data.deltas {
            if let Some(row) = self.apply_delta(data, delta, author_id)? {
                change_writer.append(&row)?;
                summary.change_count += 1;
            }
        }

        Ok(())
    }

    fn apply_delta(
        &mut self,
        data: &CommitData,
        delta: &RawDelta,
        author_id: i64,
    ) -> Result<Option<ChangeRow>> {
        let path = match delta.kind {
            ChangeKind::Delete => delta.old_path.as_deref(),
            _ => delta.new_path.as_deref(),
        };

        let path = match path {
            Some(path) => path,
            None => return Ok(None),
        };

        if !self.admit(path, &data.oid) || !self.filter.includes(path) {
            return Ok(None);
        }

        let entity_id = self.file_entity(path)?;
        let mut old_entity_id = None;

        if matches!(delta.kind, ChangeKind::Rename | ChangeKind::Copy) {
            if let Some(old_path) = delta.old_path.as_deref() {
                if self.admit(old_path, &data.oid) && self.filter.includes(old_path) {
                    let old_id = self.file_entity(old_path)?;
                    // Similarity is the configured detection threshold;
                    // libgit2 does not surface the per-delta score.
                    self.store.insert_lineage(
                        old_id,
                        entity_id,
                        &data.oid,
                        self.rename_similarity,
                    )?;
                    self.roots.insert(entity_id, self.root_of(old_id));
                    old_entity_id = Some(old_id);
                }
            }
        }

        let root = self.root_of(entity_id);
        self.store.bump_entity_stats(
            root,
            1,
            i64::from(delta.insertions),
            i64::from(delta.deletions),
            data.committer_ts,
        )?;
        self.store.bump_entity_author(root, author_id)?;

        Ok(Some(ChangeRow {
            commit_oid: data.oid.clone(),
            entity_id,
            kind: delta.kind,
            insertions: delta.insertions,
            deletions: delta.deletions,
            old_entity_id,
        }))
    }

    fn admit(&mut self, path: &str, commit_oid: &str) -> bool {
        match self.validator.check(path) {
            Ok(()) => true,
            Err(rejection) => {
                self.log.push(ValidationEntry::warn(
                    Some(commit_oid.to_string()),
                    STAGE,
                    rejection.to_string(),
                    Some(path.to_string()),
                ));
                false
            }
        }
    }

    /// Create (or find) the file entity for a path, along with folder
    /// entities for each ancestor directory.
    fn file_entity(&mut self, path: &str) -> Result<EntityId> {
        let mut parent: Option<EntityId> = None;
        let mut prefix = PathBuf::new();

        if let Some(dir) = Path::new(path).parent() {
            for component in dir.components() {
                prefix.push(component);
                let name = path_to_string(&prefix);
                if name.is_empty() {
                    continue;
                }
                let id =
                    self.store.get_or_create_entity(EntityKind::Folder, &name, None, parent)?;
                parent = Some(id);
            }
        }

        self.store.get_or_create_entity(EntityKind::File, path, language_of(path), parent)
    }
}

fn language_of(path: &str) -> Option<&'static str> {
    let extension = Path::new(path).extension()?.to_str()?;
    Some(match extension {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "go" => "go",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "md" => "markdown",
        "json" => "json",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "sql" => "sql",
        _ => return None,
    })
}

/// Flag every entity whose path is present in the HEAD tree (files and
/// their ancestor folders).
fn mark_head_entities(head: &git2::Commit<'_>, store: &mut Store) -> Result<()> {
    let mut paths = Vec::new();

    head.tree()?.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            if let Some(name) = entry.name() {
                paths.push(format!("{}{}", dir, name));
            }
        }
        TreeWalkResult::Ok
    })?;

    let mut live = Vec::new();
    let mut folders = HashSet::new();

    for path in &paths {
        if let Some(entity) = store.entity_by_name(EntityKind::File, path)? {
            live.push(entity.id);
        }

        let mut dir = Path::new(path).parent();
        while let Some(d) = dir {
            let name = path_to_string(d);
            if name.is_empty() {
                break;
            }
            folders.insert(name);
            dir = d.parent();
        }
    }

    for folder in &folders {
        if let Some(entity) = store.entity_by_name(EntityKind::Folder, folder)? {
            live.push(entity.id);
        }
    }

    store.set_exists_at_head(&live)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_tags_come_from_extensions() {
        assert_eq!(language_of("src/main.rs"), Some("rust"));
        assert_eq!(language_of("pkg/mod.go"), Some("go"));
        assert_eq!(language_of("Makefile"), None);
        assert_eq!(language_of("web/app.tsx"), Some("typescript"));
    }

    #[test]
    fn num_per_thread_never_returns_zero() {
        assert_eq!(num_per_thread(8, 0), 1);
        assert_eq!(num_per_thread(8, 7), 1);
        assert_eq!(num_per_thread(4, 10), 3);
    }
}
