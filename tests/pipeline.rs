use std::fs;
use std::path::Path;

use git2::Oid;
use git2::Repository;
use git2::Signature;
use git2::Time;
use tempfile::TempDir;

use cochange::config::AnalysisConfig;
use cochange::config::ClusteringConfig;
use cochange::core::CancellationToken;
use cochange::core::TaskState;
use cochange::core::WeightColumn;
use cochange::orchestrator;
use cochange::query::HotspotSort;
use cochange::query::Page;
use cochange::query::QueryApi;
use cochange::storage;
use cochange::storage::DataLayout;
use cochange::storage::Store;

/// Throwaway repository with controlled timestamps: every commit advances
/// the clock by one hour starting at 2026-01-10 00:00:00 UTC.
struct Fixture {
    dir: TempDir,
    repo: Repository,
    data: TempDir,
    epoch: i64,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("create repo dir");
        let repo = Repository::init(dir.path()).expect("init repo");
        let data = TempDir::new().expect("create data dir");
        Self { dir, repo, data, epoch: 1_767_996_000 }
    }

    /// Write/overwrite `files`, delete `removed`, and commit as `author`.
    fn commit(&mut self, author: &str, files: &[(&str, &str)], removed: &[&str], message: &str) -> Oid {
        self.epoch += 3600;
        let signature = Signature::new(
            author,
            &format!("{}@example.com", author.to_lowercase()),
            &Time::new(self.epoch, 0),
        )
        .expect("create signature");

        let mut index = self.repo.index().expect("repo index");

        for (path, content) in files {
            let full = self.dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).expect("create parent dirs");
            }
            fs::write(&full, content).expect("write file");
            index.add_path(Path::new(path)).expect("stage file");
        }

        for path in removed {
            fs::remove_file(self.dir.path().join(path)).expect("delete file");
            index.remove_path(Path::new(path)).expect("unstage file");
        }

        index.write().expect("write index");
        let tree_oid = index.write_tree().expect("write tree");
        let tree = self.repo.find_tree(tree_oid).expect("find tree");

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit().expect("head commit")),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .expect("create commit")
    }

    fn analyze(&self, config: &AnalysisConfig) -> i64 {
        orchestrator::run_analysis(
            self.dir.path(),
            self.data.path(),
            config,
            CancellationToken::new(),
            None,
        )
        .expect("analysis run")
    }

    fn layout(&self) -> DataLayout {
        let repo_id = storage::repo_id(self.dir.path()).expect("repo id");
        DataLayout::new(self.data.path(), &repo_id)
    }
}

fn small_config() -> AnalysisConfig {
    AnalysisConfig { min_revisions: 1, min_cooccurrence: 1, ..AnalysisConfig::default() }
}

fn page(limit: usize, offset: usize) -> Page {
    Page { limit, offset }
}

#[test]
fn empty_history_completes_successfully() {
    let fixture = Fixture::new();
    let task_id = fixture.analyze(&small_config());

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    let task = store.task(task_id).unwrap().unwrap();

    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.entity_count, 0);
    assert_eq!(task.relationship_count, 0);
}

#[test]
fn lockfile_coupling_is_symmetric_and_correct() {
    let mut fixture = Fixture::new();

    // 6 commits touching both files, 2 touching only package.json, 3
    // touching only package-lock.json.
    for i in 0..6 {
        fixture.commit(
            "Ada",
            &[
                ("package.json", &format!("deps v{}", i)),
                ("package-lock.json", &format!("lock v{}", i)),
            ],
            &[],
            &format!("bump deps {}", i),
        );
    }
    for i in 0..2 {
        fixture.commit("Ada", &[("package.json", &format!("meta {}", i))], &[], "edit metadata");
    }
    for i in 0..3 {
        fixture.commit("Ada", &[("package-lock.json", &format!("re-lock {}", i))], &[], "re-lock");
    }

    fixture.analyze(&small_config());

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    let api = QueryApi::new(&store, &layout).unwrap();

    let forward = api
        .coupling("package.json", WeightColumn::Jaccard, 0.0, page(10, 0))
        .unwrap();
    assert_eq!(forward.support, 8);

    let neighbor = forward.neighbors.iter().find(|n| n.path == "package-lock.json").unwrap();
    assert_eq!(neighbor.pair_count, 6);
    let expected = 6.0 / (8.0 + 9.0 - 6.0);
    assert!((neighbor.jaccard - expected).abs() < 1e-9);
    assert!((neighbor.p_neighbor_given_path - 6.0 / 8.0).abs() < 1e-9);

    let backward = api
        .coupling("package-lock.json", WeightColumn::Jaccard, 0.0, page(10, 0))
        .unwrap();
    let mirrored = backward.neighbors.iter().find(|n| n.path == "package.json").unwrap();
    assert_eq!(mirrored.jaccard, neighbor.jaccard);
    assert!((mirrored.p_neighbor_given_path - 6.0 / 9.0).abs() < 1e-9);

    let evidence = api.evidence("package.json", "package-lock.json").unwrap();
    assert_eq!(evidence.len(), 6);
    assert!(evidence.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[test]
fn bulk_commits_count_for_stats_but_never_couple() {
    let mut fixture = Fixture::new();

    // The eight widget files only ever co-change inside one bulk commit.
    let bulk: Vec<(String, String)> =
        (0..8).map(|i| (format!("widget_{}.rs", i), "contents".to_string())).collect();
    let bulk_refs: Vec<(&str, &str)> =
        bulk.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    fixture.commit("Ada", &bulk_refs, &[], "monolithic import");

    // Individual follow-ups so every widget still has activity.
    for i in 0..8 {
        fixture.commit(
            "Ada",
            &[(&format!("widget_{}.rs", i), "solo edit")],
            &[],
            &format!("tweak widget {}", i),
        );
    }

    let config = AnalysisConfig { max_changeset_size: 5, ..small_config() };
    fixture.analyze(&config);

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    assert_eq!(store.relationship_count().unwrap(), 0);

    let api = QueryApi::new(&store, &layout).unwrap();
    let hotspots = api.hotspots(HotspotSort::Commits, None, page(20, 0)).unwrap();

    // The bulk commit still counts toward per-file commit totals.
    let widget = hotspots.iter().find(|h| h.path == "widget_3.rs").unwrap();
    assert_eq!(widget.total_commits, 2);
}

#[test]
fn rename_chain_keeps_one_logical_history() {
    let mut fixture = Fixture::new();
    let body = "line one\nline two\nline three\nline four\nline five\n";

    fixture.commit("Ada", &[("a.py", body)], &[], "add a.py");
    fixture.commit("Ada", &[("a.py", &format!("{}extra\n", body))], &[], "extend a.py");
    let renamed = format!("{}extra\n", body);
    fixture.commit("Ada", &[("b.py", &renamed)], &["a.py"], "rename a.py to b.py");
    fixture.commit("Ada", &[("b.py", &format!("{}more\n", renamed))], &[], "extend b.py");
    let renamed_again = format!("{}more\n", renamed);
    fixture.commit("Ada", &[("c.py", &renamed_again)], &["b.py"], "rename b.py to c.py");
    fixture.commit("Ada", &[("c.py", &format!("{}final\n", renamed_again))], &[], "finish c.py");

    fixture.analyze(&small_config());

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    let api = QueryApi::new(&store, &layout).unwrap();

    let history = api.file_history("c.py", page(50, 0)).unwrap();
    assert_eq!(history.len(), 6, "history must span the whole rename chain");
    assert!(history.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    // Queries through an old name resolve to the same logical file.
    let via_old_name = api.file_history("a.py", page(50, 0)).unwrap();
    assert_eq!(via_old_name.len(), 6);

    let hotspots = api.hotspots(HotspotSort::Commits, None, page(10, 0)).unwrap();
    assert_eq!(hotspots.len(), 1, "one logical file despite three names");
    assert_eq!(hotspots[0].path, "c.py");
    assert_eq!(hotspots[0].total_commits, 6);
    assert!(hotspots[0].exists_at_head);
}

#[test]
fn garbage_paths_are_logged_and_never_become_entities() {
    let mut fixture = Fixture::new();

    fixture.commit(
        "Ada",
        &[("A", "status letter"), ("user@example.com", "email"), ("src/real.rs", "fn main() {}")],
        &[],
        "mixed quality input",
    );
    fixture.commit("Ada", &[("src/real.rs", "fn main() { run() }")], &[], "edit the real file");

    fixture.analyze(&small_config());

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    let api = QueryApi::new(&store, &layout).unwrap();

    let hotspots = api.hotspots(HotspotSort::Commits, None, page(50, 0)).unwrap();
    assert_eq!(hotspots.len(), 1);
    assert_eq!(hotspots[0].path, "src/real.rs");

    let log = api.validation(page(50, 0)).unwrap();
    assert!(log.iter().any(|e| e.reason == "change_code_as_path"));
    assert!(log.iter().any(|e| e.reason == "email_as_path"));
}

#[test]
fn reruns_and_seeded_clustering_are_deterministic() {
    let mut fixture = Fixture::new();

    for i in 0..5 {
        fixture.commit(
            "Ada",
            &[("api/server.rs", &format!("s{}", i)), ("api/routes.rs", &format!("r{}", i))],
            &[],
            "api change",
        );
        fixture.commit(
            "Bo",
            &[("ui/view.rs", &format!("v{}", i)), ("ui/style.css", &format!("c{}", i))],
            &[],
            "ui change",
        );
    }

    fixture.analyze(&small_config());

    let layout = fixture.layout();

    let read_edges = || {
        let store = Store::open(layout.db_path()).unwrap();
        let api = QueryApi::new(&store, &layout).unwrap();
        let result =
            api.coupling("api/server.rs", WeightColumn::Jaccard, 0.0, page(50, 0)).unwrap();
        result.neighbors
    };

    let first = read_edges();
    fixture.analyze(&small_config());
    let second = read_edges();
    assert_eq!(first, second, "identical config must reproduce identical edges");

    let clustering = ClusteringConfig {
        algorithm: "louvain".to_string(),
        min_weight: 0.0,
        seed: 7,
        ..ClusteringConfig::default()
    };

    let snapshot_a =
        orchestrator::cluster_existing(fixture.dir.path(), fixture.data.path(), &clustering, None)
            .unwrap();
    let snapshot_b =
        orchestrator::cluster_existing(fixture.dir.path(), fixture.data.path(), &clustering, None)
            .unwrap();

    let store = Store::open(layout.db_path()).unwrap();
    let api = QueryApi::new(&store, &layout).unwrap();
    let a = api.get_snapshot(snapshot_a).unwrap();
    let b = api.get_snapshot(snapshot_b).unwrap();

    let memberships = |snapshot: &cochange::snapshots::Snapshot| {
        snapshot.clusters.iter().map(|c| c.entity_ids.clone()).collect::<Vec<_>>()
    };
    assert_eq!(memberships(&a), memberships(&b));
    assert_eq!(a.clusters.len(), 2, "two independent pairs, two clusters");
}

#[test]
fn search_is_substring_and_pagination_is_stable() {
    let mut fixture = Fixture::new();

    // Distinct commit counts per file give a strict hotspot order.
    for file in 0..6 {
        for edit in 0..=file {
            fixture.commit(
                "Ada",
                &[(&format!("openhands/runtime/file_{}.py", file), &format!("edit {}", edit))],
                &[],
                "runtime work",
            );
        }
    }
    fixture.commit("Ada", &[("docs/guide.md", "intro")], &[], "write docs");

    fixture.analyze(&small_config());

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    let api = QueryApi::new(&store, &layout).unwrap();

    // Substring, not prefix: 'runtime' is in the middle of the path.
    let matched = api.hotspots(HotspotSort::Commits, Some("runtime"), page(50, 0)).unwrap();
    assert_eq!(matched.len(), 6);
    assert!(matched.iter().all(|h| h.path.contains("runtime")));

    let all = api.hotspots(HotspotSort::Commits, None, page(50, 0)).unwrap();
    let window = api.hotspots(HotspotSort::Commits, None, page(3, 2)).unwrap();
    assert_eq!(window.len(), 3);
    assert_eq!(window.as_slice(), &all[2..5]);
}

#[test]
fn snapshot_crud_round_trips() {
    let mut fixture = Fixture::new();

    for i in 0..4 {
        fixture.commit(
            "Ada",
            &[("pair/left.rs", &format!("l{}", i)), ("pair/right.rs", &format!("r{}", i))],
            &[],
            "paired edit",
        );
    }

    fixture.analyze(&small_config());

    let clustering = ClusteringConfig {
        algorithm: "components".to_string(),
        min_weight: 0.0,
        ..ClusteringConfig::default()
    };
    let id = orchestrator::cluster_existing(
        fixture.dir.path(),
        fixture.data.path(),
        &clustering,
        Some("baseline"),
    )
    .unwrap();

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    let api = QueryApi::new(&store, &layout).unwrap();

    let snapshot = api.get_snapshot(id).unwrap();
    assert_eq!(snapshot.name, "baseline");
    assert_eq!(snapshot.clusters.len(), 1);
    assert_eq!(snapshot.clusters[0].size, 2);

    let listed = api.list_snapshots(Some("base"), page(10, 0)).unwrap();
    assert_eq!(listed.len(), 1);

    let tags = vec!["q1".to_string()];
    api.update_snapshot(id, Some("renamed"), Some(&tags)).unwrap();
    let renamed = api.get_snapshot(id).unwrap();
    assert_eq!(renamed.name, "renamed");
    assert_eq!(renamed.tags, tags);
    assert_eq!(renamed.clusters, snapshot.clusters, "cluster content is immutable");

    api.delete_snapshot(id).unwrap();
    assert!(api.get_snapshot(id).is_err());
}

#[test]
fn second_analyze_while_idle_reuses_nothing_but_succeeds() {
    let mut fixture = Fixture::new();
    fixture.commit("Ada", &[("main.rs", "fn main() {}")], &[], "start");

    let first = fixture.analyze(&small_config());
    let second = fixture.analyze(&small_config());
    assert_ne!(first, second, "a finished task never blocks a new run");

    let layout = fixture.layout();
    let store = Store::open(layout.db_path()).unwrap();
    assert_eq!(store.task(second).unwrap().unwrap().state, TaskState::Completed);
}
