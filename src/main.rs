use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use indicatif_log_bridge::LogWrapper;

use cochange::config::AnalysisConfig;
use cochange::config::ChangesetMode;
use cochange::config::ClusteringConfig;
use cochange::config::Linkage;
use cochange::core::CancellationToken;
use cochange::core::Stage;
use cochange::core::WeightColumn;
use cochange::orchestrator;
use cochange::query::HotspotSort;
use cochange::query::Page;
use cochange::query::QueryApi;
use cochange::storage;
use cochange::storage::DataLayout;
use cochange::storage::Store;

/// Mine a git history for logical coupling: which files change together,
/// how strongly, and how the co-change graph clusters.
///
/// `analyze` runs the full pipeline (history extraction, changeset
/// shaping, edge building, optional clustering) and persists everything
/// under the data directory. The remaining subcommands are read-only
/// queries over those artifacts.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the git repository to analyze or query.
    #[arg(short = 'C', long, default_value = ".", global = true)]
    repo: PathBuf,

    /// Root of the engine's data directory.
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full analysis pipeline as one task.
    Analyze(Box<AnalyzeArgs>),

    /// Top files by commit count or churn.
    Hotspots {
        #[arg(long, value_enum, default_value_t = HotspotSort::Commits)]
        sort: HotspotSort,
        /// Substring filter on the file path.
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },

    /// Nested folder structure of files present at HEAD.
    Tree,

    /// Files most coupled to the given path.
    Coupling {
        path: String,
        #[arg(long, value_enum, default_value_t = WeightColumn::Jaccard)]
        metric: WeightColumn,
        #[arg(long, default_value_t = 0.0)]
        min_weight: f64,
        #[command(flatten)]
        page: PageArgs,
    },

    /// The coupling result as nodes and edges for visualization.
    Graph {
        path: String,
        #[arg(long, value_enum, default_value_t = WeightColumn::Jaccard)]
        metric: WeightColumn,
        #[arg(long, default_value_t = 0.0)]
        min_weight: f64,
        #[command(flatten)]
        page: PageArgs,
    },

    /// Commits that touched both paths.
    Evidence { src: String, dst: String },

    /// Folder-level coupling edges.
    Components {
        /// Substring filter on the component path.
        component: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },

    /// Commits touching the path across its whole rename history.
    History {
        path: String,
        #[command(flatten)]
        page: PageArgs,
    },

    /// Cluster the persisted co-change graph and save a snapshot.
    Cluster(Box<ClusterArgs>),

    /// Inspect, rename, and delete clustering snapshots.
    #[command(subcommand)]
    Snapshots(SnapshotCommand),

    /// Classify cluster drift between two snapshots.
    Compare { base: i64, head: i64 },

    /// Show an analysis task (defaults to the latest).
    Status {
        #[arg(long)]
        task: Option<i64>,
    },

    /// Page through the validation log of skipped records.
    Validation {
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Debug, clap::Args)]
struct PageArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

impl From<&PageArgs> for Page {
    fn from(args: &PageArgs) -> Self {
        Self { limit: args.limit, offset: args.offset }
    }
}

#[derive(Debug, clap::Args)]
struct AnalyzeArgs {
    /// JSON file with an AnalysisConfig; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(help_heading = "Changesets", long)]
    min_revisions: Option<i64>,
    #[arg(help_heading = "Changesets", long)]
    max_changeset_size: Option<usize>,
    #[arg(help_heading = "Changesets", long)]
    max_logical_changeset_size: Option<usize>,
    #[arg(help_heading = "Changesets", long, value_enum)]
    changeset_mode: Option<ChangesetMode>,
    #[arg(help_heading = "Changesets", long)]
    author_time_window_hours: Option<i64>,
    #[arg(help_heading = "Changesets", long)]
    ticket_id_pattern: Option<String>,

    #[arg(help_heading = "Edges", long)]
    min_cooccurrence: Option<i64>,
    #[arg(help_heading = "Edges", long)]
    component_depth: Option<usize>,
    #[arg(help_heading = "Edges", long)]
    min_component_cooccurrence: Option<i64>,
    #[arg(help_heading = "Edges", long)]
    decay_half_life_days: Option<f64>,
    #[arg(help_heading = "Edges", long)]
    topk_edges_per_file: Option<usize>,

    /// Only consider commits from the last N days.
    #[arg(help_heading = "Commit limiting", long)]
    window_days: Option<i64>,
    /// Unix seconds, inclusive lower bound on committer time.
    #[arg(help_heading = "Commit limiting", long)]
    since: Option<i64>,
    /// Unix seconds, inclusive upper bound on committer time.
    #[arg(help_heading = "Commit limiting", long)]
    until: Option<i64>,

    /// Path glob to include (repeatable).
    #[arg(help_heading = "Paths", long = "include")]
    include_patterns: Vec<String>,
    /// Path glob to exclude (repeatable).
    #[arg(help_heading = "Paths", long = "exclude")]
    exclude_patterns: Vec<String>,
    #[arg(help_heading = "Paths", long)]
    rename_similarity: Option<f64>,

    /// Also cluster the graph and persist a snapshot.
    #[arg(help_heading = "Clustering", long)]
    cluster: Option<String>,
    #[arg(help_heading = "Clustering", long, value_enum)]
    weight_column: Option<WeightColumn>,
    #[arg(help_heading = "Clustering", long)]
    cluster_min_weight: Option<f64>,
    #[arg(help_heading = "Clustering", long)]
    seed: Option<u64>,
}

#[derive(Debug, clap::Args)]
struct ClusterArgs {
    #[arg(long, default_value = "louvain")]
    algorithm: String,
    #[arg(long, value_enum, default_value_t = WeightColumn::Jaccard)]
    weight_column: WeightColumn,
    #[arg(long, default_value_t = 0.1)]
    min_weight: f64,
    /// Restrict the graph to files under this folder.
    #[arg(long)]
    folder: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    resolution: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 100)]
    max_iterations: usize,
    #[arg(long, value_enum, default_value_t = Linkage::Average)]
    linkage: Linkage,
    #[arg(long, default_value_t = 0.7)]
    cut_threshold: f64,
    #[arg(long, default_value_t = 0.6)]
    eps: f64,
    #[arg(long, default_value_t = 2)]
    min_samples: usize,
    /// Snapshot name.
    #[arg(long)]
    name: Option<String>,
    /// Snapshot tag (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    List {
        /// Substring filter on the snapshot name.
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },
    Show {
        id: i64,
    },
    Rename {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Delete {
        id: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger = env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init().expect("logger init");

    match &cli.command {
        Command::Analyze(args) => analyze(&cli, args, progress),
        Command::Hotspots { sort, search, page } => with_query(&cli, |api| {
            api.hotspots(*sort, search.as_deref(), page.into())
        }),
        Command::Tree => with_query(&cli, |api| api.file_tree()),
        Command::Coupling { path, metric, min_weight, page } => {
            with_query(&cli, |api| api.coupling(path, *metric, *min_weight, page.into()))
        }
        Command::Graph { path, metric, min_weight, page } => {
            with_query(&cli, |api| api.coupling_graph(path, *metric, *min_weight, page.into()))
        }
        Command::Evidence { src, dst } => with_query(&cli, |api| api.evidence(src, dst)),
        Command::Components { component, page } => {
            with_query(&cli, |api| api.component_coupling(component.as_deref(), page.into()))
        }
        Command::History { path, page } => {
            with_query(&cli, |api| api.file_history(path, page.into()))
        }
        Command::Cluster(args) => cluster(&cli, args),
        Command::Snapshots(command) => snapshots(&cli, command),
        Command::Compare { base, head } => {
            with_query(&cli, |api| api.compare_snapshots(*base, *head))
        }
        Command::Status { task } => with_query(&cli, |api| match task {
            Some(id) => api.task(*id)?.context("task not found"),
            None => api.latest_task()?.context("no analysis task recorded yet"),
        }),
        Command::Validation { page } => with_query(&cli, |api| api.validation(page.into())),
    }
}

fn analyze(cli: &Cli, args: &AnalyzeArgs, progress: MultiProgress) -> Result<()> {
    let config = build_config(args)?;
    let start = Instant::now();

    let bar = progress.add(ProgressBar::new(100)).with_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {percent}% {msg}")
            .expect("progress template is valid"),
    );

    let observer = {
        let bar = bar.clone();
        move |stage: Stage, progress: f64, _processed: u64, _total: u64| {
            bar.set_message(stage.to_string());
            bar.set_position((progress * 100.0) as u64);
        }
    };

    let task_id = orchestrator::run_analysis(
        &cli.repo,
        &cli.data_dir,
        &config,
        CancellationToken::new(),
        Some(&observer),
    )?;

    bar.finish_and_clear();
    log::info!("Finished in {}ms.", start.elapsed().as_millis());

    with_query(cli, |api| api.task(task_id)?.context("task row missing after run"))
}

fn build_config(args: &AnalyzeArgs) -> Result<AnalysisConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => AnalysisConfig::default(),
    };

    macro_rules! set {
        ($field:ident) => {
            if let Some(value) = &args.$field {
                config.$field = Some(value.clone());
            }
        };
        ($field:ident, copy) => {
            if let Some(value) = args.$field {
                config.$field = value;
            }
        };
    }

    set!(min_revisions, copy);
    set!(max_changeset_size, copy);
    set!(max_logical_changeset_size, copy);
    set!(changeset_mode, copy);
    set!(author_time_window_hours, copy);
    set!(ticket_id_pattern);
    set!(min_cooccurrence, copy);
    set!(component_depth, copy);
    set!(min_component_cooccurrence, copy);
    set!(topk_edges_per_file, copy);
    set!(rename_similarity, copy);

    if args.decay_half_life_days.is_some() {
        config.decay_half_life_days = args.decay_half_life_days;
    }
    if args.window_days.is_some() {
        config.window_days = args.window_days;
    }
    if args.since.is_some() {
        config.since = args.since;
    }
    if args.until.is_some() {
        config.until = args.until;
    }
    if !args.include_patterns.is_empty() {
        config.include_patterns = args.include_patterns.clone();
    }
    if !args.exclude_patterns.is_empty() {
        config.exclude_patterns = args.exclude_patterns.clone();
    }

    if let Some(algorithm) = &args.cluster {
        let mut clustering = config.clustering.take().unwrap_or_default();
        clustering.algorithm = algorithm.clone();
        if let Some(column) = args.weight_column {
            clustering.weight_column = column;
        }
        if let Some(min_weight) = args.cluster_min_weight {
            clustering.min_weight = min_weight;
        }
        if let Some(seed) = args.seed {
            clustering.seed = seed;
        }
        config.clustering = Some(clustering);
    }

    Ok(config)
}

fn cluster(cli: &Cli, args: &ClusterArgs) -> Result<()> {
    let clustering = ClusteringConfig {
        algorithm: args.algorithm.clone(),
        weight_column: args.weight_column,
        min_weight: args.min_weight,
        folder: args.folder.clone(),
        resolution: args.resolution,
        seed: args.seed,
        max_iterations: args.max_iterations,
        linkage: args.linkage,
        cut_threshold: args.cut_threshold,
        eps: args.eps,
        min_samples: args.min_samples,
        snapshot_name: args.name.clone(),
        snapshot_tags: args.tags.clone(),
    };

    let id =
        orchestrator::cluster_existing(&cli.repo, &cli.data_dir, &clustering, args.name.as_deref())?;

    with_query(cli, |api| api.get_snapshot(id))
}

fn snapshots(cli: &Cli, command: &SnapshotCommand) -> Result<()> {
    match command {
        SnapshotCommand::List { search, page } => {
            with_query(cli, |api| api.list_snapshots(search.as_deref(), page.into()))
        }
        SnapshotCommand::Show { id } => with_query(cli, |api| api.get_snapshot(*id)),
        SnapshotCommand::Rename { id, name, tags } => with_query(cli, |api| {
            let tags = if tags.is_empty() { None } else { Some(tags.as_slice()) };
            api.update_snapshot(*id, name.as_deref(), tags)?;
            api.get_snapshot(*id)
        }),
        SnapshotCommand::Delete { id } => with_query(cli, |api| {
            api.delete_snapshot(*id)?;
            Ok(serde_json::json!({ "deleted": id }))
        }),
    }
}

/// Open the repository's store read-only, run the query, print JSON.
fn with_query<T, F>(cli: &Cli, f: F) -> Result<()>
where
    T: serde::Serialize,
    F: FnOnce(&QueryApi<'_>) -> Result<T>,
{
    let repo_id = storage::repo_id(&cli.repo)?;
    let layout = DataLayout::new(&cli.data_dir, &repo_id);

    if !layout.db_path().exists() {
        anyhow::bail!(
            "no analysis data for this repository yet; run `cochange analyze` first"
        );
    }

    let store = Store::open(layout.db_path())?;
    let api = QueryApi::new(&store, &layout)?;
    let value = f(&api)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
