use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use motive::catalog::{Catalog, CatalogError, NewNode, NodeKind, Status, StatusFilter};
use motive::config::{
    ConfigError, EffectiveConfig, default_repo_config_yaml, load_effective_config,
};
use motive::coverage::CoverageError;
use motive::hook::{HookRuntime, HookVariant, PathFilter, edit_log};
use motive::index::rebuild::{
    RebuildError, RebuildInputs, ReportSource, rebuild, run_tests_and_rebuild_index,
};
use motive::index::{IndexError, MotivationIndex};
use motive::query::render::{render_locations, render_motivation, render_nodes};
use motive::query::{QueryError, locate, motivation, tree};
use motive::session::SessionStore;
use motive::store::StoreError;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const STATE_DIR: &str = ".motive";
const LOG_ENV: &str = "MOTIVE_LOG";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        let code = if value.is_corrupt() {
            "corrupt_state"
        } else {
            "store_error"
        };
        Self::new(code, value.to_string())
    }
}

impl From<CatalogError> for CliError {
    fn from(value: CatalogError) -> Self {
        match value {
            CatalogError::NotFound(_) | CatalogError::MissingParent { .. } => {
                Self::new("not_found", value.to_string())
            }
            CatalogError::Store(err) => err.into(),
            other => Self::new("catalog_error", other.to_string()),
        }
    }
}

impl From<QueryError> for CliError {
    fn from(value: QueryError) -> Self {
        match value {
            QueryError::NotFound(_) => Self::new("not_found", value.to_string()),
            QueryError::InvalidRange { .. } => Self::new("invalid_target", value.to_string()),
            QueryError::Catalog(err) => err.into(),
        }
    }
}

impl From<IndexError> for CliError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::Missing(_) => Self::new("index_missing", value.to_string()),
            IndexError::Store(err) => err.into(),
        }
    }
}

impl From<RebuildError> for CliError {
    fn from(value: RebuildError) -> Self {
        match value {
            RebuildError::NoInputs => Self::new("no_inputs", value.to_string()),
            RebuildError::MissingCatalog(_) => Self::new("not_initialized", value.to_string()),
            RebuildError::Catalog(err) => err.into(),
            RebuildError::Index(err) => err.into(),
            RebuildError::Coverage(CoverageError::Parse { .. }) => {
                Self::new("parse_error", value.to_string())
            }
            RebuildError::Coverage(_) => Self::new("report_error", value.to_string()),
            RebuildError::Spawn { .. } => Self::new("command_spawn_error", value.to_string()),
            RebuildError::Timeout(_) => Self::new("test_timeout", value.to_string()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "motive")]
#[command(about = "Explains why code exists by mapping it to stakeholder intent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Status(StatusArgs),
    Locate(LocateArgs),
    Tree(TreeArgs),
    Motivation(MotivationArgs),
    Add(AddArgs),
    Link(LinkArgs),
    Rebuild,
    Test(TestArgs),
    Hook(HookArgs),
    SessionStart(SessionStartArgs),
    Log(LogArgs),
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Fail unless every facet is passing.
    #[arg(long)]
    check: bool,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct LocateArgs {
    node_id: String,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct TreeArgs {
    node_id: Option<String>,
    #[arg(long)]
    status: Option<StatusFilter>,
    #[arg(long, default_value_t = 0)]
    max_depth: usize,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct MotivationArgs {
    /// `<file>`, `<file>:<line>` or `<file>:<start>-<end>`.
    target: String,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct AddArgs {
    kind: NodeKind,
    text: String,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long)]
    priority: Option<i64>,
    #[arg(long = "label")]
    labels: Vec<String>,
}

#[derive(Args, Debug)]
struct LinkArgs {
    facet_id: String,
    test_id: String,
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Overrides `test_timeout_secs`.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct HookArgs {
    #[arg(long)]
    variant: Option<HookVariant>,
}

#[derive(Args, Debug)]
struct SessionStartArgs {
    #[arg(long)]
    session_id: Option<String>,
}

#[derive(Args, Debug)]
struct LogArgs {
    #[arg(long)]
    unmapped: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct WorkspacePaths {
    root: PathBuf,
    /// Falls back to the workspace root when `HOME` is unset.
    home: PathBuf,
    state: PathBuf,
    catalog: PathBuf,
    index: PathBuf,
    seen: PathBuf,
    session_id: PathBuf,
    edit_log: PathBuf,
    repo_config: PathBuf,
    user_config: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Hook(args) => {
            run_hook(args);
            Ok(())
        }
        command => {
            let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
            let base = workspace_paths(&cwd, Some(home_dir()?));
            run_command(command, &base)
        }
    }
}

/// Hooks never fail the agent's tool call: a missing working directory
/// means nothing to do, a missing `HOME` skips the user config layer, and
/// a broken config falls back to defaults.
fn run_hook(args: HookArgs) {
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            tracing::debug!(error = %err, "hook has no working directory");
            return;
        }
    };
    let base = workspace_paths(&cwd, home_dir().ok());
    let config = load_config(&base).unwrap_or_else(|err| {
        tracing::warn!(error = %err.message, "hook using default config");
        EffectiveConfig::default()
    });
    cmd_hook(&base.with_config(&config), &config, args);
}

fn run_command(command: Command, base: &WorkspacePaths) -> Result<(), CliError> {
    let config = load_config(base)?;
    let paths = base.with_config(&config);
    match command {
        Command::Init => cmd_init(&paths),
        Command::Status(args) => cmd_status(&paths, args),
        Command::Locate(args) => cmd_locate(&paths, args),
        Command::Tree(args) => cmd_tree(&paths, args),
        Command::Motivation(args) => cmd_motivation(&paths, args),
        Command::Add(args) => cmd_add(&paths, args),
        Command::Link(args) => cmd_link(&paths, args),
        Command::Rebuild => cmd_rebuild(&paths, &config),
        Command::Test(args) => cmd_test(&paths, &config, args),
        Command::SessionStart(args) => cmd_session_start(&paths, args),
        Command::Log(args) => cmd_log(&paths, args),
        Command::Hook(_) => Ok(()),
    }
}

fn cmd_init(paths: &WorkspacePaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.state).map_err(|err| CliError::io("mkdir_error", err))?;
    write_default_config(paths)?;
    let created_catalog = !paths.catalog.exists();
    if created_catalog {
        Catalog::default().save(&paths.catalog)?;
    }

    print_json(&json!({
        "status": "ok",
        "workspace": path_string(&paths.state),
        "config": path_string(&paths.repo_config),
        "catalog": path_string(&paths.catalog),
        "created_catalog": created_catalog,
    }))
}

fn cmd_status(paths: &WorkspacePaths, args: StatusArgs) -> Result<(), CliError> {
    let catalog = Catalog::load(&paths.catalog)?;
    let statuses = catalog.status_map();

    let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
    let mut facet_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut failing = Vec::new();
    let mut unlinked = Vec::new();
    for node in catalog.nodes() {
        *kinds.entry(node.kind.as_str()).or_default() += 1;
        if !node.is_facet() {
            continue;
        }
        let status = node.facet_status();
        *facet_counts.entry(status.as_str()).or_default() += 1;
        if status == Status::Failing {
            failing.push(node.id.clone());
        }
        if node.test.is_none() {
            unlinked.push(node.id.clone());
        }
    }
    let goals = catalog
        .roots()
        .into_iter()
        .map(|goal| {
            json!({
                "id": goal.id,
                "text": goal.text,
                "status": statuses.get(&goal.id).copied().unwrap_or_default(),
            })
        })
        .collect::<Vec<_>>();

    let index = match MotivationIndex::load(&paths.index) {
        Ok(index) => json!({
            "present": true,
            "attribution": index.attribution,
            "files": index.forward.len(),
            "located_facets": index.located_in.len(),
        }),
        Err(err) if err.is_missing() => json!({ "present": false }),
        Err(err) => json!({ "present": true, "error": err.to_string() }),
    };

    let facet_total = facet_counts.values().sum::<usize>();
    let passing = facet_counts.get("passing").copied().unwrap_or(0);
    let satisfied = facet_total > 0 && passing == facet_total;

    if args.pretty {
        let view = tree(&catalog, None, None, 0)?;
        print!("{}", render_nodes(&view));
        println!(
            "{facet_total} facets: {passing} passing, {} failing, {} untested",
            facet_counts.get("failing").copied().unwrap_or(0),
            facet_counts.get("untested").copied().unwrap_or(0)
        );
        if !unlinked.is_empty() {
            println!("unlinked: {}", unlinked.join(", "));
        }
    } else {
        print_json(&json!({
            "nodes": kinds,
            "facets": facet_counts,
            "goals": goals,
            "failing": failing,
            "unlinked": unlinked,
            "satisfied": satisfied,
            "index": index,
        }))?;
    }

    if args.check && !satisfied {
        return Err(CliError::new(
            "unsatisfied",
            format!("{} of {facet_total} facets are not passing", facet_total - passing),
        ));
    }
    Ok(())
}

fn cmd_locate(paths: &WorkspacePaths, args: LocateArgs) -> Result<(), CliError> {
    let catalog = Catalog::load_or_empty(&paths.catalog);
    let index = load_index_for_query(paths);
    let locations = locate(&catalog, &index, &args.node_id)?;
    if args.pretty {
        print!("{}", render_locations(&args.node_id, &locations));
        return Ok(());
    }
    print_json(&json!({
        "node_id": args.node_id,
        "locations": locations,
    }))
}

fn cmd_tree(paths: &WorkspacePaths, args: TreeArgs) -> Result<(), CliError> {
    let catalog = Catalog::load_or_empty(&paths.catalog);
    let nodes = tree(&catalog, args.node_id.as_deref(), args.status, args.max_depth)?;
    if args.pretty {
        print!("{}", render_nodes(&nodes));
        return Ok(());
    }
    print_json(&json!({ "roots": nodes }))
}

fn cmd_motivation(paths: &WorkspacePaths, args: MotivationArgs) -> Result<(), CliError> {
    let (file, range) = parse_file_range_target(&args.target)?;
    let catalog = Catalog::load_or_empty(&paths.catalog);
    let index_missing = !paths.index.exists();
    let index = load_index_for_query(paths);
    let file = relative_to_root(&paths.root, file);
    let result = motivation(&catalog, &index, &file, range)?;

    if args.pretty {
        print!("{}", render_motivation(&result));
        return Ok(());
    }
    let mut payload = serde_json::to_value(&result)?;
    if let Value::Object(map) = &mut payload {
        map.insert("found".to_string(), json!(!result.is_empty()));
        map.insert("index_missing".to_string(), json!(index_missing));
    }
    print_json(&payload)
}

fn cmd_add(paths: &WorkspacePaths, args: AddArgs) -> Result<(), CliError> {
    require_initialized(paths)?;
    let mut catalog = Catalog::load(&paths.catalog)?;
    let node = catalog
        .add(NewNode {
            kind: args.kind,
            text: args.text,
            parent: args.parent,
            priority: args.priority,
            labels: args.labels,
        })?
        .clone();
    catalog.save(&paths.catalog)?;
    print_json(&serde_json::to_value(&node)?)
}

fn cmd_link(paths: &WorkspacePaths, args: LinkArgs) -> Result<(), CliError> {
    require_initialized(paths)?;
    let mut catalog = Catalog::load(&paths.catalog)?;
    catalog.link(&args.facet_id, &args.test_id)?;
    catalog.save(&paths.catalog)?;
    let facet = catalog.require(&args.facet_id)?;
    print_json(&serde_json::to_value(facet)?)
}

fn cmd_rebuild(paths: &WorkspacePaths, config: &EffectiveConfig) -> Result<(), CliError> {
    require_initialized(paths)?;
    let summary = rebuild(&rebuild_inputs(paths, config))?;
    print_json(&json!({
        "status": "ok",
        "rebuild": summary,
    }))
}

fn cmd_test(
    paths: &WorkspacePaths,
    config: &EffectiveConfig,
    args: TestArgs,
) -> Result<(), CliError> {
    require_initialized(paths)?;
    let command = config.test_command.as_deref().ok_or_else(|| {
        CliError::new(
            "no_test_command",
            "set `test_command` in .motive/config.yml",
        )
    })?;
    let timeout = Duration::from_secs(args.timeout.unwrap_or(config.test_timeout_secs).max(1));
    let run = run_tests_and_rebuild_index(
        &rebuild_inputs(paths, config),
        command,
        &paths.root,
        timeout,
    )?;
    print_json(&json!({
        "status": "ok",
        "tests_passed": run.exit_code == Some(0),
        "run": run,
    }))
}

fn cmd_hook(paths: &WorkspacePaths, config: &EffectiveConfig, args: HookArgs) {
    let filter = PathFilter::new(&config.hook.exclude).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "ignoring invalid hook exclude patterns");
        PathFilter::default()
    });
    let runtime = HookRuntime {
        root: paths.root.clone(),
        catalog: paths.catalog.clone(),
        index: paths.index.clone(),
        edit_log: paths.edit_log.clone(),
        session: session_store(paths),
        variant: args.variant.unwrap_or(config.hook.variant),
        filter,
    };
    let timeout = Duration::from_millis(config.hook.timeout_ms);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut raw = String::new();
        let output = match io::stdin().read_to_string(&mut raw) {
            Ok(_) => runtime.run(&raw),
            Err(err) => {
                tracing::debug!(error = %err, "cannot read hook event");
                None
            }
        };
        let _ = tx.send(output);
    });

    match rx.recv_timeout(timeout) {
        Ok(Some(output)) => match serde_json::to_string(&output) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => tracing::debug!(error = %err, "cannot render hook output"),
        },
        Ok(None) => {}
        Err(_) => tracing::debug!(?timeout, "hook timed out"),
    }
}

fn cmd_session_start(paths: &WorkspacePaths, args: SessionStartArgs) -> Result<(), CliError> {
    fs::create_dir_all(&paths.state).map_err(|err| CliError::io("mkdir_error", err))?;
    session_store(paths).start(args.session_id.as_deref())?;
    print_json(&json!({
        "status": "ok",
        "session_id": args.session_id,
    }))
}

fn cmd_log(paths: &WorkspacePaths, args: LogArgs) -> Result<(), CliError> {
    let mut entries = edit_log::load(&paths.edit_log);
    if args.unmapped {
        entries.retain(|entry| entry.is_unmapped());
    }
    if let Some(limit) = args.limit {
        entries = entries.split_off(entries.len().saturating_sub(limit));
    }
    print_json(&json!({
        "count": entries.len(),
        "entries": entries,
    }))
}

fn load_index_for_query(paths: &WorkspacePaths) -> MotivationIndex {
    match MotivationIndex::load(&paths.index) {
        Ok(index) => index,
        Err(err) => {
            if !err.is_missing() {
                tracing::warn!(error = %err, "motivation index unreadable, treating as empty");
            }
            MotivationIndex::default()
        }
    }
}

fn rebuild_inputs(paths: &WorkspacePaths, config: &EffectiveConfig) -> RebuildInputs {
    RebuildInputs {
        catalog: paths.catalog.clone(),
        index: paths.index.clone(),
        coverage: config.coverage.as_ref().map(|coverage| ReportSource {
            path: config.resolve(&coverage.path, &paths.root, &paths.home),
            format: coverage.format,
        }),
        results: config
            .results
            .as_deref()
            .map(|results| config.resolve(results, &paths.root, &paths.home)),
    }
}

fn session_store(paths: &WorkspacePaths) -> SessionStore {
    SessionStore::new(&paths.seen, &paths.session_id)
}

/// `file`, `file:line` or `file:start-end`, lines 1-based.
fn parse_file_range_target(target: &str) -> Result<(&str, Option<(u32, u32)>), CliError> {
    let Some((file, range)) = target.rsplit_once(':') else {
        return Ok((target, None));
    };
    if file.is_empty() {
        return Err(CliError::new("invalid_target", "missing file before `:`"));
    }
    let (start_raw, end_raw) = range.split_once('-').unwrap_or((range, range));

    let start: u32 = start_raw
        .trim()
        .parse()
        .map_err(|_| CliError::new("invalid_target", "start line must be an integer"))?;
    let end: u32 = end_raw
        .trim()
        .parse()
        .map_err(|_| CliError::new("invalid_target", "end line must be an integer"))?;
    if start == 0 || end == 0 || end < start {
        return Err(CliError::new(
            "invalid_target",
            "line range must be 1-based and end must be >= start",
        ));
    }

    Ok((file, Some((start, end))))
}

fn relative_to_root(root: &Path, file: &str) -> String {
    Path::new(file)
        .strip_prefix(root)
        .map(path_string)
        .unwrap_or_else(|_| file.to_string())
}

fn load_config(paths: &WorkspacePaths) -> Result<EffectiveConfig, CliError> {
    Ok(load_effective_config(
        &paths.root,
        Some(&paths.repo_config),
        paths.user_config.as_deref(),
    )?)
}

fn workspace_paths(cwd: &Path, home: Option<PathBuf>) -> WorkspacePaths {
    let state = cwd.join(STATE_DIR);
    let user_config = home
        .as_ref()
        .map(|home| home.join(STATE_DIR).join("config.yml"));
    WorkspacePaths {
        root: cwd.to_path_buf(),
        catalog: state.join("catalog.json"),
        index: state.join("index.json"),
        seen: state.join("session-seen.json"),
        session_id: state.join("session-id"),
        edit_log: state.join("edit-log.json"),
        repo_config: state.join("config.yml"),
        user_config,
        state,
        home: home.unwrap_or_else(|| cwd.to_path_buf()),
    }
}

impl WorkspacePaths {
    fn with_config(&self, config: &EffectiveConfig) -> Self {
        let mut paths = self.clone();
        paths.catalog = config.resolve(&config.catalog, &self.root, &self.home);
        paths.index = config.resolve(&config.index, &self.root, &self.home);
        paths
    }
}

fn require_initialized(paths: &WorkspacePaths) -> Result<(), CliError> {
    if !paths.state.is_dir() {
        return Err(CliError::new(
            "not_initialized",
            "workspace is not initialized; run `motive init`",
        ));
    }
    Ok(())
}

fn write_default_config(paths: &WorkspacePaths) -> Result<(), CliError> {
    if paths.repo_config.exists() {
        return Ok(());
    }
    if let Some(parent) = paths.repo_config.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    fs::write(&paths.repo_config, default_repo_config_yaml())
        .map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
