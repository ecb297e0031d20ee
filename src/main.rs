use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hypershell::autoscale::{AutoscalerOptions, Policy};
use hypershell::client::{run_client, ClientOptions};
use hypershell::cluster::{run_local_cluster, run_remote_cluster};
use hypershell::config::{self, ConfigLoader, Settings};
use hypershell::error::{HyperError, Result};
use hypershell::server::receiver::FailureSink;
use hypershell::server::submitter::{SubmitSink, Submitter, TaskSource};
use hypershell::server::{Server, ServerOptions};
use hypershell::shutdown::{install_force_handler, install_shutdown_handler};
use hypershell::store::{TaskFilter, TaskStore};
use hypershell::task::{split_argline, Task};
use hypershell::template::DEFAULT_TEMPLATE;

#[derive(Parser, Debug)]
#[command(name = "hypershell")]
#[command(version, about = "A distributed many-task execution engine for shell command-lines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a cluster: server plus managed clients
    Cluster(ClusterArgs),
    /// Launch the server, scheduling from the database or an input file
    Server(ServerArgs),
    /// Launch a client and run tasks in parallel
    Client(ClientArgs),
    /// Submit tasks to the database
    Submit(SubmitArgs),
    /// Initialize the database schema
    Initdb,
    /// Operate on individual tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Inspect and modify configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Path to the task file ("-" for stdin)
    filepath: Option<String>,

    /// Number of task executors per client
    #[arg(short = 'N', long, default_value_t = 1)]
    num_tasks: usize,

    /// Command-line template pattern
    #[arg(short = 't', long, default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Size of task bundles
    #[arg(short = 'b', long)]
    bundlesize: Option<usize>,

    /// Seconds to wait before flushing a partial bundle
    #[arg(short = 'w', long)]
    bundlewait: Option<u64>,

    /// Automatically retry failed tasks this many times
    #[arg(short = 'r', long, default_value_t = 0)]
    max_retries: u32,

    /// Schedule failed tasks before new tasks
    #[arg(long)]
    eager: bool,

    /// Run without a database (submit directly to clients)
    #[arg(long)]
    no_db: bool,

    /// Disable client confirmation of received bundles
    #[arg(long)]
    no_confirm: bool,

    /// Keep scheduling even when all tasks are finished
    #[arg(long, conflicts_with = "restart")]
    forever: bool,

    /// Resume scheduling from previously interrupted tasks
    #[arg(long)]
    restart: bool,

    /// Port number for the server
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Number of local clients
    #[arg(long, default_value_t = 1)]
    num_clients: usize,

    /// Launch clients over SSH on these hosts (comma-separated)
    #[arg(long, conflicts_with = "launcher")]
    ssh: Option<String>,

    /// Extra arguments for ssh
    #[arg(long, default_value = "")]
    ssh_args: String,

    /// Launch clients with mpirun
    #[arg(long, conflicts_with_all = ["ssh", "launcher"])]
    mpi: bool,

    /// Launch clients with a custom command
    #[arg(long)]
    launcher: Option<String>,

    /// Capture individual task stdout and stderr
    #[arg(short = 'c', long)]
    capture: bool,

    /// Redirect task output to a file
    #[arg(short = 'o', long, conflicts_with = "capture")]
    output: Option<PathBuf>,

    /// Redirect task errors to a file
    #[arg(short = 'e', long, conflicts_with = "capture")]
    errors: Option<PathBuf>,

    /// Write failed task args to a file
    #[arg(short = 'f', long, conflicts_with = "print_failures")]
    failures: Option<PathBuf>,

    /// Print failed task args to stdout
    #[arg(long = "print", )]
    print_failures: bool,

    /// Client idle timeout in seconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    /// Task walltime limit in seconds
    #[arg(short = 'W', long)]
    task_timeout: Option<u64>,

    /// Signal escalation wait period in seconds
    #[arg(short = 'S', long)]
    signalwait: Option<u64>,

    /// Client start-up delay in seconds (negative for random)
    #[arg(short = 'd', long, default_value_t = 0.0)]
    delay_start: f64,

    /// Enable autoscaling with the given policy (fixed or dynamic)
    #[arg(short = 'A', long)]
    autoscaling: Option<String>,

    /// Autoscaling factor
    #[arg(short = 'F', long)]
    factor: Option<f64>,

    /// Autoscaling period in seconds
    #[arg(short = 'P', long)]
    period: Option<u64>,

    /// Initial cluster size
    #[arg(short = 'I', long)]
    init_size: Option<usize>,

    /// Minimum cluster size
    #[arg(short = 'X', long)]
    min_size: Option<usize>,

    /// Maximum cluster size
    #[arg(short = 'Y', long)]
    max_size: Option<usize>,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Path to the task file ("-" for stdin)
    filepath: Option<String>,

    #[arg(short = 'H', long)]
    bind: Option<String>,

    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Authentication token for clients
    #[arg(short = 'k', long)]
    auth: Option<String>,

    #[arg(short = 'b', long)]
    bundlesize: Option<usize>,

    #[arg(short = 'w', long)]
    bundlewait: Option<u64>,

    #[arg(short = 'r', long, default_value_t = 0)]
    max_retries: u32,

    #[arg(long)]
    eager: bool,

    #[arg(long, conflicts_with_all = ["restart", "filepath"])]
    forever: bool,

    #[arg(long)]
    restart: bool,

    #[arg(long)]
    no_db: bool,

    #[arg(long)]
    no_confirm: bool,

    /// Outbound queue capacity in bundles
    #[arg(long)]
    queuesize: Option<usize>,

    /// Write failed task args to a file
    #[arg(short = 'f', long, conflicts_with = "print_failures")]
    failures: Option<PathBuf>,

    /// Print failed task args to stdout
    #[arg(long = "print")]
    print_failures: bool,
}

#[derive(Args, Debug)]
struct ClientArgs {
    #[arg(short = 'H', long)]
    host: Option<String>,

    #[arg(short = 'p', long)]
    port: Option<u16>,

    #[arg(short = 'k', long)]
    auth: Option<String>,

    /// Number of task executors to run in parallel
    #[arg(short = 'N', long, default_value_t = 1)]
    num_tasks: usize,

    #[arg(short = 't', long, default_value = DEFAULT_TEMPLATE)]
    template: String,

    #[arg(short = 'b', long)]
    bundlesize: Option<usize>,

    #[arg(short = 'w', long)]
    bundlewait: Option<u64>,

    /// Seconds to wait before start-up (negative for random)
    #[arg(short = 'd', long, default_value_t = 0.0)]
    delay_start: f64,

    #[arg(long)]
    no_confirm: bool,

    #[arg(short = 'o', long, conflicts_with = "capture")]
    output: Option<PathBuf>,

    #[arg(short = 'e', long, conflicts_with = "capture")]
    errors: Option<PathBuf>,

    /// Capture individual task stdout and stderr
    #[arg(short = 'c', long)]
    capture: bool,

    /// Shutdown automatically after this many idle seconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    #[arg(short = 'W', long)]
    task_timeout: Option<u64>,

    #[arg(short = 'S', long)]
    signalwait: Option<u64>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Path to the task file ("-" for stdin)
    filepath: Option<String>,

    #[arg(short = 'b', long)]
    bundlesize: Option<usize>,

    #[arg(short = 'w', long)]
    bundlewait: Option<u64>,

    /// Template applied to each submitted line
    #[arg(short = 't', long)]
    template: Option<String>,

    /// Tag applied to every submitted task (key or key=value)
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Submit a single task
    Submit {
        /// The command-line for the task
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Show a task record as JSON
    Info { id: Uuid },
    /// Block until a task completes
    Wait {
        id: Uuid,
        /// Seconds between polls
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Submit a task, wait for it, and exit with its status
    Run {
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
    /// Search task records
    Search {
        #[arg(long)]
        completed: bool,
        #[arg(long)]
        failed: bool,
        #[arg(long)]
        remaining: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Update a task field or tag
    Update {
        id: Uuid,
        /// field=value assignments
        #[arg(required = true)]
        assignments: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Cancel a task so the scheduler skips it
    Cancel { id: Uuid },
    /// Permanently delete a task record
    Delete { id: Uuid },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the value at a dotted path
    Get { path: String },
    /// Assign a value in a configuration file
    Set {
        path: String,
        value: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    /// Show which layer defines a dotted path
    Which { path: String },
    /// Open a configuration file in $EDITOR
    Edit {
        #[arg(long, default_value = "user")]
        scope: String,
    },
}

/// Uncaught panics leave a traceback file under the logging directory.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let dir = PathBuf::from(home).join(".hypershell").join("log");
        if std::fs::create_dir_all(&dir).is_ok() {
            let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
            let path = dir.join(format!("traceback-{stamp}.log"));
            let trace = std::backtrace::Backtrace::force_capture();
            let _ = std::fs::write(&path, format!("{info}\n\n{trace}\n"));
        }
        default_hook(info);
    }));
}

#[tokio::main]
async fn main() {
    install_panic_hook();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let loader = ConfigLoader::load()?;
    let settings = loader.settings()?;
    init_logging(&settings);
    match cli.command {
        Command::Cluster(args) => run_cluster(args, settings).await,
        Command::Server(args) => run_server(args, settings).await,
        Command::Client(args) => run_client_command(args, settings).await,
        Command::Submit(args) => run_submit(args, settings).await,
        Command::Initdb => {
            let store = TaskStore::connect(&settings.database).await?;
            store.init_schema().await?;
            println!("database initialized");
            Ok(0)
        }
        Command::Task { command } => run_task(command, settings).await,
        Command::Config { command } => run_config(command, loader),
    }
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hypershell={}", settings.logging.level)));
    if settings.logging.style == "detailed" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn task_source(filepath: Option<String>) -> TaskSource {
    match filepath.as_deref() {
        None | Some("-") => TaskSource::Stdin,
        Some(path) => TaskSource::File(PathBuf::from(path)),
    }
}

fn parse_tags(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for entry in raw {
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        };
        hypershell::task::validate_tag(&key, &value)?;
        tags.insert(key, value);
    }
    Ok(tags)
}

async fn run_cluster(args: ClusterArgs, settings: Settings) -> Result<i32> {
    let shutdown = install_shutdown_handler();
    let force = install_force_handler();

    let mut server_options = ServerOptions::new(&settings);
    server_options.no_db = args.no_db;
    server_options.no_confirm = args.no_confirm;
    server_options.forever = args.forever;
    server_options.restart = args.restart;
    server_options.max_retries = args.max_retries;
    server_options.eager = args.eager;
    if let Some(port) = args.port {
        server_options.port = port;
    }
    if let Some(bundlesize) = args.bundlesize {
        server_options.bundlesize = bundlesize;
    }
    if let Some(bundlewait) = args.bundlewait {
        server_options.bundlewait = bundlewait;
    }
    server_options.failure_sink = failure_sink(args.print_failures, args.failures.clone());
    if !args.restart && !args.forever {
        server_options.source = Some(task_source(args.filepath.clone()));
    }

    let mut client_options = ClientOptions::new(&settings);
    client_options.num_tasks = args.num_tasks;
    client_options.template = args.template.clone();
    client_options.capture = args.capture;
    client_options.output_path = args.output.clone();
    client_options.errors_path = args.errors.clone();
    client_options.delay = args.delay_start;
    client_options.no_confirm = args.no_confirm;
    if let Some(bundlesize) = args.bundlesize {
        client_options.bundlesize = bundlesize;
    }
    if let Some(bundlewait) = args.bundlewait {
        client_options.bundlewait = bundlewait;
    }
    if let Some(timeout) = args.timeout {
        client_options.timeout = Some(timeout);
    }
    if let Some(timeout) = args.task_timeout {
        client_options.task_timeout = Some(timeout);
    }
    if let Some(signalwait) = args.signalwait {
        client_options.signalwait = signalwait;
    }

    let launchers = if let Some(hosts) = &args.ssh {
        hosts
            .split(',')
            .map(|host| {
                if args.ssh_args.is_empty() {
                    format!("ssh {}", host.trim())
                } else {
                    format!("ssh {} {}", args.ssh_args, host.trim())
                }
            })
            .collect()
    } else if args.mpi {
        vec!["mpirun".to_string()]
    } else {
        args.launcher.clone().into_iter().collect()
    };

    let autoscale = match &args.autoscaling {
        Some(policy) => {
            if args.no_db {
                return Err(HyperError::Config(
                    "autoscaling requires a database (remove --no-db)".to_string(),
                ));
            }
            server_options.forever = true;
            Some(AutoscalerOptions {
                policy: policy.parse::<Policy>()?,
                factor: args.factor.unwrap_or(settings.autoscale.factor),
                period: args.period.unwrap_or(settings.autoscale.period),
                init: args.init_size.unwrap_or(settings.autoscale.size.init),
                min: args.min_size.unwrap_or(settings.autoscale.size.min),
                max: args.max_size.unwrap_or(settings.autoscale.size.max),
                launcher: settings.autoscale.launcher.clone(),
                client_command: String::new(),
            })
        }
        None => None,
    };

    if launchers.is_empty() && autoscale.is_none() {
        run_local_cluster(
            server_options,
            client_options,
            args.num_clients,
            shutdown,
            force,
        )
        .await
    } else {
        run_remote_cluster(server_options, client_options, launchers, autoscale, shutdown).await
    }
}

async fn run_server(args: ServerArgs, settings: Settings) -> Result<i32> {
    let shutdown = install_shutdown_handler();
    let mut options = ServerOptions::new(&settings);
    if let Some(bind) = args.bind {
        options.bind = bind;
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    if let Some(auth) = args.auth {
        options.auth = auth;
    }
    if let Some(bundlesize) = args.bundlesize {
        options.bundlesize = bundlesize;
    }
    if let Some(bundlewait) = args.bundlewait {
        options.bundlewait = bundlewait;
    }
    if let Some(queuesize) = args.queuesize {
        options.queuesize = queuesize;
    }
    options.max_retries = args.max_retries;
    options.eager = args.eager;
    options.forever = args.forever;
    options.restart = args.restart;
    options.no_db = args.no_db;
    options.no_confirm = args.no_confirm;
    options.failure_sink = failure_sink(args.print_failures, args.failures);
    if !args.restart && !args.forever {
        options.source = Some(task_source(args.filepath));
    }
    let server = Server::start(options, shutdown).await?;
    let summary = server.join().await?;
    Ok(if summary.failed > 0 { 1 } else { 0 })
}

async fn run_client_command(args: ClientArgs, settings: Settings) -> Result<i32> {
    let shutdown = install_shutdown_handler();
    let force = install_force_handler();
    let mut options = ClientOptions::new(&settings);
    if let Some(host) = args.host {
        options.host = host;
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    if let Some(auth) = args.auth {
        options.auth = auth;
    }
    options.num_tasks = args.num_tasks;
    options.template = args.template;
    if let Some(bundlesize) = args.bundlesize {
        options.bundlesize = bundlesize;
    }
    if let Some(bundlewait) = args.bundlewait {
        options.bundlewait = bundlewait;
    }
    options.delay = args.delay_start;
    options.no_confirm = args.no_confirm;
    options.capture = args.capture;
    options.output_path = args.output;
    options.errors_path = args.errors;
    if let Some(timeout) = args.timeout {
        options.timeout = Some(timeout);
    }
    if let Some(timeout) = args.task_timeout {
        options.task_timeout = Some(timeout);
    }
    if let Some(signalwait) = args.signalwait {
        options.signalwait = signalwait;
    }
    run_client(options, shutdown, force).await?;
    Ok(0)
}

async fn run_submit(args: SubmitArgs, settings: Settings) -> Result<i32> {
    let shutdown = install_shutdown_handler();
    let store = TaskStore::connect(&settings.database).await?;
    let submitter = Submitter {
        source: task_source(args.filepath),
        sink: SubmitSink::Store(store),
        template: args.template.as_deref().map(hypershell::template::Template::new),
        tags: parse_tags(&args.tags)?,
        bundlesize: args.bundlesize.unwrap_or(settings.submit.bundlesize),
        bundlewait: args.bundlewait.unwrap_or(settings.submit.bundlewait),
        submitted: Default::default(),
        done: Default::default(),
        shutdown,
    };
    let count = submitter.run().await?;
    println!("submitted {count} tasks");
    Ok(0)
}

async fn run_task(command: TaskCommand, settings: Settings) -> Result<i32> {
    let store = TaskStore::connect(&settings.database).await?;
    match command {
        TaskCommand::Submit { args, tags } => {
            let task = Task::new(&args.join(" "), &parse_tags(&tags)?)?;
            store.insert(std::slice::from_ref(&task)).await?;
            println!("{}", task.id);
            Ok(0)
        }
        TaskCommand::Info { id } => {
            let task = store
                .fetch(id)
                .await?
                .ok_or_else(|| HyperError::Config(format!("no task with id {id}")))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(0)
        }
        TaskCommand::Wait { id, interval, timeout } => {
            let task = wait_for(&store, id, interval, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(0)
        }
        TaskCommand::Run { args } => {
            let (argline, tags) = split_argline(&args.join(" "))?;
            let task = Task::new(&argline, &tags)?;
            let id = task.id;
            store.insert(std::slice::from_ref(&task)).await?;
            let task = wait_for(&store, id, 2, None).await?;
            Ok(task.exit_status.unwrap_or(1))
        }
        TaskCommand::Search {
            completed,
            failed,
            remaining,
            tags,
            limit,
        } => {
            let filter = TaskFilter {
                completed,
                failed,
                remaining,
                tags: parse_tags(&tags)?.into_iter().collect(),
                limit,
            };
            for task in store.search(&filter).await? {
                println!("{}", serde_json::to_string(&task)?);
            }
            Ok(0)
        }
        TaskCommand::Update { id, assignments, tags } => {
            for assignment in &assignments {
                let (field, value) = assignment.split_once('=').ok_or_else(|| {
                    HyperError::Config(format!("expected field=value, got \"{assignment}\""))
                })?;
                store.update_field(id, field, value).await?;
            }
            for (key, value) in parse_tags(&tags)? {
                store.set_tag(id, &key, &value).await?;
            }
            Ok(0)
        }
        TaskCommand::Cancel { id } => {
            let cancelled = store.cancel(&[id]).await?;
            if cancelled == 0 {
                return Err(HyperError::Config(format!(
                    "task {id} not found or already complete"
                )));
            }
            Ok(0)
        }
        TaskCommand::Delete { id } => {
            let deleted = store.delete(&[id]).await?;
            if deleted == 0 {
                return Err(HyperError::Config(format!("no task with id {id}")));
            }
            Ok(0)
        }
    }
}

async fn wait_for(
    store: &TaskStore,
    id: Uuid,
    interval: u64,
    timeout: Option<u64>,
) -> Result<Task> {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + tokio::time::Duration::from_secs(t));
    loop {
        let task = store
            .fetch(id)
            .await?
            .ok_or_else(|| HyperError::Config(format!("no task with id {id}")))?;
        if task.is_complete() {
            return Ok(task);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(HyperError::Timeout);
            }
        }
        tokio::time::sleep(tokio::time::Duration::from_secs(interval.max(1))).await;
    }
}

fn run_config(command: ConfigCommand, loader: ConfigLoader) -> Result<i32> {
    match command {
        ConfigCommand::Get { path } => match loader.get(&path)? {
            Some(value) => {
                println!("{value}");
                Ok(0)
            }
            None => Err(HyperError::Config(format!("no such option: {path}"))),
        },
        ConfigCommand::Which { path } => match loader.which(&path) {
            Some(layer) => {
                println!("{layer}");
                Ok(0)
            }
            None => Err(HyperError::Config(format!("no such option: {path}"))),
        },
        ConfigCommand::Set { path, value, scope } => {
            config::update_file(&scope_path(&scope)?, &path, &value)?;
            Ok(0)
        }
        ConfigCommand::Edit { scope } => {
            let path = scope_path(&scope)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| HyperError::Config(err.to_string()))?;
            }
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let status = std::process::Command::new(editor).arg(&path).status()?;
            Ok(status.code().unwrap_or(1))
        }
    }
}

fn scope_path(scope: &str) -> Result<PathBuf> {
    match scope {
        "system" => Ok(config::system_path()),
        "user" => Ok(config::user_path()),
        "local" => Ok(config::local_path()),
        other => Err(HyperError::Config(format!(
            "unknown scope '{other}' (expected system, user, or local)"
        ))),
    }
}

fn failure_sink(print: bool, path: Option<PathBuf>) -> Option<FailureSink> {
    if print {
        Some(FailureSink::Stdout)
    } else {
        path.map(FailureSink::File)
    }
}
