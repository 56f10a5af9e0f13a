mod cache;
mod checkmk;
mod client;
mod config;
mod downtime;
mod export;
mod kisters;
mod output;
mod rapid;
mod ratelimit;
mod smseagle;
mod vmware;
mod xiq;
mod xiq_agent;

use crate::cache::{AP_TTL_SECS, HostFilter, RedisCache, find_hosts};
use crate::checkmk::{CheckOutcome, NotifyContext, SectionWriter, State};
use crate::client::{ClientOptions, ProxyMode};
use crate::config::{
    CheckmkConfig, Config, RapidConfig, RedisConfig, Scope, SmsEagleConfig, VmwareConfig,
    XiqConfig, XiqSettings, save,
};
use crate::output::{OutputFormat, RenderOpts, render_value};
use crate::rapid::{RapidClient, parse_timestamp, process_events, write_node_checks};
use crate::smseagle::{Message, MessageType, Notifier, Recipients, parse_ids};
use crate::xiq::{Device, View, XiqClient, find_location, format_uptime_short, uptime_seconds};
use crate::xiq_agent::AgentAuth;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use log::{LevelFilter, info};
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "cmk-agents",
    version,
    about = "Checkmk special agents, checks and notifiers for REST APIs"
)]
struct Cli {
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        global = true,
        help = "More log output on stderr (-v info, -vv debug)"
    )]
    verbose: u8,

    #[arg(long, global = true, help = "Debug logging, same as -vv")]
    debug: bool,

    #[arg(
        long,
        short = 'o',
        value_enum,
        default_value_t = OutputFormat::Pretty,
        global = true,
        help = "Output format of the REST client commands"
    )]
    output: OutputFormat,

    #[arg(
        long,
        value_name = "COL1,COL2",
        global = true,
        help = "Override table columns (comma-separated)"
    )]
    columns: Option<String>,

    #[arg(
        long,
        value_name = "COLUMN",
        global = true,
        help = "Sort table rows by column (ascending)"
    )]
    sort_by: Option<String>,

    #[arg(
        long,
        value_name = "TEXT",
        global = true,
        help = "Filter rows containing TEXT (case-insensitive)"
    )]
    filter: Option<String>,

    #[command(flatten)]
    net: NetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct NetArgs {
    #[arg(long, global = true, value_name = "URL", help = "Send requests through this proxy")]
    proxy: Option<String>,

    #[arg(long, global = true, help = "Ignore proxy environment variables")]
    no_proxy: bool,

    #[arg(
        long = "no-cert-check",
        global = true,
        help = "Do not verify TLS certificates"
    )]
    no_cert_check: bool,
}

impl NetArgs {
    fn options(&self, timeout: u64) -> ClientOptions {
        ClientOptions {
            verify_tls: !self.no_cert_check,
            timeout: Duration::from_secs(timeout),
            proxy: ProxyMode::from_flags(self.proxy.clone(), self.no_proxy),
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// RAPID server client, node checks and hardware agent
    Rapid(RapidArgs),
    /// ExtremeCloud IQ agent, checks and tools
    Xiq(XiqArgs),
    /// VMware vCenter special agent
    #[command(subcommand)]
    Vmware(VmwareCommand),
    /// Kisters REST availability agent
    #[command(subcommand)]
    Kisters(KistersCommand),
    /// Checkmk notification scripts
    #[command(subcommand)]
    Notify(NotifyCommand),
    /// Persist settings to the chosen scope
    Configure(Box<ConfigureArgs>),
    /// Show current configuration (secrets masked)
    ConfigShow,
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Args)]
struct RapidArgs {
    #[arg(long, value_name = "URL", help = "RAPID server (defaults to https://localhost:3001)")]
    server: Option<String>,

    #[arg(long, help = "API key override (otherwise RAPID_API_KEY or config)")]
    api_key: Option<String>,

    #[arg(long, short = 'd', help = "Database name (defaults to DB1)")]
    database: Option<String>,

    #[arg(long, short = 'n', help = "Node name (defaults to PythonRestClient)")]
    node: Option<String>,

    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    timeout: u64,

    #[command(subcommand)]
    command: RapidCommand,
}

#[derive(Subcommand)]
enum RapidCommand {
    /// Hardware special agent (system, thermal, power)
    Agent {
        #[arg(value_name = "HOST")]
        host: String,
        #[arg(long, short = 'u')]
        username: String,
        #[arg(long, short = 'p')]
        password: String,
    },
    /// Local check lines for the connection status of every node
    Nodes {
        #[arg(long, help = "Print the raw node snapshot as JSON instead")]
        json: bool,
        #[arg(long, help = "Only report the node selected with --node")]
        single: bool,
    },
    /// Validate the API key
    Auth,
    /// List databases
    Databases,
    /// List items of the selected node
    Items,
    /// Create a node in the selected database
    CreateNode {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Create an item in the selected node
    CreateItem {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Show an item
    Item {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Write random process data to an item
    WriteData {
        #[arg(value_name = "ITEM")]
        item: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, value_name = "ISO8601", help = "First timestamp (defaults to now)")]
        start: Option<String>,
    },
    /// Read process data of an item
    ReadData {
        #[arg(value_name = "ITEM")]
        item: String,
        #[arg(long, value_name = "ISO8601")]
        start: String,
        #[arg(long, value_name = "ISO8601")]
        end: String,
    },
}

#[derive(Args)]
struct XiqArgs {
    #[arg(long, alias = "base-url", value_name = "URL")]
    url: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long, value_name = "FILE")]
    token_file: Option<PathBuf>,

    #[arg(long)]
    page_size: Option<u32>,

    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    timeout: u64,

    #[command(subcommand)]
    command: XiqCommand,
}

#[derive(Subcommand)]
enum XiqCommand {
    /// Special agent output for Checkmk
    Agent {
        #[arg(value_name = "HOST", help = "Checkmk host the agent runs for")]
        host: Option<String>,
        #[arg(long, help = "Use this API token instead of logging in")]
        api_token: Option<String>,
    },
    /// Nagios check of the API rate limit
    Ratelimit {
        #[arg(long, env = "XIQ_API_TOKEN", hide_env_values = true)]
        api_token: Option<String>,
        #[arg(long, short = 'w', default_value_t = ratelimit::DEFAULT_WARN_PERCENT)]
        warn: f64,
        #[arg(long, short = 'c', default_value_t = ratelimit::DEFAULT_CRIT_PERCENT)]
        crit: f64,
        #[arg(long = "check-timeout", default_value_t = 10, value_name = "SECONDS")]
        check_timeout: u64,
    },
    /// Log in and store the API token
    Token {
        #[arg(long, help = "Write a .env template instead")]
        create_env: bool,
        #[arg(long, default_value = ".env", value_name = "FILE")]
        env_file: PathBuf,
        #[arg(long, help = "Overwrite an existing .env file")]
        force: bool,
    },
    /// List devices
    Devices {
        #[arg(long, value_enum, default_value_t = View::Full)]
        views: View,
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },
    /// Full details of one device
    Device {
        #[arg(value_name = "ID", required_unless_present = "hostname")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id", help = "Look the device up by hostname")]
        hostname: Option<String>,
    },
    /// List clients
    Clients {
        #[arg(long, value_enum, default_value_t = View::Detail)]
        views: View,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        dir: Option<String>,
        #[arg(long = "where", value_name = "EXPR")]
        condition: Option<String>,
        #[arg(long, help = "Only currently connected clients")]
        active: bool,
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },
    /// Show the location tree
    Locations,
    /// Device status summary of a location
    LocationSummary(LocationArg),
    /// Wi-Fi health of a location
    WifiHealth(LocationArg),
    /// Redis access point cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Args)]
struct LocationArg {
    #[arg(value_name = "ID_OR_UNIQUE_NAME")]
    location: String,
}

#[derive(Args, Clone)]
struct RedisArgs {
    #[arg(long)]
    redis_host: Option<String>,
    #[arg(long)]
    redis_port: Option<u16>,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Fetch all APs with their SSIDs and cache them
    Sync {
        #[command(flatten)]
        redis: RedisArgs,
        #[arg(long, default_value_t = AP_TTL_SECS)]
        ttl: u64,
        #[arg(long, help = "Also cache the location tree")]
        locations: bool,
    },
    /// Export cached APs
    Export {
        #[command(flatten)]
        redis: RedisArgs,
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },
    /// Show one cached AP by hostname
    Lookup {
        #[command(flatten)]
        redis: RedisArgs,
        #[arg(value_name = "HOSTNAME")]
        hostname: String,
    },
    /// Search cached APs
    Find {
        #[command(flatten)]
        redis: RedisArgs,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        managed_by: Option<String>,
        #[arg(long)]
        device_function: Option<String>,
        #[arg(long, help = "Match whole values instead of substrings")]
        exact: bool,
    },
    /// Show the cached location tree
    Tree {
        #[command(flatten)]
        redis: RedisArgs,
        #[arg(long, help = "Fetch the tree from XIQ and cache it first")]
        refresh: bool,
    },
    /// Find a location id by unique name in the cached tree
    FindLocation {
        #[command(flatten)]
        redis: RedisArgs,
        #[arg(value_name = "UNIQUE_NAME")]
        unique_name: String,
    },
}

#[derive(Subcommand)]
enum VmwareCommand {
    /// Special agent output for Checkmk
    Agent {
        #[arg(value_name = "HOST")]
        host: String,
        #[arg(long, short = 'u')]
        username: Option<String>,
        #[arg(long, conflicts_with = "password_file")]
        password: Option<String>,
        #[arg(long, value_name = "FILE")]
        password_file: Option<PathBuf>,
        #[arg(long, short = 'p')]
        port: Option<u16>,
        #[arg(long, help = "Verify the vCenter certificate")]
        verify_ssl: bool,
        #[arg(long, default_value_t = 30, value_name = "SECONDS")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum KistersCommand {
    /// Special agent output for Checkmk
    Agent {
        #[arg(long, value_name = "JSON")]
        config: String,
        #[arg(long, default_value_t = 10, value_name = "SECONDS")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum NotifyCommand {
    /// Send an SMS, TTS call or wave call via SMSEagle
    Smseagle(Box<SmsEagleArgs>),
    /// Set or remove auto-downtimes through the Checkmk REST API
    Downtime {
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
        #[arg(long)]
        api_user: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, value_name = "DAYS")]
        duration_days: Option<String>,
        #[arg(long, default_value_t = 10, value_name = "SECONDS")]
        timeout: u64,
    },
}

#[derive(Args)]
struct SmsEagleArgs {
    #[arg(value_enum, value_name = "TYPE")]
    kind: MessageType,
    #[arg(long, value_delimiter = ',')]
    to: Vec<String>,
    #[arg(long, value_name = "ID1,ID2")]
    contacts: Option<String>,
    #[arg(long, value_name = "ID1,ID2")]
    groups: Option<String>,
    #[arg(long, help = "Message text; $VAR$ placeholders are expanded from NOTIFY_*")]
    text: Option<String>,
    #[arg(long)]
    wave_id: Option<u32>,
    #[arg(long, alias = "modem_no")]
    modem_no: Option<u32>,
    #[arg(long, default_value_t = smseagle::DEFAULT_VOICE_ID)]
    voice_id: u32,
    #[arg(long, value_name = "URL")]
    url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long, value_name = "URL")]
    url2: Option<String>,
    #[arg(long)]
    token2: Option<String>,
    #[arg(long, alias = "disable_ssl", help = "Disable TLS verification")]
    disable_ssl: bool,
    #[arg(long, help = "Read recipient and default text from Checkmk NOTIFY_* variables")]
    from_env: bool,
    #[arg(long, value_name = "FILE", help = "Append log lines to FILE instead of stderr")]
    log_file: Option<PathBuf>,
    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    timeout: u64,
}

#[derive(Args, Default)]
struct ConfigureArgs {
    #[arg(
        long,
        value_enum,
        default_value_t = ScopeArg::User,
        help = "Where to write the config (local project dir or user config dir)"
    )]
    scope: ScopeArg,
    #[arg(long)]
    rapid_server: Option<String>,
    #[arg(long)]
    rapid_api_key: Option<String>,
    #[arg(long)]
    rapid_database: Option<String>,
    #[arg(long)]
    rapid_node: Option<String>,
    #[arg(long)]
    xiq_url: Option<String>,
    #[arg(long)]
    xiq_username: Option<String>,
    #[arg(long)]
    xiq_password: Option<String>,
    #[arg(long)]
    xiq_token_file: Option<PathBuf>,
    #[arg(long)]
    redis_host: Option<String>,
    #[arg(long)]
    redis_port: Option<u16>,
    #[arg(long)]
    vmware_username: Option<String>,
    #[arg(long)]
    vmware_port: Option<u16>,
    #[arg(long)]
    smseagle_url: Option<String>,
    #[arg(long)]
    smseagle_token: Option<String>,
    #[arg(long)]
    smseagle_url2: Option<String>,
    #[arg(long)]
    smseagle_token2: Option<String>,
    #[arg(long)]
    checkmk_api_url: Option<String>,
    #[arg(long)]
    checkmk_api_user: Option<String>,
    #[arg(long)]
    checkmk_api_key: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ScopeArg {
    Local,
    #[default]
    User,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Local => Scope::Local,
            ScopeArg::User => Scope::User,
        }
    }
}

fn main() -> ExitCode {
    // Only the working directory's .env; a missing file is fine.
    let _ = dotenvy::from_path(Path::new(".env"));
    let cli = Cli::parse();
    if let Err(err) = init_logging(&cli) {
        eprintln!("Error: {:#}", err);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match (cli.debug, cli.verbose) {
        (true, _) | (_, 2..) => LevelFilter::Debug,
        (_, 1) => LevelFilter::Info,
        _ => LevelFilter::Warn,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();
    if let Commands::Notify(NotifyCommand::Smseagle(args)) = &cli.command
        && let Some(path) = &args.log_file
    {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {:?}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let render_opts = RenderOpts {
        columns: cli.columns.as_ref().map(|c| {
            c.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }),
        sort_by: cli.sort_by.clone(),
        filter: cli.filter.clone(),
    };
    let ui = Ui {
        format: cli.output,
        opts: render_opts,
    };

    match cli.command {
        Commands::Rapid(args) => handle_rapid(args, &cli.net, &cwd, &ui),
        Commands::Xiq(args) => handle_xiq(args, &cli.net, &cwd, &ui),
        Commands::Vmware(command) => handle_vmware(command, &cli.net, &cwd),
        Commands::Kisters(KistersCommand::Agent { config, timeout }) => {
            let endpoints = kisters::parse_config(&config)?;
            let mut out = SectionWriter::new(io::stdout().lock());
            kisters::run(&mut out, &endpoints, Duration::from_secs(timeout), !cli.net.no_cert_check)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Notify(command) => Ok(handle_notify(command, &cli.net, &cwd)),
        Commands::Configure(args) => {
            let scope: Scope = args.scope.into();
            let existing = config::load_scope(scope, &cwd)?;
            let updated = apply_configure(existing, *args);
            let path = save(scope, &updated, &cwd)?;
            println!("Saved configuration to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::ConfigShow => {
            let merged = config::load(&cwd)?;
            println!("{}", serde_yaml::to_string(&merged.masked())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completion { shell } => {
            use clap_complete::{generate, shells};
            let mut cmd = Cli::command();
            let bin = cmd.get_name().to_string();
            let mut stdout = io::stdout();
            match shell {
                CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin, &mut stdout),
                CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin, &mut stdout),
                CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin, &mut stdout),
                CompletionShell::PowerShell => {
                    generate(shells::PowerShell, &mut cmd, bin, &mut stdout)
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct Ui {
    format: OutputFormat,
    opts: RenderOpts,
}

impl Ui {
    fn show(&self, value: &Value, columns: Option<&[&str]>) -> Result<()> {
        let mut stdout = io::stdout().lock();
        render_value(value, self.format, &self.opts, columns, &mut stdout)
    }
}

fn handle_rapid(args: RapidArgs, net: &NetArgs, cwd: &Path, ui: &Ui) -> Result<ExitCode> {
    let RapidArgs {
        server,
        api_key,
        database,
        node,
        timeout,
        command,
    } = args;
    // RAPID ignores environment proxies unless --proxy is given.
    let mut options = net.options(timeout);
    if net.proxy.is_none() {
        options.proxy = ProxyMode::Disabled;
    }
    let overrides = RapidConfig {
        server,
        api_key,
        database,
        node,
        verify_tls: net.no_cert_check.then_some(false),
    };
    let connect = || -> Result<(RapidClient, config::RapidSettings)> {
        let settings = config::resolve_rapid(cwd, overrides.clone())?;
        let options = ClientOptions {
            verify_tls: settings.verify_tls,
            ..options.clone()
        };
        let client = RapidClient::new(&settings.server, &settings.api_key, &options)?;
        Ok((client, settings))
    };

    match command {
        RapidCommand::Agent {
            host,
            username,
            password,
        } => {
            let options = ClientOptions {
                timeout: Duration::from_secs(10),
                ..options.clone()
            };
            let api = rapid::hardware_client(&host, &username, &password, &options)?;
            let mut out = SectionWriter::new(io::stdout().lock());
            rapid::run_hardware_agent(&api, &mut out)?;
        }
        RapidCommand::Nodes { json, single } => {
            let (client, settings) = connect()?;
            let snapshot = client.snapshot(&settings.database)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                let mut out = SectionWriter::new(io::stdout().lock());
                let only = single.then_some(settings.node.as_str());
                let worst = write_node_checks(
                    &mut out,
                    &settings.database,
                    snapshot.as_ref(),
                    only,
                    Utc::now(),
                )?;
                info!("worst node state in {}: {}", settings.database, worst);
            }
        }
        RapidCommand::Auth => {
            let (client, _) = connect()?;
            ui.show(&client.authenticate()?, None)?;
        }
        RapidCommand::Databases => {
            let (client, _) = connect()?;
            let rows: Vec<Value> = client
                .list_databases()?
                .iter()
                .map(|n| json!({"name": n}))
                .collect();
            ui.show(&Value::Array(rows), Some(&["name"]))?;
        }
        RapidCommand::Items => {
            let (client, s) = connect()?;
            let rows: Vec<Value> = client
                .list_items(&s.database, &s.node)?
                .iter()
                .map(|n| json!({"name": n}))
                .collect();
            ui.show(&Value::Array(rows), Some(&["name"]))?;
        }
        RapidCommand::CreateNode { name } => {
            let (client, s) = connect()?;
            let db = s.database.as_str();
            if client.node_exists(db, &name) {
                println!("Node '{name}' already exists in {db}");
            } else {
                let created = client.create_node(db, &name)?;
                ui.show(&created.unwrap_or_else(|| json!({"Name": name})), None)?;
            }
        }
        RapidCommand::CreateItem { name, description } => {
            let (client, s) = connect()?;
            let (db, node) = (s.database.as_str(), s.node.as_str());
            if !client.node_exists(db, node) {
                bail!("node '{node}' does not exist in {db}");
            }
            if client.item_exists(db, node, &name) {
                println!("Item '{name}' already exists in {db}/{node}");
            } else {
                let created = client.create_item(db, node, &name, &description)?;
                ui.show(&created.unwrap_or_else(|| json!({"Name": name})), None)?;
            }
        }
        RapidCommand::Item { name } => {
            let (client, s) = connect()?;
            ui.show(&client.item(&s.database, &s.node, &name)?, None)?;
        }
        RapidCommand::WriteData { item, count, start } => {
            let start = match start {
                Some(raw) => parse_timestamp(&raw)?,
                None => Utc::now().naive_utc(),
            };
            let (client, s) = connect()?;
            let events = process_events(start, count, &mut rand::thread_rng());
            let written = client.write_process_data(&s.database, &s.node, &item, &events)?;
            println!("Wrote {written} events to {}/{}/{item}", s.database, s.node);
        }
        RapidCommand::ReadData { item, start, end } => {
            // Validate locally so typos do not reach the server.
            parse_timestamp(&start)?;
            parse_timestamp(&end)?;
            let (client, s) = connect()?;
            let data = client.read_process_data(&s.database, &s.node, &item, &start, &end)?;
            ui.show(&data, Some(&["ts", "val"]))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn redis_settings(args: &RedisArgs, cwd: &Path) -> Result<config::RedisSettings> {
    config::resolve_redis(
        cwd,
        RedisConfig {
            host: args.redis_host.clone(),
            port: args.redis_port,
            ..Default::default()
        },
    )
}

/// Accepts either a location id or a unique name looked up in the tree.
fn location_id(xiq: &mut XiqClient, location: &str) -> Result<String> {
    if location.chars().all(|c| c.is_ascii_digit()) {
        return Ok(location.to_string());
    }
    let tree = xiq.location_tree()?;
    find_location(&tree, location)
        .map(|m| m.id)
        .ok_or_else(|| anyhow!("location '{location}' not found"))
}

fn export_rows(
    items: &[Value],
    csv: Option<&Path>,
    json: Option<&Path>,
    ui: &Ui,
    columns: &[&str],
) -> Result<()> {
    if let Some(path) = csv {
        export::to_file(path, |w| export::write_objects_csv(items, w))?;
        println!("Wrote {} rows to {}", items.len(), path.display());
    }
    if let Some(path) = json {
        export::to_file(path, |w| export::write_json(items, w))?;
        println!("Wrote {} entries to {}", items.len(), path.display());
    }
    if csv.is_none() && json.is_none() {
        ui.show(&Value::Array(items.to_vec()), Some(columns))?;
    }
    Ok(())
}

fn handle_xiq(args: XiqArgs, net: &NetArgs, cwd: &Path, ui: &Ui) -> Result<ExitCode> {
    let XiqArgs {
        url,
        username,
        password,
        token_file,
        page_size,
        timeout,
        command,
    } = args;
    let overrides = XiqConfig {
        base_url: url,
        username,
        password,
        token_file,
        page_size,
    };
    let connect = |timeout: u64| -> Result<(XiqClient, XiqSettings)> {
        let settings = config::resolve_xiq(cwd, overrides.clone())?;
        let xiq = XiqClient::from_settings(&settings, &net.options(timeout))?;
        Ok((xiq, settings))
    };
    let login = || -> Result<XiqClient> {
        let (mut xiq, _) = connect(timeout)?;
        xiq.authenticate()?;
        Ok(xiq)
    };

    match command {
        XiqCommand::Agent { host, api_token } => {
            if let Some(host) = &host {
                info!("running XIQ agent for {}", host);
            }
            let (mut xiq, settings) = connect(timeout)?;
            let auth = match api_token {
                Some(token) => AgentAuth::Token(token),
                None => match settings.credentials() {
                    Ok((username, password)) => AgentAuth::Login { username, password },
                    Err(_) => AgentAuth::Missing,
                },
            };
            let mut out = SectionWriter::new(io::stdout().lock());
            xiq_agent::run(&mut xiq, &auth, &mut out, Utc::now())?;
        }
        XiqCommand::Ratelimit {
            api_token,
            warn,
            crit,
            check_timeout,
        } => {
            let outcome = ratelimit_check(
                || connect(check_timeout).map(|(xiq, _)| xiq),
                api_token.as_deref(),
                warn,
                crit,
                check_timeout,
            );
            println!("{}", outcome.render());
            return Ok(outcome.state.exit_code());
        }
        XiqCommand::Token {
            create_env: true,
            env_file,
            force,
        } => {
            config::write_env_template(&env_file, force)?;
            println!("Wrote {}", env_file.display());
        }
        XiqCommand::Token { .. } => {
            let (mut xiq, _) = connect(timeout)?;
            println!("{}", xiq.login()?);
        }
        XiqCommand::Devices { views, csv, json } => {
            let mut devices = login()?.devices_raw(views)?;
            if let Some(path) = &csv {
                let typed: Vec<Device> = devices
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<_, _>>()
                    .context("unexpected device shape")?;
                export::to_file(path, |w| export::write_device_csv(&typed, w, Utc::now()))?;
                println!("Wrote {} devices to {}", typed.len(), path.display());
            }
            if json.is_some() || csv.is_none() {
                if json.is_none() {
                    add_uptime(&mut devices, Utc::now());
                }
                export_rows(
                    &devices,
                    None,
                    json.as_deref(),
                    ui,
                    &[
                        "id",
                        "hostname",
                        "ip_address",
                        "product_type",
                        "device_function",
                        "connected",
                        "uptime",
                    ],
                )?;
            }
        }
        XiqCommand::Device { id, hostname } => {
            let mut xiq = login()?;
            let device = match (id, hostname) {
                (Some(id), _) => xiq.device(&id)?,
                (None, Some(hostname)) => xiq
                    .device_by_hostname(&hostname)?
                    .ok_or_else(|| anyhow!("no device named '{hostname}'"))?,
                (None, None) => bail!("pass a device ID or --hostname"),
            };
            ui.show(&device, None)?;
        }
        XiqCommand::Clients {
            views,
            sort,
            dir,
            condition,
            active,
            csv,
            json,
        } => {
            let mut xiq = login()?;
            let clients = if active {
                xiq.active_clients()?
            } else {
                xiq.clients(views, sort.as_deref(), dir.as_deref(), condition.as_deref())?
            };
            export_rows(
                &clients,
                csv.as_deref(),
                json.as_deref(),
                ui,
                &["hostname", "mac_address", "ip_address", "ssid", "device_id"],
            )?;
        }
        XiqCommand::Locations => {
            let tree = login()?.location_tree()?;
            ui.show(&tree, Some(&["id", "name", "unique_name", "type"]))?;
        }
        XiqCommand::LocationSummary(LocationArg { location }) => {
            let mut xiq = login()?;
            let id = location_id(&mut xiq, &location)?;
            ui.show(&xiq.location_summary(&id)?, None)?;
        }
        XiqCommand::WifiHealth(LocationArg { location }) => {
            let mut xiq = login()?;
            let id = location_id(&mut xiq, &location)?;
            ui.show(&xiq.wifi_health(&id)?, None)?;
        }
        XiqCommand::Cache(command) => handle_cache(command, login, cwd, ui)?,
    }
    Ok(ExitCode::SUCCESS)
}

/// Adds a readable `uptime` column derived from `system_up_time`.
fn add_uptime(devices: &mut [Value], now: DateTime<Utc>) {
    for device in devices {
        let uptime = device
            .get("system_up_time")
            .and_then(|raw| uptime_seconds(raw, now))
            .map(format_uptime_short);
        if let (Some(uptime), Some(map)) = (uptime, device.as_object_mut()) {
            map.insert("uptime".to_string(), Value::String(uptime));
        }
    }
}

/// Nagios-style check: every failure becomes a state, never an error.
fn ratelimit_check(
    connect: impl FnOnce() -> Result<XiqClient>,
    api_token: Option<&str>,
    warn: f64,
    crit: f64,
    timeout: u64,
) -> CheckOutcome {
    let levels = match ratelimit::levels(warn, crit) {
        Ok(levels) => levels,
        Err(err) => return CheckOutcome::new(State::Unknown, format!("{err:#}")),
    };
    let mut xiq = match connect() {
        Ok(xiq) => xiq,
        Err(err) => return CheckOutcome::new(State::Unknown, format!("{err:#}")),
    };
    match api_token {
        Some(token) => xiq = xiq.with_token(token),
        None => {
            if let Err(err) = xiq.authenticate() {
                return CheckOutcome::new(State::Unknown, format!("No API token: {err:#}"));
            }
        }
    }
    ratelimit::check(xiq.api(), &levels, Duration::from_secs(timeout))
}

fn handle_cache(
    command: CacheCommand,
    login: impl FnOnce() -> Result<XiqClient>,
    cwd: &Path,
    ui: &Ui,
) -> Result<()> {
    match command {
        CacheCommand::Sync {
            redis,
            ttl,
            locations,
        } => {
            let settings = redis_settings(&redis, cwd)?;
            let mut xiq = login()?;
            let mut cache = RedisCache::open(&settings, settings.ap_db)?;
            let records = cache::sync(&mut xiq, &mut cache, ttl)?;
            println!("Cached {} access points (ttl {}s)", records.len(), ttl);
            if locations {
                let tree = xiq.location_tree()?;
                RedisCache::open(&settings, settings.locations_db)?.store_location_tree(&tree)?;
                println!("Cached location tree");
            }
        }
        CacheCommand::Export { redis, csv, json } => {
            let settings = redis_settings(&redis, cwd)?;
            let records = RedisCache::open(&settings, settings.ap_db)?.load_all()?;
            if let Some(path) = &csv {
                export::to_file(path, |w| export::write_ap_csv(&records, w))?;
                println!("Wrote {} access points to {}", records.len(), path.display());
            }
            if let Some(path) = &json {
                export::to_file(path, |w| export::write_json(&records, w))?;
                println!("Wrote {} access points to {}", records.len(), path.display());
            }
            if csv.is_none() && json.is_none() {
                export::write_ap_csv(&records, io::stdout().lock())?;
            }
        }
        CacheCommand::Lookup { redis, hostname } => {
            let settings = redis_settings(&redis, cwd)?;
            let record = RedisCache::open(&settings, settings.ap_db)?
                .by_hostname(&hostname)?
                .ok_or_else(|| anyhow!("no cached access point named '{hostname}'"))?;
            ui.show(&serde_json::to_value(&record)?, None)?;
        }
        CacheCommand::Find {
            redis,
            hostname,
            location,
            managed_by,
            device_function,
            exact,
        } => {
            let settings = redis_settings(&redis, cwd)?;
            let records = RedisCache::open(&settings, settings.ap_db)?.load_all()?;
            let filter = HostFilter {
                hostname,
                location_part: location,
                managed_by,
                device_function,
                exact,
            };
            let found = find_hosts(&records, &filter);
            ui.show(
                &serde_json::to_value(&found)?,
                Some(&["hostname", "ip_address", "serial_number", "bssid_mac", "id"]),
            )?;
        }
        CacheCommand::Tree { redis, refresh } => {
            let settings = redis_settings(&redis, cwd)?;
            let mut cache = RedisCache::open(&settings, settings.locations_db)?;
            let tree = if refresh {
                let tree = login()?.location_tree()?;
                cache.store_location_tree(&tree)?;
                tree
            } else {
                cache
                    .location_tree()?
                    .ok_or_else(|| anyhow!("no cached location tree; run with --refresh"))?
            };
            ui.show(&tree, Some(&["id", "name", "unique_name", "type"]))?;
        }
        CacheCommand::FindLocation { redis, unique_name } => {
            let settings = redis_settings(&redis, cwd)?;
            let tree = RedisCache::open(&settings, settings.locations_db)?
                .location_tree()?
                .ok_or_else(|| anyhow!("no cached location tree; run `xiq cache tree --refresh`"))?;
            let found = find_location(&tree, &unique_name)
                .ok_or_else(|| anyhow!("location '{unique_name}' not found"))?;
            ui.show(&serde_json::to_value(&found)?, None)?;
        }
    }
    Ok(())
}

fn handle_vmware(command: VmwareCommand, net: &NetArgs, cwd: &Path) -> Result<ExitCode> {
    let VmwareCommand::Agent {
        host,
        username,
        password,
        password_file,
        port,
        verify_ssl,
        timeout,
    } = command;
    let password = match (&password, &password_file) {
        (_, Some(path)) => Some(vmware::read_password_file(path)?),
        (password, None) => password.clone(),
    };
    let settings = config::resolve_vmware(
        cwd,
        VmwareConfig {
            username,
            password,
            port,
        },
    )?;
    let username = settings
        .username
        .ok_or_else(|| anyhow!("vCenter username is required; pass --username"))?;
    let password = settings
        .password
        .ok_or_else(|| anyhow!("vCenter password is required; pass --password or --password-file"))?;
    let options = ClientOptions {
        verify_tls: verify_ssl,
        ..net.options(timeout)
    };
    let base = vmware::base_url(&host, settings.port.unwrap_or(443));
    let agent = vmware::VmwareAgent::connect(&base, &username, &password, &options)?;
    let mut out = SectionWriter::new(io::stdout().lock());
    agent.run(&mut out)?;
    Ok(ExitCode::SUCCESS)
}

/// Notifiers exit 0 on success and 2 on any failure.
fn handle_notify(command: NotifyCommand, net: &NetArgs, cwd: &Path) -> ExitCode {
    let result = match command {
        NotifyCommand::Smseagle(args) => send_smseagle(*args, net, cwd),
        NotifyCommand::Downtime {
            api_url,
            api_user,
            api_key,
            duration_days,
            timeout,
        } => run_downtime(
            CheckmkConfig {
                api_url,
                api_user,
                api_key,
            },
            duration_days,
            &net.options(timeout),
            cwd,
        ),
    };
    match result {
        Ok(message) => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn send_smseagle(args: SmsEagleArgs, net: &NetArgs, cwd: &Path) -> Result<String> {
    let settings = config::resolve_smseagle(
        cwd,
        SmsEagleConfig {
            url: args.url,
            token: args.token,
            url2: args.url2,
            token2: args.token2,
            modem_no: args.modem_no,
            verify_tls: args.disable_ssl.then_some(false),
        },
    )?;
    let ctx = if args.from_env {
        NotifyContext::from_env()
    } else {
        NotifyContext::default()
    };

    let mut recipients = Recipients {
        to: args.to,
        contacts: args.contacts.as_deref().map(parse_ids).transpose()?.unwrap_or_default(),
        groups: args.groups.as_deref().map(parse_ids).transpose()?.unwrap_or_default(),
    };
    if args.from_env
        && recipients.is_empty()
        && let Some(pager) = smseagle::pager(&ctx)
    {
        recipients.to.push(pager.to_string());
    }
    let text = match args.text {
        Some(text) => Some(ctx.expand(&text)),
        None if args.from_env => Some(smseagle::default_text(&ctx)),
        None => None,
    };

    let message = Message {
        kind: args.kind,
        recipients,
        text,
        wave_id: args.wave_id,
        voice_id: args.voice_id,
        modem_no: settings.modem_no,
    };
    let notifier = Notifier::new(&settings, &net.options(args.timeout))?;
    let answer = notifier.send(&message)?;
    Ok(format!(
        "{} queued (ID: {})",
        message.kind.as_str(),
        answer.get("id").map(output::value_to_str).unwrap_or_default()
    ))
}

fn run_downtime(
    overrides: CheckmkConfig,
    duration_days: Option<String>,
    options: &ClientOptions,
    cwd: &Path,
) -> Result<String> {
    let ctx = NotifyContext::from_env();
    let merged = config::resolve_checkmk(cwd, overrides)?;
    let params = downtime::Params::resolve(&ctx, merged, duration_days);
    let outcome = downtime::run(&ctx, &params, options, Utc::now())?;
    Ok(outcome.to_string())
}

fn apply_configure(mut config: Config, args: ConfigureArgs) -> Config {
    fn set<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    if args.rapid_server.is_some()
        || args.rapid_api_key.is_some()
        || args.rapid_database.is_some()
        || args.rapid_node.is_some()
    {
        let rapid = config.rapid.get_or_insert_with(Default::default);
        set(&mut rapid.server, args.rapid_server);
        set(&mut rapid.api_key, args.rapid_api_key);
        set(&mut rapid.database, args.rapid_database);
        set(&mut rapid.node, args.rapid_node);
    }
    if args.xiq_url.is_some()
        || args.xiq_username.is_some()
        || args.xiq_password.is_some()
        || args.xiq_token_file.is_some()
    {
        let xiq = config.xiq.get_or_insert_with(Default::default);
        set(&mut xiq.base_url, args.xiq_url);
        set(&mut xiq.username, args.xiq_username);
        set(&mut xiq.password, args.xiq_password);
        set(&mut xiq.token_file, args.xiq_token_file);
    }
    if args.redis_host.is_some() || args.redis_port.is_some() {
        let redis = config.redis.get_or_insert_with(Default::default);
        set(&mut redis.host, args.redis_host);
        set(&mut redis.port, args.redis_port);
    }
    if args.vmware_username.is_some() || args.vmware_port.is_some() {
        let vmware = config.vmware.get_or_insert_with(Default::default);
        set(&mut vmware.username, args.vmware_username);
        set(&mut vmware.port, args.vmware_port);
    }
    if args.smseagle_url.is_some()
        || args.smseagle_token.is_some()
        || args.smseagle_url2.is_some()
        || args.smseagle_token2.is_some()
    {
        let sms = config.smseagle.get_or_insert_with(Default::default);
        set(&mut sms.url, args.smseagle_url);
        set(&mut sms.token, args.smseagle_token);
        set(&mut sms.url2, args.smseagle_url2);
        set(&mut sms.token2, args.smseagle_token2);
    }
    if args.checkmk_api_url.is_some()
        || args.checkmk_api_user.is_some()
        || args.checkmk_api_key.is_some()
    {
        let cmk = config.checkmk.get_or_insert_with(Default::default);
        set(&mut cmk.api_url, args.checkmk_api_url);
        set(&mut cmk.api_user, args.checkmk_api_user);
        set(&mut cmk.api_key, args.checkmk_api_key);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn configure_only_touches_given_sections() {
        let existing = Config {
            rapid: Some(RapidConfig {
                server: Some("https://rapid:3001".into()),
                api_key: Some("old".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let args = ConfigureArgs {
            rapid_api_key: Some("new".into()),
            smseagle_url: Some("https://eagle".into()),
            ..Default::default()
        };
        let updated = apply_configure(existing, args);
        let rapid = updated.rapid.unwrap();
        assert_eq!(rapid.server.as_deref(), Some("https://rapid:3001"));
        assert_eq!(rapid.api_key.as_deref(), Some("new"));
        assert_eq!(
            updated.smseagle.unwrap().url.as_deref(),
            Some("https://eagle")
        );
        assert!(updated.xiq.is_none());
        assert!(updated.checkmk.is_none());
    }

    #[test]
    fn parses_notify_and_agent_arguments() {
        let cli = Cli::parse_from([
            "cmk-agents",
            "notify",
            "smseagle",
            "call_tts",
            "--to",
            "+491,+492",
            "--groups",
            "3",
            "--text",
            "hello",
            "--disable_ssl",
        ]);
        let Commands::Notify(NotifyCommand::Smseagle(args)) = cli.command else {
            panic!("expected smseagle command");
        };
        assert_eq!(args.kind, MessageType::CallTts);
        assert_eq!(args.to, vec!["+491", "+492"]);
        assert!(args.disable_ssl);

        let cli = Cli::parse_from(["cmk-agents", "-vv", "xiq", "agent", "myhost", "--no-cert-check"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.net.no_cert_check);
    }

    #[test]
    fn adds_readable_uptime_to_devices() {
        let now = Utc::now();
        let mut devices = vec![
            json!({"hostname": "ap-1", "system_up_time": 20_000_000}),
            json!({"hostname": "ap-2"}),
        ];
        add_uptime(&mut devices, now);
        assert_eq!(devices[0]["uptime"], "231d 11h 33m");
        assert!(devices[1].get("uptime").is_none());
    }
}
