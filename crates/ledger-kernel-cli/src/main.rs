use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ledger_kernel_api::{
    CandidateRequest, CreateTodoRequest, DeleteTodoRequest, LedgerKernelApi, UpdateTodoRequest,
    VoteRequest,
};
use ledger_kernel_core::{Address, NewPoll, Principal};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "ledger_kernel=info";

#[derive(Debug, Parser)]
#[command(name = "lk")]
#[command(about = "Ledger Kernel CLI")]
struct Cli {
    #[arg(long, env = "LEDGER_KERNEL_DB", default_value = "./ledger_kernel.sqlite3")]
    db: PathBuf,

    /// Authenticated caller; required for task mutations.
    #[arg(long, env = "LEDGER_KERNEL_PRINCIPAL")]
    principal: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Todo {
        #[command(subcommand)]
        command: Box<TodoCommand>,
    },
    Poll {
        #[command(subcommand)]
        command: Box<PollCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum TodoCommand {
    Create(TodoCreateArgs),
    Update(TodoUpdateArgs),
    Delete(TodoTargetArgs),
    Show(TodoShowArgs),
    List(TodoListArgs),
}

#[derive(Debug, Args)]
struct TodoCreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
struct TodoUpdateArgs {
    #[arg(long)]
    title: String,
    /// Owner of the addressed task; defaults to `--principal`.
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    description: String,
    #[arg(long, default_value_t = false)]
    completed: bool,
}

#[derive(Debug, Args)]
struct TodoTargetArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    owner: Option<String>,
}

#[derive(Debug, Args)]
struct TodoShowArgs {
    #[arg(long, required_unless_present = "address")]
    title: Option<String>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long, conflicts_with_all = ["title", "owner"])]
    address: Option<String>,
}

#[derive(Debug, Args)]
struct TodoListArgs {
    #[arg(long)]
    owner: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PollCommand {
    Init(PollInitArgs),
    Show(PollIdArgs),
    List,
    Candidate(CandidateArgs),
    Candidates(PollIdArgs),
    Vote(CandidateArgs),
    Status(PollIdArgs),
}

#[derive(Debug, Args)]
struct PollInitArgs {
    #[arg(long)]
    poll_id: u64,
    #[arg(long)]
    description: String,
    /// Unix milliseconds or RFC3339.
    #[arg(long)]
    start: String,
    /// Unix milliseconds or RFC3339.
    #[arg(long)]
    end: String,
    #[arg(long)]
    candidates: u64,
}

#[derive(Debug, Args)]
struct PollIdArgs {
    #[arg(long)]
    poll_id: u64,
}

#[derive(Debug, Args)]
struct CandidateArgs {
    #[arg(long)]
    poll_id: u64,
    #[arg(long)]
    name: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "opening ledger database");
    let api = LedgerKernelApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Todo { command } => run_todo(*command, &api, cli.principal.as_deref()),
        Command::Poll { command } => run_poll(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &LedgerKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_todo(command: TodoCommand, api: &LedgerKernelApi, principal: Option<&str>) -> Result<()> {
    match command {
        TodoCommand::Create(args) => {
            let caller = require_principal(principal)?;
            let request = CreateTodoRequest { title: args.title, description: args.description };
            emit(&api.todo_create(request, &caller)?)
        }
        TodoCommand::Update(args) => {
            let caller = require_principal(principal)?;
            let request = UpdateTodoRequest {
                title: args.title,
                owner: parse_optional_principal(args.owner.as_deref())?,
                description: args.description,
                completed: args.completed,
            };
            emit(&api.todo_update(request, &caller)?)
        }
        TodoCommand::Delete(args) => {
            let caller = require_principal(principal)?;
            let request = DeleteTodoRequest {
                title: args.title,
                owner: parse_optional_principal(args.owner.as_deref())?,
            };
            emit(&api.todo_delete(request, &caller)?)
        }
        TodoCommand::Show(args) => {
            if let Some(address) = args.address {
                let address = Address::parse_hex(&address)?;
                return emit(&api.todo_show_by_address(&address)?);
            }
            let title = args.title.ok_or_else(|| anyhow!("--title or --address is required"))?;
            let owner = match args.owner.as_deref() {
                Some(owner) => parse_principal(owner)?,
                None => require_principal(principal)
                    .context("--owner is required when no --principal is set")?,
            };
            emit(&api.todo_show(&title, &owner)?)
        }
        TodoCommand::List(args) => {
            let owner = parse_optional_principal(args.owner.as_deref())?;
            let tasks = api.todo_list(owner.as_ref())?;
            emit_json(serde_json::json!({ "tasks": tasks }))
        }
    }
}

fn run_poll(command: PollCommand, api: &LedgerKernelApi) -> Result<()> {
    match command {
        PollCommand::Init(args) => {
            let request = NewPoll {
                poll_id: args.poll_id,
                description: args.description,
                start_time: parse_time_millis(&args.start)?,
                end_time: parse_time_millis(&args.end)?,
                candidate_count: args.candidates,
            };
            emit(&api.poll_initialize(request)?)
        }
        PollCommand::Show(args) => emit(&api.poll_show(args.poll_id)?),
        PollCommand::List => {
            let polls = api.poll_list()?;
            emit_json(serde_json::json!({ "polls": polls }))
        }
        PollCommand::Candidate(args) => {
            let request = CandidateRequest { name: args.name, poll_id: args.poll_id };
            emit(&api.candidate_initialize(request)?)
        }
        PollCommand::Candidates(args) => {
            let candidates = api.candidate_list(args.poll_id)?;
            emit_json(serde_json::json!({ "poll_id": args.poll_id, "candidates": candidates }))
        }
        PollCommand::Vote(args) => {
            emit(&api.vote(VoteRequest { name: args.name, poll_id: args.poll_id })?)
        }
        PollCommand::Status(args) => emit(&api.poll_status(args.poll_id)?),
    }
}

fn require_principal(principal: Option<&str>) -> Result<Principal> {
    let raw = principal
        .ok_or_else(|| anyhow!("--principal or LEDGER_KERNEL_PRINCIPAL is required"))?;
    parse_principal(raw)
}

fn parse_principal(raw: &str) -> Result<Principal> {
    Principal::new(raw).with_context(|| format!("invalid principal `{raw}`"))
}

fn parse_optional_principal(raw: Option<&str>) -> Result<Option<Principal>> {
    raw.map(parse_principal).transpose()
}

fn parse_time_millis(value: &str) -> Result<i64> {
    if let Ok(millis) = value.trim().parse::<i64>() {
        return Ok(millis);
    }
    let parsed = OffsetDateTime::parse(value.trim(), &Rfc3339).with_context(|| {
        format!("invalid time `{value}`: expected unix milliseconds or RFC3339")
    })?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000)
        .with_context(|| format!("time `{value}` is out of range"))
}
