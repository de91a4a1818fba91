use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use case_monitor_checker::{HttpCaseChecker, MockCaseChecker};
use case_monitor_domain::{
    format_rfc3339, now_utc, parse_rfc3339, DateTimeUtc, DetailRecord, MonitorId, RequestId,
    RequestStatus,
};
use case_monitor_engine::{
    load_scheduler_config, MonitorRequest, MonitorScheduler, RequestSubmission, RequestTracker,
    SchedulerConfig,
};
use case_monitor_ledger_core::LedgerStore;
use case_monitor_ledger_sqlite::SqliteLedgerStore;
use clap::{Args, Parser, Subcommand};
use time::Duration;

#[derive(Debug, Parser)]
#[command(name = "case-monitor")]
#[command(about = "Request lifecycle tracking and case monitoring over a SQLite ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Request(RequestArgs),
    Monitor(MonitorArgs),
    Tick(TickArgs),
}

#[derive(Debug, Args)]
struct RequestArgs {
    #[command(subcommand)]
    command: RequestSubcommand,
}

#[derive(Debug, Subcommand)]
enum RequestSubcommand {
    /// Record a new request; it starts open.
    Submit {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        account_number: String,
        #[arg(long)]
        order_id: i64,
        #[arg(long)]
        case_id: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Move a request to open, completed, or error.
    Transition {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        request_id: i64,
        #[arg(long)]
        status: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Attach the write-once detail slots (slot=value pairs).
    AttachDetails {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        request_id: i64,
        #[arg(long = "detail")]
        details: Vec<String>,
    },
    Show {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        request_id: i64,
    },
    List {
        #[arg(long)]
        db: PathBuf,
    },
    History {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        request_id: i64,
    },
    /// Verify the request's history hash chain.
    Audit {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        request_id: i64,
    },
}

#[derive(Debug, Args)]
struct MonitorArgs {
    #[command(subcommand)]
    command: MonitorSubcommand,
}

#[derive(Debug, Subcommand)]
enum MonitorSubcommand {
    /// Place a case under monitoring until it concludes or expires.
    Start {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        case_id: String,
        #[arg(long)]
        account_number: String,
        #[arg(long)]
        order_id: i64,
        #[arg(long)]
        request_id: Option<i64>,
        #[arg(long)]
        expire_at: String,
        #[arg(long)]
        initial_delay_minutes: Option<i64>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    List {
        #[arg(long)]
        db: PathBuf,
    },
    /// Open monitors due for a check at the given time (default: now).
    Due {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        at: Option<String>,
    },
    Show {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        monitor_id: i64,
    },
    History {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        monitor_id: i64,
    },
    AttachDetails {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        monitor_id: i64,
        #[arg(long = "detail")]
        details: Vec<String>,
    },
    /// Stop monitoring a case before it concludes.
    Cancel {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        monitor_id: i64,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Expire a monitor whose window has lapsed.
    Expire {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        monitor_id: i64,
        #[arg(long)]
        at: Option<String>,
    },
    /// Verify the monitor's history hash chain.
    Audit {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        monitor_id: i64,
    },
}

#[derive(Debug, Args)]
struct TickArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    at: Option<String>,
    /// Use the scripted checker instead of HTTP; unscripted cases stay
    /// open and reschedule.
    #[arg(long, default_value_t = false)]
    mock: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Request(args) => request_command(args),
        Commands::Monitor(args) => monitor_command(args),
        Commands::Tick(args) => tick_command(&args),
    }
}

fn request_command(args: RequestArgs) -> Result<()> {
    match args.command {
        RequestSubcommand::Submit {
            db,
            account_number,
            order_id,
            case_id,
            description,
        } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            let record = tracker.create(&RequestSubmission {
                case_id,
                order_id,
                account_number,
                status_description: description,
            })?;
            println!(
                "request_id={} status={} created_at={}",
                record.request_id,
                record.status,
                format_rfc3339(record.created_at)?
            );
        }
        RequestSubcommand::Transition {
            db,
            request_id,
            status,
            description,
        } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            let status = RequestStatus::parse(&status).ok_or_else(|| {
                anyhow!("invalid status '{status}'; use open, completed, or error")
            })?;
            let record = tracker.transition(RequestId(request_id), status, description)?;
            println!(
                "request_id={} status={} status_changed_at={}",
                record.request_id,
                record.status,
                format_rfc3339(record.status_changed_at)?
            );
        }
        RequestSubcommand::AttachDetails {
            db,
            request_id,
            details,
        } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            let details = parse_detail_pairs(&details)?;
            tracker.attach_details(RequestId(request_id), &details)?;
            println!("request_id={request_id} detail_slots={}", details.len());
        }
        RequestSubcommand::Show { db, request_id } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            let record = tracker
                .get(RequestId(request_id))?
                .ok_or_else(|| anyhow!("request {request_id} not found"))?;
            println!("{}", serde_json::to_string(&record)?);
        }
        RequestSubcommand::List { db } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            for record in tracker.list()? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        RequestSubcommand::History { db, request_id } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            for row in tracker.history(RequestId(request_id))? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        RequestSubcommand::Audit { db, request_id } => {
            let store = open_store(&db)?;
            let tracker = RequestTracker::new(&store);
            let report = tracker.audit(RequestId(request_id))?;
            println!(
                "request_id={request_id} entries={} chain_valid={}",
                report.entries, report.chain_valid
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_lines)]
fn monitor_command(args: MonitorArgs) -> Result<()> {
    match args.command {
        MonitorSubcommand::Start {
            db,
            case_id,
            account_number,
            order_id,
            request_id,
            expire_at,
            initial_delay_minutes,
            config,
        } => {
            let store = open_store(&db)?;
            let config = resolve_config(config.as_deref())?;
            let scheduler = MonitorScheduler::new(&store, config.backoff)?;
            let record = scheduler.start_monitoring(
                &MonitorRequest {
                    case_id,
                    request_id: request_id.map(RequestId),
                    order_id,
                    account_number,
                    expire_at: parse_rfc3339(&expire_at)?,
                    initial_delay: initial_delay_minutes.map(Duration::minutes),
                },
                now_utc(),
            )?;
            println!(
                "monitor_id={} status={} next_check_at={} expire_at={}",
                record.monitor_id,
                record.status,
                format_rfc3339(record.next_check_at)?,
                format_rfc3339(record.expire_at)?
            );
        }
        MonitorSubcommand::List { db } => {
            let store = open_store(&db)?;
            for record in store.list_monitors()? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        MonitorSubcommand::Due { db, at } => {
            let store = open_store(&db)?;
            let at = parse_at(at.as_deref())?;
            for record in store.due_monitors(at)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        MonitorSubcommand::Show { db, monitor_id } => {
            let store = open_store(&db)?;
            let record = store
                .get_monitor(MonitorId(monitor_id))?
                .ok_or_else(|| anyhow!("monitor {monitor_id} not found"))?;
            println!("{}", serde_json::to_string(&record)?);
        }
        MonitorSubcommand::History { db, monitor_id } => {
            let store = open_store(&db)?;
            let scheduler = MonitorScheduler::new(&store, SchedulerConfig::default().backoff)?;
            for row in scheduler.history(MonitorId(monitor_id))? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        MonitorSubcommand::AttachDetails {
            db,
            monitor_id,
            details,
        } => {
            let store = open_store(&db)?;
            let scheduler = MonitorScheduler::new(&store, SchedulerConfig::default().backoff)?;
            let details = parse_detail_pairs(&details)?;
            scheduler.attach_details(MonitorId(monitor_id), &details)?;
            println!("monitor_id={monitor_id} detail_slots={}", details.len());
        }
        MonitorSubcommand::Cancel {
            db,
            monitor_id,
            reason,
        } => {
            let store = open_store(&db)?;
            let scheduler = MonitorScheduler::new(&store, SchedulerConfig::default().backoff)?;
            let record = scheduler.cancel(MonitorId(monitor_id), reason)?;
            println!("monitor_id={} status={}", record.monitor_id, record.status);
        }
        MonitorSubcommand::Expire { db, monitor_id, at } => {
            let store = open_store(&db)?;
            let scheduler = MonitorScheduler::new(&store, SchedulerConfig::default().backoff)?;
            let at = parse_at(at.as_deref())?;
            let record = scheduler.expire(MonitorId(monitor_id), at)?;
            println!("monitor_id={} status={}", record.monitor_id, record.status);
        }
        MonitorSubcommand::Audit { db, monitor_id } => {
            let store = open_store(&db)?;
            let scheduler = MonitorScheduler::new(&store, SchedulerConfig::default().backoff)?;
            let report = scheduler.audit(MonitorId(monitor_id))?;
            println!(
                "monitor_id={monitor_id} entries={} chain_valid={}",
                report.entries, report.chain_valid
            );
        }
    }
    Ok(())
}

fn tick_command(args: &TickArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let config = resolve_config(args.config.as_deref())?;
    let scheduler = MonitorScheduler::new(&store, config.backoff)?;
    let at = parse_at(args.at.as_deref())?;

    let summary = if args.mock {
        let checker = MockCaseChecker::new();
        scheduler.run_tick(&checker, at)?
    } else {
        let checker_config = config
            .checker
            .ok_or_else(|| anyhow!("tick requires a checker section in the config, or --mock"))?;
        let checker = HttpCaseChecker::new(checker_config)?;
        scheduler.run_tick(&checker, at)?
    };

    println!(
        "polled={} resolved={} failed={} expired={} rescheduled={} skipped={}",
        summary.polled,
        summary.resolved,
        summary.failed,
        summary.expired,
        summary.rescheduled,
        summary.skipped
    );
    Ok(())
}

fn open_store(path: &Path) -> Result<SqliteLedgerStore> {
    let store = SqliteLedgerStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn resolve_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    match path {
        Some(path) => load_scheduler_config(path),
        None => Ok(SchedulerConfig::default()),
    }
}

fn parse_at(at: Option<&str>) -> Result<DateTimeUtc> {
    match at {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(now_utc()),
    }
}

fn parse_detail_pairs(pairs: &[String]) -> Result<DetailRecord> {
    let mut details = DetailRecord::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("detail '{pair}' must be slot=value, e.g. para_1=note"))?;
        details.set(name, value.to_string())?;
    }
    Ok(details)
}
