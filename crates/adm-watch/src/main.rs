use adm_core::{ApprovalRequest, ConnectionStatus, StreamEvent};
use adm_stream::{
    config::parse_endpoint,
    plan_view::{correlation_id, sort_by_timestamp, PlanSelection, PlanView},
    ConfigError, DispatchOutcome, Session, SessionUpdate, StreamConfig,
};
use clap::Parser;
use std::{error::Error, io, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "adm-watch", about = "Follow the ADMADC gateway event stream")]
struct Args {
    /// Gateway WebSocket URL; falls back to ADM_GATEWAY_URL.
    #[arg(long, default_value = "")]
    url: String,
    /// Plan id to follow, or "all".
    #[arg(long, default_value = "all")]
    plan: String,
    /// Print the settled view once and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
    #[arg(long, default_value_t = 1500)]
    settle_ms: u64,
    /// Write tracing output to stderr.
    #[arg(long, default_value_t = false)]
    log: bool,
}

struct Watch {
    selection: PlanSelection,
    plan_ids: Vec<String>,
}

impl Watch {
    fn new(selection: PlanSelection) -> Self {
        Self {
            selection,
            plan_ids: Vec::new(),
        }
    }

    /// Re-derives the plan view and prints what changed in the plan list or selection.
    fn refresh(&mut self, snapshot: &[StreamEvent]) {
        let view = PlanView::derive(snapshot, &self.selection);
        if view.plan_ids != self.plan_ids {
            println!("plans {}", format_plan_ids(&view.plan_ids));
            self.plan_ids = view.plan_ids;
        }
        if view.selection != self.selection {
            println!("following {}", view.selection);
            self.selection = view.selection;
        }
    }

    fn apply(&mut self, session: &Session, update: SessionUpdate) {
        match update {
            SessionUpdate::Status(status) => println!("{}", format_status_line(status)),
            SessionUpdate::Dispatched(outcome) => self.apply_outcome(session, outcome),
            SessionUpdate::EventsCleared => {
                self.refresh(&[]);
                println!("events cleared");
            }
            SessionUpdate::ApprovalsCleared => println!("approvals cleared"),
        }
    }

    fn apply_outcome(&mut self, session: &Session, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::EventInserted { event_id }
            | DispatchOutcome::HistoryAppended { event_id } => {
                let snapshot = session.events();
                self.refresh(&snapshot);
                if let Some(event) = snapshot.iter().find(|event| event.event_id == event_id) {
                    if self.selection.matches(event) {
                        println!("{}", format_event_line(event));
                    }
                }
            }
            DispatchOutcome::ApprovalQueued { approval_id } => {
                if let Some(approval) = session
                    .approvals()
                    .into_iter()
                    .find(|approval| approval.approval_id == approval_id)
                {
                    println!("{}", format_approval_line(&approval));
                }
            }
            DispatchOutcome::ApprovalResolved { approval_id } => {
                println!("approval {approval_id} resolved");
            }
            DispatchOutcome::HistoryDuplicate { .. }
            | DispatchOutcome::ApprovalDuplicate { .. }
            | DispatchOutcome::ApprovalAbsent { .. }
            | DispatchOutcome::Ignored { .. }
            | DispatchOutcome::Discarded => {}
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.log || resolve_log_stderr());
    let config = load_config(&args)?;
    let selection: PlanSelection = args.plan.parse().unwrap_or_default();

    let session = Session::open(config);
    if args.once {
        tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;
        print_settled(&session, &selection);
        session.shutdown().await;
        return Ok(());
    }

    let mut updates = session.subscribe();
    let mut watch = Watch::new(selection);
    println!("{}", format_status_line(session.status()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "watch_interrupt");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => watch.apply(&session, update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "watch_lagged", skipped);
                    watch.refresh(&session.events());
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_settled(session: &Session, selection: &PlanSelection) {
    let snapshot = session.snapshot();
    let view = PlanView::derive(&snapshot.events, selection);
    println!("{}", format_status_line(snapshot.status));
    println!("plans {}", format_plan_ids(&view.plan_ids));
    println!("following {}", view.selection);
    let mut events: Vec<&StreamEvent> = view.events.iter().collect();
    sort_by_timestamp(&mut events);
    for event in events {
        println!("{}", format_event_line(event));
    }
    for approval in &snapshot.approvals {
        println!("{}", format_approval_line(approval));
    }
}

fn format_status_line(status: ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Disconnected => "status disconnected; retrying".to_string(),
        other => format!("status {other}"),
    }
}

fn format_event_line(event: &StreamEvent) -> String {
    let timestamp = if event.timestamp.is_empty() {
        "-"
    } else {
        event.timestamp.as_str()
    };
    format!(
        "{timestamp} {:<24} {:<18} plan={} {}",
        event.event_type.as_str(),
        ellipsize(&event.producer, 18),
        correlation_id(event).map(short_id).unwrap_or("-"),
        event.event_id
    )
}

fn format_approval_line(approval: &ApprovalRequest) -> String {
    format!(
        "approval {} pending plan={} branch={} files={}",
        approval.approval_id,
        if approval.plan_id.is_empty() {
            "-"
        } else {
            short_id(&approval.plan_id)
        },
        if approval.branch_name.is_empty() {
            "-"
        } else {
            approval.branch_name.as_str()
        },
        approval.files_count
    )
}

fn format_plan_ids(plan_ids: &[String]) -> String {
    if plan_ids.is_empty() {
        return "-".to_string();
    }
    plan_ids
        .iter()
        .map(|plan_id| short_id(plan_id))
        .collect::<Vec<_>>()
        .join(",")
}

/// Plan ids are UUIDs; the first 8 characters are enough to tell runs apart.
fn short_id(plan_id: &str) -> &str {
    match plan_id.char_indices().nth(8) {
        Some((idx, _)) => &plan_id[..idx],
        None => plan_id,
    }
}

fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn load_config(args: &Args) -> Result<StreamConfig, ConfigError> {
    let mut config = StreamConfig::from_env()?;
    if !args.url.trim().is_empty() {
        config.endpoint = parse_endpoint(&args.url)?;
    }
    Ok(config)
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_log_stderr() -> bool {
    std::env::var("ADM_LOG_STDERR")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

fn init_logging(enabled: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
