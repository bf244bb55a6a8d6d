//! Command runners: load config, open the database, do one thing, print it.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use serde_json::json;
use yijing_config::{GatewayConfig, YijingConfig};
use yijing_engine::{
    DivinationError, DivinationOrchestrator, DivinationOutcome, DivinationRequest, DivinationStream,
    ReplyEvent, cast_throws,
};
use yijing_providers::retry::RetryPolicy;
use yijing_providers::{GatewaySettings, GatewayTimeouts, GeminiGateway};
use yijing_store::{AccountPlan, Database, OfflineUpload, StoreSettings, TextsFile};
use yijing_types::{
    ClientApp, ClientContext, HexagramContext, HexagramFigure, ReadingId, UserId,
    daily_quota_limit, quota_day,
};

use crate::command::{
    AccountCommand, AskArgs, Cli, Commands, HistoryCommand, TextsCommand, ThrowsArg,
};

/// Exit status for a request the service turned away (as opposed to a crash).
const EXIT_REJECTED: u8 = 2;
/// Exit status after Ctrl-C, as a shell would report SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        config,
        database,
        json,
        command,
    } = cli;
    let out = Output { json };

    match command {
        Commands::Cast => cast(out),
        Commands::Ask(args) => {
            let ws = Workspace::open(config.as_deref(), database)?;
            ask(&ws, args, out).await
        }
        Commands::Context(args) => {
            let ws = Workspace::open(config.as_deref(), database)?;
            context(&ws, args, out)
        }
        Commands::Account(cmd) => {
            let ws = Workspace::open(config.as_deref(), database)?;
            account(&ws, cmd, out)
        }
        Commands::History(cmd) => {
            let ws = Workspace::open(config.as_deref(), database)?;
            history(&ws, cmd, out)
        }
        Commands::Texts(cmd) => {
            let ws = Workspace::open(config.as_deref(), database)?;
            texts(&ws, cmd, out)
        }
    }
}

// ============================================================================
// Setup
// ============================================================================

struct Workspace {
    config: YijingConfig,
    db: Arc<Database>,
}

impl Workspace {
    fn open(config_path: Option<&Path>, database: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => YijingConfig::load_from(path)?,
            None => YijingConfig::load()?.unwrap_or_default(),
        };

        let path = match database {
            Some(path) => path,
            None => config
                .storage
                .database_path()
                .context("No home directory; pass --database")?,
        };
        let settings = StoreSettings {
            monthly_quota: config.ledger.monthly_quota,
            retention_days: config.readings.retention_days,
        };
        let db = Database::open(&path, settings)?;
        Ok(Self {
            config,
            db: Arc::new(db),
        })
    }
}

pub(crate) fn gateway_settings(config: &GatewayConfig) -> Result<GatewaySettings> {
    let api_key = config
        .api_key()
        .context("No Gemini API key: set GEMINI_API_KEY or [gateway] api_key")?;
    let model = config.model().context("Invalid [gateway] model")?;

    let mut settings = GatewaySettings::new(api_key, model);
    if let Some(base_url) = config.base_url() {
        settings.base_url = base_url;
    }
    settings.fallback_models = config.fallback_models();
    settings.temperature = config.temperature;
    settings.max_output_tokens = config.max_output_tokens;
    settings.stop_sequences.clone_from(&config.stop_sequences);
    settings.timeouts = GatewayTimeouts {
        connect: config.connect_timeout(),
        response: config.response_timeout(),
        stream_idle: config.stream_idle_timeout(),
    };
    settings.retry = RetryPolicy::default()
        .with_max_retries(config.max_retries)
        .with_initial_delay(config.initial_backoff());
    settings.https_only = config.https_only;
    Ok(settings)
}

fn user_id(raw: String) -> Result<UserId> {
    UserId::new(raw).context("Invalid --user")
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit(self, value: &serde_json::Value, plain: impl FnOnce() -> String) -> Result<()> {
        let mut stdout = io::stdout().lock();
        if self.json {
            writeln!(stdout, "{value}")?;
        } else {
            writeln!(stdout, "{}", plain())?;
        }
        Ok(())
    }
}

// ============================================================================
// ask / context / cast
// ============================================================================

async fn ask(ws: &Workspace, args: AskArgs, out: Output) -> Result<ExitCode> {
    let user = user_id(args.user)?;
    let throws = args.throws.unwrap_or_else(|| {
        cast_throws()
            .iter()
            .map(|throw| i64::from(throw.value()))
            .collect()
    });
    let client = args
        .app
        .as_deref()
        .map(ClientApp::parse)
        .transpose()?
        .map(|app| ClientContext {
            app,
            version: args.app_version,
        });

    let gateway = GeminiGateway::new(gateway_settings(&ws.config.gateway)?)
        .context("Failed to build HTTP client")?;
    let orchestrator = DivinationOrchestrator::with_database(
        Arc::clone(&ws.db),
        Arc::new(gateway),
        ws.config.prompt.system_prompt.clone(),
    );

    let mut request =
        DivinationRequest::new(user, throws, args.question).with_ad_session(args.ad_session);
    if let Some(name) = args.name {
        request = request.with_user_name(name);
    }
    if let Some(client) = client {
        request = request.with_client(client);
    }

    let stream = match orchestrator.handle(request).await {
        Ok(stream) => stream,
        Err(e) => return rejected(&e, out),
    };
    print_header(stream.context(), out)?;
    relay(stream, out).await
}

fn rejected(error: &DivinationError, out: Output) -> Result<ExitCode> {
    if let DivinationError::Internal(e) = error {
        return Err(anyhow::anyhow!("{e:#}"));
    }
    let class = error.class();
    if out.json {
        out.emit(
            &json!({
                "event": "rejected",
                "class": class.as_str(),
                "status": error.status_code(),
                "message": error.to_string(),
            }),
            String::new,
        )?;
    } else {
        eprintln!("{error} [{}]", class.as_str());
    }
    Ok(ExitCode::from(EXIT_REJECTED))
}

fn print_header(context: &HexagramContext, out: Output) -> Result<()> {
    if out.json {
        return out.emit(&context_json(context), String::new);
    }
    let mut stderr = io::stderr().lock();
    writeln!(
        stderr,
        "{} {} ({})",
        context.display_name(),
        context.trigram_title(),
        context.code()
    )?;
    let labels = context.figure().changing_line_labels();
    if !labels.is_empty() {
        writeln!(stderr, "changing: {}", labels.join(", "))?;
    }
    writeln!(stderr)?;
    Ok(())
}

/// Forward reply events to stdout until the stream ends or Ctrl-C.
async fn relay(mut stream: DivinationStream, out: Output) -> Result<ExitCode> {
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut interrupt => None,
            event = stream.next_event() => Some(event),
        };
        match next {
            Some(Some(event)) => print_event(&event, out)?,
            Some(None) => break,
            None => {
                let outcome = stream.cancel().await?;
                print_outcome(&outcome, out)?;
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
    }

    let outcome = stream.finish().await?;
    print_outcome(&outcome, out)?;
    Ok(match outcome {
        DivinationOutcome::Completed { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn print_event(event: &ReplyEvent, out: Output) -> Result<()> {
    if out.json {
        let value = match event {
            ReplyEvent::Text(text) => json!({ "event": "text", "text": text }),
            ReplyEvent::Usage(report) => json!({ "event": "usage", "report": report }),
            ReplyEvent::Failed(reason) => {
                json!({ "event": "failed", "reason": reason.to_string() })
            }
        };
        return out.emit(&value, String::new);
    }
    let mut stdout = io::stdout().lock();
    write!(stdout, "{}", event.render())?;
    stdout.flush()?;
    Ok(())
}

fn print_outcome(outcome: &DivinationOutcome, out: Output) -> Result<()> {
    let reading_id = outcome.reading_id().map(ReadingId::value);
    if out.json {
        let (status, detail) = match outcome {
            DivinationOutcome::Completed { .. } => ("completed", None),
            DivinationOutcome::Partial { error, .. } => ("partial", Some(error.clone())),
            DivinationOutcome::Failed { reason, refunded } => (
                "failed",
                Some(format!("{reason} (refunded: {refunded})")),
            ),
            DivinationOutcome::Cancelled { .. } => ("cancelled", None),
        };
        return out.emit(
            &json!({
                "event": "outcome",
                "status": status,
                "reading_id": reading_id,
                "detail": detail,
            }),
            String::new,
        );
    }

    let mut stderr = io::stderr().lock();
    writeln!(stderr)?;
    match outcome {
        DivinationOutcome::Completed { .. } | DivinationOutcome::Partial { .. } => {}
        DivinationOutcome::Failed { refunded, .. } => {
            if *refunded {
                writeln!(stderr, "(charge refunded)")?;
            }
        }
        DivinationOutcome::Cancelled { .. } => writeln!(stderr, "(cancelled)")?,
    }
    if let Some(id) = reading_id {
        writeln!(stderr, "saved as reading {id}")?;
    }
    Ok(())
}

fn context_json(context: &HexagramContext) -> serde_json::Value {
    let figure = context.figure();
    json!({
        "event": "context",
        "code": context.code().as_str(),
        "name": context.display_name(),
        "title": context.trigram_title(),
        "judgment": context.judgment(),
        "throws": figure.throws().iter().map(|t| t.value()).collect::<Vec<_>>(),
        "upper_trigram": figure.upper_trigram().name(),
        "lower_trigram": figure.lower_trigram().name(),
        "changing_lines": context.changing_positions(),
        "line_texts": context.line_texts(),
    })
}

/// Preview a hexagram. Reads the reference texts only; nobody is charged.
fn context(ws: &Workspace, args: ThrowsArg, out: Output) -> Result<ExitCode> {
    let figure = match HexagramFigure::resolve_values(&args.throws) {
        Ok(figure) => figure,
        Err(e) => return rejected(&DivinationError::from(e), out),
    };
    let Some(record) = ws.db.lookup_hexagram(figure.code())? else {
        let e = DivinationError::HexagramNotFound {
            code: figure.code().to_string(),
        };
        return rejected(&e, out);
    };
    let lines = ws
        .db
        .lookup_line_texts(record.id, figure.changing_positions())?;
    let context = HexagramContext::new(figure, record, lines);

    out.emit(&context_json(&context), || {
        let mut text = format!(
            "{} {} ({})\n{}\n上卦 {}\n下卦 {}",
            context.display_name(),
            context.trigram_title(),
            context.code(),
            context.judgment(),
            context.figure().upper_trigram(),
            context.figure().lower_trigram(),
        );
        for line in context.line_texts() {
            text.push_str(&format!("\n{} {}", line.position, line.text));
        }
        text
    })?;
    Ok(ExitCode::SUCCESS)
}

fn cast(out: Output) -> Result<ExitCode> {
    let values: Vec<u8> = cast_throws().iter().map(|throw| throw.value()).collect();
    out.emit(&json!({ "throws": values }), || {
        values
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    })?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// account
// ============================================================================

fn account(ws: &Workspace, cmd: AccountCommand, out: Output) -> Result<ExitCode> {
    match cmd {
        AccountCommand::Create { user, name } => {
            let account = ws.db.create_account(&user_id(user)?, name.as_deref())?;
            out.emit(&json!(account), || format!("created {}", account.id))?;
        }
        AccountCommand::Show { user } => {
            let user = user_id(user)?;
            let account = ws
                .db
                .load_account(&user)?
                .with_context(|| format!("Account {user} not found"))?;
            let now = Utc::now();
            let used = ws.db.quota_used(&user, quota_day(now))?;
            let limit = daily_quota_limit(ws.db.settings().monthly_quota);
            let subscribed = account.wallet.is_subscribed(now);
            out.emit(
                &json!({
                    "account": account,
                    "subscribed": subscribed,
                    "quota": { "used_today": used, "daily_limit": limit },
                }),
                || {
                    let mut text = format!(
                        "{}  plan={}  gold={}  silver={}  readings={}",
                        account.id,
                        account.plan.as_str(),
                        account.wallet.gold,
                        account.wallet.silver,
                        account.request_count
                    );
                    if let Some(until) = account.wallet.subscription_until {
                        text.push_str(&format!(
                            "\nsubscribed until {}  quota {used}/{limit} today",
                            until.to_rfc3339()
                        ));
                    }
                    text
                },
            )?;
        }
        AccountCommand::Grant { user, gold, silver } => {
            let user = user_id(user)?;
            let wallet = ws.db.grant_credits(&user, gold, silver)?;
            out.emit(&json!(wallet), || {
                format!("{user}  gold={}  silver={}", wallet.gold, wallet.silver)
            })?;
        }
        AccountCommand::Subscribe { user, days } => {
            let user = user_id(user)?;
            let until = if days == 0 {
                ws.db.set_subscription(&user, AccountPlan::Free, None)?;
                None
            } else {
                let now = Utc::now();
                let wallet = ws
                    .db
                    .load_wallet(&user)?
                    .with_context(|| format!("Account {user} not found"))?;
                // An active subscription is extended from its end, not from today.
                let start = wallet.subscription_until.filter(|u| *u > now).unwrap_or(now);
                let until = start + Duration::days(i64::from(days));
                ws.db
                    .set_subscription(&user, AccountPlan::Subscriber, Some(until))?;
                Some(until)
            };
            out.emit(&json!({ "user": user, "subscription_until": until }), || {
                match until {
                    Some(until) => format!("{user} subscribed until {}", until.to_rfc3339()),
                    None => format!("{user} subscription ended"),
                }
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// history / texts
// ============================================================================

fn history(ws: &Workspace, cmd: HistoryCommand, out: Output) -> Result<ExitCode> {
    match cmd {
        HistoryCommand::List {
            user,
            limit,
            offset,
            include_expired,
        } => {
            let readings =
                ws.db
                    .list_readings(&user_id(user)?, limit, offset, include_expired)?;
            out.emit(&json!(readings), || {
                readings
                    .iter()
                    .map(|r| {
                        format!(
                            "{:>5}{} {} {}  {}",
                            r.id.value(),
                            if r.is_pinned { "*" } else { " " },
                            r.created_at.format("%Y-%m-%d %H:%M"),
                            r.hexagram_code,
                            r.question
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        HistoryCommand::Show { user, id } => {
            let detail = ws
                .db
                .reading_detail(&user_id(user)?, ReadingId::new(id))?
                .with_context(|| format!("Reading {id} not found"))?;
            out.emit(&json!(detail), || {
                format!(
                    "{} ({})\n\n{}",
                    detail.summary.question, detail.summary.hexagram_code, detail.content
                )
            })?;
        }
        HistoryCommand::Pin { user, id } => set_pin(ws, user, id, true, out)?,
        HistoryCommand::Unpin { user, id } => set_pin(ws, user, id, false, out)?,
        HistoryCommand::Delete { user, id } => {
            if !ws.db.delete_reading(&user_id(user)?, ReadingId::new(id))? {
                bail!("Reading {id} not found");
            }
            out.emit(&json!({ "deleted": id }), || format!("deleted {id}"))?;
        }
        HistoryCommand::Purge => {
            let purged = ws.db.purge_expired(Utc::now())?;
            out.emit(&json!({ "purged": purged }), || {
                format!("purged {purged} expired readings")
            })?;
        }
        HistoryCommand::Import { user, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let upload: OfflineUpload = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let records = upload.into_records();
            let saved = ws.db.import_readings(&user_id(user)?, &records)?;
            out.emit(
                &json!({ "received": records.len(), "saved_count": saved.len(), "saved_ids": saved }),
                || format!("imported {} of {} readings", saved.len(), records.len()),
            )?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn set_pin(ws: &Workspace, user: String, id: i64, pin: bool, out: Output) -> Result<()> {
    if !ws.db.set_pin(&user_id(user)?, ReadingId::new(id), pin)? {
        bail!("Reading {id} not found");
    }
    out.emit(&json!({ "id": id, "pinned": pin }), || {
        format!("{} {id}", if pin { "pinned" } else { "unpinned" })
    })
}

fn texts(ws: &Workspace, cmd: TextsCommand, out: Output) -> Result<ExitCode> {
    match cmd {
        TextsCommand::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let parsed: TextsFile = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let report = ws.db.import_texts(&parsed)?;
            out.emit(
                &json!({ "hexagrams": report.hexagrams, "lines": report.lines }),
                || {
                    format!(
                        "imported {} hexagrams, {} lines",
                        report.hexagrams, report.lines
                    )
                },
            )?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
