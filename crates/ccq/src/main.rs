use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ccq_claude_cli::ClaudeCliBackend;
use ccq_core::{
    config::Config,
    correlator::Correlator,
    domain::SessionId,
    model::{
        client::{Backend, EchoBackend},
        types::ConversationMessage,
    },
    query::QueryClient,
    transport::NdjsonTransport,
    utils::json_preview,
    worker::Worker,
};

#[derive(Parser, Debug)]
#[command(name = "ccq", version, about = "Multiplexed Claude queries over a worker process")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve requests on stdin/stdout (spawned by `ask`).
    Worker {
        #[arg(long, value_enum, default_value_t = BackendKind::Claude)]
        backend: BackendKind,
    },
    /// Send a prompt through a freshly spawned worker and print the reply.
    Ask {
        prompt: String,
        /// Permission preset to apply before sending.
        #[arg(long)]
        preset: Option<String>,
        /// Send within this conversation session.
        #[arg(long)]
        session: Option<String>,
        /// Wait for the aggregated reply instead of streaming.
        #[arg(long, conflicts_with = "session")]
        once: bool,
        /// Print the aggregated reply as JSON (implies --once).
        #[arg(long, conflicts_with = "session")]
        json: bool,
        #[arg(long, value_enum, default_value_t = BackendKind::Claude)]
        backend: BackendKind,
    },
    /// Show the effective permissions, optionally checking invocations like `Bash(ls)`.
    Permissions {
        #[arg(long)]
        preset: Option<String>,
        #[arg(long = "check", value_name = "INVOCATION")]
        checks: Vec<String>,
        /// Dump the engine as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the available permission presets.
    Presets,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Claude,
    Echo,
}

impl BackendKind {
    fn as_arg(self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Echo => "echo",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ccq_core::logging::init("ccq")?;
    let cli = Cli::parse();
    let cfg = Config::load().context("loading configuration")?;

    match cli.command {
        Command::Worker { backend } => run_worker(&cfg, backend).await,
        Command::Ask {
            prompt,
            preset,
            session,
            once,
            json,
            backend,
        } => {
            let client = connect(&cfg, backend)?;
            if let Some(name) = preset {
                client.apply_preset(&name).await?;
            }
            if once || json {
                ask_once(&client, &prompt, json).await
            } else {
                ask_streaming(&client, &prompt, session).await
            }
        }
        Command::Permissions {
            preset,
            checks,
            json,
        } => show_permissions(&cfg, preset, &checks, json),
        Command::Presets => {
            let catalog = cfg.preset_catalog()?;
            for name in catalog.names() {
                if let Some(info) = catalog.info(name) {
                    let tools: Vec<_> = info.allowed_tools.iter().map(|t| t.as_str()).collect();
                    println!("{:<20} {} [{}]", info.name, info.display_name, tools.join(", "));
                }
            }
            Ok(())
        }
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

async fn run_worker(cfg: &Config, kind: BackendKind) -> anyhow::Result<()> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Claude => Arc::new(ClaudeCliBackend::new(cfg.claude_cli_config())),
        BackendKind::Echo => Arc::new(EchoBackend),
    };
    info!(backend = backend.name(), "worker starting");

    let worker = Worker::new(backend);
    let shutdown = worker.shutdown_token();
    let interrupt = cancel_on_ctrl_c();
    tokio::spawn(async move {
        interrupt.cancelled().await;
        shutdown.cancel();
    });

    worker.serve_stdio().await?;

    let metrics = worker.metrics();
    let summary = metrics.summary();
    info!(
        operations = summary.total_operations,
        success_rate = summary.success_rate,
        most_used_tool = ?summary.most_used_tool,
        "worker stopped"
    );
    if let Some(path) = &cfg.metrics_file {
        metrics
            .export(path)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }
    Ok(())
}

fn connect(cfg: &Config, backend: BackendKind) -> anyhow::Result<QueryClient> {
    let settings = cfg.client_settings()?;
    let correlator = Arc::new(Correlator::new());
    let exe = std::env::current_exe().context("locating the ccq executable")?;
    let args = vec![
        "worker".to_string(),
        "--backend".to_string(),
        backend.as_arg().to_string(),
    ];
    let transport = NdjsonTransport::spawn_worker(&exe, &args, Arc::clone(&correlator))?;
    Ok(QueryClient::new(Arc::new(transport), correlator, settings))
}

fn print_message(m: &ConversationMessage) {
    if !m.content.is_empty() {
        println!("{}", m.content);
    }
    for call in m.tool_calls.iter().flatten() {
        let args = serde_json::Value::Object(call.arguments.clone());
        eprintln!("[{}] {}", call.tool, json_preview(&args, 200));
    }
}

async fn ask_once(client: &QueryClient, prompt: &str, json: bool) -> anyhow::Result<()> {
    let response = client.query_once(prompt, None, None).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        response.messages.iter().for_each(print_message);
    }
    Ok(())
}

async fn ask_streaming(
    client: &QueryClient,
    prompt: &str,
    session: Option<String>,
) -> anyhow::Result<()> {
    let interrupt = cancel_on_ctrl_c();

    if let Some(id) = session {
        let session = client.session(Some(SessionId::from(id.as_str())), None).await?;
        let mut turn = session.send(prompt).await?;
        loop {
            tokio::select! {
                _ = interrupt.cancelled() => {
                    warn!("interrupted");
                    return Ok(());
                }
                item = turn.next() => match item {
                    Some(m) => print_message(&m?),
                    None => return Ok(()),
                },
            }
        }
    }

    let mut stream = client.query(prompt, None, None).await?;
    loop {
        tokio::select! {
            _ = interrupt.cancelled() => {
                stream.cancel();
                warn!("interrupted");
                return Ok(());
            }
            item = stream.next() => match item {
                Some(m) => print_message(&m?),
                None => return Ok(()),
            },
        }
    }
}

fn show_permissions(
    cfg: &Config,
    preset: Option<String>,
    checks: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let catalog = cfg.preset_catalog()?;
    let mut engine = cfg.permission_engine(&catalog)?;
    if let Some(name) = preset {
        engine.apply_preset(catalog.get(&name)?);
    }

    if json {
        println!("{}", engine.to_json()?);
    } else {
        let s = engine.summary();
        println!(
            "tools: {} allowed, {} denied; rules: {} allow, {} deny",
            s.allowed_tools, s.denied_tools, s.allow_rules, s.deny_rules
        );
        let allowed: Vec<_> = engine.allowed_tools().iter().map(|t| t.as_str()).collect();
        println!("allowed: {}", allowed.join(", "));
    }

    for check in checks {
        let decision = engine.validate_invocation(check);
        let verdict = if decision.allowed { "allow" } else { "deny" };
        println!("{verdict:<5} {check}: {}", decision.reason);
    }
    Ok(())
}
