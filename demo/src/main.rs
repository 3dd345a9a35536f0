mod stubs;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use locus::catalog;
use locus::{CancellationToken, Config, Orchestrator, PlainText, Registry, Request, Synthesizer};

#[derive(Parser, Debug, Clone)]
#[command(about = "Runs the travel catalogue against offline stub providers")]
struct Args {
    /// Capabilities to request.
    #[arg(required = true)]
    capabilities: Vec<String>,

    #[arg(long, default_value = "Nairobi")]
    location: String,

    #[arg(long, default_value = "dinner")]
    event: String,

    /// Capabilities whose provider always fails.
    #[arg(long, value_delimiter = ',')]
    fail: Vec<String>,

    /// Capabilities whose provider fails transiently on the first attempt.
    #[arg(long, value_delimiter = ',')]
    flaky: Vec<String>,

    /// Capabilities whose provider takes a few seconds to answer.
    #[arg(long, value_delimiter = ',')]
    slow: Vec<String>,

    /// Per-attempt timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout: u64,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Overall deadline in milliseconds.
    #[arg(long)]
    deadline: Option<u64>,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Print the timed execution graph as a Mermaid diagram.
    #[arg(long)]
    mermaid: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    locus::init_logging()?;

    let args = Args::parse();

    let behaviour = stubs::Behaviour {
        fail: args.fail.clone(),
        flaky: args.flaky.clone(),
        slow: args.slow.clone(),
    };

    let mut registry = Registry::new();
    catalog::register_travel(&mut registry, |entry| Some(stubs::provider(entry.id, &behaviour)))?;

    let mut config = Config::default().with_timeout(Duration::from_millis(args.timeout));
    if let Some(limit) = args.concurrency {
        config = config.with_max_concurrency(limit);
    }
    if let Some(deadline) = args.deadline {
        config = config.with_request_deadline(Duration::from_millis(deadline));
    }

    let request = Request::new(&args.capabilities)
        .param("location", args.location.as_str())
        .param("event", args.event.as_str())
        .param("memory", format!("prefers {}", args.event));

    let orchestrator = Orchestrator::new(Arc::new(registry), config);

    println!(
        "{} {}",
        style("locus").red(),
        style(format!("planning {:?}", request.capabilities())).blue()
    );

    let plan = orchestrator.plan(&request)?;
    for (depth, layer) in plan.layers().iter().enumerate() {
        let names: Vec<String> = layer.iter().map(|id| id.to_string()).collect();
        println!("  layer {depth}: {}", names.join(", "));
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling request");
                cancel.cancel();
            }
        }
    });

    let run = orchestrator.run(&request, cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run.report)?);
    } else {
        println!("{}", PlainText.synthesize(&request, &run.report).await?);
    }

    if args.mermaid {
        println!("{}", run.diagnostics.render_mermaid(&run.plan));
    }

    let failed = run.report.failed().count();
    let skipped = run.report.skipped().count();
    let summary = format!(
        "{} succeeded, {failed} failed, {skipped} skipped",
        run.report.succeeded().count()
    );

    if run.report.is_complete() {
        println!("{}", style(summary).green());
    } else {
        println!("{}", style(summary).yellow());
    }

    Ok(())
}
