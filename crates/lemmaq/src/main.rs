use std::io::{self, BufRead, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use lemmaq::config::ENV_WORKER_INDEX;
use lemmaq::{
    Client, Config, ExecSpawner, QueueSet, ShutdownLatch, Supervisor, VersionInfo, logging,
    shutdown, stub_analyzer, supervisor,
};

const USAGE: &str = "\
Usage: lemmaq <command> [options]

Commands:
  serve              Create the queues and run the worker pool
  worker             Run one worker against existing queues
  normalize [TEXT]   Normalize TEXT, or each line of stdin
  cleanup            Remove queues left behind by a crashed launcher
  analyzer-stub      Run the built-in fake analyzer on stdin/stdout
  version            Print version information

Options:
  --namespace <ns>   Resource name prefix [env: LEMMAQ_NAMESPACE, default: /lemmaq]
  --workers <n>      Worker processes [env: LEMMAQ_WORKERS, default: 4]
  --timeout <secs>   normalize timeout [env: LEMMAQ_TIMEOUT_SECS, default: none]";

#[derive(Debug, PartialEq)]
enum Command {
    Serve,
    Worker,
    Normalize(Option<String>),
    Cleanup,
    AnalyzerStub,
    Version,
}

#[derive(Debug, Default, PartialEq)]
struct Overrides {
    namespace: Option<String>,
    workers: Option<usize>,
    timeout: Option<Duration>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (command, overrides) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    logging::init_tracing();

    if let Err(e) = run(command, overrides) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(Command, Overrides), String> {
    let mut command: Option<&str> = None;
    let mut text: Option<String> = None;
    let mut overrides = Overrides::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--namespace" => {
                i += 1;
                overrides.namespace =
                    Some(args.get(i).ok_or("--namespace requires a value")?.clone());
            }
            "--workers" => {
                i += 1;
                let raw = args.get(i).ok_or("--workers requires a value")?;
                match raw.parse::<usize>() {
                    Ok(n) if n > 0 => overrides.workers = Some(n),
                    _ => return Err(format!("invalid worker count: {raw}")),
                }
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                match raw.parse::<f64>() {
                    Ok(secs) if secs > 0.0 && secs.is_finite() => {
                        overrides.timeout = Some(Duration::from_secs_f64(secs));
                    }
                    _ => return Err(format!("invalid timeout: {raw}")),
                }
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg if command.is_none() => command = Some(arg),
            arg if command == Some("normalize") && text.is_none() => text = Some(arg.to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    let command = match command {
        Some("serve") => Command::Serve,
        Some("worker") => Command::Worker,
        Some("normalize") => Command::Normalize(text),
        Some("cleanup") => Command::Cleanup,
        Some("analyzer-stub") => Command::AnalyzerStub,
        Some("version") => Command::Version,
        Some(other) => return Err(format!("unknown command: {other}")),
        None => return Err("missing command".to_string()),
    };
    Ok((command, overrides))
}

fn load_config(overrides: Overrides) -> Config {
    let mut config = Config::from_env();
    if let Some(namespace) = overrides.namespace {
        config.queue = config.queue.with_namespace(namespace);
    }
    if let Some(workers) = overrides.workers {
        config.queue = config.queue.with_workers(workers);
    }
    if overrides.timeout.is_some() {
        config.client = config.client.with_timeout(overrides.timeout);
    }
    config
}

fn run(command: Command, overrides: Overrides) -> anyhow::Result<()> {
    let config = load_config(overrides);
    match command {
        Command::Serve => serve(config),
        Command::Worker => worker(config),
        Command::Normalize(text) => normalize(config, text),
        Command::Cleanup => {
            QueueSet::destroy(&config.queue.names()).context("failed to remove queues")
        }
        Command::AnalyzerStub => {
            stub_analyzer::run_stub(io::stdin().lock(), io::stdout().lock())
                .context("analyzer stub failed")
        }
        Command::Version => {
            let info = VersionInfo::new().with_analyzer(&config.worker.analyzer);
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

fn serve(config: Config) -> anyhow::Result<()> {
    let spawner = ExecSpawner::current_exe().context("cannot locate own executable")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let shutdown = supervisor::shutdown_signal()?;
        Supervisor::new(config, Arc::new(spawner))
            .run(shutdown)
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn worker(config: Config) -> anyhow::Result<()> {
    let latch = ShutdownLatch::new();
    shutdown::install_signal_handler(latch.clone())
        .context("failed to install signal handler")?;

    let index = std::env::var(ENV_WORKER_INDEX).unwrap_or_else(|_| "-".to_string());
    let span = tracing::info_span!("worker", index = %index);
    let _enter = span.enter();

    lemmaq::run_worker(&config.queue, &config.worker, &latch)?;
    Ok(())
}

fn normalize(config: Config, text: Option<String>) -> anyhow::Result<()> {
    let client = Client::connect(&config)
        .context("queues are not available; is `lemmaq serve` running?")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match text {
        Some(text) => writeln!(out, "{}", client.normalize(&text)?)?,
        None => {
            for line in io::stdin().lock().lines() {
                let line = line.context("failed to read stdin")?;
                writeln!(out, "{}", client.normalize(&line)?)?;
                out.flush()?;
            }
        }
    }
    Ok(())
}
