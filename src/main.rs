use anyhow::{bail, Context, Result};
use calibration_dashboard::dashboard::benchmark_view;
use calibration_dashboard::schema::{DEFAULT_MEASURE, MEASURES};
use calibration_dashboard::{CacheStatus, Config, Dashboard, GatewayKind};

const USAGE: &str = "usage: calibration-dashboard [status|trigger|benchmark [MEASURE]] [--offline]";

#[derive(Debug, PartialEq)]
enum Command {
    Status,
    Trigger,
    Benchmark(String),
}

fn parse_command(positional: &[&str]) -> Result<Command> {
    match positional.first().copied().unwrap_or("status") {
        "status" => Ok(Command::Status),
        "trigger" => Ok(Command::Trigger),
        "benchmark" => Ok(Command::Benchmark(
            positional.get(1).copied().unwrap_or(DEFAULT_MEASURE).to_string(),
        )),
        other => bail!("unknown command {:?}\n{}", other, USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let offline = args.iter().any(|a| a == "--offline");
    let positional: Vec<&str> = args
        .iter()
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect();
    let command = parse_command(&positional)?;

    let mut cfg = Config::from_env();
    let kind = if offline {
        // canned backend answers instantly; no reason to wait seconds
        cfg.settle_ms = cfg.settle_ms.min(500);
        cfg.poll_base_ms = cfg.poll_base_ms.min(250);
        GatewayKind::Offline
    } else {
        GatewayKind::Http
    };
    let dash = Dashboard::new(cfg, kind).context("building request gateway")?;

    match command {
        Command::Status => {
            let result = dash.fetch_status().await;
            let ok = result.is_ok();
            println!("{}", serde_json::to_string_pretty(&dash.status_view())?);
            if !ok {
                println!("{}", serde_json::to_string_pretty(&result.to_json())?);
                bail!("status read failed");
            }
        }
        Command::Trigger => follow_recalibration(&dash).await?,
        Command::Benchmark(measure) => {
            if !MEASURES.contains(&measure.as_str()) {
                eprintln!("[benchmark] unknown measure {:?}; known: {}", measure, MEASURES.join(", "));
            }
            let mut rx = dash.benchmarks().subscribe();
            let mut entry = dash.select_measure(&measure);
            while entry.status == CacheStatus::Loading {
                rx.changed().await?;
                entry = match dash.benchmarks().active() {
                    Some(e) => e,
                    None => break,
                };
            }
            println!("{}", serde_json::to_string_pretty(&benchmark_view(&entry))?);
        }
    }

    dash.teardown();
    Ok(())
}

async fn follow_recalibration(dash: &Dashboard) -> Result<()> {
    // completion is judged against the status seen before the trigger
    if let Err(err) = dash.job().fetch_status().await {
        eprintln!("[trigger] baseline status read failed: {}", err);
    }
    let mut rx = dash.job().subscribe();
    if let Err(err) = dash.recalibrate().await {
        println!("{}", serde_json::to_string_pretty(&dash.status_view())?);
        bail!("recalibration not started: {}", err);
    }

    let mut last_seen = None;
    loop {
        let snap = dash.job().snapshot();
        let state = snap.lifecycle.state;
        if last_seen != Some((state, snap.lifecycle.attempts)) {
            eprintln!("[trigger] run={} state={} attempts={}", snap.run, state.as_str(), snap.lifecycle.attempts);
            last_seen = Some((state, snap.lifecycle.attempts));
        }
        if !state.is_running() {
            break;
        }
        rx.changed().await?;
    }

    println!("{}", serde_json::to_string_pretty(&dash.status_view())?);
    if let Some(err) = dash.job().snapshot().lifecycle.last_error {
        bail!("recalibration failed: {}", err);
    }
    Ok(())
}
