//! Analyse one position with a bundled engine and print the best move.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use xqbridge::{
    BridgeConfig, EngineBridge, EngineEvent, NativeDirLocator, Params, Reply, ScoreKind, Verb,
};

const USAGE: &str = "Usage: xqbridge-cli <engine-dir> [--depth N | --movetime MS] [--fen FEN] \
                     [--moves \"h2e2 h9g7 ...\"] [--option NAME=VALUE]... [--json]";

#[derive(Debug, Default)]
struct Args {
    engine_dir: PathBuf,
    depth: Option<u32>,
    movetime: Option<u64>,
    fen: Option<String>,
    moves: Option<String>,
    options: Vec<(String, String)>,
    json: bool,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut engine_dir: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--depth" => {
                i += 1;
                let raw = args.get(i).ok_or("--depth requires a value")?;
                parsed.depth = Some(raw.parse().map_err(|_| format!("invalid depth: {raw}"))?);
            }
            "--movetime" => {
                i += 1;
                let raw = args.get(i).ok_or("--movetime requires a value")?;
                parsed.movetime = Some(raw.parse().map_err(|_| format!("invalid movetime: {raw}"))?);
            }
            "--fen" => {
                i += 1;
                parsed.fen = Some(args.get(i).ok_or("--fen requires a value")?.clone());
            }
            "--moves" => {
                i += 1;
                parsed.moves = Some(args.get(i).ok_or("--moves requires a value")?.clone());
            }
            "--option" => {
                i += 1;
                let raw = args.get(i).ok_or("--option requires NAME=VALUE")?;
                let (name, value) = raw
                    .split_once('=')
                    .ok_or_else(|| format!("invalid option (expected NAME=VALUE): {raw}"))?;
                parsed.options.push((name.to_string(), value.to_string()));
            }
            "--json" => parsed.json = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if engine_dir.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                engine_dir = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    if parsed.depth.is_some() && parsed.movetime.is_some() {
        return Err("--depth and --movetime are mutually exclusive".to_string());
    }
    parsed.engine_dir = engine_dir.ok_or("missing required argument: <engine-dir>")?;
    Ok(parsed)
}

fn position_params(args: &Args) -> Params {
    let mut params = match &args.fen {
        Some(fen) => vec![("fen".to_string(), fen.clone())],
        None => vec![("startpos".to_string(), String::new())],
    };
    if let Some(moves) = &args.moves {
        params.push(("moves".to_string(), moves.clone()));
    }
    params
}

fn go_params(args: &Args) -> Params {
    match (args.depth, args.movetime) {
        (_, Some(ms)) => vec![("movetime".to_string(), ms.to_string())],
        (Some(depth), None) => vec![("depth".to_string(), depth.to_string())],
        (None, None) => vec![("depth".to_string(), "12".to_string())],
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = BridgeConfig::new().from_env()?;
    for (name, value) in &args.options {
        config = config.with_startup_option(name.as_str(), value.as_str());
    }

    let bridge = EngineBridge::new(NativeDirLocator::new(&args.engine_dir), config);
    let info = bridge
        .start()
        .await
        .with_context(|| format!("failed to start engine from {}", args.engine_dir.display()))?;
    tracing::info!(
        session_id = %info.session_id,
        engine = info.identity.name.as_deref().unwrap_or("unknown"),
        "Engine started"
    );

    let json = args.json;
    let _progress = bridge.subscribe(move |event: EngineEvent| match event {
        EngineEvent::Info(info) if json => {
            if let Ok(line) = serde_json::to_string(&info) {
                println!("{line}");
            }
        }
        EngineEvent::Info(info) => {
            if let (Some(depth), Some(score)) = (info.depth, info.score) {
                let kind = match score.kind {
                    ScoreKind::Cp => "cp",
                    ScoreKind::Mate => "mate",
                };
                println!("depth {depth} score {kind} {} pv {}", score.value, info.pv.join(" "));
            }
        }
        EngineEvent::EngineError { message } => eprintln!("engine: {message}"),
        _ => {}
    });

    // Leave room for the engine's own time management on top of movetime.
    let deadline = args.movetime.map(|ms| Duration::from_millis(ms) + Duration::from_secs(5));

    let result = async {
        bridge.send(Verb::UciNewGame, Vec::new(), None).await?;
        bridge.send(Verb::Position, position_params(&args), None).await?;
        bridge.send(Verb::Go, go_params(&args), deadline).await
    }
    .await;

    let outcome = bridge.stop().await;
    tracing::debug!(?outcome, "Engine stopped");

    match result.context("search failed")? {
        Reply::BestMove { mv, ponder } if json => {
            println!("{}", serde_json::json!({ "bestmove": mv, "ponder": ponder }));
        }
        Reply::BestMove { mv, ponder: Some(ponder) } => println!("bestmove {mv} ponder {ponder}"),
        Reply::BestMove { mv, ponder: None } => println!("bestmove {mv}"),
        other => anyhow::bail!("unexpected reply to go: {other:?}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    xqbridge::init_tracing();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
