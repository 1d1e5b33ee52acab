//! Scripted in-process engine for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::{Instant, sleep_until};

use crate::process::InProcessEngine;

/// Knobs for how the scripted engine misbehaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct Behavior {
    /// Read everything, answer nothing.
    pub silent: bool,
    /// Exit with code 1 as soon as `uci` arrives.
    pub exit_on_uci: bool,
    /// Delay between `go` and `bestmove`.
    pub search_time: Duration,
    /// Emit an unparseable line in the middle of each search.
    pub garbage_during_search: bool,
    /// Exit with this code when `go` arrives.
    pub exit_on_go: Option<i32>,
    /// Stop answering anything once `go` arrives.
    pub hang_on_go: bool,
    /// Keep searching through `stop`.
    pub ignore_stop: bool,
    pub ignore_quit: bool,
}

pub(crate) struct ScriptedEngine {
    behavior: Behavior,
    received: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEngine {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every line the engine has read, in order.
    pub fn received(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.received)
    }
}

const OPTIONS: &[&str] = &["Threads", "Hash", "MultiPV", "Move Overhead"];

async fn emit(out: &mut DuplexStream, line: &str) -> bool {
    out.write_all(format!("{line}\n").as_bytes()).await.is_ok()
}

fn option_name(line: &str) -> String {
    let rest = line.split_once(" name ").map(|(_, r)| r).unwrap_or("");
    rest.split(" value ").next().unwrap_or("").to_string()
}

#[async_trait]
impl InProcessEngine for ScriptedEngine {
    async fn run(&self, input: DuplexStream, mut output: DuplexStream) -> i32 {
        let b = &self.behavior;
        let mut lines = BufReader::new(input).lines();
        let mut search_due: Option<Instant> = None;
        let mut infinite = false;
        let mut hung = false;

        macro_rules! say {
            ($($arg:tt)*) => {
                if !emit(&mut output, &format!($($arg)*)).await {
                    return 0;
                }
            };
        }

        loop {
            let due = search_due;
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { return 0 };
                    self.received.lock().unwrap().push(line.clone());

                    let verb = line.split_whitespace().next().unwrap_or("");
                    if verb == "quit" && !b.ignore_quit {
                        return 0;
                    }
                    if b.silent || hung {
                        continue;
                    }

                    match verb {
                        "uci" => {
                            if b.exit_on_uci {
                                return 1;
                            }
                            say!("id name ScriptedFish 1.0");
                            say!("id author the test suite");
                            for name in OPTIONS {
                                say!("option name {name} type spin default 1 min 1 max 1024");
                            }
                            say!("uciok");
                        }
                        "isready" => say!("readyok"),
                        "setoption" => {
                            let name = option_name(&line);
                            if !OPTIONS.iter().any(|o| o.eq_ignore_ascii_case(&name)) {
                                say!("No such option: {name}");
                            }
                        }
                        "position" | "ucinewgame" | "ponderhit" | "quit" => {}
                        "go" => {
                            if let Some(code) = b.exit_on_go {
                                return code;
                            }
                            if b.hang_on_go {
                                hung = true;
                                continue;
                            }
                            say!("info depth 1 seldepth 1 score cp 15 nodes 120 nps 12000 pv h2e2");
                            if b.garbage_during_search {
                                say!("@@#! \u{1} not a protocol line");
                            }
                            say!("info depth 2 seldepth 3 score cp 21 nodes 480 pv h2e2 h9g7");
                            if line.contains("infinite") {
                                infinite = true;
                            } else {
                                search_due = Some(Instant::now() + b.search_time);
                            }
                        }
                        "stop" if b.ignore_stop => {}
                        "stop" => {
                            if infinite || search_due.is_some() {
                                infinite = false;
                                search_due = None;
                                say!("bestmove h2e2 ponder h9g7");
                            }
                        }
                        _ => say!("Unknown command: '{line}'. Type help for more information."),
                    }
                }
                _ = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                    search_due = None;
                    say!("bestmove h2e2 ponder h9g7");
                }
            }
        }
    }
}
