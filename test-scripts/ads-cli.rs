use std::process::ExitCode;
use std::time::Duration;

use tc3_ads_rs::{AdsError, PlcValue, SessionBlocking, SessionBuilder, SessionEvent};

#[derive(Debug)]
struct CliConfig {
    target: Option<String>,
    timeout_ms: u64,
}

#[derive(Debug)]
enum Command {
    Get { symbol: String },
    Set { symbol: String, value: String },
    Watch { symbol: String, seconds: u64 },
    Events { seconds: u64 },
    Smoke { symbol: String },
    Help,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            if matches!(err, AdsError::BadNetId { .. }) {
                eprintln!(
                    "hint: pass the controller address as `--target 192.168.0.10.1.1:851` or set ADS_TARGET."
                );
            }
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<(), AdsError> {
    let (config, command) = parse_args()?;

    if matches!(command, Command::Help) {
        print_help();
        return Ok(());
    }

    let target = config
        .target
        .or_else(|| std::env::var("ADS_TARGET").ok())
        .ok_or_else(|| AdsError::BadNetId {
            input: "<missing>".to_string(),
        })?;

    let builder =
        SessionBuilder::new(target).timeout(Duration::from_millis(config.timeout_ms));
    let session = SessionBlocking::open(builder)?;
    let mut events = session.events();

    if !session.is_connected() {
        eprintln!("warning: not connected yet; reconnect timer is running");
    }

    match command {
        Command::Get { symbol } => {
            let value = session.value(&symbol);
            println!("{symbol} = {} ({:?})", value.cached(), value.kind());
            println!("fresh read: {}", session.get(&symbol));
        }
        Command::Set { symbol, value } => {
            session.set(&symbol, value.as_str());
            println!("{symbol} = {}", session.get(&symbol));
        }
        Command::Watch { symbol, seconds } => {
            let value = session.value(&symbol);
            let mut updates = value.subscribe();
            println!("watching {symbol} for {seconds}s (initial: {})", value.cached());
            session.block_on(async {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
                loop {
                    let wait = tokio::time::timeout_at(deadline, updates.changed());
                    match wait.await {
                        Ok(Ok(())) => println!("{symbol} -> {}", *updates.borrow_and_update()),
                        _ => break,
                    }
                }
            });
        }
        Command::Events { seconds } => {
            println!("listening for session events for {seconds}s");
            session.block_on(async {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
                loop {
                    match tokio::time::timeout_at(deadline, events.recv()).await {
                        Ok(Ok(SessionEvent::ConnectionChanged(up))) => {
                            println!("connection: {}", if up { "up" } else { "down" })
                        }
                        Ok(Ok(SessionEvent::Error(msg))) => println!("error: {msg}"),
                        _ => break,
                    }
                }
            });
        }
        Command::Smoke { symbol } => {
            let value = session.value(&symbol);
            let before = session.block_on(value.get());
            println!("read:  {symbol} = {before}");
            if before == PlcValue::Empty {
                eprintln!("smoke: read failed, skipping write-back");
            } else {
                session.set(&symbol, before.to_string().as_str());
                println!("write: {symbol} = {}", session.get(&symbol));
            }
        }
        Command::Help => unreachable!(),
    }

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Error(msg) = event {
            eprintln!("session error: {msg}");
        }
    }
    session.disconnect();
    Ok(())
}

fn parse_args() -> Result<(CliConfig, Command), AdsError> {
    let mut config = CliConfig {
        target: None,
        timeout_ms: 5000,
    };
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--target" => config.target = args.next(),
            "--timeout-ms" => {
                config.timeout_ms = args
                    .next()
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(config.timeout_ms)
            }
            "--help" | "-h" => return Ok((config, Command::Help)),
            other => positional.push(other.to_string()),
        }
    }

    let command = match positional.first().map(String::as_str) {
        Some("get") if positional.len() == 2 => Command::Get {
            symbol: positional[1].clone(),
        },
        Some("set") if positional.len() == 3 => Command::Set {
            symbol: positional[1].clone(),
            value: positional[2].clone(),
        },
        Some("watch") if positional.len() >= 2 => Command::Watch {
            symbol: positional[1].clone(),
            seconds: positional
                .get(2)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(10),
        },
        Some("events") => Command::Events {
            seconds: positional
                .get(1)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(10),
        },
        Some("smoke") if positional.len() == 2 => Command::Smoke {
            symbol: positional[1].clone(),
        },
        _ => Command::Help,
    };

    Ok((config, command))
}

fn print_help() {
    println!(
        "ads-cli - TwinCAT ADS smoke-test CLI

USAGE:
    ads-cli [--target <ams-addr>] [--timeout-ms <ms>] <command>

COMMANDS:
    get <symbol>              read one symbol
    set <symbol> <value>      write one symbol (value converted to its kind)
    watch <symbol> [seconds]  print change notifications
    events [seconds]          print session lifecycle/error events
    smoke <symbol>            read then write back, exercising both paths

The controller address uses the AMS form, e.g. 192.168.0.10.1.1:851.
It can also be set via the ADS_TARGET environment variable."
    );
}
