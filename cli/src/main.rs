//! wavelink - interactive console driving a GTKWave waveform viewer.
//!
//! ```text
//! main() -> ViewerController::open(wavefile) -> console loop
//!                 |                                 |
//!                 v                                 v
//!   select events / time-cursor changes     add / values / follow ...
//! ```
//!
//! Stdout belongs to the console; logs go to `~/.wavelink/logs/wavelink.log`.

mod console;

use std::{
    env,
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use wavelink_config::WavelinkConfig;
use wavelink_viewer::{SELECT_EVENT, SignalValue, ViewerController, ViewerState};

use crate::console::Command;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Never stdout: that is where the console prints.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.wavelink/logs/wavelink.log
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".wavelink").join("logs").join("wavelink.log"));
    }

    // Fallback: ./.wavelink/logs/wavelink.log
    candidates.push(PathBuf::from(".wavelink").join("logs").join("wavelink.log"));

    candidates
}

fn format_values(values: &[SignalValue]) -> String {
    values
        .iter()
        .map(|v| {
            let text = v.value_text().unwrap_or_else(|| "-".to_string());
            format!("{}={text}", v.leaf_name())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Print the selection the viewer reports while following.
fn register_select_printer(viewer: &ViewerController) {
    viewer.on_event(SELECT_EVENT, |args: &[serde_json::Value]| {
        let paths: Vec<&str> = args.iter().filter_map(serde_json::Value::as_str).collect();
        if !paths.is_empty() {
            println!("selected: {}", paths.join(", "));
        }
    });
}

/// Print the annotation signals every time the viewer's time cursor moves.
fn spawn_annotation_printer(viewer: ViewerController, signals: Vec<String>) {
    if signals.is_empty() {
        return;
    }
    let mut cursor = viewer.subscribe_time_cursor();
    tokio::spawn(async move {
        while cursor.changed().await.is_ok() {
            let Some(time) = cursor.borrow_and_update().clone() else {
                continue;
            };
            match viewer.get_signal_values(signals.iter().cloned()).await {
                Ok(values) => println!("@ {time}: {}", format_values(&values)),
                Err(e) => tracing::debug!("Annotation refresh failed: {e}"),
            }
        }
    });
}

/// Announce when the viewer goes away on its own.
fn spawn_state_printer(viewer: &ViewerController) {
    let mut state = viewer.subscribe_state();
    tokio::spawn(async move {
        let mut last = *state.borrow_and_update();
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            if last == ViewerState::Running && current != ViewerState::Running {
                println!("viewer {}", current.label());
            }
            last = current;
        }
    });
}

async fn open(viewer: &ViewerController, wavefile: PathBuf) {
    if !viewer.supports_file(&wavefile) {
        println!(
            "warning: {} is not one of {}",
            wavefile.display(),
            viewer.supported_extensions().join(" ")
        );
    }
    match viewer.open(&wavefile).await {
        Ok(()) => println!(
            "viewer running (pid {})",
            viewer
                .pid()
                .await
                .map_or_else(|| "?".to_string(), |p| p.to_string())
        ),
        Err(e) => println!("error: {e}"),
    }
}

/// Run one console command. Returns `false` to quit.
async fn execute(viewer: &ViewerController, command: Command) -> bool {
    let result = match command {
        Command::Open(path) => {
            open(viewer, path).await;
            Ok(())
        }
        Command::Close => {
            viewer.close().await;
            Ok(())
        }
        Command::Add(signals) => viewer.add_signals(signals).await,
        Command::Values(signals) => match viewer.get_signal_values(signals).await {
            Ok(values) => {
                println!("{}", format_values(&values));
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Refresh => viewer.refresh().await,
        Command::Follow(enabled) => viewer.set_follow_enabled(enabled).await,
        Command::Status => {
            println!(
                "state: {}  follow: {}",
                viewer.state().label(),
                if viewer.follow_enabled() { "on" } else { "off" }
            );
            Ok(())
        }
        Command::Help => {
            println!("{}", console::HELP);
            Ok(())
        }
        Command::Quit => return false,
    };
    if let Err(e) = result {
        println!("error: {e}");
    }
    true
}

fn prompt() {
    print!("wavelink> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = WavelinkConfig::load().unwrap_or_else(|e| {
        eprintln!("warning: {e}; using defaults");
        WavelinkConfig::default()
    });
    let signals = config.annotation_signals().to_vec();
    let config_path = WavelinkConfig::path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "the config file".to_string());
    let viewer = ViewerController::new(config.viewer)
        .with_context(|| format!("set [viewer] path in {config_path}"))?;

    register_select_printer(&viewer);
    spawn_annotation_printer(viewer.clone(), signals);
    spawn_state_printer(&viewer);

    if let Some(wavefile) = env::args_os().nth(1) {
        open(&viewer, PathBuf::from(wavefile)).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading console input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match console::parse(&line) {
            Ok(Some(command)) => {
                // A viewer stuck in startup must not take the console with it.
                let keep_going = tokio::select! {
                    keep_going = execute(&viewer, command) => keep_going,
                    _ = tokio::signal::ctrl_c() => false,
                };
                if !keep_going {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{e}"),
        }
    }

    viewer.close().await;
    Ok(())
}
