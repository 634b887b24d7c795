//! Console command parsing.

use std::path::PathBuf;

use anyhow::{Result, bail};

pub const HELP: &str = "\
commands:
  open <wavefile>        launch the viewer on a waveform file
  close                  close the viewer
  add <signal>...        add signals to the viewer
  values <signal>...     print signal values at the time cursor
  refresh                reload the waveform file
  follow on|off          forward the viewer's selection
  status                 show viewer state
  help                   show this text
  quit                   close the viewer and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(PathBuf),
    Close,
    Add(Vec<String>),
    Values(Vec<String>),
    Refresh,
    Follow(bool),
    Status,
    Help,
    Quit,
}

/// Parse one console line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let args: Vec<String> = words.map(String::from).collect();

    let command = match name {
        "open" => match args.as_slice() {
            [path] => Command::Open(PathBuf::from(path)),
            _ => bail!("usage: open <wavefile>"),
        },
        "close" => Command::Close,
        "add" | "values" if args.is_empty() => bail!("usage: {name} <signal>..."),
        "add" => Command::Add(args),
        "values" => Command::Values(args),
        "refresh" | "reload" => Command::Refresh,
        "follow" => match args.first().map(String::as_str) {
            Some("on") => Command::Follow(true),
            Some("off") => Command::Follow(false),
            _ => bail!("usage: follow on|off"),
        },
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command `{other}` (try `help`)"),
    };
    Ok(Some(command))
}
