//! GTKWave command dialect.
//!
//! Everything that knows what the viewer's Tcl commands look like lives here;
//! the channel below only ever sees opaque lines.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use tempfile::TempPath;

use crate::types::SignalQuery;

/// Tcl procedures sourced during the startup handshake.
const SETUP_SCRIPT_TEMPLATE: &str = include_str!("../resources/gtkwave_setup.tcl");

const SENTINEL_PLACEHOLDER: &str = "@SENTINEL@";

/// Launch option that makes GTKWave read Tcl commands from stdin.
const STDIN_TCL_OPTION: &str = "-W";

/// Inherited variables that keep GTKWave from starting when the parent runs
/// under a different GTK installation.
pub(crate) const SCRUBBED_ENV: [&str; 4] = [
    "GTK_PATH",
    "GTK_EXE_PREFIX",
    "GDK_PIXBUF_MODULE_FILE",
    "GIO_MODULE_DIR",
];

/// GTKWave can report which traces are highlighted.
pub(crate) const CAN_FOLLOW_SELECTION: bool = true;

/// Event emitted when the user highlights traces inside the viewer.
pub const SELECT_EVENT: &str = "select";

pub(crate) const TELL_TIME_UPDATED: &str = "tell_time_updated";
pub(crate) const TELL_SELECTED: &str = "tell_selected";
pub(crate) const RELOAD: &str = "gtkwave::reLoadFile";
/// The leading empty line terminates any partially written command.
pub(crate) const EXIT: &str = "\nexit";

pub(crate) fn launch_args(options: &[String], wavefile: &Path) -> Vec<String> {
    let mut args = options.to_vec();
    if !args.iter().any(|a| a == STDIN_TCL_OPTION) {
        args.push(STDIN_TCL_OPTION.to_string());
    }
    args.push(wavefile.display().to_string());
    args
}

pub(crate) fn handshake_command(script: &Path) -> String {
    format!("source {{{}}}", script.display())
}

/// Lines that append `query` to the viewer's displayed traces.
pub(crate) fn add_signals_commands(query: &SignalQuery) -> Vec<String> {
    let mut commands = Vec::with_capacity(query.paths().len() + 2);
    commands.push("set signal_to_add [list]".to_string());
    for path in query.paths() {
        commands.push(format!("lappend signal_to_add {{{path}}}"));
    }
    commands.push("gtkwave::addSignalsFromList $signal_to_add".to_string());
    commands
}

/// Prelude line and exchange line for fetching the values of `query`.
pub(crate) fn signal_values_commands(query: &SignalQuery) -> (String, String) {
    let prelude = format!("set signals_to_get {{ {} }}", query.paths().join(" "));
    (prelude, "get_signals_values $signals_to_get".to_string())
}

/// Render the bundled setup script for `sentinel`.
pub(crate) fn setup_script(sentinel: char) -> String {
    SETUP_SCRIPT_TEMPLATE.replace(SENTINEL_PLACEHOLDER, &tcl_char_escape(sentinel))
}

/// Write the bundled setup script to a fresh temp file the viewer can
/// `source`. The file is removed when the returned path is dropped.
pub(crate) fn materialize_setup_script(sentinel: char) -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("wavelink-gtkwave-setup-")
        .suffix(".tcl")
        .tempfile()?;
    file.write_all(setup_script(sentinel).as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

fn tcl_char_escape(c: char) -> String {
    let code = u32::from(c);
    let mut out = String::new();
    if code <= 0xFFFF {
        let _ = write!(out, "\\u{code:04X}");
    } else {
        let _ = write!(out, "\\U{code:08X}");
    }
    out
}
