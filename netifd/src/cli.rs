//! Command-line surface: `serve` (the default) runs the daemon loop;
//! `status`, `up`, `down`, and `reload` are one-shot scripting commands
//! that would, against a real transport, dial the running daemon's
//! socket instead of starting a fresh one.

use std::path::PathBuf;

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};

fn get_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
        .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
        .literal(AnsiColor::Green.on_default().effects(Effects::BOLD))
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
        .valid(AnsiColor::Green.on_default().effects(Effects::BOLD))
        .invalid(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
}

/// netifd - network interface daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(styles = get_styles())]
pub struct Cli {
    /// Overrides the management socket path (the real transport is out
    /// of scope; this is threaded through to the management facade for
    /// callers that want to observe it).
    #[arg(short = 's', long = "socket", default_value = "/var/run/netifd.sock")]
    pub socket: PathBuf,

    /// Path to the UCI-flavoured network configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/config/network")]
    pub config: PathBuf,

    /// Directory holding `resolv.conf` and the daemon's log files.
    #[arg(short = 'r', long = "resolv-conf", default_value = "/tmp/resolv.conf.d/resolv.conf")]
    pub resolv_conf: PathBuf,

    /// Directory containing `<proto>.sh` protocol scripts for the
    /// `shell` handler.
    #[arg(long = "script-dir", default_value = "/lib/netifd/proto")]
    pub script_dir: PathBuf,

    /// The command to execute. Defaults to `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug, Default, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Runs the daemon's event loop (the default command).
    #[default]
    Serve,
    /// Dumps device/interface status once and exits.
    Status,
    /// Brings an interface up.
    Up {
        /// The interface's logical name.
        iface: String,
    },
    /// Brings an interface down.
    Down {
        /// The interface's logical name.
        iface: String,
    },
    /// Reloads configuration without restarting the process.
    Reload,
}
