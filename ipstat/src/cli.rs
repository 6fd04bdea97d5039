use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    Config, ConfigError, HookKind, XdpMode, DEFAULT_INTERVAL_SECS, DEFAULT_LIMIT, DEFAULT_LISTEN,
    DEFAULT_REFRESH_SECS,
};

#[derive(Parser, Debug)]
#[command(name = "ipstat")]
#[command(about = "Per-source IPv4 traffic counter backed by an eBPF ingress hook", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the counters to stdout at a fixed interval
    Console(ConsoleCommand),
    /// Serve the ranked counters as an auto-refreshing HTML page
    Web(WebCommand),
}

#[derive(Args, Debug)]
struct HookArgs {
    /// Network interface to attach to (e.g. eth0, wlan0)
    #[arg(long, short, value_name = "IFACE")]
    iface: String,
    /// Kernel hook the counting program is bound to
    #[arg(long, value_enum, default_value_t = HookKind::Tc)]
    hook: HookKind,
    /// XDP attach mode, only used with `--hook xdp`
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,
}

#[derive(Args, Debug)]
struct ConsoleCommand {
    #[command(flatten)]
    hook: HookArgs,
    /// Seconds between printed snapshots
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,
}

#[derive(Args, Debug)]
struct WebCommand {
    #[command(flatten)]
    hook: HookArgs,
    /// Maximum number of addresses shown on the page
    #[arg(long, short, value_name = "ROWS", default_value_t = DEFAULT_LIMIT)]
    limit: usize,
    /// Address the HTTP server listens on
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,
    /// Seconds before the page reloads itself
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_REFRESH_SECS)]
    refresh_secs: u64,
}

impl Cli {
    pub(crate) fn into_config(self) -> Result<Config, ConfigError> {
        match self.command {
            Commands::Console(cmd) => Config::console(
                cmd.hook.iface,
                cmd.hook.hook,
                cmd.hook.xdp_mode,
                cmd.interval_secs,
            ),
            Commands::Web(cmd) => Config::web(
                cmd.hook.iface,
                cmd.hook.hook,
                cmd.hook.xdp_mode,
                cmd.limit,
                cmd.listen,
                cmd.refresh_secs,
            ),
        }
    }
}
