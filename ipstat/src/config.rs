use std::{net::SocketAddr, num::NonZeroUsize, time::Duration};

use clap::ValueEnum;

pub(crate) const DEFAULT_INTERVAL_SECS: u64 = 5;
pub(crate) const DEFAULT_REFRESH_SECS: u64 = 5;
pub(crate) const DEFAULT_LIMIT: usize = 30;
pub(crate) const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ConfigError {
    #[error("interface name must not be empty")]
    EmptyInterface,
    #[error("row limit must be greater than zero")]
    ZeroLimit,
    #[error("polling interval must be at least one second")]
    ZeroInterval,
    #[error("page refresh delay must be at least one second")]
    ZeroRefresh,
}

/// Kernel hook the counting program is bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum HookKind {
    /// Traffic-control classifier on the clsact ingress hook
    Tc,
    /// XDP on the receive path
    Xdp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Mode {
    Console {
        interval: Duration,
    },
    Web {
        limit: NonZeroUsize,
        listen: SocketAddr,
        refresh: Duration,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Config {
    pub(crate) iface: String,
    pub(crate) hook: HookKind,
    pub(crate) xdp_mode: XdpMode,
    pub(crate) mode: Mode,
}

impl Config {
    pub(crate) fn console(
        iface: String,
        hook: HookKind,
        xdp_mode: XdpMode,
        interval_secs: u64,
    ) -> Result<Self, ConfigError> {
        if interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Self::new(
            iface,
            hook,
            xdp_mode,
            Mode::Console {
                interval: Duration::from_secs(interval_secs),
            },
        )
    }

    pub(crate) fn web(
        iface: String,
        hook: HookKind,
        xdp_mode: XdpMode,
        limit: usize,
        listen: SocketAddr,
        refresh_secs: u64,
    ) -> Result<Self, ConfigError> {
        let limit = NonZeroUsize::new(limit).ok_or(ConfigError::ZeroLimit)?;
        if refresh_secs == 0 {
            return Err(ConfigError::ZeroRefresh);
        }
        Self::new(
            iface,
            hook,
            xdp_mode,
            Mode::Web {
                limit,
                listen,
                refresh: Duration::from_secs(refresh_secs),
            },
        )
    }

    fn new(
        iface: String,
        hook: HookKind,
        xdp_mode: XdpMode,
        mode: Mode,
    ) -> Result<Self, ConfigError> {
        let iface = iface.trim().to_string();
        if iface.is_empty() {
            return Err(ConfigError::EmptyInterface);
        }
        Ok(Self {
            iface,
            hook,
            xdp_mode,
            mode,
        })
    }
}
