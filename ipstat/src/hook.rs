// Binding of the counting program to the ingress hook of one interface.
//
// TC: the clsact qdisc is the shared attachment point. It is created when missing and reused
// otherwise, and it is never removed. Our classifier always lives at a fixed priority/handle, so a
// filter left behind by a previous run that was killed is removed before attaching (replace
// semantics). Detaching removes only that filter.
//
// XDP: the program is attached through a bpf link owned by this process.

use std::{error::Error, io, iter};

use aya::{
    programs::{
        links::Link,
        tc::{self, NlOptions, SchedClassifierLink, SchedClassifierLinkId, TcAttachOptions},
        xdp::XdpLinkId,
        Program, ProgramError, SchedClassifier, TcAttachType, Xdp, XdpFlags,
    },
    Ebpf,
};
use aya_log::EbpfLogger;
use ipstat_common::{IP_STATS_MAP, TC_PROGRAM, XDP_PROGRAM};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, HookKind, XdpMode},
    table::IpStatsTable,
};

const EBPF_OBJECT: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/ipstat"));

pub(crate) const TC_PRIORITY: u16 = 1;
pub(crate) const TC_HANDLE: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub(crate) enum HookError {
    #[error("network interface {0:?} not found")]
    InterfaceNotFound(String),
    #[error("{context}: permission denied ({detail}); run as root or with CAP_BPF and CAP_NET_ADMIN")]
    PermissionDenied { context: String, detail: String },
    #[error("{context}: {detail}")]
    HookSetupFailed { context: String, detail: String },
}

/// Owner of a live kernel binding.
pub(crate) trait Hook {
    /// Removes the binding. Detaching something that is already gone succeeds.
    fn detach(&mut self) -> Result<(), HookError>;
}

/// Kernel operations needed to converge on a single ingress classifier.
pub(crate) trait TcFilters {
    type LinkId;

    fn add_clsact(&mut self, iface: &str) -> io::Result<()>;

    fn detach_filter_at(
        &mut self,
        iface: &str,
        priority: u16,
        handle: u32,
    ) -> Result<(), ProgramError>;

    fn attach_filter(
        &mut self,
        iface: &str,
        priority: u16,
        handle: u32,
    ) -> Result<Self::LinkId, ProgramError>;

    fn detach_filter(&mut self, link: Self::LinkId) -> Result<(), ProgramError>;
}

/// Ensures the clsact qdisc exists and our filter is the only one at its priority/handle.
pub(crate) fn install_filter<F: TcFilters>(
    filters: &mut F,
    iface: &str,
) -> Result<F::LinkId, HookError> {
    match filters.add_clsact(iface) {
        Ok(()) => info!("Added clsact qdisc on {iface}"),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            debug!("Reusing existing clsact qdisc on {iface}")
        }
        Err(err) => {
            return Err(setup_error(
                format!("failed to add clsact qdisc on {iface}"),
                &err,
            ))
        }
    }

    match filters.detach_filter_at(iface, TC_PRIORITY, TC_HANDLE) {
        Ok(()) => info!("Replaced leftover ingress filter on {iface}"),
        Err(err) if is_gone(&err) => {}
        Err(err) => {
            return Err(setup_error(
                format!("failed to remove leftover ingress filter on {iface}"),
                &err,
            ))
        }
    }

    filters
        .attach_filter(iface, TC_PRIORITY, TC_HANDLE)
        .map_err(|err| setup_error(format!("failed to attach tc program on {iface}"), &err))
}

pub(crate) fn release_filter<F: TcFilters>(
    filters: &mut F,
    iface: &str,
    link: F::LinkId,
) -> Result<(), HookError> {
    match filters.detach_filter(link) {
        Ok(()) => Ok(()),
        Err(err) if is_gone(&err) => {
            debug!("Ingress filter on {iface} was already removed");
            Ok(())
        }
        Err(err) => Err(setup_error(
            format!("failed to detach tc program from {iface}"),
            &err,
        )),
    }
}

struct AyaTc<'p> {
    program: &'p mut SchedClassifier,
}

impl TcFilters for AyaTc<'_> {
    type LinkId = SchedClassifierLinkId;

    fn add_clsact(&mut self, iface: &str) -> io::Result<()> {
        tc::qdisc_add_clsact(iface)
    }

    fn detach_filter_at(
        &mut self,
        iface: &str,
        priority: u16,
        handle: u32,
    ) -> Result<(), ProgramError> {
        SchedClassifierLink::attached(iface, TcAttachType::Ingress, priority, handle)?.detach()
    }

    fn attach_filter(
        &mut self,
        iface: &str,
        priority: u16,
        handle: u32,
    ) -> Result<SchedClassifierLinkId, ProgramError> {
        self.program.attach_with_options(
            iface,
            TcAttachType::Ingress,
            TcAttachOptions::Netlink(NlOptions { priority, handle }),
        )
    }

    fn detach_filter(&mut self, link: SchedClassifierLinkId) -> Result<(), ProgramError> {
        self.program.detach(link)
    }
}

enum LinkHandle {
    Tc(SchedClassifierLinkId),
    Xdp(XdpLinkId),
}

/// The loaded program and its binding. Dropping it detaches if [`Hook::detach`] was not called.
pub(crate) struct Attachment {
    iface: String,
    bpf: Ebpf,
    link: Option<LinkHandle>,
}

/// Loads the counting program, binds it to `config.iface` and hands back the counter table.
///
/// Nothing is left in the kernel when this fails: the loaded object is dropped, and a stale
/// filter removed on the way is not restored.
pub(crate) fn attach(config: &Config) -> Result<(Attachment, IpStatsTable), HookError> {
    let index = resolve_interface(&config.iface)?;
    debug!("Resolved interface {} to index {index}", config.iface);

    raise_memlock_rlimit();

    if EBPF_OBJECT.is_empty() {
        return Err(HookError::HookSetupFailed {
            context: "embedded eBPF object is empty".into(),
            detail: "rebuild with bpf-linker installed".into(),
        });
    }
    let mut bpf =
        Ebpf::load(EBPF_OBJECT).map_err(|err| setup_error("failed to load eBPF object", &err))?;

    if let Err(err) = EbpfLogger::init(&mut bpf) {
        warn!("Failed to initialize eBPF logger: {err}");
    }

    let map = bpf
        .take_map(IP_STATS_MAP)
        .ok_or_else(|| HookError::HookSetupFailed {
            context: format!("map {IP_STATS_MAP} not found"),
            detail: "eBPF object does not define it".into(),
        })?;
    let table = IpStatsTable::from_map(map)
        .map_err(|err| setup_error(format!("map {IP_STATS_MAP} has unexpected type"), &err))?;

    let link = match config.hook {
        HookKind::Tc => {
            let program: &mut SchedClassifier = program_mut(&mut bpf, TC_PROGRAM)?;
            program
                .load()
                .map_err(|err| setup_error("failed to load tc program", &err))?;
            LinkHandle::Tc(install_filter(&mut AyaTc { program }, &config.iface)?)
        }
        HookKind::Xdp => {
            let program: &mut Xdp = program_mut(&mut bpf, XDP_PROGRAM)?;
            program
                .load()
                .map_err(|err| setup_error("failed to load xdp program", &err))?;
            let link = program
                .attach(&config.iface, xdp_flags(config.xdp_mode))
                .map_err(|err| {
                    setup_error(
                        format!(
                            "failed to attach xdp program on {} in {:?} mode",
                            config.iface, config.xdp_mode
                        ),
                        &err,
                    )
                })?;
            LinkHandle::Xdp(link)
        }
    };

    info!(
        "Attached {:?} program to {} ingress",
        config.hook, config.iface
    );

    Ok((
        Attachment {
            iface: config.iface.clone(),
            bpf,
            link: Some(link),
        },
        table,
    ))
}

impl Hook for Attachment {
    fn detach(&mut self) -> Result<(), HookError> {
        let Some(link) = self.link.take() else {
            debug!("Program already detached from {}", self.iface);
            return Ok(());
        };

        match link {
            LinkHandle::Tc(id) => {
                let program: &mut SchedClassifier = program_mut(&mut self.bpf, TC_PROGRAM)?;
                release_filter(&mut AyaTc { program }, &self.iface, id)?;
            }
            LinkHandle::Xdp(id) => {
                let program: &mut Xdp = program_mut(&mut self.bpf, XDP_PROGRAM)?;
                match program.detach(id) {
                    Ok(()) => {}
                    Err(err) if is_gone(&err) => {
                        debug!("XDP program on {} was already removed", self.iface)
                    }
                    Err(err) => {
                        return Err(setup_error(
                            format!("failed to detach xdp program from {}", self.iface),
                            &err,
                        ))
                    }
                }
            }
        }

        info!("Detached program from {}", self.iface);
        Ok(())
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.link.is_some() {
            warn!("Attachment on {} dropped while attached", self.iface);
            if let Err(err) = self.detach() {
                error!("Failed to detach program from {}: {err}", self.iface);
            }
        }
    }
}

fn program_mut<'a, P>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut P, HookError>
where
    &'a mut P: TryFrom<&'a mut Program, Error = ProgramError>,
{
    let program = bpf
        .program_mut(name)
        .ok_or_else(|| HookError::HookSetupFailed {
            context: format!("program {name} not found"),
            detail: "eBPF object does not define it".into(),
        })?;
    program
        .try_into()
        .map_err(|err| setup_error(format!("program {name} has wrong type"), &err))
}

pub(crate) fn resolve_interface(name: &str) -> Result<u32, HookError> {
    let interfaces = NetworkInterface::show()
        .map_err(|err| setup_error("failed to list network interfaces", &err))?;
    interfaces
        .into_iter()
        .find(|interface| interface.name == name)
        .map(|interface| interface.index)
        .ok_or_else(|| HookError::InterfaceNotFound(name.to_string()))
}

/// Kernels before 5.11 charge map memory against RLIMIT_MEMLOCK.
fn raise_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("Remove limit on locked memory failed, ret is: {ret}");
    }
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

fn setup_error(context: impl Into<String>, err: &(dyn Error + 'static)) -> HookError {
    let context = context.into();
    let detail = describe(err);
    if io_errors(err).any(|io_error| io_error.kind() == io::ErrorKind::PermissionDenied) {
        HookError::PermissionDenied { context, detail }
    } else {
        HookError::HookSetupFailed { context, detail }
    }
}

fn is_gone(err: &ProgramError) -> bool {
    matches!(err, ProgramError::NotAttached)
        || io_errors(err).any(|io_error| io_error.kind() == io::ErrorKind::NotFound)
}

fn io_errors<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a io::Error> {
    iter::successors(Some(err), |&err| err.source()).filter_map(|err| {
        err.downcast_ref::<io::Error>()
            .or_else(|| match err.downcast_ref::<ProgramError>() {
                Some(ProgramError::IOError(io_error)) => Some(io_error),
                Some(ProgramError::SyscallError(err)) => Some(&err.io_error),
                _ => None,
            })
    })
}

fn describe(err: &(dyn Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    for err in iter::successors(Some(err), |&err| err.source()) {
        let text = err.to_string();
        if !parts.last().is_some_and(|last| last.contains(&text)) {
            parts.push(text);
        }
    }
    parts.join(": ")
}
