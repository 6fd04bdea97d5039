#![no_std] //
#![no_main] //

use core::{
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use aya_ebpf::{
    bindings::{xdp_action, TC_ACT_OK},
    macros::{classifier, map, xdp},
    maps::HashMap,
    programs::{TcContext, XdpContext},
    EbpfContext,
};
use aya_log_ebpf::error;
use ipstat_common::IP_STATS_MAX_ENTRIES;
use network_types::{eth::EthHdr, ip::Ipv4Hdr};

const ETH_P_IP: u16 = 0x0800;
const ETHER_TYPE_OFFSET: usize = 12;
const IPV4_SRC_ADDR_OFFSET: usize = 12;
const BPF_NOEXIST: u64 = 1;

#[map]
static IP_STATS: HashMap<u32, u64> = HashMap::with_max_entries(IP_STATS_MAX_ENTRIES, 0);

#[classifier]
pub fn ipstat_tc(ctx: TcContext) -> i32 {
    let len = ctx.len() as u64;
    // Counting never changes the verdict.
    let _ = unsafe { try_count(&ctx, ctx.data(), ctx.data_end(), len) };
    TC_ACT_OK
}

#[xdp]
pub fn ipstat_xdp(ctx: XdpContext) -> u32 {
    let len = (ctx.data_end() - ctx.data()) as u64;
    let _ = unsafe { try_count(&ctx, ctx.data(), ctx.data_end(), len) };
    xdp_action::XDP_PASS
}

unsafe fn try_count<C: EbpfContext>(
    ctx: &C,
    start: usize,
    end: usize,
    len: u64,
) -> Result<(), ()> {
    ptr_at::<EthHdr>(start, end, 0)?;
    let ether_type: *const u16 = ptr_at(start, end, ETHER_TYPE_OFFSET)?;
    if u16::from_be(core::ptr::read_unaligned(ether_type)) != ETH_P_IP {
        return Ok(());
    }

    let ip_offset = mem::size_of::<EthHdr>();
    ptr_at::<Ipv4Hdr>(start, end, ip_offset)?;
    let src_addr: *const u32 = ptr_at(start, end, ip_offset + IPV4_SRC_ADDR_OFFSET)?;

    // The raw header bytes become the key, see `ipstat_common::decode_key`.
    let key = core::ptr::read_unaligned(src_addr);
    record(ctx, &key, len)
}

#[inline(always)]
unsafe fn record<C: EbpfContext>(ctx: &C, key: &u32, len: u64) -> Result<(), ()> {
    if let Some(bytes) = IP_STATS.get_ptr_mut(key) {
        AtomicU64::from_ptr(bytes).fetch_add(len, Ordering::Relaxed);
        return Ok(());
    }

    if IP_STATS.insert(key, &len, BPF_NOEXIST).is_ok() {
        return Ok(());
    }

    // Another CPU may have created the entry between the lookup and the insert.
    if let Some(bytes) = IP_STATS.get_ptr_mut(key) {
        AtomicU64::from_ptr(bytes).fetch_add(len, Ordering::Relaxed);
        return Ok(());
    }

    error!(ctx, "Failed to insert new source address byte counter value");
    Err(())
}

#[inline(always)]
unsafe fn ptr_at<T>(start: usize, end: usize, offset: usize) -> Result<*const T, ()> {
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return Err(());
    }

    Ok((start + offset) as *const T)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
