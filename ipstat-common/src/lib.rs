#![cfg_attr(not(test), no_std)]

// Shared between the eBPF program and the userspace agent. Keep it `no_std`.

use core::net::Ipv4Addr;

/// Name of the per-source byte counter map.
pub const IP_STATS_MAP: &str = "IP_STATS";
pub const IP_STATS_MAX_ENTRIES: u32 = 10240;

pub const TC_PROGRAM: &str = "ipstat_tc";
pub const XDP_PROGRAM: &str = "ipstat_xdp";

/// Map keys are the four source address bytes exactly as they appear in the IPv4 header,
/// reinterpreted as a `u32` in host memory. Decoding therefore goes through the native
/// byte order, which yields network order octets on hosts of either endianness.
#[inline(always)]
pub fn decode_key(key: u32) -> Ipv4Addr {
    Ipv4Addr::from(key.to_ne_bytes())
}

#[inline(always)]
pub fn encode_key(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}
