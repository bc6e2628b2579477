//! Linux network-interface introspection: addresses, link parameters and
//! the kernel ARP table.

use std::ffi::CStr;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::ptr;
use std::str::FromStr;

use log::warn;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Low 32 bits of the address, as written to the dispatch tables.
    pub fn lo(&self) -> u32 {
        ((self.0[2] as u32) << 24)
            | ((self.0[3] as u32) << 16)
            | ((self.0[4] as u32) << 8)
            | self.0[5] as u32
    }

    /// High 16 bits of the address.
    pub fn hi(&self) -> u32 {
        ((self.0[0] as u32) << 8) | self.0[1] as u32
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<MacAddr> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                count += 1;
                break;
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidArgument(format!("bad MAC address `{}`", s)))?;
            count += 1;
        }
        if count != 6 {
            return Err(Error::InvalidArgument(format!("bad MAC address `{}`", s)));
        }
        Ok(MacAddr(octets))
    }
}

/// Link parameters of one Ethernet interface.
#[derive(Clone, Debug)]
pub struct IfaceInfo {
    pub name: String,
    pub mac: MacAddr,
    pub ipv4: Option<Ipv4Addr>,
    pub mtu: u32,
    pub link_rate_bps: u64,
}

fn sysfs_read(iface: &str, entry: &str) -> Result<String> {
    let path = format!("/sys/class/net/{}/{}", iface, entry);
    if !Path::new(&path).exists() {
        return Err(Error::DeviceNotFound(format!("interface {}", iface)));
    }
    Ok(fs::read_to_string(&path)?.trim().to_string())
}

/// IPv4 address of `iface`, if one is assigned.
pub fn ipv4_addr(iface: &str) -> Result<Option<Ipv4Addr>> {
    let mut addrs: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return Err(Error::Io("getifaddrs failed".into()));
    }
    let mut found = None;
    let mut cursor = addrs;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if entry.ifa_addr.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }.to_string_lossy();
        if name != iface {
            continue;
        }
        let sa_family = unsafe { (*entry.ifa_addr).sa_family };
        if sa_family == libc::AF_INET as libc::sa_family_t {
            let sin = entry.ifa_addr as *const libc::sockaddr_in;
            let raw = unsafe { (*sin).sin_addr.s_addr };
            found = Some(Ipv4Addr::from(u32::from_be(raw)));
            break;
        }
    }
    unsafe { libc::freeifaddrs(addrs) };
    Ok(found)
}

/// Gathers MAC, IPv4, MTU and link rate for `iface`.
pub fn iface_info(iface: &str) -> Result<IfaceInfo> {
    let mac = sysfs_read(iface, "address")?.parse()?;
    let mtu = sysfs_read(iface, "mtu")?
        .parse()
        .map_err(|_| Error::Io(format!("{}: unparseable MTU", iface)))?;
    // `speed` reads as -1 while the link is down.
    let link_rate_bps = match sysfs_read(iface, "speed") {
        Ok(speed) => match speed.parse::<i64>() {
            Ok(mbps) if mbps > 0 => mbps as u64 * 1_000_000,
            _ => {
                warn!("{}: link speed unavailable, assuming 10 Gb/s", iface);
                10_000_000_000
            }
        },
        Err(_) => 10_000_000_000,
    };
    Ok(IfaceInfo {
        name: iface.to_string(),
        mac,
        ipv4: ipv4_addr(iface)?,
        mtu,
        link_rate_bps,
    })
}

fn parse_arp_table(table: &str, ip: Ipv4Addr) -> Option<MacAddr> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (entry_ip, flags, hw_addr) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(entry_ip), Some(_hw_type), Some(flags), Some(hw_addr)) => {
                    (entry_ip, flags, hw_addr)
                }
                _ => continue,
            };
        if entry_ip != ip.to_string() {
            continue;
        }
        // Flag 0x2 marks a complete entry.
        if u32::from_str_radix(flags.trim_start_matches("0x"), 16)
            .map(|f| f & 0x2 != 0)
            .unwrap_or(false)
        {
            return hw_addr.parse().ok();
        }
    }
    None
}

/// Looks `ip` up in the kernel ARP table.
pub fn arp_lookup(ip: Ipv4Addr) -> Result<Option<MacAddr>> {
    let table = fs::read_to_string("/proc/net/arp")?;
    Ok(parse_arp_table(&table, ip))
}
