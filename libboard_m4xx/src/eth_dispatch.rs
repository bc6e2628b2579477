//! Per-interface CHDR dispatch table.
//!
//! Each Ethernet interface carries a forwarding table in the FPGA that maps
//! CHDR destination addresses to `(MAC, IPv4, UDP port)` tuples, plus the
//! interface's own addresses and the bridge-mode register set.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info};

use crate::net::{self, MacAddr};
use crate::regs::RegisterInterface;
use crate::{Error, Result};

const REG_OWN_IP: u32 = 0x0000;
const REG_OWN_PORT: u32 = 0x0004;
const REG_BRIDGE_MAC_LO: u32 = 0x0010;
const REG_BRIDGE_MAC_HI: u32 = 0x0014;
const REG_BRIDGE_IP: u32 = 0x0018;
const REG_BRIDGE_PORT: u32 = 0x001c;
const REG_BRIDGE_ENABLE: u32 = 0x0020;
const REG_FWD_POLICY: u32 = 0x0024;

const FWD_POLICY_UNKNOWN_ETH: u32 = 1 << 0;
const FWD_POLICY_BROADCAST: u32 = 1 << 1;

// Destination-endpoint tables, indexed by CHDR endpoint.
const SID_IP_BASE: u32 = 0x1000;
const SID_MAC_LO_BASE: u32 = 0x1400;
const SID_PORT_MAC_HI_BASE: u32 = 0x1800;
const SID_TABLE_SIZE: u16 = 512;

// Local-address tables, indexed by the SID destination address.
const LOCAL_IP_BASE: u32 = 0x1d00;
const LOCAL_MAC_LO_BASE: u32 = 0x1e00;
const LOCAL_PORT_MAC_HI_BASE: u32 = 0x1f00;
const LOCAL_TABLE_SIZE: u16 = 64;

/// Legacy CHDR addressing tuple used to index the dispatch tables.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sid {
    pub dst_addr: u16,
    pub dst_ep: u16,
}

pub struct EthDispatch {
    regs: Arc<dyn RegisterInterface>,
    base: u32,
    iface: String,
}

impl EthDispatch {
    pub fn new(regs: Arc<dyn RegisterInterface>, base: u32, iface: &str) -> EthDispatch {
        EthDispatch {
            regs,
            base,
            iface: iface.to_string(),
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn set_ipv4_addr(&self, addr: Ipv4Addr, bridge_en: bool) -> Result<()> {
        let reg = if bridge_en { REG_BRIDGE_IP } else { REG_OWN_IP };
        debug!("{}: own IP {} (bridge={})", self.iface, addr, bridge_en);
        self.regs.poke32(self.base + reg, u32::from(addr))
    }

    pub fn set_vita_port(&self, port: u16, idx: u32, bridge_en: bool) -> Result<()> {
        if idx != 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid CHDR port index {}",
                idx
            )));
        }
        let reg = if bridge_en {
            REG_BRIDGE_PORT
        } else {
            REG_OWN_PORT
        };
        self.regs.poke32(self.base + reg, port as u32)
    }

    pub fn set_bridge_mac_addr(&self, mac: MacAddr) -> Result<()> {
        self.regs.poke32(self.base + REG_BRIDGE_MAC_LO, mac.lo())?;
        self.regs.poke32(self.base + REG_BRIDGE_MAC_HI, mac.hi())
    }

    pub fn set_bridge_mode(&self, enable: bool) -> Result<()> {
        info!("{}: bridge mode {}", self.iface, if enable { "on" } else { "off" });
        self.regs
            .poke32(self.base + REG_BRIDGE_ENABLE, enable as u32)
    }

    pub fn set_forward_policy(&self, fwd_unknown_eth: bool, fwd_broadcast: bool) -> Result<()> {
        let mut policy = 0;
        if fwd_unknown_eth {
            policy |= FWD_POLICY_UNKNOWN_ETH;
        }
        if fwd_broadcast {
            policy |= FWD_POLICY_BROADCAST;
        }
        self.regs.poke32(self.base + REG_FWD_POLICY, policy)
    }

    fn route_slot(&self, sid: Sid) -> Result<(u32, u32, u32)> {
        if sid.dst_addr <= 1 {
            if sid.dst_ep >= SID_TABLE_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "CHDR endpoint {} out of range",
                    sid.dst_ep
                )));
            }
            let idx = 4 * sid.dst_ep as u32;
            Ok((
                self.base + SID_IP_BASE + idx,
                self.base + SID_MAC_LO_BASE + idx,
                self.base + SID_PORT_MAC_HI_BASE + idx,
            ))
        } else {
            if sid.dst_addr >= LOCAL_TABLE_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "SID destination address {} out of range",
                    sid.dst_addr
                )));
            }
            let idx = 4 * sid.dst_addr as u32;
            Ok((
                self.base + LOCAL_IP_BASE + idx,
                self.base + LOCAL_MAC_LO_BASE + idx,
                self.base + LOCAL_PORT_MAC_HI_BASE + idx,
            ))
        }
    }

    /// Installs a forwarding entry.
    ///
    /// With no MAC given the kernel ARP table is consulted; a miss fails the
    /// call. The three table words are written IP first and the combined
    /// port/MAC-high word last, so a half-written slot is never valid.
    pub fn set_route(
        &self,
        sid: Sid,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        dst_mac: Option<MacAddr>,
    ) -> Result<()> {
        let mac = match dst_mac {
            Some(mac) => mac,
            None => net::arp_lookup(dst_ip)?
                .ok_or_else(|| Error::PeerNotReady(format!("no ARP entry for {}", dst_ip)))?,
        };
        let (ip_reg, mac_lo_reg, port_mac_hi_reg) = self.route_slot(sid)?;
        info!(
            "{}: route {:?} -> {}:{} ({})",
            self.iface, sid, dst_ip, dst_port, mac
        );
        self.regs.poke32(ip_reg, u32::from(dst_ip))?;
        self.regs.poke32(mac_lo_reg, mac.lo())?;
        self.regs
            .poke32(port_mac_hi_reg, ((dst_port as u32) << 16) | mac.hi())
    }

    /// Reads back an installed entry, mostly for verification.
    pub fn get_route(&self, sid: Sid) -> Result<(Ipv4Addr, u16, MacAddr)> {
        let (ip_reg, mac_lo_reg, port_mac_hi_reg) = self.route_slot(sid)?;
        let ip = Ipv4Addr::from(self.regs.peek32(ip_reg)?);
        let mac_lo = self.regs.peek32(mac_lo_reg)?;
        let port_mac_hi = self.regs.peek32(port_mac_hi_reg)?;
        let mac = MacAddr([
            (port_mac_hi >> 8) as u8,
            port_mac_hi as u8,
            (mac_lo >> 24) as u8,
            (mac_lo >> 16) as u8,
            (mac_lo >> 8) as u8,
            mac_lo as u8,
        ]);
        Ok((ip, (port_mac_hi >> 16) as u16, mac))
    }
}
