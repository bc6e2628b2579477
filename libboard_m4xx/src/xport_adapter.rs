//! Transport-adapter control.
//!
//! An adapter sits between one Ethernet interface and the CHDR crossbar and
//! can rewrite or strip CHDR headers for remote-UDP streaming. It is only
//! present when the FPGA image carries the block; presence and capabilities
//! come from its info register.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;

use crate::net::MacAddr;
use crate::regs::RegisterInterface;
use crate::{wait_not_busy, Error, Result};

const REG_COMPAT: u32 = 0x0100;
const REG_INFO: u32 = 0x0104;
const REG_NODE_INST: u32 = 0x0108;
const REG_KV_MAC_LO: u32 = 0x010c;
const REG_KV_MAC_HI: u32 = 0x0110;
const REG_KV_IPV4: u32 = 0x0114;
const REG_KV_UDP_PORT: u32 = 0x0118;
const REG_KV_CFG: u32 = 0x011c;

const CFG_BUSY: u32 = 1 << 31;

const CAP_RX_ROUTING: u32 = 1 << 0;
const CAP_RX_HDR_REMOVAL: u32 = 1 << 1;

const COMPAT_MAJOR: u16 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_millis(500);
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a remote-routed stream leaves the adapter.
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive, ToPrimitive)]
pub enum StreamMode {
    /// Forward the CHDR packet as-is inside UDP.
    FullPacket = 0,
    /// Strip the CHDR header and forward the raw payload.
    RawPayload = 1,
}

pub struct XportAdapter {
    regs: Arc<dyn RegisterInterface>,
    base: u32,
    iface: String,
    inst_id: u32,
    caps: u32,
}

impl XportAdapter {
    /// Probes the adapter block behind `base`; `None` when the FPGA image
    /// does not include one on this interface.
    pub fn probe(
        regs: Arc<dyn RegisterInterface>,
        base: u32,
        iface: &str,
    ) -> Result<Option<XportAdapter>> {
        let info = regs.peek32(base + REG_INFO)?;
        if info == 0 {
            return Ok(None);
        }
        let compat = regs.peek32(base + REG_COMPAT)?;
        let (major, minor) = ((compat >> 16) as u16, compat as u16);
        if major != COMPAT_MAJOR {
            warn!(
                "{}: transport adapter compat {}.{} unusable (need major {})",
                iface, major, minor, COMPAT_MAJOR
            );
            return Ok(None);
        }
        let inst_id = regs.peek32(base + REG_NODE_INST)?;
        let adapter = XportAdapter {
            regs,
            base,
            iface: iface.to_string(),
            inst_id,
            caps: info & (CAP_RX_ROUTING | CAP_RX_HDR_REMOVAL),
        };
        info!(
            "{}: transport adapter {} (compat {}.{}, caps [{}])",
            iface,
            inst_id,
            major,
            minor,
            adapter.caps_str()
        );
        Ok(Some(adapter))
    }

    pub fn inst_id(&self) -> u32 {
        self.inst_id
    }

    pub fn has_rx_routing(&self) -> bool {
        self.caps & CAP_RX_ROUTING != 0
    }

    pub fn has_rx_hdr_removal(&self) -> bool {
        self.caps & CAP_RX_HDR_REMOVAL != 0
    }

    /// Capability set as a comma-separated list, as reported over RPC.
    pub fn caps_str(&self) -> String {
        let mut caps = Vec::new();
        if self.has_rx_routing() {
            caps.push("rx_routing");
        }
        if self.has_rx_hdr_removal() {
            caps.push("rx_hdr_removal");
        }
        caps.join(",")
    }

    /// Installs a remote endpoint route for `epid`.
    ///
    /// The key-value registers are written MAC first; the combined
    /// EPID/stream-mode word commits the entry.
    pub fn add_remote_ep_route(
        &self,
        epid: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        dst_mac: MacAddr,
        mode: StreamMode,
    ) -> Result<()> {
        if !self.has_rx_routing() {
            return Err(Error::InvalidArgument(format!(
                "{}: transport adapter cannot route received streams",
                self.iface
            )));
        }
        if mode == StreamMode::RawPayload && !self.has_rx_hdr_removal() {
            return Err(Error::InvalidArgument(format!(
                "{}: transport adapter cannot remove CHDR headers",
                self.iface
            )));
        }
        wait_not_busy(
            || Ok(self.regs.peek32(self.base + REG_KV_CFG)? & CFG_BUSY == 0),
            BUSY_TIMEOUT,
            BUSY_POLL_INTERVAL,
            "transport adapter route engine",
        )?;
        info!(
            "{}: remote EP route {} -> {}:{} ({}, {:?})",
            self.iface, epid, dst_ip, dst_port, dst_mac, mode
        );
        self.regs.poke32(self.base + REG_KV_MAC_LO, dst_mac.lo())?;
        self.regs.poke32(self.base + REG_KV_MAC_HI, dst_mac.hi())?;
        self.regs
            .poke32(self.base + REG_KV_IPV4, u32::from(dst_ip))?;
        self.regs
            .poke32(self.base + REG_KV_UDP_PORT, dst_port as u32)?;
        let mode_bits = mode.to_u32().unwrap_or(0);
        self.regs
            .poke32(self.base + REG_KV_CFG, epid as u32 | (mode_bits << 16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeRegs {
        words: Mutex<HashMap<u32, u32>>,
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl FakeRegs {
        fn new(init: &[(u32, u32)]) -> Arc<FakeRegs> {
            Arc::new(FakeRegs {
                words: Mutex::new(init.iter().cloned().collect()),
                writes: Mutex::new(Vec::new()),
            })
        }
    }

    impl RegisterInterface for FakeRegs {
        fn peek32(&self, addr: u32) -> Result<u32> {
            Ok(*self.words.lock().unwrap().get(&addr).unwrap_or(&0))
        }

        fn poke32(&self, addr: u32, value: u32) -> Result<()> {
            self.words.lock().unwrap().insert(addr, value);
            self.writes.lock().unwrap().push((addr, value));
            Ok(())
        }
    }

    fn adapter_regs(caps: u32) -> Arc<FakeRegs> {
        FakeRegs::new(&[
            (REG_INFO, caps),
            (REG_COMPAT, (COMPAT_MAJOR as u32) << 16),
            (REG_NODE_INST, 2),
        ])
    }

    #[test]
    fn absent_block_probes_as_none() {
        let regs = FakeRegs::new(&[]);
        assert!(XportAdapter::probe(regs, 0, "sfp0").unwrap().is_none());
    }

    #[test]
    fn incompatible_block_probes_as_none() {
        let regs = FakeRegs::new(&[(REG_INFO, CAP_RX_ROUTING), (REG_COMPAT, 2 << 16)]);
        assert!(XportAdapter::probe(regs, 0, "sfp0").unwrap().is_none());
    }

    #[test]
    fn full_packet_route_writes_expected_words_in_order() {
        let regs = adapter_regs(CAP_RX_ROUTING | CAP_RX_HDR_REMOVAL);
        let adapter = XportAdapter::probe(regs.clone(), 0, "sfp0")
            .unwrap()
            .unwrap();
        regs.writes.lock().unwrap().clear();
        adapter
            .add_remote_ep_route(
                7,
                Ipv4Addr::new(10, 0, 0, 2),
                49200,
                "02:00:00:00:00:99".parse().unwrap(),
                StreamMode::FullPacket,
            )
            .unwrap();
        let writes = regs.writes.lock().unwrap();
        assert_eq!(
            *writes,
            vec![
                (REG_KV_MAC_LO, 0x0000_0099),
                (REG_KV_MAC_HI, 0x0200),
                (REG_KV_IPV4, 0x0a00_0002),
                (REG_KV_UDP_PORT, 49200),
                (REG_KV_CFG, 7),
            ]
        );
    }

    #[test]
    fn raw_payload_without_capability_leaves_registers_untouched() {
        let regs = adapter_regs(CAP_RX_ROUTING);
        let adapter = XportAdapter::probe(regs.clone(), 0, "sfp0")
            .unwrap()
            .unwrap();
        regs.writes.lock().unwrap().clear();
        match adapter.add_remote_ep_route(
            7,
            Ipv4Addr::new(10, 0, 0, 2),
            49200,
            "02:00:00:00:00:99".parse().unwrap(),
            StreamMode::RawPayload,
        ) {
            Err(Error::InvalidArgument(_)) => (),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        assert!(regs.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn raw_payload_sets_mode_bits() {
        let regs = adapter_regs(CAP_RX_ROUTING | CAP_RX_HDR_REMOVAL);
        let adapter = XportAdapter::probe(regs.clone(), 0, "sfp0")
            .unwrap()
            .unwrap();
        adapter
            .add_remote_ep_route(
                3,
                Ipv4Addr::new(10, 0, 0, 2),
                49201,
                "02:00:00:00:00:99".parse().unwrap(),
                StreamMode::RawPayload,
            )
            .unwrap();
        assert_eq!(regs.peek32(REG_KV_CFG).unwrap(), 3 | (1 << 16));
    }

    #[test]
    fn stuck_busy_bit_times_out() {
        let regs = adapter_regs(CAP_RX_ROUTING);
        regs.poke32(REG_KV_CFG, CFG_BUSY).unwrap();
        regs.writes.lock().unwrap().clear();
        let adapter = XportAdapter::probe(regs.clone(), 0, "sfp0")
            .unwrap()
            .unwrap();
        match adapter.add_remote_ep_route(
            1,
            Ipv4Addr::new(10, 0, 0, 2),
            49200,
            "02:00:00:00:00:99".parse().unwrap(),
            StreamMode::FullPacket,
        ) {
            Err(Error::BusyTimeout(_)) => (),
            other => panic!("expected BusyTimeout, got {:?}", other),
        }
    }
}
