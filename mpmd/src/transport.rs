//! CHDR transport manager.
//!
//! Enumerates the data-plane links, reports their negotiation parameters to
//! the host and routes remote-endpoint requests to the transport adapter of
//! the right interface.

use std::net::Ipv4Addr;

use libboard_m4xx::eth_dispatch::EthDispatch;
use libboard_m4xx::net::{self, IfaceInfo, MacAddr};
use libboard_m4xx::xport_adapter::{StreamMode, XportAdapter};
use libboard_m4xx::{Error, Result};
use log::info;

/// UDP port on which the FPGA accepts CHDR traffic.
pub const CHDR_UDP_PORT: u16 = 49153;

pub struct ChdrLink {
    pub dispatch: EthDispatch,
    pub adapter: Option<XportAdapter>,
    pub info: IfaceInfo,
}

pub struct TransportManager {
    links: Vec<ChdrLink>,
}

fn parse_stream_mode(mode: &str) -> Result<StreamMode> {
    match mode {
        "full_packet" => Ok(StreamMode::FullPacket),
        "raw_payload" => Ok(StreamMode::RawPayload),
        _ => Err(Error::InvalidArgument(format!(
            "unknown stream mode `{}`",
            mode
        ))),
    }
}

impl TransportManager {
    pub fn new(links: Vec<ChdrLink>) -> TransportManager {
        for link in &links {
            info!(
                "CHDR link {}: {} ({} bit/s{})",
                link.info.name,
                link.info
                    .ipv4
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "no address".to_string()),
                link.info.link_rate_bps,
                match &link.adapter {
                    Some(adapter) => format!(", transport adapter {}", adapter.inst_id()),
                    None => String::new(),
                }
            );
        }
        TransportManager { links }
    }

    pub fn links(&self) -> &[ChdrLink] {
        &self.links
    }

    pub fn link_types(&self) -> Vec<String> {
        if self.links.is_empty() {
            Vec::new()
        } else {
            vec!["udp".to_string()]
        }
    }

    /// Per-link negotiation parameters for one link type.
    pub fn link_options(&self, link_type: &str) -> Result<Vec<Vec<(String, String)>>> {
        if link_type != "udp" {
            return Err(Error::InvalidArgument(format!(
                "unknown CHDR link type `{}`",
                link_type
            )));
        }
        let mut options = Vec::new();
        for link in &self.links {
            let ipv4 = match link.info.ipv4 {
                Some(ipv4) => ipv4,
                // An unconfigured interface is not offered to the host.
                None => continue,
            };
            let mut map = vec![
                ("ipv4".to_string(), ipv4.to_string()),
                ("port".to_string(), CHDR_UDP_PORT.to_string()),
                ("link_rate".to_string(), link.info.link_rate_bps.to_string()),
            ];
            if let Some(adapter) = &link.adapter {
                map.push(("xport_adapter_id".to_string(), adapter.inst_id().to_string()));
                map.push(("xport_adapter_caps".to_string(), adapter.caps_str()));
            }
            options.push(map);
        }
        Ok(options)
    }

    pub fn mtu(&self, iface: &str) -> Result<u32> {
        self.links
            .iter()
            .find(|link| link.info.name == iface)
            .map(|link| link.info.mtu)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown CHDR interface `{}`", iface)))
    }

    /// Routes CHDR endpoint `epid` out to a remote UDP destination.
    ///
    /// Returns the adapter instance that took the route.
    pub fn add_remote_ep_route(
        &self,
        epid: u16,
        dst_addr: &str,
        dst_port: u16,
        dst_mac: Option<&str>,
        stream_mode: &str,
        adapter_id: Option<&str>,
    ) -> Result<String> {
        let dst_ip: Ipv4Addr = dst_addr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad IPv4 address `{}`", dst_addr)))?;
        let mode = parse_stream_mode(stream_mode)?;

        let adapter = match adapter_id {
            Some(wanted) => self
                .links
                .iter()
                .filter_map(|link| link.adapter.as_ref())
                .find(|adapter| adapter.inst_id().to_string() == wanted)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("no transport adapter `{}`", wanted))
                })?,
            None => self
                .links
                .iter()
                .filter_map(|link| link.adapter.as_ref())
                .next()
                .ok_or_else(|| {
                    Error::InvalidArgument("no transport adapter on any interface".to_string())
                })?,
        };

        let mac: MacAddr = match dst_mac {
            Some(mac) => mac.parse()?,
            None => net::arp_lookup(dst_ip)?
                .ok_or_else(|| Error::PeerNotReady(format!("no ARP entry for {}", dst_ip)))?,
        };

        adapter.add_remote_ep_route(epid, dst_ip, dst_port, mac, mode)?;
        Ok(adapter.inst_id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libboard_m4xx::regs::RegisterInterface;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct FakeRegs {
        words: Mutex<HashMap<u32, u32>>,
    }

    impl FakeRegs {
        fn new(init: &[(u32, u32)]) -> Arc<FakeRegs> {
            Arc::new(FakeRegs {
                words: Mutex::new(init.iter().cloned().collect()),
            })
        }
    }

    impl RegisterInterface for FakeRegs {
        fn peek32(&self, addr: u32) -> Result<u32> {
            Ok(*self.words.lock().unwrap().get(&addr).unwrap_or(&0))
        }

        fn poke32(&self, addr: u32, value: u32) -> Result<()> {
            self.words.lock().unwrap().insert(addr, value);
            Ok(())
        }
    }

    fn link(name: &str, with_adapter: bool) -> ChdrLink {
        // Adapter block registers per the adapter layout: info and compat.
        let regs = FakeRegs::new(&[
            (0x0104, if with_adapter { 0x3 } else { 0 }),
            (0x0100, 1 << 16),
            (0x0108, 2),
        ]);
        ChdrLink {
            dispatch: EthDispatch::new(regs.clone(), 0, name),
            adapter: XportAdapter::probe(regs, 0, name).unwrap(),
            info: IfaceInfo {
                name: name.to_string(),
                mac: "02:00:00:00:00:01".parse().unwrap(),
                ipv4: Some(Ipv4Addr::new(192, 168, 10, 2)),
                mtu: 9000,
                link_rate_bps: 10_000_000_000,
            },
        }
    }

    #[test]
    fn link_options_carry_adapter_keys_only_when_present() {
        let mgr = TransportManager::new(vec![link("sfp0", true), link("sfp1", false)]);
        assert_eq!(mgr.link_types(), vec!["udp".to_string()]);
        let options = mgr.link_options("udp").unwrap();
        assert_eq!(options.len(), 2);
        let keys: Vec<&str> = options[0].iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"xport_adapter_id"));
        assert!(keys.contains(&"xport_adapter_caps"));
        let keys: Vec<&str> = options[1].iter().map(|(k, _)| k.as_str()).collect();
        assert!(!keys.contains(&"xport_adapter_id"));
        assert!(mgr.link_options("pcie").is_err());
    }

    #[test]
    fn remote_route_goes_to_the_requested_adapter() {
        let mgr = TransportManager::new(vec![link("sfp0", true)]);
        let adapter_id = mgr
            .add_remote_ep_route(
                7,
                "10.0.0.2",
                49200,
                Some("02:00:00:00:00:99"),
                "full_packet",
                None,
            )
            .unwrap();
        assert_eq!(adapter_id, "2");
        assert!(mgr
            .add_remote_ep_route(
                7,
                "10.0.0.2",
                49200,
                Some("02:00:00:00:00:99"),
                "full_packet",
                Some("9"),
            )
            .is_err());
    }

    #[test]
    fn bad_arguments_are_rejected_up_front() {
        let mgr = TransportManager::new(vec![link("sfp0", true)]);
        assert!(mgr
            .add_remote_ep_route(7, "not-an-ip", 1, Some("02:00:00:00:00:99"), "full_packet", None)
            .is_err());
        assert!(mgr
            .add_remote_ep_route(7, "10.0.0.2", 1, Some("02:00:00:00:00:99"), "half_packet", None)
            .is_err());
        assert_eq!(mgr.mtu("sfp0").unwrap(), 9000);
        assert!(mgr.mtu("eth9").is_err());
    }
}
