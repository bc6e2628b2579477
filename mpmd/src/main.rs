//! Peripheral-manager daemon for the M4xx motherboard family.
//!
//! Bring-up order: logger, configuration, register banks, clock tree,
//! timekeepers, data-plane links; then the RPC server task, the discovery
//! responder task and the claim watchdog task.

use std::mem;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libboard_m4xx::eth_dispatch::EthDispatch;
use libboard_m4xx::mboard::MboardRegs;
use libboard_m4xx::regs::MmioBank;
use libboard_m4xx::rpll::Rpll;
use libboard_m4xx::spi::SpiChip;
use libboard_m4xx::spll::Spll;
use libboard_m4xx::xport_adapter::XportAdapter;
use libboard_m4xx::{net, regs::RegisterInterface};
use log::{error, info, warn};

mod claim;
mod clock_policy;
mod clocking;
mod comms;
mod config;
mod logger;
mod periph;
mod proto;
mod rpc;
mod timekeeper;
mod transport;

use claim::DEFAULT_TIMEOUT;
use clocking::{ClockManager, PpsSource, RefSource};
use config::Config;
use logger::BufferLogger;
use periph::{m4xx_identity, DeviceState, PeripheralManager};
use timekeeper::Timekeepers;
use transport::{ChdrLink, TransportManager, CHDR_UDP_PORT};

const DEFAULT_CONFIG_PATH: &str = "/etc/mpm.conf";

// FPGA peripheral window: motherboard registers, timekeepers and one
// dispatch/adapter block per Ethernet interface.
const FPGA_WINDOW_SIZE: usize = 0x0010_0000;
const CPLD_WINDOW_SIZE: usize = 0x1000;
const ETH_BASE: u32 = 0x8000;
const ETH_STRIDE: u32 = 0x4000;

const SPI_SPEED_HZ: u32 = 1_000_000;

fn cfg_str<'a>(cfg: &'a Config, key: &str, default: &'a str) -> &'a str {
    match cfg.read_str(key) {
        Ok(value) => value,
        Err(_) => default,
    }
}

fn open_bank(path: &str, size: usize) -> libboard_m4xx::Result<Arc<MmioBank>> {
    let bank = Arc::new(MmioBank::new(path, size, true)?);
    // The daemon holds every bank open for its whole lifetime.
    let scope = bank.open()?;
    mem::forget(scope);
    Ok(bank)
}

fn setup(cfg: &Config) -> Result<Arc<PeripheralManager>, String> {
    let fpga: Arc<dyn RegisterInterface> = open_bank(
        cfg_str(cfg, "fpga_regs", "/dev/uio0"),
        FPGA_WINDOW_SIZE,
    )
    .map_err(|e| e.to_string())?;
    let cpld: Arc<dyn RegisterInterface> = open_bank(
        cfg_str(cfg, "cpld_regs", "/dev/uio1"),
        CPLD_WINDOW_SIZE,
    )
    .map_err(|e| e.to_string())?;

    let mb = Arc::new(MboardRegs::new(fpga.clone()));
    mb.selftest().map_err(|e| e.to_string())?;
    let (major, minor) = mb.get_compat_number().map_err(|e| e.to_string())?;
    let (git_hash, dirty) = mb.get_git_hash().map_err(|e| e.to_string())?;
    info!(
        "detected FPGA: compat {}.{}, git {}{}, built {}",
        major,
        minor,
        git_hash,
        if dirty { "-dirty" } else { "" },
        mb.get_build_timestamp().map_err(|e| e.to_string())?
    );

    let spll_chip = SpiChip::new(
        cfg_str(cfg, "spll_spidev", "/dev/spidev0.0"),
        SPI_SPEED_HZ,
        0,
    )
    .map_err(|e| e.to_string())?;
    let rpll_chip = SpiChip::new(
        cfg_str(cfg, "rpll_spidev", "/dev/spidev0.1"),
        SPI_SPEED_HZ,
        0,
    )
    .map_err(|e| e.to_string())?;
    let mut clock_mgr = ClockManager::new(
        Rpll::new(Box::new(rpll_chip), None),
        Spll::new(Box::new(spll_chip), None),
        mb.clone(),
        cpld,
    );
    clock_mgr.init().map_err(|e| e.to_string())?;

    let clock_source = RefSource::from_name(cfg_str(cfg, "clock_source", "internal"))
        .map_err(|e| e.to_string())?;
    clock_mgr
        .set_ref_source(clock_source)
        .map_err(|e| e.to_string())?;
    let time_source = PpsSource::from_name(cfg_str(cfg, "time_source", "internal"))
        .map_err(|e| e.to_string())?;

    let num_timekeepers = mb.get_num_timekeepers().map_err(|e| e.to_string())?;
    let timekeepers = Timekeepers::new(fpga.clone(), num_timekeepers);
    info!("{} timekeeper(s)", num_timekeepers);

    let cfg_flag = |key: &str| {
        cfg.read_str(key)
            .map(|value| value == "1" || value == "true")
            .unwrap_or(false)
    };
    let fwd_unknown_eth = cfg_flag("fwd_unknown_eth");
    let fwd_broadcast = cfg_flag("fwd_broadcast");

    let mut links = Vec::new();
    for (slot, iface) in cfg_str(cfg, "chdr_ifaces", "sfp0,sfp1")
        .split(',')
        .map(str::trim)
        .filter(|iface| !iface.is_empty())
        .enumerate()
    {
        let info = match net::iface_info(iface) {
            Ok(info) => info,
            Err(error) => {
                warn!("skipping CHDR interface {}: {}", iface, error);
                continue;
            }
        };
        let base = ETH_BASE + slot as u32 * ETH_STRIDE;
        let dispatch = EthDispatch::new(fpga.clone(), base, iface);
        if let Some(ipv4) = info.ipv4 {
            dispatch.set_ipv4_addr(ipv4, false).map_err(|e| e.to_string())?;
            dispatch
                .set_vita_port(CHDR_UDP_PORT, 0, false)
                .map_err(|e| e.to_string())?;
        }
        dispatch
            .set_forward_policy(fwd_unknown_eth, fwd_broadcast)
            .map_err(|e| e.to_string())?;
        let adapter =
            XportAdapter::probe(fpga.clone(), base, iface).map_err(|e| e.to_string())?;
        links.push(ChdrLink {
            dispatch,
            adapter,
            info,
        });
    }
    let transport = TransportManager::new(links);

    let serial = cfg_str(cfg, "serial", "0000000").to_string();
    let num_dbs = cfg.read_u64("num_dbs").unwrap_or(2) as usize;
    let mpm = Arc::new(PeripheralManager::new(
        m4xx_identity(&serial, num_dbs),
        DeviceState {
            clock_mgr,
            timekeepers,
            transport,
            mb,
            time_source,
        },
        DEFAULT_TIMEOUT,
    ));

    let default_mcr = cfg.read_u64("master_clock_rate").unwrap_or(368_640_000);
    match mpm.set_master_clock_rate(&[default_mcr]) {
        Ok(mcrs) => info!("master clock rate: {} Hz", mcrs[0]),
        Err(error) => warn!("initial clock configuration failed: {}", error),
    }

    Ok(mpm)
}

fn main() {
    BufferLogger::register();
    info!("M4xx peripheral manager starting...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(error) => {
            warn!("config {} unusable ({}), using defaults", config_path, error);
            Config::empty()
        }
    };

    let mpm = match setup(&cfg) {
        Ok(mpm) => mpm,
        Err(error) => {
            error!("bring-up failed: {}", error);
            process::exit(1);
        }
    };

    let discovery_port = cfg.read_u64("discovery_port").unwrap_or(comms::DEFAULT_DISCOVERY_PORT as u64) as u16;
    {
        let mpm = mpm.clone();
        thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || {
                if let Err(error) = comms::discovery_main(mpm, discovery_port) {
                    error!("discovery responder died: {}", error);
                }
            })
            .expect("cannot spawn discovery thread");
    }

    PeripheralManager::spawn_watchdog(mpm.clone());

    let rpc_port = cfg.read_u64("rpc_port").unwrap_or(comms::DEFAULT_RPC_PORT as u64) as u16;
    if let Err(error) = comms::rpc_main(mpm, rpc_port) {
        error!("RPC server died: {}", error);
        // Give the logger a moment to drain to the console.
        thread::sleep(Duration::from_millis(100));
        process::exit(1);
    }
}
