//! Peripheral manager: composes the clocking, timekeeper and transport
//! subsystems behind the RPC vocabulary and owns the claim lifecycle.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use libboard_m4xx::mboard::MboardRegs;
use log::{info, warn, LevelFilter};

use crate::claim::{Claim, WATCHDOG_INTERVAL};
use crate::clock_policy::{compute_plan, DspInfo};
use crate::clocking::{ClockManager, PpsSource, RefSource};
use crate::logger::BufferLogger;
use crate::rpc::Value;
use crate::timekeeper::{ReadTime, SetTime, Timekeepers};
use crate::transport::TransportManager;

pub struct DbSlot {
    pub pid: u16,
    pub serial: String,
    pub dsp: DspInfo,
}

pub struct DeviceIdentity {
    pub product: String,
    pub pid: u16,
    pub serial: String,
    pub db_slots: Vec<DbSlot>,
}

/// Identity table for the M4xx motherboard.
pub fn m4xx_identity(serial: &str, num_dbs: usize) -> DeviceIdentity {
    let dsp = DspInfo {
        bandwidth: 3_200_000_000,
        spc_rx: 8,
        spc_tx: 8,
        extra_resampling: 1,
    };
    DeviceIdentity {
        product: "m4xx".to_string(),
        pid: 0x0404,
        serial: serial.to_string(),
        db_slots: (0..num_dbs)
            .map(|slot| DbSlot {
                pid: 0x4001,
                serial: format!("{}-{}", serial, slot),
                dsp,
            })
            .collect(),
    }
}

/// Mutable device state, serialized behind one mutex so watchdog teardown
/// only ever runs between RPCs.
pub struct DeviceState {
    pub clock_mgr: ClockManager,
    pub timekeepers: Timekeepers,
    pub transport: TransportManager,
    pub mb: Arc<MboardRegs>,
    pub time_source: PpsSource,
}

struct MethodEntry {
    name: &'static str,
    doc: &'static str,
    requires_token: bool,
}

// Forwarded PPS edges land this long after the true PPS, on an aligned
// BRC/PRC edge.
const PPS_FWD_DELAY: f64 = 0.125;

static METHODS: &[MethodEntry] = &[
    MethodEntry { name: "claim", doc: "Claim the device, returns the session token", requires_token: false },
    MethodEntry { name: "reclaim", doc: "Keep-alive for an existing claim", requires_token: true },
    MethodEntry { name: "unclaim", doc: "Release the claim and tear the session down", requires_token: true },
    MethodEntry { name: "list_methods", doc: "List RPC methods", requires_token: false },
    MethodEntry { name: "get_device_info", doc: "Static device identity", requires_token: false },
    MethodEntry { name: "get_clock_sources", doc: "Selectable reference sources", requires_token: true },
    MethodEntry { name: "get_time_sources", doc: "Selectable PPS sources", requires_token: true },
    MethodEntry { name: "get_clock_source", doc: "Currently selected reference source", requires_token: true },
    MethodEntry { name: "get_time_source", doc: "Currently selected PPS source", requires_token: true },
    MethodEntry { name: "set_clock_source", doc: "Select the reference source", requires_token: true },
    MethodEntry { name: "set_time_source", doc: "Select the PPS source", requires_token: true },
    MethodEntry { name: "get_master_clock_rate", doc: "Current master clock rate in Hz", requires_token: true },
    MethodEntry { name: "set_master_clock_rate", doc: "Retune the clock tree to the given rates", requires_token: true },
    MethodEntry { name: "get_num_timekeepers", doc: "Number of timekeepers", requires_token: true },
    MethodEntry { name: "get_timekeeper_time", doc: "Read a timekeeper (now or last PPS)", requires_token: true },
    MethodEntry { name: "set_timekeeper_time", doc: "Load a timekeeper (now or next PPS)", requires_token: true },
    MethodEntry { name: "set_tick_period", doc: "Set a timekeeper tick period", requires_token: true },
    MethodEntry { name: "get_ref_locked", doc: "Whether the full PLL chain is locked", requires_token: true },
    MethodEntry { name: "get_chdr_link_types", doc: "Available CHDR link types", requires_token: false },
    MethodEntry { name: "get_chdr_link_options", doc: "Per-link CHDR parameters", requires_token: false },
    MethodEntry { name: "add_remote_ep_route", doc: "Route a CHDR endpoint to a remote UDP destination", requires_token: true },
    MethodEntry { name: "get_mtu", doc: "MTU of a CHDR interface", requires_token: true },
    MethodEntry { name: "get_device_id", doc: "Device ID register", requires_token: true },
    MethodEntry { name: "set_device_id", doc: "Write the device ID register", requires_token: true },
    MethodEntry { name: "get_proto_ver", doc: "RFNoC protocol version", requires_token: false },
    MethodEntry { name: "get_chdr_width", doc: "CHDR bus width in bits", requires_token: false },
    MethodEntry { name: "get_compat_number", doc: "FPGA compat number (major, minor)", requires_token: false },
    MethodEntry { name: "get_git_hash", doc: "FPGA git hash and clean/dirty state", requires_token: false },
    MethodEntry { name: "get_build_timestamp", doc: "FPGA build timestamp, ISO 8601", requires_token: false },
    MethodEntry { name: "get_log", doc: "Drain the buffered daemon log", requires_token: false },
    MethodEntry { name: "set_log_level", doc: "Set the console log level", requires_token: false },
    MethodEntry { name: "get_uptime", doc: "Daemon uptime in seconds", requires_token: false },
];

fn str_arg<'a>(args: &'a [Value], idx: usize) -> Result<&'a str, String> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("invalid argument: argument {} must be a string", idx))
}

fn u64_arg(args: &[Value], idx: usize) -> Result<u64, String> {
    args.get(idx)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("invalid argument: argument {} must be an integer", idx))
}

fn bool_arg(args: &[Value], idx: usize) -> Result<bool, String> {
    args.get(idx)
        .and_then(Value::as_bool)
        .ok_or_else(|| format!("invalid argument: argument {} must be a boolean", idx))
}

fn u64_list_arg<'a>(args: &'a [Value], idx: usize) -> Result<&'a [u64], String> {
    args.get(idx)
        .and_then(Value::as_u64_list)
        .ok_or_else(|| format!("invalid argument: argument {} must be an integer list", idx))
}

/// Optional string argument: absent or empty means "not given".
fn opt_str_arg<'a>(args: &'a [Value], idx: usize) -> Option<&'a str> {
    args.get(idx).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub struct PeripheralManager {
    ident: DeviceIdentity,
    claim: Claim,
    dev: Mutex<DeviceState>,
    start: Instant,
}

impl PeripheralManager {
    pub fn new(ident: DeviceIdentity, dev: DeviceState, claim_timeout: Duration) -> PeripheralManager {
        info!(
            "peripheral manager up: {} serial {} with {} daughterboard slot(s)",
            ident.product,
            ident.serial,
            ident.db_slots.len()
        );
        PeripheralManager {
            ident,
            claim: Claim::new(claim_timeout),
            dev: Mutex::new(dev),
            start: Instant::now(),
        }
    }

    fn dev(&self) -> MutexGuard<DeviceState> {
        self.dev.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn claim_state(&self) -> &Claim {
        &self.claim
    }

    /// One-line discovery datagram payload.
    pub fn discovery_info(&self) -> String {
        format!(
            "MPM-DISC;type={};serial={};claimed={}",
            self.ident.product,
            self.ident.serial,
            if self.claim.is_claimed() { "True" } else { "False" }
        )
    }

    /// Session teardown, run after unclaim or watchdog expiry. Failures are
    /// logged and swallowed so the release always completes.
    pub fn teardown(&self) {
        let dev = self.dev();
        for link in dev.transport.links() {
            if let Err(error) = link.dispatch.set_forward_policy(false, false) {
                warn!("teardown: {}: {}", link.dispatch.iface(), error);
            }
        }
        for tk in 0..dev.timekeepers.num() {
            if let Err(error) = dev.clock_mgr.configure_pps_forwarding(tk, false, 0, 0.0) {
                warn!("teardown: timekeeper {}: {}", tk, error);
            }
        }
        info!("session torn down");
    }

    /// Runs the claim watchdog until the process exits.
    pub fn spawn_watchdog(mpm: Arc<PeripheralManager>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("claim-watchdog".to_string())
            .spawn(move || loop {
                thread::sleep(WATCHDOG_INTERVAL);
                if mpm.claim.expire_if_stale().is_some() {
                    mpm.teardown();
                }
            })
            .expect("cannot spawn watchdog thread")
    }

    pub(crate) fn set_master_clock_rate(&self, rates: &[u64]) -> Result<Vec<u64>, String> {
        if rates.is_empty() || rates.len() > self.ident.db_slots.len() {
            return Err(format!(
                "invalid argument: expected 1..={} master clock rates",
                self.ident.db_slots.len()
            ));
        }
        let dsp: Vec<DspInfo> = self.ident.db_slots.iter().map(|slot| slot.dsp).collect();
        let mut dev = self.dev();
        let ref_rate = dev.clock_mgr.ref_source().rate();
        let plan = compute_plan(ref_rate, rates, &dsp, None).map_err(|e| e.to_string())?;
        dev.clock_mgr.reconfigure(plan).map_err(|e| e.to_string())?;
        let mcrs = dev
            .clock_mgr
            .current_plan()
            .map(|plan| plan.mcrs.clone())
            .unwrap_or_default();
        // Keep the timekeepers coherent with the new radio rate.
        if let Some(rate) = mcrs.first() {
            let period = Timekeepers::period_ns_for_rate(*rate);
            for tk in 0..dev.timekeepers.num() {
                dev.timekeepers
                    .set_tick_period(tk, period)
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(mcrs)
    }

    /// Dispatches one RPC. Errors are returned as strings whose leading
    /// words identify the error class.
    pub fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value, String> {
        let entry = METHODS
            .iter()
            .find(|entry| entry.name == method)
            .ok_or_else(|| format!("protocol error: unknown method `{}`", method))?;

        let (token, args) = if entry.requires_token {
            let token = str_arg(args, 0).map_err(|_| "bad token".to_string())?;
            // reclaim/unclaim validate the token themselves so their state
            // transitions stay atomic.
            if method != "reclaim" && method != "unclaim" {
                self.claim.check_token(token).map_err(|e| e.to_string())?;
            }
            (token, &args[1..])
        } else {
            ("", args)
        };

        match method {
            "claim" => {
                let caller = str_arg(args, 0).unwrap_or("unknown");
                Ok(Value::Str(self.claim.claim(caller)))
            }
            "reclaim" => self
                .claim
                .reclaim(token)
                .map(Value::Bool)
                .map_err(|e| e.to_string()),
            "unclaim" => {
                self.claim.unclaim(token).map_err(|e| e.to_string())?;
                self.teardown();
                Ok(Value::Bool(true))
            }
            "list_methods" => Ok(Value::MapList(
                METHODS
                    .iter()
                    .map(|entry| {
                        vec![
                            ("name".to_string(), entry.name.to_string()),
                            ("docstring".to_string(), entry.doc.to_string()),
                            (
                                "requires_token".to_string(),
                                if entry.requires_token { "True" } else { "False" }.to_string(),
                            ),
                        ]
                    })
                    .collect(),
            )),
            "get_device_info" => {
                let dev = self.dev();
                let (major, minor) = dev.mb.get_compat_number().map_err(|e| e.to_string())?;
                let mut map = vec![
                    ("type".to_string(), self.ident.product.clone()),
                    ("product".to_string(), self.ident.product.clone()),
                    ("pid".to_string(), format!("0x{:04x}", self.ident.pid)),
                    ("serial".to_string(), self.ident.serial.clone()),
                    ("fpga_version".to_string(), format!("{}.{}", major, minor)),
                    (
                        "mpm_version".to_string(),
                        env!("CARGO_PKG_VERSION").to_string(),
                    ),
                    (
                        "claimed".to_string(),
                        if self.claim.is_claimed() { "True" } else { "False" }.to_string(),
                    ),
                ];
                if let Some(owner) = self.claim.owner() {
                    map.push(("claimed_by".to_string(), owner));
                }
                Ok(Value::Map(map))
            }
            "get_clock_sources" => Ok(Value::StrList(vec![
                "internal".to_string(),
                "external".to_string(),
                "gpsdo".to_string(),
                "nsync_aux".to_string(),
            ])),
            "get_time_sources" => Ok(Value::StrList(vec![
                "internal".to_string(),
                "external".to_string(),
                "gpsdo".to_string(),
            ])),
            "get_clock_source" => Ok(Value::Str(self.dev().clock_mgr.ref_source().name())),
            "get_time_source" => Ok(Value::Str(self.dev().time_source.name().to_string())),
            "set_clock_source" => {
                let source = RefSource::from_name(str_arg(args, 0)?).map_err(|e| e.to_string())?;
                {
                    let mut dev = self.dev();
                    dev.clock_mgr.set_ref_source(source).map_err(|e| e.to_string())?;
                }
                // Retune the sample clock chain against the new reference.
                let mcrs = self
                    .dev()
                    .clock_mgr
                    .current_plan()
                    .map(|plan| plan.mcrs.clone());
                if let Some(mcrs) = mcrs {
                    self.set_master_clock_rate(&mcrs)?;
                }
                Ok(Value::Void)
            }
            "set_time_source" => {
                let source = PpsSource::from_name(str_arg(args, 0)?).map_err(|e| e.to_string())?;
                let mut dev = self.dev();
                dev.time_source = source;
                let ref_rate = dev.clock_mgr.ref_source().rate();
                let radio_rate = dev.clock_mgr.current_plan().map(|plan| {
                    plan.mmcm.vco_rate / plan.mmcm.output_divs["r0_clk"] as u64
                });
                if let Some(radio_rate) = radio_rate {
                    dev.clock_mgr
                        .sync_spll_clocks(source, ref_rate)
                        .map_err(|e| e.to_string())?;
                    // Re-arm PPS forwarding against the new alignment.
                    for tk in 0..dev.timekeepers.num() {
                        dev.clock_mgr
                            .configure_pps_forwarding(tk, true, radio_rate, PPS_FWD_DELAY)
                            .map_err(|e| e.to_string())?;
                    }
                }
                Ok(Value::Void)
            }
            "get_master_clock_rate" => Ok(Value::U64(
                self.dev()
                    .clock_mgr
                    .current_plan()
                    .map(|plan| plan.mcrs[0])
                    .unwrap_or(0),
            )),
            "set_master_clock_rate" => {
                let rates = u64_list_arg(args, 0)?;
                Ok(Value::U64List(self.set_master_clock_rate(rates)?))
            }
            "get_num_timekeepers" => Ok(Value::U64(self.dev().timekeepers.num() as u64)),
            "get_timekeeper_time" => {
                let tk = u64_arg(args, 0)? as u32;
                let which = if bool_arg(args, 1)? {
                    ReadTime::LastPps
                } else {
                    ReadTime::Now
                };
                self.dev()
                    .timekeepers
                    .get_time(tk, which)
                    .map(Value::U64)
                    .map_err(|e| e.to_string())
            }
            "set_timekeeper_time" => {
                let tk = u64_arg(args, 0)? as u32;
                let ticks = u64_arg(args, 1)?;
                let when = if bool_arg(args, 2)? {
                    SetTime::NextPps
                } else {
                    SetTime::Now
                };
                self.dev()
                    .timekeepers
                    .set_time(tk, ticks, when)
                    .map(|_| Value::Void)
                    .map_err(|e| e.to_string())
            }
            "set_tick_period" => {
                let tk = u64_arg(args, 0)? as u32;
                let period = u64_arg(args, 1)?;
                self.dev()
                    .timekeepers
                    .set_tick_period(tk, period)
                    .map(|_| Value::Void)
                    .map_err(|e| e.to_string())
            }
            "get_ref_locked" => self
                .dev()
                .clock_mgr
                .get_ref_locked()
                .map(Value::Bool)
                .map_err(|e| e.to_string()),
            "get_chdr_link_types" => Ok(Value::StrList(self.dev().transport.link_types())),
            "get_chdr_link_options" => self
                .dev()
                .transport
                .link_options(str_arg(args, 0)?)
                .map(Value::MapList)
                .map_err(|e| e.to_string()),
            "add_remote_ep_route" => {
                let epid = u64_arg(args, 0)? as u16;
                let dst_addr = str_arg(args, 1)?;
                let dst_port = u64_arg(args, 2)? as u16;
                let dst_mac = opt_str_arg(args, 3);
                let stream_mode = str_arg(args, 4)?;
                let adapter = opt_str_arg(args, 5);
                self.dev()
                    .transport
                    .add_remote_ep_route(epid, dst_addr, dst_port, dst_mac, stream_mode, adapter)
                    .map(Value::Str)
                    .map_err(|e| e.to_string())
            }
            "get_mtu" => self
                .dev()
                .transport
                .mtu(str_arg(args, 0)?)
                .map(|mtu| Value::U64(mtu as u64))
                .map_err(|e| e.to_string()),
            "get_device_id" => self
                .dev()
                .mb
                .get_device_id()
                .map(|id| Value::U64(id as u64))
                .map_err(|e| e.to_string()),
            "set_device_id" => {
                let device_id = u64_arg(args, 0)? as u16;
                self.dev()
                    .mb
                    .set_device_id(device_id)
                    .map(|_| Value::Void)
                    .map_err(|e| e.to_string())
            }
            "get_proto_ver" => self
                .dev()
                .mb
                .get_proto_ver()
                .map(|ver| Value::U64(ver as u64))
                .map_err(|e| e.to_string()),
            "get_chdr_width" => self
                .dev()
                .mb
                .get_chdr_width()
                .map(|width| Value::U64(width as u64))
                .map_err(|e| e.to_string()),
            "get_compat_number" => self
                .dev()
                .mb
                .get_compat_number()
                .map(|(major, minor)| Value::U64List(vec![major as u64, minor as u64]))
                .map_err(|e| e.to_string()),
            "get_git_hash" => self
                .dev()
                .mb
                .get_git_hash()
                .map(|(hash, dirty)| {
                    Value::StrList(vec![
                        hash,
                        if dirty { "dirty" } else { "clean" }.to_string(),
                    ])
                })
                .map_err(|e| e.to_string()),
            "get_build_timestamp" => self
                .dev()
                .mb
                .get_build_timestamp()
                .map(Value::Str)
                .map_err(|e| e.to_string()),
            "get_log" => Ok(Value::Str(
                BufferLogger::get_logger()
                    .map(|logger| logger.extract())
                    .unwrap_or_default(),
            )),
            "set_log_level" => {
                let level = match str_arg(args, 0)? {
                    "off" => LevelFilter::Off,
                    "error" => LevelFilter::Error,
                    "warn" => LevelFilter::Warn,
                    "info" => LevelFilter::Info,
                    "debug" => LevelFilter::Debug,
                    "trace" => LevelFilter::Trace,
                    other => {
                        return Err(format!("invalid argument: unknown log level `{}`", other))
                    }
                };
                if let Some(logger) = BufferLogger::get_logger() {
                    logger.set_console_log_level(level);
                }
                Ok(Value::Void)
            }
            "get_uptime" => Ok(Value::U64(self.start.elapsed().as_secs())),
            // METHODS and this match are kept in sync; a mismatch is a bug.
            _ => Err(format!("protocol error: unknown method `{}`", method)),
        }
    }
}

/// Fully faked device assembly shared by the RPC-level tests here and the
/// socket-level tests in `comms`.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::ChdrLink;
    use libboard_m4xx::eth_dispatch::EthDispatch;
    use libboard_m4xx::net::IfaceInfo;
    use libboard_m4xx::regs::{ChipInterface, RegisterInterface};
    use libboard_m4xx::rpll::Rpll;
    use libboard_m4xx::spll::Spll;
    use libboard_m4xx::xport_adapter::XportAdapter;
    use libboard_m4xx::Result as BoardResult;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    pub const DISPATCH_BASE: u32 = 0x8000;

    // FPGA window fake with enough behavior for end-to-end dispatch tests:
    // the MMCM locks when taken out of reset, SET_NOW timekeeper loads take
    // effect immediately.
    struct FakeFpga {
        words: Mutex<HashMap<u32, u32>>,
    }

    impl FakeFpga {
        fn new() -> Arc<FakeFpga> {
            let mut words = HashMap::new();
            words.insert(0x0000, (7 << 16) | 1); // compat
            words.insert(0x0014, (64 << 16) | 0x0100); // RFNoC info
            words.insert(0x0018, 2); // timekeepers
            words.insert(DISPATCH_BASE + 0x0104, 0x3); // adapter caps
            words.insert(DISPATCH_BASE + 0x0100, 1 << 16); // adapter compat
            words.insert(DISPATCH_BASE + 0x0108, 2); // adapter instance
            Arc::new(FakeFpga {
                words: Mutex::new(words),
            })
        }
    }

    impl RegisterInterface for FakeFpga {
        fn peek32(&self, addr: u32) -> BoardResult<u32> {
            let words = self.words.lock().unwrap();
            if addr == 0x0020 {
                let ctrl = *words.get(&0x001c).unwrap_or(&0);
                return Ok(if ctrl & 1 == 0 { 1 } else { 0 });
            }
            Ok(*words.get(&addr).unwrap_or(&0))
        }

        fn poke32(&self, addr: u32, value: u32) -> BoardResult<()> {
            let mut words = self.words.lock().unwrap();
            words.insert(addr, value);
            // Timekeeper SET_NOW loads latch immediately.
            if addr >= 0x1000
                && addr < 0x1000 + 2 * 0x30
                && (addr - 0x1000) % 0x30 == 0x10
                && value & 1 != 0
            {
                let base = addr - 0x10;
                let lo = *words.get(&(base + 0x08)).unwrap_or(&0);
                let hi = *words.get(&(base + 0x0c)).unwrap_or(&0);
                words.insert(base, lo);
                words.insert(base + 4, hi);
            }
            Ok(())
        }
    }

    struct FakeLmk {
        regs: Mutex<HashMap<u16, u8>>,
    }

    impl FakeLmk {
        fn new(initial_status: u8) -> FakeLmk {
            let mut regs = HashMap::new();
            regs.insert(0x0051, initial_status);
            regs.insert(0x0250, initial_status);
            FakeLmk {
                regs: Mutex::new(regs),
            }
        }
    }

    impl ChipInterface for FakeLmk {
        fn peek8(&self, addr: u16) -> BoardResult<u8> {
            Ok(*self.regs.lock().unwrap().get(&addr).unwrap_or(&0))
        }

        fn poke8(&self, addr: u16, value: u8) -> BoardResult<()> {
            let mut regs = self.regs.lock().unwrap();
            regs.insert(addr, value);
            if addr == 0x0230 || addr == 0x0050 {
                regs.insert(0x0250, 0x03);
                regs.insert(0x0051, 0x03);
            }
            if addr == 0x0240 && value == 0x01 {
                let status = *regs.get(&0x0250).unwrap_or(&0);
                regs.insert(0x0250, status | 0x04);
            }
            Ok(())
        }
    }

    pub(crate) fn test_mpm(claim_timeout: Duration) -> Arc<PeripheralManager> {
        let fpga = FakeFpga::new();
        let cpld = FakeFpga::new();
        let mb = Arc::new(MboardRegs::new(fpga.clone()));
        let clock_mgr = ClockManager::new(
            Rpll::new(Box::new(FakeLmk::new(0x03)), None),
            Spll::new(Box::new(FakeLmk::new(0x00)), None),
            mb.clone(),
            cpld,
        );
        let num_tk = mb.get_num_timekeepers().unwrap();
        let timekeepers = Timekeepers::new(fpga.clone(), num_tk);
        let link = ChdrLink {
            dispatch: EthDispatch::new(fpga.clone(), DISPATCH_BASE, "sfp0"),
            adapter: XportAdapter::probe(fpga.clone(), DISPATCH_BASE, "sfp0").unwrap(),
            info: IfaceInfo {
                name: "sfp0".to_string(),
                mac: "02:00:00:00:00:01".parse().unwrap(),
                ipv4: Some(Ipv4Addr::new(192, 168, 10, 2)),
                mtu: 9000,
                link_rate_bps: 10_000_000_000,
            },
        };
        let dev = DeviceState {
            clock_mgr,
            timekeepers,
            transport: TransportManager::new(vec![link]),
            mb,
            time_source: PpsSource::Internal,
        };
        Arc::new(PeripheralManager::new(
            m4xx_identity("3200001", 2),
            dev,
            claim_timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_mpm;
    use super::*;

    fn claim(mpm: &PeripheralManager) -> String {
        match mpm.dispatch("claim", &[Value::Str("test".to_string())]) {
            Ok(Value::Str(token)) => token,
            other => panic!("claim failed: {:?}", other),
        }
    }

    #[test]
    fn rpc_claim_lifecycle() {
        let mpm = test_mpm(Duration::from_millis(200));
        let token = claim(&mpm);
        assert!(!token.is_empty());

        assert_eq!(
            mpm.dispatch("reclaim", &[Value::Str("wrong".to_string())]),
            Err("bad token".to_string())
        );
        assert_eq!(
            mpm.dispatch("reclaim", &[Value::Str(token.clone())]),
            Ok(Value::Bool(true))
        );

        // No keep-alive past the watchdog period.
        thread::sleep(Duration::from_millis(300));
        assert!(mpm.claim_state().expire_if_stale().is_some());
        mpm.teardown();
        assert_eq!(
            mpm.dispatch("reclaim", &[Value::Str(token)]),
            Err("bad token".to_string())
        );
    }

    #[test]
    fn token_checks_guard_protected_methods() {
        let mpm = test_mpm(Duration::from_secs(2));
        match mpm.dispatch("get_ref_locked", &[Value::Str("nope".to_string())]) {
            Err(message) => assert!(message.starts_with("protocol error")),
            other => panic!("expected error, got {:?}", other),
        }
        let token = claim(&mpm);
        assert_eq!(
            mpm.dispatch("get_ref_locked", &[Value::Str("nope".to_string())]),
            Err("bad token".to_string())
        );
        // No-token methods work in any state.
        assert!(mpm.dispatch("get_device_info", &[]).is_ok());
        assert!(mpm
            .dispatch("get_ref_locked", &[Value::Str(token)])
            .is_ok());
    }

    #[test]
    fn set_master_clock_rate_end_to_end() {
        let mpm = test_mpm(Duration::from_secs(2));
        let token = claim(&mpm);
        let reply = mpm
            .dispatch(
                "set_master_clock_rate",
                &[
                    Value::Str(token.clone()),
                    Value::U64List(vec![368_640_000]),
                ],
            )
            .unwrap();
        assert_eq!(reply, Value::U64List(vec![368_640_000]));
        assert_eq!(
            mpm.dispatch("get_master_clock_rate", &[Value::Str(token.clone())]),
            Ok(Value::U64(368_640_000))
        );
        assert_eq!(
            mpm.dispatch("get_ref_locked", &[Value::Str(token)]),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn timekeeper_rpc_roundtrip() {
        let mpm = test_mpm(Duration::from_secs(2));
        let token = claim(&mpm);
        let ticks = (3u64 << 32) | 42;
        mpm.dispatch(
            "set_timekeeper_time",
            &[
                Value::Str(token.clone()),
                Value::U64(1),
                Value::U64(ticks),
                Value::Bool(false),
            ],
        )
        .unwrap();
        assert_eq!(
            mpm.dispatch(
                "get_timekeeper_time",
                &[Value::Str(token.clone()), Value::U64(1), Value::Bool(false)],
            ),
            Ok(Value::U64(ticks))
        );
        assert_eq!(
            mpm.dispatch("get_num_timekeepers", &[Value::Str(token)]),
            Ok(Value::U64(2))
        );
    }

    #[test]
    fn remote_route_and_link_options() {
        let mpm = test_mpm(Duration::from_secs(2));
        let token = claim(&mpm);
        match mpm.dispatch("get_chdr_link_types", &[]) {
            Ok(Value::StrList(types)) => assert_eq!(types, vec!["udp".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        match mpm.dispatch(
            "get_chdr_link_options",
            &[Value::Str("udp".to_string())],
        ) {
            Ok(Value::MapList(options)) => {
                assert!(options[0]
                    .iter()
                    .any(|(k, v)| k == "xport_adapter_caps" && v.contains("rx_routing")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            mpm.dispatch(
                "add_remote_ep_route",
                &[
                    Value::Str(token),
                    Value::U64(7),
                    Value::Str("10.0.0.2".to_string()),
                    Value::U64(49200),
                    Value::Str("02:00:00:00:00:99".to_string()),
                    Value::Str("full_packet".to_string()),
                    Value::Str(String::new()),
                ],
            ),
            Ok(Value::Str("2".to_string()))
        );
    }

    #[test]
    fn clock_source_change_replans_against_new_reference() {
        let mpm = test_mpm(Duration::from_secs(2));
        let token = claim(&mpm);
        mpm.dispatch(
            "set_master_clock_rate",
            &[Value::Str(token.clone()), Value::U64List(vec![368_640_000])],
        )
        .unwrap();
        assert_eq!(
            mpm.dispatch(
                "set_clock_source",
                &[Value::Str(token.clone()), Value::Str("external".to_string())],
            ),
            Ok(Value::Void)
        );
        assert_eq!(
            mpm.dispatch("get_clock_source", &[Value::Str(token.clone())]),
            Ok(Value::Str("external".to_string()))
        );
        // The plan survived the reference switch.
        assert_eq!(
            mpm.dispatch("get_master_clock_rate", &[Value::Str(token)]),
            Ok(Value::U64(368_640_000))
        );
    }

    #[test]
    fn time_source_change_resyncs_after_clock_setup() {
        let mpm = test_mpm(Duration::from_secs(2));
        let token = claim(&mpm);
        mpm.dispatch(
            "set_master_clock_rate",
            &[Value::Str(token.clone()), Value::U64List(vec![368_640_000])],
        )
        .unwrap();
        assert_eq!(
            mpm.dispatch(
                "set_time_source",
                &[Value::Str(token.clone()), Value::Str("external".to_string())],
            ),
            Ok(Value::Void)
        );
        assert_eq!(
            mpm.dispatch("get_time_source", &[Value::Str(token)]),
            Ok(Value::Str("external".to_string()))
        );
    }

    #[test]
    fn device_info_tracks_claim_state() {
        let mpm = test_mpm(Duration::from_secs(2));
        let info = |mpm: &PeripheralManager| match mpm.dispatch("get_device_info", &[]) {
            Ok(Value::Map(map)) => map,
            other => panic!("unexpected {:?}", other),
        };
        assert!(info(&mpm)
            .iter()
            .any(|(k, v)| k == "claimed" && v == "False"));
        let token = claim(&mpm);
        assert!(info(&mpm).iter().any(|(k, v)| k == "claimed" && v == "True"));
        mpm.dispatch("unclaim", &[Value::Str(token)]).unwrap();
        assert!(info(&mpm)
            .iter()
            .any(|(k, v)| k == "claimed" && v == "False"));
    }

    #[test]
    fn list_methods_reports_token_requirements() {
        let mpm = test_mpm(Duration::from_secs(2));
        let methods = match mpm.dispatch("list_methods", &[]) {
            Ok(Value::MapList(methods)) => methods,
            other => panic!("unexpected {:?}", other),
        };
        let requires = |name: &str| {
            methods
                .iter()
                .find(|m| m.iter().any(|(k, v)| k == "name" && v == name))
                .and_then(|m| {
                    m.iter()
                        .find(|(k, _)| k == "requires_token")
                        .map(|(_, v)| v == "True")
                })
                .unwrap()
        };
        assert!(!requires("claim"));
        assert!(!requires("get_chdr_link_types"));
        assert!(requires("set_master_clock_rate"));
        assert!(requires("unclaim"));
    }

    #[test]
    fn unknown_method_is_a_protocol_error() {
        let mpm = test_mpm(Duration::from_secs(2));
        match mpm.dispatch("reboot", &[]) {
            Err(message) => assert!(message.starts_with("protocol error")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn discovery_payload_carries_claim_state() {
        let mpm = test_mpm(Duration::from_secs(2));
        assert_eq!(
            mpm.discovery_info(),
            "MPM-DISC;type=m4xx;serial=3200001;claimed=False"
        );
        let _token = claim(&mpm);
        assert!(mpm.discovery_info().ends_with("claimed=True"));
    }
}
