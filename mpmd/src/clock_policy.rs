//! Clocking policy.
//!
//! Pure computation from requested master clock rates to a complete divider
//! plan: SPLL VCXO/PLL dividers, RPLL tuple, MMCM feedback and output
//! dividers, and per-daughterboard converter resampling. Nothing in here
//! touches hardware; the clock manager applies the result.

use std::collections::BTreeMap;
use std::fmt;

use libboard_m4xx::rpll::{self, RpllSettings};
use libboard_m4xx::spll::SpllConfig;
use log::warn;

// PLL1 phase-frequency detector rate shared by every supported reference.
const PFD1: u64 = 40_000;

// RPLL operating point: its own crystal and the clocks it serves.
const RPLL_REF_RATE: u64 = 25_000_000;
const INTERNAL_BRC_RATE: u64 = 25_000_000;
const USR_CLK_RATE: u64 = 156_250_000;

const MMCM_VCO_MIN: u64 = 800_000_000;
const MMCM_VCO_MAX: u64 = 1_600_000_000;

// Converter-side resampling factors the RFDC supports.
const RESAMPLE_FACTORS: [u32; 4] = [1, 2, 4, 8];

// VCO dividers yielding valid converter rates.
const CONVERTER_DIVS: [u32; 3] = [1, 2, 3];

const SYSREF_PRC_RATIO: u16 = 24;

const RFDC_CLK_DIV: u64 = 16;

struct VcxoProfile {
    freq: u64,
    vco: u64,
    prc_div: u32,
}

// One SPLL VCO operating point per VCXO. The 122.88 MHz crystal covers the
// radio-rate family, the 100 MHz crystal the decimal family.
static VCXO_PROFILES: [VcxoProfile; 2] = [
    VcxoProfile {
        freq: 122_880_000,
        vco: 2_949_120_000,
        prc_div: 48,
    },
    VcxoProfile {
        freq: 100_000_000,
        vco: 3_000_000_000,
        prc_div: 48,
    },
];

/// Per-daughterboard DSP capabilities, fixed by the device table.
#[derive(Clone, Copy, Debug)]
pub struct DspInfo {
    /// Highest usable master clock rate.
    pub bandwidth: u64,
    pub spc_rx: u32,
    pub spc_tx: u32,
    pub extra_resampling: u32,
}

/// Converter rate and resampling for one daughterboard.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RfdcConfig {
    pub conv_rate: u64,
    pub resampling: u32,
}

/// FPGA MMCM divider plan.
#[derive(Clone, Debug, PartialEq)]
pub struct MmcmPlan {
    pub input_rate: u64,
    pub vco_rate: u64,
    pub fb_div: u32,
    pub output_divs: BTreeMap<String, u32>,
    pub use_defaults: bool,
}

/// RPLL operating tuple plus the divider words it resolves to.
#[derive(Clone, Debug, PartialEq)]
pub struct RpllPlan {
    pub ref_rate: u64,
    pub brc_rate: u64,
    pub usr_clk_rate: u64,
    pub settings: RpllSettings,
}

/// Everything needed to retune the clock tree.
#[derive(Clone, Debug, PartialEq)]
pub struct ClockPlan {
    pub spll: SpllConfig,
    pub rpll: RpllPlan,
    pub mmcm: MmcmPlan,
    pub rfdc: Vec<RfdcConfig>,
    pub prc_rate: u64,
    /// Achieved master clock rate per daughterboard.
    pub mcrs: Vec<u64>,
    /// Which requested rates had to be coerced.
    pub coerced: Vec<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PolicyError {
    UnsupportedMcr(u64),
    UnsupportedRefRate(u64),
    UnsupportedConverterRate(u64),
    NoMcrGiven,
    MmcmUnreachable(u64),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PolicyError::UnsupportedMcr(rate) => {
                write!(f, "invalid argument: unsupported master clock rate {} Hz", rate)
            }
            PolicyError::UnsupportedRefRate(rate) => {
                write!(f, "invalid argument: unsupported reference rate {} Hz", rate)
            }
            PolicyError::UnsupportedConverterRate(rate) => {
                write!(f, "invalid argument: unsupported converter rate {} Hz", rate)
            }
            PolicyError::NoMcrGiven => write!(f, "invalid argument: no master clock rate given"),
            PolicyError::MmcmUnreachable(rate) => write!(
                f,
                "invalid argument: no MMCM setting reaches {} Hz",
                rate
            ),
        }
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

fn resample_factors(dsp: &DspInfo) -> Vec<u32> {
    RESAMPLE_FACTORS
        .iter()
        .map(|f| f * dsp.extra_resampling)
        .collect()
}

/// All master clock rates reachable for a daughterboard, descending.
pub fn supported_mcrs(dsp: &DspInfo) -> Vec<u64> {
    let mut rates = Vec::new();
    for profile in &VCXO_PROFILES {
        for div in &CONVERTER_DIVS {
            let conv = profile.vco / *div as u64;
            if profile.vco % *div as u64 != 0 {
                continue;
            }
            for factor in resample_factors(dsp) {
                if conv % factor as u64 == 0 {
                    let mcr = conv / factor as u64;
                    if mcr <= dsp.bandwidth && mcr % dsp.spc_rx as u64 == 0 {
                        rates.push(mcr);
                    }
                }
            }
        }
    }
    rates.sort_unstable();
    rates.dedup();
    rates.reverse();
    rates
}

/// Rounds `requested` to the nearest supported rate. Idempotent.
pub fn coerce_mcr(requested: u64, dsp: &DspInfo) -> Result<u64, PolicyError> {
    let rates = supported_mcrs(dsp);
    rates
        .iter()
        .min_by_key(|rate| {
            if **rate > requested {
                **rate - requested
            } else {
                requested - **rate
            }
        })
        .copied()
        .ok_or(PolicyError::UnsupportedMcr(requested))
}

// A converter-rate candidate: which VCXO profile and VCO divider it uses.
struct Candidate {
    profile: &'static VcxoProfile,
    conv_div: u32,
    conv_rate: u64,
}

fn candidates() -> Vec<Candidate> {
    let mut result = Vec::new();
    for profile in &VCXO_PROFILES {
        for div in &CONVERTER_DIVS {
            if profile.vco % *div as u64 == 0 {
                result.push(Candidate {
                    profile,
                    conv_div: *div,
                    conv_rate: profile.vco / *div as u64,
                });
            }
        }
    }
    result
}

fn resampling_for(conv_rate: u64, mcr: u64, dsp: &DspInfo) -> Option<u32> {
    if conv_rate % mcr != 0 {
        return None;
    }
    let factor = (conv_rate / mcr) as u32;
    if resample_factors(dsp).contains(&factor) {
        Some(factor)
    } else {
        None
    }
}

fn mmcm_plan(prc_rate: u64, conv_rate: u64, mcrs: &[u64], dsp: &[DspInfo]) -> Result<MmcmPlan, PolicyError> {
    let mut required = BTreeMap::new();
    let radio0 = mcrs[0] / dsp[0].spc_rx as u64;
    required.insert("r0_clk".to_string(), radio0);
    if mcrs.len() > 1 {
        required.insert("r1_clk".to_string(), mcrs[1] / dsp[1].spc_rx as u64);
    }
    required.insert("data_clk".to_string(), radio0);
    required.insert("data_clk_2x".to_string(), 2 * radio0);
    required.insert("rfdc_clk".to_string(), conv_rate / RFDC_CLK_DIV);
    required.insert("rfdc_clk_2x".to_string(), 2 * (conv_rate / RFDC_CLK_DIV));

    let mut base = prc_rate;
    for rate in required.values() {
        base = lcm(base, *rate);
    }
    let vco_rate = (1u64..)
        .map(|k| base * k)
        .find(|vco| *vco >= MMCM_VCO_MIN)
        .filter(|vco| *vco <= MMCM_VCO_MAX)
        .ok_or(PolicyError::MmcmUnreachable(base))?;

    let output_divs = required
        .iter()
        .map(|(name, rate)| (name.clone(), (vco_rate / rate) as u32))
        .collect();
    Ok(MmcmPlan {
        input_rate: prc_rate,
        vco_rate,
        fb_div: (vco_rate / prc_rate) as u32,
        output_divs,
        use_defaults: false,
    })
}

fn spll_config(
    profile: &VcxoProfile,
    conv_div: u32,
    ref_rate: u64,
) -> Result<SpllConfig, PolicyError> {
    if ref_rate == 0 || ref_rate % PFD1 != 0 {
        return Err(PolicyError::UnsupportedRefRate(ref_rate));
    }
    let n_total = profile.vco / profile.freq;
    // Smallest workable prescaler keeps N in range on both families.
    let prescaler = 2u8;
    let conv = conv_div as u16;
    let prc = profile.prc_div as u16;
    Ok(SpllConfig {
        vcxo_freq: profile.freq,
        output_freq: profile.vco / conv_div as u64,
        vco_freq: profile.vco,
        brc_freq: ref_rate,
        pll1_r_div: (ref_rate / PFD1) as u16,
        pll1_n_div: (profile.freq / PFD1) as u16,
        pll2_r_div: 1,
        pll2_prescaler: prescaler,
        pll2_n_div: (n_total / prescaler as u64) as u16,
        sysref_div: prc * SYSREF_PRC_RATIO,
        clkout_divs: [conv, conv, prc, prc, conv, conv, prc],
        prc_div: profile.prc_div,
        legacy_mode: false,
    })
}

fn rpll_plan() -> RpllPlan {
    // The RPLL operating point is independent of the MCR; failure here would
    // mean the constants above disagree with the driver tables.
    let settings = rpll::lookup_settings(RPLL_REF_RATE, INTERNAL_BRC_RATE, USR_CLK_RATE)
        .unwrap_or_else(|_| RpllSettings::default());
    RpllPlan {
        ref_rate: RPLL_REF_RATE,
        brc_rate: INTERNAL_BRC_RATE,
        usr_clk_rate: USR_CLK_RATE,
        settings,
    }
}

/// Computes a full clock plan.
///
/// `ref_rate` is the rate of the selected base reference; `converter_override`
/// forces the converter rate instead of deriving it from the requested MCRs.
pub fn compute_plan(
    ref_rate: u64,
    requested_mcrs: &[u64],
    dsp: &[DspInfo],
    converter_override: Option<u64>,
) -> Result<ClockPlan, PolicyError> {
    if requested_mcrs.is_empty() || dsp.len() < requested_mcrs.len() {
        return Err(PolicyError::NoMcrGiven);
    }

    let mut mcrs = Vec::with_capacity(requested_mcrs.len());
    let mut coerced = Vec::with_capacity(requested_mcrs.len());
    for (requested, info) in requested_mcrs.iter().zip(dsp) {
        let achieved = coerce_mcr(*requested, info)?;
        if achieved != *requested {
            warn!(
                "master clock rate {} Hz is unsupported, coerced to {} Hz",
                requested, achieved
            );
        }
        coerced.push(achieved != *requested);
        mcrs.push(achieved);
    }

    let all = candidates();
    let viable: Vec<&Candidate> = match converter_override {
        Some(rate) => {
            let matched: Vec<&Candidate> =
                all.iter().filter(|c| c.conv_rate == rate).collect();
            if matched.is_empty() {
                return Err(PolicyError::UnsupportedConverterRate(rate));
            }
            matched
        }
        None => all.iter().collect(),
    };

    // A candidate is common when every daughterboard reaches its rate by an
    // integer resampling of the one converter rate.
    let common = viable.iter().find(|c| {
        mcrs.iter()
            .zip(dsp)
            .all(|(mcr, info)| resampling_for(c.conv_rate, *mcr, info).is_some())
    });
    let (candidate, final_mcrs) = match common {
        Some(candidate) => (*candidate, mcrs.clone()),
        None => {
            // Requested rates are mutually incompatible: satisfy the first
            // daughterboard and pull the others onto its plan.
            let candidate = viable
                .iter()
                .find(|c| resampling_for(c.conv_rate, mcrs[0], &dsp[0]).is_some())
                .ok_or(PolicyError::UnsupportedMcr(mcrs[0]))?;
            warn!(
                "requested master clock rates {:?} are incompatible, \
                 falling back to {} Hz on every daughterboard",
                mcrs, mcrs[0]
            );
            for slot in 1..mcrs.len() {
                if mcrs[slot] != mcrs[0] {
                    coerced[slot] = true;
                }
            }
            (*candidate, vec![mcrs[0]; mcrs.len()])
        }
    };

    let spll = spll_config(candidate.profile, candidate.conv_div, ref_rate)?;
    let prc_rate = candidate.profile.vco / candidate.profile.prc_div as u64;
    let rfdc = final_mcrs
        .iter()
        .zip(dsp)
        .map(|(mcr, info)| RfdcConfig {
            conv_rate: candidate.conv_rate,
            resampling: resampling_for(candidate.conv_rate, *mcr, info).unwrap_or(1),
        })
        .collect();
    let mmcm = mmcm_plan(prc_rate, candidate.conv_rate, &final_mcrs, dsp)?;

    Ok(ClockPlan {
        spll,
        rpll: rpll_plan(),
        mmcm,
        rfdc,
        prc_rate,
        mcrs: final_mcrs,
        coerced,
    })
}
