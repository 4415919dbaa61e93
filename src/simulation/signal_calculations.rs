//! Radio timing and link budget calculations.
//!
//! Contains helpers for:
//! - 802.11g ERP-OFDM airtime of data and control frames
//! - Log-distance path loss with optional log-normal shadowing
//! - Effective communication distance estimation given a simple link budget
//! - SNR thresholds per OFDM rate
//!
//! Units:
//! - Power: dBm, distance: metres
//! - Time: `std::time::Duration` for the API, microseconds internally

use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

/// OFDM slot time.
pub const SLOT_TIME: Duration = Duration::from_micros(9);
/// Short interframe space.
pub const SIFS: Duration = Duration::from_micros(10);
/// DCF interframe space: SIFS + 2 slots.
pub const DIFS: Duration = Duration::from_micros(28);

const PREAMBLE_AND_HEADER_US: u64 = 20;
const SYMBOL_US: u64 = 4;
const SERVICE_BITS: u64 = 16;
const TAIL_BITS: u64 = 6;

/// MAC header + FCS of a QoS-less data frame.
pub const MAC_HEADER_AND_FCS_BYTES: u32 = 28;
/// LLC/SNAP encapsulation.
pub const LLC_BYTES: u32 = 8;
pub const RTS_BYTES: u32 = 20;
pub const CTS_BYTES: u32 = 14;
pub const ACK_BYTES: u32 = 14;

/// Rates (Mbit/s) of the ERP-OFDM rate set.
pub const OFDM_RATES_MBPS: [u32; 8] = [6, 9, 12, 18, 24, 36, 48, 54];

/// Parameters defining the radio channel propagation model.
///
/// These are the constants of a log-distance path loss model with log-normal
/// shadowing. They determine how signal strength decays with distance and
/// how much random variation is applied on top.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PathLossParameters {
    /// Path loss exponent (n).
    ///
    /// - n = 2.0: Free space
    /// - n = 2.7 to 3.5: Urban areas
    /// - n = 3.0 to 5.0: Indoor obstructed environments
    pub path_loss_exponent: f32,

    /// Standard deviation for log-normal shadowing (σ) in dB. 0 disables shadowing.
    #[serde(default)]
    pub shadowing_sigma: f32,

    /// Path loss at the reference distance d₀ = 1 m, in dB.
    pub path_loss_at_reference_distance: f32,

    /// Receiver noise floor in dBm (thermal noise over 20 MHz plus noise figure).
    pub noise_floor: f32,
}

impl Default for PathLossParameters {
    fn default() -> Self {
        Self {
            path_loss_exponent: 3.0,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 46.6777,
            noise_floor: -96.0,
        }
    }
}

/// Physical layer configuration shared by every interface.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PhyParameters {
    /// Rate used for data frames.
    pub data_rate_mbps: u32,
    /// Rate used for RTS, CTS and ACK frames.
    pub control_rate_mbps: u32,
    pub tx_power_dbm: f32,
    pub path_loss: PathLossParameters,
}

impl Default for PhyParameters {
    fn default() -> Self {
        Self {
            data_rate_mbps: 6,
            control_rate_mbps: 6,
            tx_power_dbm: 16.0206,
            path_loss: PathLossParameters::default(),
        }
    }
}

impl PhyParameters {
    pub fn validate(&self) -> Result<(), String> {
        for rate in [self.data_rate_mbps, self.control_rate_mbps] {
            if !OFDM_RATES_MBPS.contains(&rate) {
                return Err(format!("{} Mbit/s is not an OFDM rate (expected one of {:?})", rate, OFDM_RATES_MBPS));
            }
        }
        if !self.tx_power_dbm.is_finite() {
            return Err("tx power must be finite".into());
        }
        let pl = &self.path_loss;
        if !(pl.path_loss_exponent.is_finite() && pl.path_loss_exponent > 0.0) {
            return Err(format!("path loss exponent must be positive, got {}", pl.path_loss_exponent));
        }
        if !(pl.shadowing_sigma.is_finite() && pl.shadowing_sigma >= 0.0) {
            return Err(format!("shadowing sigma must be non-negative, got {}", pl.shadowing_sigma));
        }
        if !(pl.path_loss_at_reference_distance.is_finite() && pl.noise_floor.is_finite()) {
            return Err("reference path loss and noise floor must be finite".into());
        }
        Ok(())
    }

    /// Airtime of a data frame carrying an IP datagram of `ip_size` bytes.
    pub fn data_airtime(&self, ip_size: u32) -> Duration {
        calculate_air_time(ip_size + MAC_HEADER_AND_FCS_BYTES + LLC_BYTES, self.data_rate_mbps)
    }

    pub fn rts_airtime(&self) -> Duration {
        calculate_air_time(RTS_BYTES, self.control_rate_mbps)
    }

    pub fn cts_airtime(&self) -> Duration {
        calculate_air_time(CTS_BYTES, self.control_rate_mbps)
    }

    pub fn ack_airtime(&self) -> Duration {
        calculate_air_time(ACK_BYTES, self.control_rate_mbps)
    }

    /// Duration of a complete RTS/CTS exchange: `RTS + SIFS + CTS + SIFS`.
    pub fn reservation_exchange(&self) -> Duration {
        self.rts_airtime() + SIFS + self.cts_airtime() + SIFS
    }

    /// Time the interface stays busy after its data frame: `SIFS + ACK + DIFS`.
    pub fn post_transmission_gap(&self) -> Duration {
        SIFS + self.ack_airtime() + DIFS
    }

    /// Deterministic effective range in metres for the configured data rate.
    pub fn effective_distance(&self) -> f32 {
        calculate_effective_distance(self.tx_power_dbm, self.data_rate_mbps, &self.path_loss)
    }
}

/// Airtime of an OFDM PPDU carrying `bytes` MPDU bytes at `rate_mbps`.
///
/// ```text
/// T = T_preamble+header + ceil((16 + 8·L + 6) / N_DBPS) × 4 µs
/// N_DBPS = rate (Mbit/s) × 4 µs
/// ```
pub fn calculate_air_time(bytes: u32, rate_mbps: u32) -> Duration {
    let bits_per_symbol = (rate_mbps.max(1) as u64) * SYMBOL_US;
    let bits = SERVICE_BITS + 8 * bytes as u64 + TAIL_BITS;
    let symbols = bits.div_ceil(bits_per_symbol);
    Duration::from_micros(PREAMBLE_AND_HEADER_US + symbols * SYMBOL_US)
}

/// Duration of `slots` backoff slots.
pub fn backoff_duration(slots: u32) -> Duration {
    SLOT_TIME * slots
}

/// Calculate the path loss (in dB) at a given distance using a log-distance
/// path loss model with log-normal shadowing.
///
/// ```text
/// PL(d) = PL(d₀) + 10 × n × log₁₀(d/d₀) + X_σ,   d₀ = 1 m
/// ```
///
/// For distances below 1 m the reference loss is returned. The shadowing
/// term is drawn from `rng`, so callers control reproducibility.
pub fn calculate_path_loss<R: Rng + ?Sized>(distance: f32, params: &PathLossParameters, rng: &mut R) -> f32 {
    if distance < 1.0 {
        return params.path_loss_at_reference_distance;
    }
    let path_loss = params.path_loss_at_reference_distance + 10.0 * params.path_loss_exponent * distance.log10();
    let shadowing = match Normal::new(0.0_f32, params.shadowing_sigma) {
        Ok(normal) if params.shadowing_sigma > 0.0 => normal.sample(rng),
        _ => 0.0,
    };
    path_loss + shadowing
}

/// Received power in dBm: `P_tx - PL(d)`.
pub fn calculate_rssi<R: Rng + ?Sized>(distance: f32, tx_power_dbm: f32, params: &PathLossParameters, rng: &mut R) -> f32 {
    tx_power_dbm - calculate_path_loss(distance, params, rng)
}

/// Minimum SNR (dB) to decode a frame at the given OFDM rate.
pub fn calculate_snr_limit(rate_mbps: u32) -> f32 {
    match rate_mbps {
        6 => 2.0,
        9 => 3.0,
        12 => 5.0,
        18 => 7.0,
        24 => 10.0,
        36 => 14.0,
        48 => 18.0,
        54 => 20.0,
        _ => 20.0,
    }
}

pub fn calculate_receiving_limit(rate_mbps: u32, params: &PathLossParameters) -> f32 {
    params.noise_floor + calculate_snr_limit(rate_mbps)
}

/// Estimate a deterministic "effective distance" from the link budget
/// without sampling shadowing.
///
/// Solving `P_tx - (PL0 + 10n·log10 d) = RL` for d gives
/// `d = 10^((P_tx - RL - PL0) / (10n))`.
pub fn calculate_effective_distance(tx_power_dbm: f32, rate_mbps: u32, params: &PathLossParameters) -> f32 {
    let numerator = tx_power_dbm - calculate_receiving_limit(rate_mbps, params) - params.path_loss_at_reference_distance;
    if numerator <= 0.0 {
        return 0.0;
    }
    10.0_f32.powf(numerator / (10.0 * params.path_loss_exponent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn ofdm_airtime_matches_symbol_arithmetic() {
        // 14-byte ACK at 6 Mbit/s: 16 + 112 + 6 = 134 bits -> 6 symbols of 24 bits.
        assert_eq!(calculate_air_time(ACK_BYTES, 6), Duration::from_micros(20 + 6 * 4));
        // RTS: 16 + 160 + 6 = 182 bits -> 8 symbols.
        assert_eq!(calculate_air_time(RTS_BYTES, 6), Duration::from_micros(52));

        let phy = PhyParameters::default();
        // 512 byte payload + 28 IP/UDP + 36 MAC/LLC = 576 bytes -> 4630 bits -> 193 symbols.
        assert_eq!(phy.data_airtime(540), Duration::from_micros(20 + 193 * 4));
        assert_eq!(phy.reservation_exchange(), Duration::from_micros(52 + 10 + 44 + 10));
        assert_eq!(phy.post_transmission_gap(), Duration::from_micros(10 + 44 + 28));
    }

    #[test]
    fn airtime_shrinks_with_rate() {
        assert!(calculate_air_time(1000, 54) < calculate_air_time(1000, 6));
        assert!(calculate_air_time(100, 6) < calculate_air_time(1000, 6));
    }

    #[test]
    fn rate_validation() {
        let mut phy = PhyParameters::default();
        assert!(phy.validate().is_ok());
        phy.data_rate_mbps = 11;
        assert!(phy.validate().is_err());
    }

    #[test]
    fn effective_distance_monotonic_with_tx_power_and_rate() {
        let pl = PathLossParameters::default();
        let d_low = calculate_effective_distance(0.0, 6, &pl);
        let d_high = calculate_effective_distance(20.0, 6, &pl);
        assert!(d_low < d_high);
        assert!(calculate_effective_distance(16.0206, 54, &pl) < calculate_effective_distance(16.0206, 6, &pl));
        assert!(PhyParameters::default().effective_distance() > 120.0);
    }

    #[test]
    fn path_loss_is_deterministic_without_shadowing() {
        let pl = PathLossParameters::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(calculate_path_loss(0.5, &pl, &mut rng), pl.path_loss_at_reference_distance);
        let at_10 = calculate_path_loss(10.0, &pl, &mut rng);
        assert!((at_10 - (46.6777 + 30.0)).abs() < 1e-3);
        assert!(calculate_rssi(10.0, 16.0, &pl, &mut rng) < 16.0);
    }

    #[test]
    fn shadowing_draws_from_supplied_stream() {
        let pl = PathLossParameters {
            shadowing_sigma: 4.0,
            ..Default::default()
        };
        let sample = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            calculate_path_loss(50.0, &pl, &mut rng)
        };
        assert_eq!(sample(3), sample(3));
        assert_ne!(sample(3), sample(4));
    }
}
