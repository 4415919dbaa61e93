//! Medium contention with an optional RTS/CTS handshake.
//!
//! All interfaces share one medium, so any two transmissions that overlap in
//! time collide and both are lost. A transmission becomes audible to other
//! senders only after its first instant; two senders that start at the same
//! time therefore both see an idle medium and collide.
//!
//! With RTS/CTS enabled, frames whose payload exceeds the threshold are
//! preceded by a reservation exchange. Other senders honour the resulting
//! reservation (NAV) once the RTS has been received.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use super::signal_calculations::{self, DIFS, PhyParameters, SIFS};
use super::time::SimTime;
use super::types::{InterfaceId, Packet};

/// Global contention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ContentionConfig {
    pub rts_cts_enabled: bool,
    /// Payload size in bytes above which a reservation is requested.
    pub rts_cts_threshold: u32,
    pub max_rts_retries: u32,
    pub cw_min: u32,
    pub cw_max: u32,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            rts_cts_enabled: false,
            rts_cts_threshold: 100,
            max_rts_retries: 7,
            cw_min: 15,
            cw_max: 1023,
        }
    }
}

impl ContentionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_rts_retries == 0 {
            return Err("max RTS retries must be at least 1".into());
        }
        if self.cw_min == 0 || self.cw_min > self.cw_max {
            return Err(format!("invalid contention window [{}, {}]", self.cw_min, self.cw_max));
        }
        Ok(())
    }

    /// Whether a frame with this payload goes through the RTS/CTS exchange.
    pub fn uses_reservation(&self, payload_size: u32) -> bool {
        self.rts_cts_enabled && payload_size > self.rts_cts_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Rts,
    Data,
}

/// One occupation of the shared medium.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub id: TxId,
    pub sender: InterfaceId,
    pub kind: FrameKind,
    pub start: SimTime,
    pub end: SimTime,
    pub collided: bool,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    visible_from: SimTime,
    until: SimTime,
}

/// The single shared collision domain.
#[derive(Debug, Default)]
pub struct Medium {
    active: Vec<Transmission>,
    reservations: BTreeMap<InterfaceId, Reservation>,
    next_id: u64,
}

impl Medium {
    /// Start a transmission. Every transmission still on the air collides with it.
    pub fn begin(&mut self, sender: InterfaceId, kind: FrameKind, start: SimTime, airtime: Duration) -> TxId {
        let id = TxId(self.next_id);
        self.next_id += 1;
        let mut collided = false;
        for other in self.active.iter_mut().filter(|t| t.end > start) {
            other.collided = true;
            collided = true;
        }
        self.active.push(Transmission {
            id,
            sender,
            kind,
            start,
            end: start + airtime,
            collided,
        });
        id
    }

    /// Take a transmission off the air, returning its final state.
    pub fn finish(&mut self, id: TxId) -> Option<Transmission> {
        let index = self.active.iter().position(|t| t.id == id)?;
        Some(self.active.swap_remove(index))
    }

    /// True when another sender can hear an ongoing transmission at `now`.
    pub fn is_busy(&self, now: SimTime) -> bool {
        self.active.iter().any(|t| t.start < now && t.end > now)
    }

    /// End of the last transmission on the air.
    pub fn busy_until(&self) -> Option<SimTime> {
        self.active.iter().map(|t| t.end).max()
    }

    pub fn reserve(&mut self, owner: InterfaceId, visible_from: SimTime, until: SimTime) {
        self.reservations.insert(owner, Reservation { visible_from, until });
    }

    pub fn release(&mut self, owner: InterfaceId) {
        self.reservations.remove(&owner);
    }

    /// End of the latest reservation held by someone other than `iface`.
    pub fn reserved_by_other(&self, iface: InterfaceId, now: SimTime) -> Option<SimTime> {
        self.reservations
            .iter()
            .filter(|(owner, r)| **owner != iface && r.visible_from <= now && r.until > now)
            .map(|(_, r)| r.until)
            .max()
    }
}

/// A data frame waiting for, or holding, the medium.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub packet: Packet,
    /// Interface that receives the frame on the next hop.
    pub receiver: InterfaceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacState {
    Idle,
    Pending,
    Reserving,
    Transmitting,
}

#[derive(Debug)]
struct InterfaceMac {
    queue: VecDeque<Frame>,
    state: MacState,
    ready_at: SimTime,
    retries: u32,
    cw: u32,
}

/// Result of an access attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// Nothing to send, or the interface is already occupied.
    Idle,
    Deferred { retry_at: SimTime },
    RtsStarted { tx: TxId, complete_at: SimTime, frame: Frame },
    DataStarted { tx: TxId, end_at: SimTime, frame: Frame },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReservationOutcome {
    Granted { tx: TxId, end_at: SimTime, frame: Frame },
    Failed { retry_at: SimTime, attempt: u32, frame: Frame },
    /// Retries exhausted; the frame is dropped.
    Exhausted { frame: Frame, next_at: Option<SimTime> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionOutcome {
    pub transmission: Transmission,
    pub next_at: Option<SimTime>,
}

/// Stream id of the backoff RNG; mobility streams use the node ids.
const BACKOFF_STREAM: u64 = u64::MAX;

/// Per-interface MAC queues on top of the shared [`Medium`].
#[derive(Debug)]
pub struct Contention {
    config: ContentionConfig,
    phy: PhyParameters,
    medium: Medium,
    macs: BTreeMap<InterfaceId, InterfaceMac>,
    rng: ChaCha8Rng,
}

impl Contention {
    pub fn new(config: ContentionConfig, phy: PhyParameters, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(BACKOFF_STREAM);
        Self {
            config,
            phy,
            medium: Medium::default(),
            macs: BTreeMap::new(),
            rng,
        }
    }

    pub fn config(&self) -> &ContentionConfig {
        &self.config
    }

    fn mac(&mut self, iface: InterfaceId) -> &mut InterfaceMac {
        let cw_min = self.config.cw_min;
        self.macs.entry(iface).or_insert_with(|| InterfaceMac {
            queue: VecDeque::new(),
            state: MacState::Idle,
            ready_at: SimTime::ZERO,
            retries: 0,
            cw: cw_min,
        })
    }

    pub fn queue_len(&self, iface: InterfaceId) -> usize {
        self.macs.get(&iface).map(|m| m.queue.len()).unwrap_or(0)
    }

    /// Queue a frame. Returns the time of the access attempt the caller must
    /// schedule, or `None` when an attempt is already in progress.
    pub fn enqueue(&mut self, iface: InterfaceId, frame: Frame, now: SimTime) -> Option<SimTime> {
        let mac = self.mac(iface);
        mac.queue.push_back(frame);
        if mac.state != MacState::Idle {
            return None;
        }
        mac.state = MacState::Pending;
        Some(mac.ready_at.max(now))
    }

    fn draw_backoff(&mut self, cw: u32) -> Duration {
        let slots = self.rng.gen_range(0..=cw);
        signal_calculations::backoff_duration(slots)
    }

    pub fn try_access(&mut self, iface: InterfaceId, now: SimTime) -> Access {
        let config = self.config;
        let mac = self.mac(iface);
        if mac.state != MacState::Pending {
            return Access::Idle;
        }
        let Some(front) = mac.queue.front() else {
            mac.state = MacState::Idle;
            return Access::Idle;
        };
        if now < mac.ready_at {
            return Access::Deferred { retry_at: mac.ready_at };
        }
        let payload = front.packet.payload_size;
        let cw = mac.cw;

        if config.uses_reservation(payload) {
            let nav = self.medium.reserved_by_other(iface, now);
            if self.medium.is_busy(now) || nav.is_some() {
                let free_at = self.medium.busy_until().max(nav).unwrap_or(now).max(now);
                let retry_at = free_at + DIFS + self.draw_backoff(cw);
                return Access::Deferred { retry_at };
            }
            return self.start_rts(iface, now);
        }

        if config.rts_cts_enabled {
            if let Some(nav_end) = self.medium.reserved_by_other(iface, now) {
                let retry_at = nav_end + DIFS + self.draw_backoff(cw);
                return Access::Deferred { retry_at };
            }
        }
        match self.start_data(iface, now) {
            Some((tx, end_at, frame)) => Access::DataStarted { tx, end_at, frame },
            None => Access::Idle,
        }
    }

    fn start_rts(&mut self, iface: InterfaceId, now: SimTime) -> Access {
        let phy = &self.phy;
        let Some(mac) = self.macs.get_mut(&iface) else {
            return Access::Idle;
        };
        let Some(frame) = mac.queue.front().cloned() else {
            return Access::Idle;
        };
        let exchange = phy.reservation_exchange();
        let protected = phy.data_airtime(frame.packet.ip_size()) + SIFS + phy.ack_airtime();
        mac.state = MacState::Reserving;
        let tx = self.medium.begin(iface, FrameKind::Rts, now, phy.rts_airtime());
        self.medium.reserve(iface, now + phy.rts_airtime(), now + exchange + protected);
        Access::RtsStarted {
            tx,
            complete_at: now + exchange,
            frame,
        }
    }

    fn start_data(&mut self, iface: InterfaceId, now: SimTime) -> Option<(TxId, SimTime, Frame)> {
        let mac = self.macs.get_mut(&iface)?;
        let Some(frame) = mac.queue.pop_front() else {
            mac.state = MacState::Idle;
            return None;
        };
        mac.state = MacState::Transmitting;
        let airtime = self.phy.data_airtime(frame.packet.ip_size());
        let tx = self.medium.begin(iface, FrameKind::Data, now, airtime);
        Some((tx, now + airtime, frame))
    }

    /// Resolve an RTS/CTS exchange started by [`Contention::try_access`].
    ///
    /// The exchange succeeds only if the RTS did not collide and `cts_heard`
    /// reports that the addressed receiver could answer it. `cts_heard` is
    /// not called for a collided RTS.
    ///
    /// Returns `None` if the interface has no exchange in progress.
    pub fn complete_reservation(
        &mut self,
        iface: InterfaceId,
        tx: TxId,
        now: SimTime,
        cts_heard: impl FnOnce(&Frame) -> bool,
    ) -> Option<ReservationOutcome> {
        let collided = self.medium.finish(tx)?.collided;
        let config = self.config;
        let mac = self.macs.get(&iface)?;
        if mac.state != MacState::Reserving {
            return None;
        }
        let answered = !collided && cts_heard(mac.queue.front()?);

        if answered {
            let mac = self.mac(iface);
            mac.retries = 0;
            mac.cw = config.cw_min;
            let (tx, end_at, frame) = self.start_data(iface, now)?;
            return Some(ReservationOutcome::Granted { tx, end_at, frame });
        }

        self.medium.release(iface);
        let mac = self.mac(iface);
        mac.retries += 1;
        if mac.retries >= config.max_rts_retries {
            mac.retries = 0;
            mac.cw = config.cw_min;
            let frame = mac.queue.pop_front()?;
            let next_at = if mac.queue.is_empty() {
                mac.state = MacState::Idle;
                None
            } else {
                mac.state = MacState::Pending;
                Some(now + DIFS)
            };
            return Some(ReservationOutcome::Exhausted { frame, next_at });
        }

        mac.cw = ((mac.cw + 1) * 2 - 1).min(config.cw_max);
        mac.state = MacState::Pending;
        let attempt = mac.retries;
        let cw = mac.cw;
        let frame = mac.queue.front().cloned()?;
        let retry_at = now + DIFS + self.draw_backoff(cw);
        Some(ReservationOutcome::Failed { retry_at, attempt, frame })
    }

    /// Take a finished data frame off the air.
    pub fn complete_transmission(&mut self, iface: InterfaceId, tx: TxId, now: SimTime) -> Option<TransmissionOutcome> {
        let transmission = self.medium.finish(tx)?;
        self.medium.release(iface);
        let gap = self.phy.post_transmission_gap();
        let mac = self.mac(iface);
        mac.ready_at = now + gap;
        let next_at = if mac.queue.is_empty() {
            mac.state = MacState::Idle;
            None
        } else {
            mac.state = MacState::Pending;
            Some(mac.ready_at)
        };
        Some(TransmissionOutcome { transmission, next_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::{DEFAULT_TTL, PacketKind};
    use std::net::Ipv4Addr;

    fn frame(payload_size: u32, receiver: InterfaceId) -> Frame {
        Frame {
            packet: Packet {
                packet_id: 0,
                kind: PacketKind::EchoRequest,
                source: Ipv4Addr::new(192, 168, 1, 4),
                source_port: 49153,
                destination: Ipv4Addr::new(192, 168, 1, 1),
                destination_port: 20,
                payload_size,
                sequence: 0,
                ttl: DEFAULT_TTL,
            },
            receiver,
        }
    }

    fn contention(rts_cts_enabled: bool) -> Contention {
        let config = ContentionConfig {
            rts_cts_enabled,
            ..Default::default()
        };
        Contention::new(config, PhyParameters::default(), 1)
    }

    #[test]
    fn overlapping_transmissions_collide_and_back_to_back_do_not() {
        let mut medium = Medium::default();
        let a = medium.begin(1, FrameKind::Data, SimTime::ZERO, Duration::from_micros(100));
        let b = medium.begin(2, FrameKind::Data, SimTime::from_nanos(50_000), Duration::from_micros(100));
        assert!(medium.is_busy(SimTime::from_nanos(60_000)));
        assert!(medium.finish(a).unwrap().collided);
        assert!(medium.finish(b).unwrap().collided);

        let c = medium.begin(1, FrameKind::Data, SimTime::ZERO, Duration::from_micros(100));
        let c = medium.finish(c).unwrap();
        let d = medium.begin(2, FrameKind::Data, c.end, Duration::from_micros(100));
        assert!(!c.collided);
        assert!(!medium.finish(d).unwrap().collided);
    }

    #[test]
    fn transmission_is_not_audible_at_its_first_instant() {
        let mut medium = Medium::default();
        medium.begin(1, FrameKind::Rts, SimTime::from_secs(1), Duration::from_micros(52));
        assert!(!medium.is_busy(SimTime::from_secs(1)));
        assert!(medium.is_busy(SimTime::from_secs(1) + Duration::from_micros(1)));
    }

    #[test]
    fn disabled_mode_sends_immediately_and_collides_silently() {
        let mut c = contention(false);
        let now = SimTime::from_secs(2);
        assert_eq!(c.enqueue(3, frame(512, 0), now), Some(now));
        assert_eq!(c.enqueue(4, frame(512, 0), now), Some(now));
        let Access::DataStarted { tx: a, end_at, .. } = c.try_access(3, now) else {
            panic!("expected data")
        };
        let Access::DataStarted { tx: b, .. } = c.try_access(4, now) else {
            panic!("expected data")
        };
        assert!(c.complete_transmission(3, a, end_at).unwrap().transmission.collided);
        assert!(c.complete_transmission(4, b, end_at).unwrap().transmission.collided);
    }

    #[test]
    fn small_frames_skip_the_handshake_even_when_enabled() {
        let mut c = contention(true);
        let now = SimTime::from_secs(1);
        c.enqueue(3, frame(64, 0), now);
        assert!(matches!(c.try_access(3, now), Access::DataStarted { .. }));
    }

    #[test]
    fn granted_reservation_blocks_other_senders() {
        let mut c = contention(true);
        let now = SimTime::from_secs(1);
        c.enqueue(3, frame(512, 0), now);
        let Access::RtsStarted { tx, complete_at, .. } = c.try_access(3, now) else {
            panic!("expected RTS")
        };
        assert_eq!(complete_at, now + PhyParameters::default().reservation_exchange());

        // A second sender arriving during the exchange sees the RTS and defers.
        let later = now + Duration::from_micros(30);
        c.enqueue(4, frame(512, 0), later);
        let Access::Deferred { retry_at } = c.try_access(4, later) else {
            panic!("expected deferral")
        };
        assert!(retry_at >= now + PhyParameters::default().rts_airtime() + DIFS);

        let Some(ReservationOutcome::Granted { tx: data, end_at, .. }) = c.complete_reservation(3, tx, complete_at, |_| true) else {
            panic!("expected grant")
        };
        // Even a small frame from a third sender honours the reservation.
        c.enqueue(2, frame(32, 0), complete_at);
        assert!(matches!(c.try_access(2, complete_at), Access::Deferred { .. }));
        let outcome = c.complete_transmission(3, data, end_at).unwrap();
        assert!(!outcome.transmission.collided);
        assert_eq!(outcome.next_at, None);
    }

    #[test]
    fn simultaneous_reservations_fail_and_exhaust_retries() {
        let config = ContentionConfig {
            rts_cts_enabled: true,
            max_rts_retries: 2,
            ..Default::default()
        };
        let mut c = Contention::new(config, PhyParameters::default(), 9);
        let mut now = SimTime::from_secs(2);
        c.enqueue(3, frame(512, 0), now);
        c.enqueue(4, frame(512, 0), now);

        for attempt in 1..=2 {
            let Access::RtsStarted { tx: a, complete_at, .. } = c.try_access(3, now) else {
                panic!("expected RTS from 3")
            };
            let Access::RtsStarted { tx: b, .. } = c.try_access(4, now) else {
                panic!("expected RTS from 4")
            };
            let first = c.complete_reservation(3, a, complete_at, |_| true).unwrap();
            let second = c.complete_reservation(4, b, complete_at, |_| true).unwrap();
            if attempt == 1 {
                let ReservationOutcome::Failed { retry_at, attempt, .. } = first else {
                    panic!("expected failure")
                };
                assert_eq!(attempt, 1);
                assert!(retry_at >= complete_at + DIFS);
                assert!(matches!(second, ReservationOutcome::Failed { .. }));
            } else {
                assert!(matches!(first, ReservationOutcome::Exhausted { next_at: None, .. }));
                assert!(matches!(second, ReservationOutcome::Exhausted { .. }));
            }
            now = complete_at + Duration::from_millis(10);
        }
        assert_eq!(c.queue_len(3), 0);
    }

    #[test]
    fn unanswered_rts_backs_off_and_frees_the_medium() {
        let config = ContentionConfig {
            rts_cts_enabled: true,
            max_rts_retries: 3,
            ..Default::default()
        };
        let mut c = Contention::new(config, PhyParameters::default(), 4);
        let mut now = SimTime::from_secs(1);
        c.enqueue(3, frame(512, 7), now);

        for attempt in 1..=3 {
            let Access::RtsStarted { tx, complete_at, .. } = c.try_access(3, now) else {
                panic!("expected RTS")
            };
            let mut asked = None;
            let outcome = c
                .complete_reservation(3, tx, complete_at, |f| {
                    asked = Some(f.receiver);
                    false
                })
                .unwrap();
            assert_eq!(asked, Some(7));
            assert!(c.medium.reserved_by_other(4, complete_at).is_none());
            match outcome {
                ReservationOutcome::Failed { retry_at, attempt: n, .. } => {
                    assert!(attempt < 3);
                    assert_eq!(n, attempt);
                    now = retry_at;
                }
                ReservationOutcome::Exhausted { frame, next_at } => {
                    assert_eq!(attempt, 3);
                    assert_eq!(frame.receiver, 7);
                    assert_eq!(next_at, None);
                }
                ReservationOutcome::Granted { .. } => panic!("unanswered RTS must not be granted"),
            }
        }
        assert_eq!(c.queue_len(3), 0);
    }

    #[test]
    fn interface_waits_for_ack_and_difs_between_frames() {
        let mut c = contention(false);
        let now = SimTime::from_secs(1);
        c.enqueue(3, frame(512, 0), now);
        let Access::DataStarted { tx, end_at, .. } = c.try_access(3, now) else {
            panic!("expected data")
        };
        assert_eq!(c.enqueue(3, frame(512, 0), now), None, "attempt already in progress");
        let outcome = c.complete_transmission(3, tx, end_at).unwrap();
        let gap = PhyParameters::default().post_transmission_gap();
        assert_eq!(outcome.next_at, Some(end_at + gap));
        assert_eq!(c.try_access(3, end_at), Access::Deferred { retry_at: end_at + gap });
        assert!(matches!(c.try_access(3, end_at + gap), Access::DataStarted { .. }));
    }

    #[test]
    fn config_validation() {
        assert!(ContentionConfig::default().validate().is_ok());
        let bad = ContentionConfig {
            cw_min: 64,
            cw_max: 32,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(!ContentionConfig::default().uses_reservation(512));
    }
}
