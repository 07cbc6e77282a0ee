//! Host simulation of two 6LoWPAN nodes over a lossy in-memory radio.
//!
//! A sender fragments a stream of random datagrams and a receiver puts them
//! back together. The radio delivers each burst of frames in shuffled
//! order, loses a share of them, and reports send completions back to the
//! sender after a short random delay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin lowpan-sim
//! LOWPAN_SIM_DROP_PERCENT=20 RUST_LOG=debug cargo run --bin lowpan-sim
//! ```
//!
//! Engine settings come from the `LOWPAN_*` variables read by
//! [`FragConfig::from_env`]. With `LOWPAN_ROOT=1` the receiver acts as the
//! border router and bridges datagrams with a unicast destination instead
//! of reassembling them.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `LOWPAN_SIM_DATAGRAMS` | 20 |
//! | `LOWPAN_SIM_DROP_PERCENT` | 5 |
//! | `LOWPAN_SIM_MAX_LEN` | 600 |

use log::{debug, error, info, warn};
use lowpan_frag::buffer::{BufferKind, BufferRef, PacketPool};
use lowpan_frag::config::{FragConfig, PoolConfig};
use lowpan_frag::lowpan::layers::{LinkError, LinkLayer};
use lowpan_frag::lowpan::loopback::{RecordingBridge, RecordingNetwork};
use lowpan_frag::lowpan::{FragEngine, FragStats, Outcome, RxOutcome};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use std::net::Ipv6Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frames the radio can hold before refusing more.
const RADIO_QUEUE: usize = 16;

/// Time between datagrams.
const SEND_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on the simulated send-done latency.
const MAX_DONE_DELAY_MS: u64 = 5;

/// Shortest datagram the sender generates (room for the destination).
const MIN_LEN: usize = 16;

/// Link layer that puts frames on the simulated air.
struct RadioLink {
    tx: mpsc::Sender<BufferRef>,
}

impl LinkLayer for RadioLink {
    fn submit(&mut self, _pool: &mut PacketPool, frame: BufferRef) -> Result<(), LinkError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => LinkError::Rejected("radio closed"),
        })
    }
}

/// One simulated node.
struct Node {
    pool: PacketPool,
    engine: FragEngine,
    net: RecordingNetwork,
}

impl Node {
    fn new(config: FragConfig) -> Result<Self, lowpan_frag::ConfigError> {
        Ok(Self {
            pool: PacketPool::new(PoolConfig::default())?,
            engine: FragEngine::with_random_tag(config)?,
            net: RecordingNetwork::new(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SimSettings {
    datagrams: usize,
    drop_percent: u32,
    max_len: usize,
}

impl SimSettings {
    fn from_env() -> Self {
        Self {
            datagrams: env_or("LOWPAN_SIM_DATAGRAMS", 20),
            drop_percent: env_or("LOWPAN_SIM_DROP_PERCENT", 5).min(100),
            max_len: env_or("LOWPAN_SIM_MAX_LEN", 600).max(MIN_LEN),
        }
    }
}

/// Final summary printed as JSON.
#[derive(Debug, Serialize)]
struct SimReport {
    datagrams_offered: usize,
    datagrams_accepted: usize,
    frames_on_air: usize,
    frames_lost: usize,
    completed_ok: usize,
    completed_failed: usize,
    delivered: usize,
    delivered_intact: usize,
    bridged_frames: usize,
    sender: FragStats,
    receiver: FragStats,
}

struct Sim {
    settings: SimSettings,
    sender: Node,
    receiver: Node,
    bridge: RecordingBridge,
    link: RadioLink,
    sent_payloads: Vec<Vec<u8>>,
    offered: usize,
    frames_on_air: usize,
    frames_lost: usize,
    awaiting_done: usize,
}

impl Sim {
    /// Build a random datagram on the sender and hand it to its engine.
    fn send_next(&mut self) {
        self.offered += 1;
        let Some(datagram) = self.sender.pool.allocate(BufferKind::Large) else {
            warn!("Sender has no free large buffer, skipping datagram");
            return;
        };

        let bytes = random_datagram(self.offered, self.settings.max_len);
        let filled = self
            .sender
            .pool
            .get_mut(datagram)
            .is_some_and(|packet| packet.set_payload(&bytes).is_ok());
        if !filled {
            warn!("Datagram of {} bytes does not fit a large buffer", bytes.len());
            free(&mut self.sender.pool, datagram);
            return;
        }

        match self
            .sender
            .engine
            .fragment_and_send(&mut self.sender.pool, &mut self.link, datagram)
        {
            Ok(()) => {
                debug!("Datagram #{} ({} bytes) accepted", self.offered, bytes.len());
                self.sent_payloads.push(bytes);
            }
            Err(e) => {
                warn!("Datagram #{} refused: {}", self.offered, e);
                free(&mut self.sender.pool, datagram);
            }
        }
    }

    /// Deliver a burst of frames in shuffled order, losing some.
    fn transmit(
        &mut self,
        mut air: Vec<BufferRef>,
        done_tx: &mpsc::UnboundedSender<(BufferRef, Outcome)>,
    ) {
        shuffle(&mut air);
        for frame in air {
            self.frames_on_air += 1;
            let outcome = if roll(self.settings.drop_percent) {
                self.frames_lost += 1;
                debug!("Radio lost {}", frame);
                Outcome::Failure
            } else {
                self.deliver(frame);
                Outcome::Success
            };

            self.awaiting_done += 1;
            let done_tx = done_tx.clone();
            let delay = Duration::from_millis(1 + OsRng.next_u64() % MAX_DONE_DELAY_MS);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = done_tx.send((frame, outcome));
            });
        }
    }

    /// Copy a frame across the air into the receiver's pool.
    fn deliver(&mut self, frame: BufferRef) {
        let Some(bytes) = self.sender.pool.get(frame).map(|p| p.payload().to_vec()) else {
            warn!("Frame {} vanished before transmission", frame);
            return;
        };
        let Some(copy) = self.receiver.pool.allocate(BufferKind::Frame) else {
            warn!("Receiver out of frame buffers, frame lost");
            return;
        };
        if let Some(packet) = self.receiver.pool.get_mut(copy) {
            if let Err(e) = packet.set_payload(&bytes) {
                warn!("Frame does not fit receiver buffer: {}", e);
                free(&mut self.receiver.pool, copy);
                return;
            }
        }

        let outcome = self.receiver.engine.on_fragment_received(
            &mut self.receiver.pool,
            &mut self.receiver.net,
            &mut self.bridge,
            copy,
        );
        match outcome {
            RxOutcome::Reassembled { tag, size } => {
                info!("Receiver reassembled {} bytes (tag {:#06x})", size, tag)
            }
            RxOutcome::Dropped(e) => warn!("Receiver dropped frame: {}", e),
            other => debug!("Receiver: {:?}", other),
        }
    }

    fn on_send_done(&mut self, frame: BufferRef, outcome: Outcome) {
        self.awaiting_done -= 1;
        if let Err(e) = self.sender.engine.on_fragment_sent(
            &mut self.sender.pool,
            &mut self.sender.net,
            frame,
            outcome,
        ) {
            warn!("Send completion not matched: {}", e);
        }
    }

    fn finished(&self) -> bool {
        self.offered >= self.settings.datagrams && self.awaiting_done == 0
    }

    fn report(&self) -> SimReport {
        let completions = &self.sender.net.completions;
        let delivered = &self.receiver.net.delivered;
        SimReport {
            datagrams_offered: self.offered,
            datagrams_accepted: self.sent_payloads.len(),
            frames_on_air: self.frames_on_air,
            frames_lost: self.frames_lost,
            completed_ok: completions.iter().filter(|(_, o)| o.is_success()).count(),
            completed_failed: completions.iter().filter(|(_, o)| !o.is_success()).count(),
            delivered: delivered.len(),
            delivered_intact: delivered
                .iter()
                .filter(|d| self.sent_payloads.contains(&d.bytes))
                .count(),
            bridged_frames: self.bridge.forwarded.len(),
            sender: self.sender.engine.stats().clone(),
            receiver: self.receiver.engine.stats().clone(),
        }
    }
}

/// A datagram whose first 16 bytes are its destination address.
///
/// Every third datagram goes to the all-nodes multicast group so a border
/// router keeps some traffic for itself.
fn random_datagram(seq: usize, max_len: usize) -> Vec<u8> {
    let len = MIN_LEN + (OsRng.next_u32() as usize) % (max_len - MIN_LEN + 1);
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    let destination = if seq % 3 == 0 {
        Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)
    } else {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, seq as u16)
    };
    bytes[..16].copy_from_slice(&destination.octets());
    bytes
}

fn shuffle(frames: &mut [BufferRef]) {
    for i in (1..frames.len()).rev() {
        let j = (OsRng.next_u32() as usize) % (i + 1);
        frames.swap(i, j);
    }
}

fn roll(percent: u32) -> bool {
    OsRng.next_u32() % 100 < percent
}

fn free(pool: &mut PacketPool, buf: BufferRef) {
    if let Err(e) = pool.free(buf) {
        warn!("Failed to release {}: {}", buf, e);
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring {}={:?}: not a valid value", name, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(not(target_os = "espidf"))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(target_os = "espidf")]
async fn shutdown_signal() {
    std::future::pending::<()>().await
}

#[cfg(not(target_os = "espidf"))]
fn print_report(report: &SimReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize report: {}", e),
    }
}

#[cfg(target_os = "espidf")]
fn print_report(report: &SimReport) {
    info!("{:?}", report);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== 6LoWPAN simulation starting ===");

    let receiver_config = FragConfig::from_env();
    let sender_config = FragConfig {
        is_root: false,
        ..receiver_config
    };
    let settings = SimSettings::from_env();
    info!(
        "{} datagrams up to {} bytes, {}% frame loss",
        settings.datagrams, settings.max_len, settings.drop_percent
    );

    let (sender, receiver) = match (Node::new(sender_config), Node::new(receiver_config)) {
        (Ok(s), Ok(r)) => (s, r),
        (Err(e), _) | (_, Err(e)) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (radio_tx, mut radio_rx) = mpsc::channel(RADIO_QUEUE);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut sim = Sim {
        settings,
        sender,
        receiver,
        bridge: RecordingBridge::new(),
        link: RadioLink { tx: radio_tx },
        sent_payloads: Vec::new(),
        offered: 0,
        frames_on_air: 0,
        frames_lost: 0,
        awaiting_done: 0,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Interrupted, shutting down...");
        signal_cancel.cancel();
    });

    let mut send_timer = tokio::time::interval(SEND_INTERVAL);
    send_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !sim.finished() {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = send_timer.tick(), if sim.offered < sim.settings.datagrams => {
                sim.send_next();
                let mut air = Vec::new();
                while let Ok(frame) = radio_rx.try_recv() {
                    air.push(frame);
                }
                sim.transmit(air, &done_tx);
            }

            Some((frame, outcome)) = done_rx.recv() => {
                sim.on_send_done(frame, outcome);
            }
        }
    }

    let report = sim.report();
    info!(
        "Delivered {} of {} accepted datagrams intact",
        report.delivered_intact, report.datagrams_accepted
    );
    print_report(&report);
    info!("Simulation complete");
}
