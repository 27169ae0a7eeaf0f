use anyhow::Result;
use log::{debug, info, warn};

use crate::classifier;
use crate::config::Config;
use crate::filter::Filter;
use crate::forge::{ForgedKind, HijackContext, PacketForge};
use crate::nfqueue_handler::{PacketMeta, Transport};
use crate::tcp::{self, ConnectionObservation, ParseError};

/// Largest IPv4 packet; the receive buffer is allocated once at this size.
pub const MAX_PACKET: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Malformed,
    FilterMismatch,
    NoMatch,
}

/// What one loop cycle did with the packet it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    RecvFailed,
    Passed(PassReason),
    /// The connection was hijacked; `sent` of the three forged packets went out.
    Hijacked { sent: u8 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub received: u64,
    pub recv_failures: u64,
    pub passed: u64,
    pub hijacked: u64,
    pub send_failures: u64,
}

pub struct Interceptor<T: Transport> {
    transport: T,
    filter: Filter,
    target_host: String,
    forge: PacketForge,
    recv_buf: Box<[u8]>,
    scratch: Vec<u8>,
    stats: Stats,
}

impl<T: Transport> Interceptor<T> {
    pub fn new(transport: T, config: &Config, forge: PacketForge) -> Self {
        Self {
            transport,
            filter: Filter::from_rule(&config.rule),
            target_host: config.rule.target_host.clone(),
            forge,
            recv_buf: vec![0u8; MAX_PACKET].into_boxed_slice(),
            scratch: Vec::with_capacity(MAX_PACKET),
            stats: Stats::default(),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// Receives and fully handles one packet.
    pub fn step(&mut self) -> Outcome {
        let (len, meta) = match self.transport.recv(&mut self.recv_buf) {
            Ok(received) => received,
            Err(e) => {
                self.stats.recv_failures += 1;
                warn!("Failed to read packet: {}", e);
                return Outcome::RecvFailed;
            }
        };
        self.stats.received += 1;

        let Self {
            transport,
            filter,
            target_host,
            forge,
            recv_buf,
            scratch,
            stats,
        } = self;
        let packet = &recv_buf[..len];

        let verdict = classify(packet, &meta, filter, target_host);
        let outcome = match verdict {
            Err(reason) => {
                stats.passed += 1;
                if let Err(e) = transport.reinject(packet, &meta) {
                    warn!("Failed to reinject packet: {}", e);
                }
                Outcome::Passed(reason)
            }
            Ok(obs) => {
                let ctx = forge.context(&obs);
                info!(
                    "Hijacking {}:{} -> {}:{}",
                    obs.src_ip, obs.src_port, obs.dst_ip, obs.dst_port
                );
                let sent = hijack(transport, forge, &ctx, &meta, scratch, stats);

                // The request itself must not reach the server.
                if let Err(e) = transport.discard(&meta) {
                    warn!("Failed to drop hijacked request: {}", e);
                }
                stats.hijacked += 1;
                info!(
                    "Sent {}/3 forged packets ({} hijacked, {} passed so far)",
                    sent, stats.hijacked, stats.passed
                );
                Outcome::Hijacked { sent }
            }
        };

        debug!("{:?} {:?}", outcome, self.stats);
        outcome
    }
}

fn classify<'a>(
    packet: &'a [u8],
    meta: &PacketMeta,
    filter: &Filter,
    target_host: &str,
) -> Result<ConnectionObservation<'a>, PassReason> {
    let obs = tcp::parse_headers(packet).map_err(|e: ParseError| {
        debug!("Passing unparsable packet: {}", e);
        PassReason::Malformed
    })?;

    if !filter.matches(&obs, meta) {
        debug!("Passing packet outside filter {}", filter);
        return Err(PassReason::FilterMismatch);
    }

    if !classifier::matches(obs.payload, target_host) {
        return Err(PassReason::NoMatch);
    }
    Ok(obs)
}

// Each forged packet is attempted regardless of how the previous one went.
fn hijack<T: Transport>(
    transport: &mut T,
    forge: &PacketForge,
    ctx: &HijackContext,
    meta: &PacketMeta,
    scratch: &mut Vec<u8>,
    stats: &mut Stats,
) -> u8 {
    let mut sent = 0;
    for kind in ForgedKind::ALL {
        match send_forged(transport, forge, kind, ctx, meta, scratch) {
            Ok(()) => sent += 1,
            Err(e) => {
                stats.send_failures += 1;
                warn!("Failed to send {:?} packet: {}", kind, e);
            }
        }
    }
    sent
}

fn send_forged<T: Transport>(
    transport: &mut T,
    forge: &PacketForge,
    kind: ForgedKind,
    ctx: &HijackContext,
    meta: &PacketMeta,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let direction = forge.stamp(kind, ctx, scratch)?;
    let out_meta = meta.reversed(direction);
    // Checksums cover the final stamped bytes.
    transport.compute_checksums(scratch, &out_meta)?;
    transport.send(scratch, &out_meta)?;
    Ok(())
}
