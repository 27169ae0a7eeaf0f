use std::io;
use std::net::IpAddr;
use std::process::Command;

use log::{debug, info, warn};
use nfq::{Message, Queue, Verdict};
use pnet::datalink;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::transport::{transport_channel, TransportChannelType, TransportSender};
use thiserror::Error;

use crate::config::Settings;
use crate::filter::Filter;
use crate::packet;
use crate::tcp::ParseError;

const RAW_SOCKET_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open NFQUEUE: {0}")]
    Open(#[source] io::Error),
    #[error("failed to bind NFQUEUE {queue}: {source}")]
    Bind {
        queue: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to open raw socket: {0}")]
    RawSocket(#[source] io::Error),
    #[error("iptables {0}")]
    Iptables(String),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("verdict failed: {0}")]
    Verdict(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("no packet awaiting a verdict")]
    NoPending,
    #[error("packet of {len} bytes does not fit the {cap} byte buffer")]
    Oversized { len: usize, cap: usize },
    #[error("malformed packet: {0}")]
    Malformed(#[from] ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Leaving this host.
    Outbound,
    /// Delivered to this host.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub direction: Direction,
    pub loopback: bool,
}

impl PacketMeta {
    pub fn outbound(loopback: bool) -> Self {
        Self {
            direction: Direction::Outbound,
            loopback,
        }
    }

    #[cfg(test)]
    pub fn inbound(loopback: bool) -> Self {
        Self {
            direction: Direction::Inbound,
            loopback,
        }
    }

    /// Same packet class, travelling the other way.
    pub fn reversed(&self, direction: Direction) -> Self {
        Self {
            direction,
            loopback: self.loopback,
        }
    }
}

/// Packet capture and injection.
///
/// Every packet handed out by `recv` must be answered with exactly one of
/// `reinject` or `discard` before the next `recv`.
pub trait Transport {
    /// Blocks until the next diverted packet and copies it into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, PacketMeta), TransportError>;

    /// Lets the last received packet continue unchanged.
    fn reinject(&mut self, packet: &[u8], meta: &PacketMeta) -> Result<(), TransportError>;

    /// Drops the last received packet.
    fn discard(&mut self, meta: &PacketMeta) -> Result<(), TransportError>;

    /// Injects a forged packet.
    fn send(&mut self, packet: &[u8], meta: &PacketMeta) -> Result<(), TransportError>;

    /// Fills in IPv4 and TCP checksums in place. `meta.direction` tells
    /// transports that checksum differently per direction which way it goes.
    fn compute_checksums(&self, packet: &mut [u8], _meta: &PacketMeta) -> Result<(), TransportError> {
        packet::compute_checksums(packet)?;
        Ok(())
    }
}

/// Whether a queued packet travels over the loopback interface.
///
/// The output interface decides when the kernel reports one: traffic to this
/// host's own non-127 addresses also leaves through `lo`. Without an
/// interface index the 127.0.0.0/8 addresses are the only hint.
pub fn is_loopback(outdev: u32, loopback_index: Option<u32>, packet: &[u8]) -> bool {
    match loopback_index {
        Some(index) if outdev != 0 => outdev == index,
        _ => Ipv4Packet::new(packet)
            .map(|ip| ip.get_source().is_loopback() || ip.get_destination().is_loopback())
            .unwrap_or(false),
    }
}

fn loopback_index() -> Option<u32> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.is_loopback())
        .map(|iface| iface.index)
}

/// An `iptables` rule diverting packets into the queue. Removed on drop.
#[derive(Debug)]
pub struct IptablesRule {
    args: Vec<String>,
}

impl IptablesRule {
    pub fn install(args: Vec<String>) -> Result<Self, TransportError> {
        run_iptables("-I", &args)?;
        info!("Installed iptables rule: {}", args.join(" "));
        Ok(Self { args })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Drop for IptablesRule {
    fn drop(&mut self) {
        remove_rule(&self.args);
    }
}

/// Deletes a rule previously installed with `args`. Failures are only logged.
pub fn remove_rule(args: &[String]) {
    match run_iptables("-D", args) {
        Ok(()) => info!("Removed iptables rule: {}", args.join(" ")),
        Err(e) => warn!("Failed to remove iptables rule: {}", e),
    }
}

fn run_iptables(action: &str, args: &[String]) -> Result<(), TransportError> {
    let status = Command::new("iptables")
        .arg(action)
        .args(args)
        .status()
        .map_err(|e| TransportError::Iptables(format!("could not run: {}", e)))?;

    if !status.success() {
        return Err(TransportError::Iptables(format!(
            "{} {} exited with {}",
            action,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

/// Captures through NFQUEUE, injects through a layer-3 raw socket.
pub struct NfqueueTransport {
    queue: Queue,
    queue_num: u16,
    pending: Option<Message>,
    sender: TransportSender,
    rule: Option<IptablesRule>,
    loopback_index: Option<u32>,
}

impl NfqueueTransport {
    pub fn open(filter: &Filter, settings: &Settings) -> Result<Self, TransportError> {
        let mut queue = Queue::open().map_err(TransportError::Open)?;
        queue.bind(settings.queue_num).map_err(|source| TransportError::Bind {
            queue: settings.queue_num,
            source,
        })?;

        let (sender, _) = transport_channel(
            RAW_SOCKET_BUFFER,
            TransportChannelType::Layer3(IpNextHeaderProtocols::Tcp),
        )
        .map_err(TransportError::RawSocket)?;

        let rule = if settings.manage_iptables {
            Some(IptablesRule::install(filter.iptables_rule(settings.queue_num))?)
        } else {
            info!(
                "Not managing iptables; divert matching traffic to queue {} yourself",
                settings.queue_num
            );
            None
        };

        let loopback_index = loopback_index();
        if loopback_index.is_none() {
            warn!("No loopback interface found, classifying loopback traffic by address");
        }

        info!("NFQUEUE {} open for: {}", settings.queue_num, filter);

        Ok(Self {
            queue,
            queue_num: settings.queue_num,
            pending: None,
            sender,
            rule,
            loopback_index,
        })
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }

    pub fn rule(&self) -> Option<&IptablesRule> {
        self.rule.as_ref()
    }

    fn finish_pending(&mut self, verdict: Verdict) -> Result<(), TransportError> {
        let mut msg = self.pending.take().ok_or(TransportError::NoPending)?;
        msg.set_verdict(verdict);
        self.queue.verdict(msg).map_err(TransportError::Verdict)
    }
}

impl Transport for NfqueueTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, PacketMeta), TransportError> {
        if self.pending.is_some() {
            warn!("Previous packet had no verdict, accepting it");
            self.finish_pending(Verdict::Accept)?;
        }

        let msg = self.queue.recv().map_err(TransportError::Recv)?;
        let len = msg.get_payload().len();
        let loopback = is_loopback(msg.get_outdev(), self.loopback_index, msg.get_payload());

        self.pending = Some(msg);
        if len > buf.len() {
            self.finish_pending(Verdict::Accept)?;
            return Err(TransportError::Oversized { len, cap: buf.len() });
        }

        if let Some(msg) = self.pending.as_ref() {
            buf[..len].copy_from_slice(msg.get_payload());
        }
        // Only the OUTPUT chain feeds the queue.
        Ok((len, PacketMeta::outbound(loopback)))
    }

    fn reinject(&mut self, _packet: &[u8], _meta: &PacketMeta) -> Result<(), TransportError> {
        self.finish_pending(Verdict::Accept)
    }

    fn discard(&mut self, _meta: &PacketMeta) -> Result<(), TransportError> {
        self.finish_pending(Verdict::Drop)
    }

    fn send(&mut self, packet: &[u8], meta: &PacketMeta) -> Result<(), TransportError> {
        let ip = Ipv4Packet::new(packet).ok_or(ParseError::Truncated)?;
        let destination = ip.get_destination();
        debug!(
            "Injecting {} bytes {:?} to {}",
            packet.len(),
            meta.direction,
            destination
        );
        self.sender
            .send_to(ip, IpAddr::V4(destination))
            .map_err(TransportError::Send)?;
        Ok(())
    }
}

impl Drop for NfqueueTransport {
    fn drop(&mut self) {
        if self.pending.is_some() {
            if let Err(e) = self.finish_pending(Verdict::Accept) {
                warn!("Failed to release pending packet: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetRule;
    use crate::tcp::{self, tests::build_segment};
    use std::net::Ipv4Addr;

    const LO: u32 = 1;
    const ETH: u32 = 2;

    #[test]
    fn test_loopback_from_output_interface() {
        let own = Ipv4Addr::new(192, 168, 1, 10);
        let packet = build_segment((own, 51000), (own, 80), 1, 2, b"GET");
        assert!(is_loopback(LO, Some(LO), &packet));
        assert!(!is_loopback(ETH, Some(LO), &packet));

        let local = build_segment((Ipv4Addr::LOCALHOST, 51000), (Ipv4Addr::LOCALHOST, 80), 1, 2, b"GET");
        assert!(is_loopback(LO, Some(LO), &local));
    }

    #[test]
    fn test_loopback_falls_back_to_addresses() {
        let local = build_segment((Ipv4Addr::LOCALHOST, 51000), (Ipv4Addr::LOCALHOST, 80), 1, 2, b"GET");
        let remote = build_segment(
            (Ipv4Addr::new(192, 168, 1, 10), 51000),
            (Ipv4Addr::new(93, 184, 216, 34), 80),
            1,
            2,
            b"GET",
        );
        assert!(is_loopback(0, Some(LO), &local));
        assert!(is_loopback(ETH, None, &local));
        assert!(!is_loopback(0, None, &remote));
        assert!(!is_loopback(0, None, &[0u8; 4]));
    }

    #[test]
    fn test_lo_traffic_to_own_address_passes_loopback_filter() {
        let rule = |include_loopback| TargetRule {
            port: 80,
            target_host: "blocked.example".to_string(),
            replacement_host: "r.example".to_string(),
            include_loopback,
        };
        let own = Ipv4Addr::new(192, 168, 1, 10);
        let packet = build_segment((own, 51000), (own, 80), 1, 2, b"GET / HTTP/1.1\r\n\r\n");
        let obs = tcp::parse_headers(&packet).unwrap();
        let meta = PacketMeta::outbound(is_loopback(LO, Some(LO), &packet));

        assert!(Filter::from_rule(&rule(true)).matches(&obs, &meta));
        assert!(!Filter::from_rule(&rule(false)).matches(&obs, &meta));
    }

    #[test]
    fn test_meta_reversed() {
        let meta = PacketMeta::outbound(true);
        let back = meta.reversed(Direction::Inbound);
        assert_eq!(back, PacketMeta::inbound(true));
    }

    #[test]
    fn test_default_checksums() {
        struct Null;
        impl Transport for Null {
            fn recv(&mut self, _: &mut [u8]) -> Result<(usize, PacketMeta), TransportError> {
                Err(TransportError::NoPending)
            }
            fn reinject(&mut self, _: &[u8], _: &PacketMeta) -> Result<(), TransportError> {
                Ok(())
            }
            fn discard(&mut self, _: &PacketMeta) -> Result<(), TransportError> {
                Ok(())
            }
            fn send(&mut self, _: &[u8], _: &PacketMeta) -> Result<(), TransportError> {
                Ok(())
            }
        }

        let mut short = vec![0u8; 8];
        let err = Null
            .compute_checksums(&mut short, &PacketMeta::outbound(false))
            .unwrap_err();
        assert!(matches!(err, TransportError::Malformed(ParseError::Truncated)));
    }
}
