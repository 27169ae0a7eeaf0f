// src/forge.rs - forged RST / redirect / FIN packets
use std::net::Ipv4Addr;

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::tcp::{MutableTcpPacket, TcpFlags};
use thiserror::Error;

use crate::config::{Config, TargetRule};
use crate::nfqueue_handler::Direction;
use crate::tcp::{ConnectionObservation, IPV4_HEADER_LEN, TCP_HEADER_LEN};

const HEADERS_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;
const REDIRECT_BODY: &str = "302";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForgeError {
    #[error("{kind:?} packet is {len} bytes, path MTU is {mtu}")]
    ExceedsMtu {
        kind: ForgedKind,
        len: usize,
        mtu: usize,
    },
    #[error("{kind:?} payload of {len} bytes does not fit in an IPv4 packet")]
    PayloadTooLarge { kind: ForgedKind, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgedKind {
    /// RST+ACK to the server, posing as the client.
    Reset,
    /// PSH+ACK carrying the 302 response, posing as the server.
    Redirect,
    /// FIN+ACK to the client, posing as the server.
    Finish,
}

impl ForgedKind {
    pub const ALL: [ForgedKind; 3] = [ForgedKind::Reset, ForgedKind::Redirect, ForgedKind::Finish];

    fn flags(self) -> u8 {
        match self {
            ForgedKind::Reset => TcpFlags::RST | TcpFlags::ACK,
            ForgedKind::Redirect => TcpFlags::PSH | TcpFlags::ACK,
            ForgedKind::Finish => TcpFlags::FIN | TcpFlags::ACK,
        }
    }

    /// Server-bound packets leave the host, client-bound ones are delivered to it.
    pub fn direction(self) -> Direction {
        match self {
            ForgedKind::Reset => Direction::Outbound,
            ForgedKind::Redirect | ForgedKind::Finish => Direction::Inbound,
        }
    }
}

/// The literal 302 response. The body is always `302`, so `Content-Length:3`
/// holds whatever the replacement host is.
pub fn redirect_response(replacement_host: &str, date: &str) -> String {
    format!(
        "HTTP/1.1 302 Found\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Location: http://{}\r\n\
         Date: {}\r\n\
         Content-Length:{}\r\n\
         \r\n\
         {}",
        replacement_host,
        date,
        REDIRECT_BODY.len(),
        REDIRECT_BODY
    )
}

pub fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Per-connection header values written into a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampFields {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
}

/// Addressing and sequence numbers for all three forged packets, derived from
/// one observed client-to-server segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HijackContext {
    pub reset: StampFields,
    pub redirect: StampFields,
    pub finish: StampFields,
}

impl HijackContext {
    pub fn from_observation(obs: &ConnectionObservation<'_>, port: u16, redirect_len: u32) -> Self {
        let client_next = obs.seq.wrapping_add(obs.payload_len());
        // The client's ack is the server's next sequence number.
        let server_next = obs.ack;

        let reset = StampFields {
            src_ip: obs.src_ip,
            dst_ip: obs.dst_ip,
            src_port: obs.src_port,
            dst_port: port,
            seq: obs.seq,
            ack: obs.ack,
        };
        let redirect = StampFields {
            src_ip: obs.dst_ip,
            dst_ip: obs.src_ip,
            src_port: port,
            dst_port: obs.src_port,
            seq: server_next,
            ack: client_next,
        };
        let finish = StampFields {
            seq: server_next.wrapping_add(redirect_len),
            ..redirect
        };

        Self {
            reset,
            redirect,
            finish,
        }
    }

    pub fn fields(&self, kind: ForgedKind) -> &StampFields {
        match kind {
            ForgedKind::Reset => &self.reset,
            ForgedKind::Redirect => &self.redirect,
            ForgedKind::Finish => &self.finish,
        }
    }
}

/// Fixed IPv4+TCP skeleton (and payload, for the redirect). Never mutated
/// after construction; [`ForgedPacketTemplate::stamp`] works on a copy.
#[derive(Debug, Clone)]
pub struct ForgedPacketTemplate {
    kind: ForgedKind,
    bytes: Vec<u8>,
}

impl ForgedPacketTemplate {
    pub fn build(kind: ForgedKind, ttl: u8, payload: &[u8]) -> Result<Self, ForgeError> {
        let total = HEADERS_LEN + payload.len();
        if total > u16::MAX as usize {
            return Err(ForgeError::PayloadTooLarge {
                kind,
                len: payload.len(),
            });
        }

        let mut bytes = vec![0u8; total];
        let (ip_bytes, tcp_bytes) = bytes.split_at_mut(IPV4_HEADER_LEN);
        if let Some(mut ip) = MutableIpv4Packet::new(ip_bytes) {
            ip.set_version(4);
            ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
            ip.set_total_length(total as u16);
            ip.set_ttl(ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        }
        if let Some(mut tcp) = MutableTcpPacket::new(tcp_bytes) {
            tcp.set_data_offset((TCP_HEADER_LEN / 4) as u8);
            tcp.set_flags(kind.flags());
        }
        bytes[HEADERS_LEN..].copy_from_slice(payload);

        Ok(Self { kind, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADERS_LEN..]
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copies the template into `out` and writes every per-connection field.
    /// Checksums are left zeroed for the transport to fill in.
    pub fn stamp(&self, fields: &StampFields, mtu: usize, out: &mut Vec<u8>) -> Result<(), ForgeError> {
        out.clear();
        if self.bytes.len() > mtu {
            return Err(ForgeError::ExceedsMtu {
                kind: self.kind,
                len: self.bytes.len(),
                mtu,
            });
        }
        out.extend_from_slice(&self.bytes);

        let (ip_bytes, tcp_bytes) = out.split_at_mut(IPV4_HEADER_LEN);
        if let Some(mut ip) = MutableIpv4Packet::new(ip_bytes) {
            ip.set_source(fields.src_ip);
            ip.set_destination(fields.dst_ip);
        }
        if let Some(mut tcp) = MutableTcpPacket::new(tcp_bytes) {
            tcp.set_source(fields.src_port);
            tcp.set_destination(fields.dst_port);
            tcp.set_sequence(fields.seq);
            tcp.set_acknowledgement(fields.ack);
        }
        Ok(())
    }
}

/// The three templates plus what is needed to derive their stamp values.
#[derive(Debug, Clone)]
pub struct PacketForge {
    reset: ForgedPacketTemplate,
    redirect: ForgedPacketTemplate,
    finish: ForgedPacketTemplate,
    port: u16,
    mtu: usize,
}

impl PacketForge {
    pub fn new(config: &Config) -> Result<Self, ForgeError> {
        let date = config.settings.date.clone().unwrap_or_else(http_date_now);
        Self::with_date(&config.rule, config.settings.ttl, config.settings.mtu, &date)
    }

    pub fn with_date(rule: &TargetRule, ttl: u8, mtu: usize, date: &str) -> Result<Self, ForgeError> {
        let response = redirect_response(&rule.replacement_host, date);
        let forge = Self {
            reset: ForgedPacketTemplate::build(ForgedKind::Reset, ttl, &[])?,
            redirect: ForgedPacketTemplate::build(ForgedKind::Redirect, ttl, response.as_bytes())?,
            finish: ForgedPacketTemplate::build(ForgedKind::Finish, ttl, &[])?,
            port: rule.port,
            mtu,
        };

        if forge.redirect.len() > mtu {
            log::warn!(
                "Redirect packet is {} bytes, above the {} byte MTU; matches will not be redirected",
                forge.redirect.len(),
                mtu
            );
        }
        Ok(forge)
    }

    pub fn template(&self, kind: ForgedKind) -> &ForgedPacketTemplate {
        match kind {
            ForgedKind::Reset => &self.reset,
            ForgedKind::Redirect => &self.redirect,
            ForgedKind::Finish => &self.finish,
        }
    }

    pub fn context(&self, obs: &ConnectionObservation<'_>) -> HijackContext {
        HijackContext::from_observation(obs, self.port, self.redirect.payload().len() as u32)
    }

    /// Stamps `kind` for `ctx` into `out`, returning the direction it travels.
    pub fn stamp(&self, kind: ForgedKind, ctx: &HijackContext, out: &mut Vec<u8>) -> Result<Direction, ForgeError> {
        self.template(kind).stamp(ctx.fields(kind), self.mtu, out)?;
        Ok(kind.direction())
    }
}
