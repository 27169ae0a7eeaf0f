// src/tcp.rs
use std::net::Ipv4Addr;

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame too short for an IPv4 header")]
    Truncated,
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("bad IPv4 header length {0}")]
    BadIpHeaderLength(u8),
    #[error("bad IPv4 total length {total} for a {captured} byte frame")]
    BadTotalLength { total: usize, captured: usize },
    #[error("not a TCP packet (protocol {0})")]
    NotTcp(u8),
    #[error("bad TCP data offset {0}")]
    BadDataOffset(u8),
}

/// What a single client-to-server segment tells us about its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionObservation<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub payload: &'a [u8],
}

impl<'a> ConnectionObservation<'a> {
    pub fn from_packets(ip: &Ipv4Packet, tcp: &TcpPacket, payload: &'a [u8]) -> Self {
        Self {
            src_ip: ip.get_source(),
            dst_ip: ip.get_destination(),
            src_port: tcp.get_source(),
            dst_port: tcp.get_destination(),
            seq: tcp.get_sequence(),
            ack: tcp.get_acknowledgement(),
            payload,
        }
    }

    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }
}

/// Splits a raw IPv4 frame into its TCP connection fields and payload.
///
/// The payload ends where the IPv4 total length says it does; trailing
/// bytes in the capture (link padding) are ignored.
pub fn parse_headers(raw: &[u8]) -> Result<ConnectionObservation<'_>, ParseError> {
    let ip = Ipv4Packet::new(raw).ok_or(ParseError::Truncated)?;

    if ip.get_version() != 4 {
        return Err(ParseError::NotIpv4(ip.get_version()));
    }
    let ihl = ip.get_header_length();
    let ip_header_len = ihl as usize * 4;
    if ip_header_len < IPV4_HEADER_LEN {
        return Err(ParseError::BadIpHeaderLength(ihl));
    }

    let total_len = ip.get_total_length() as usize;
    if total_len > raw.len() || total_len < ip_header_len + TCP_HEADER_LEN {
        return Err(ParseError::BadTotalLength {
            total: total_len,
            captured: raw.len(),
        });
    }

    let protocol = ip.get_next_level_protocol();
    if protocol != IpNextHeaderProtocols::Tcp {
        return Err(ParseError::NotTcp(protocol.0));
    }

    let segment = &raw[ip_header_len..total_len];
    let tcp = TcpPacket::new(segment).ok_or(ParseError::Truncated)?;
    let data_offset = tcp.get_data_offset();
    let tcp_header_len = data_offset as usize * 4;
    if tcp_header_len < TCP_HEADER_LEN || tcp_header_len > segment.len() {
        return Err(ParseError::BadDataOffset(data_offset));
    }

    Ok(ConnectionObservation::from_packets(
        &ip,
        &tcp,
        &segment[tcp_header_len..],
    ))
}
