use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket};

use crate::tcp::ParseError;

/// Fills in the IPv4 header checksum and the TCP checksum (with pseudo-header)
/// of a complete IPv4/TCP packet, in place.
pub fn compute_checksums(packet: &mut [u8]) -> Result<(), ParseError> {
    let (ip_header_len, total_len) = lengths(packet)?;

    let (src, dst) = {
        let mut ip = MutableIpv4Packet::new(&mut packet[..total_len]).ok_or(ParseError::Truncated)?;
        ip.set_checksum(0);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
        (ip.get_source(), ip.get_destination())
    };

    let mut segment = MutableTcpPacket::new(&mut packet[ip_header_len..total_len])
        .ok_or(ParseError::Truncated)?;
    segment.set_checksum(0);
    let checksum = tcp::ipv4_checksum(&segment.to_immutable(), &src, &dst);
    segment.set_checksum(checksum);

    Ok(())
}

/// True when both stored checksums match the packet contents.
#[cfg(test)]
pub fn checksums_valid(packet: &[u8]) -> bool {
    use pnet::packet::tcp::TcpPacket;

    let Ok((ip_header_len, total_len)) = lengths(packet) else {
        return false;
    };
    let Some(ip) = Ipv4Packet::new(&packet[..total_len]) else {
        return false;
    };
    let Some(segment) = TcpPacket::new(&packet[ip_header_len..total_len]) else {
        return false;
    };

    ip.get_checksum() == ipv4::checksum(&ip)
        && segment.get_checksum()
            == tcp::ipv4_checksum(&segment, &ip.get_source(), &ip.get_destination())
}

fn lengths(packet: &[u8]) -> Result<(usize, usize), ParseError> {
    let ip = Ipv4Packet::new(packet).ok_or(ParseError::Truncated)?;
    let ip_header_len = ip.get_header_length() as usize * 4;
    let total_len = ip.get_total_length() as usize;

    if ip_header_len < crate::tcp::IPV4_HEADER_LEN {
        return Err(ParseError::BadIpHeaderLength(ip.get_header_length()));
    }
    if total_len > packet.len() || total_len < ip_header_len + crate::tcp::TCP_HEADER_LEN {
        return Err(ParseError::BadTotalLength {
            total: total_len,
            captured: packet.len(),
        });
    }
    Ok((ip_header_len, total_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::tests::build_segment;
    use std::net::Ipv4Addr;

    fn segment() -> Vec<u8> {
        build_segment(
            (Ipv4Addr::new(192, 168, 0, 2), 40000),
            (Ipv4Addr::new(198, 51, 100, 7), 80),
            7,
            9,
            b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
        )
    }

    #[test]
    fn test_compute_checksums() {
        let mut packet = segment();
        compute_checksums(&mut packet).unwrap();
        assert!(checksums_valid(&packet));
    }

    #[test]
    fn test_checksum_detects_modification() {
        let mut packet = segment();
        compute_checksums(&mut packet).unwrap();

        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(!checksums_valid(&packet));

        compute_checksums(&mut packet).unwrap();
        assert!(checksums_valid(&packet));
    }

    #[test]
    fn test_odd_length_payload() {
        let mut packet = build_segment(
            (Ipv4Addr::new(10, 1, 1, 1), 1234),
            (Ipv4Addr::new(10, 2, 2, 2), 80),
            1,
            1,
            b"abc",
        );
        compute_checksums(&mut packet).unwrap();
        assert!(checksums_valid(&packet));
    }

    #[test]
    fn test_compute_checksums_rejects_short_buffer() {
        let mut short = [0x45u8; 12];
        assert_eq!(compute_checksums(&mut short), Err(ParseError::Truncated));
    }
}
