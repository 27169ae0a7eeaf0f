// src/filter.rs
use std::fmt;

use crate::config::TargetRule;
use crate::nfqueue_handler::{Direction, PacketMeta};
use crate::tcp::ConnectionObservation;

/// Which packets get diverted to us.
///
/// Rendered with `Display` in the packet-filter language:
/// `outbound && [!]loopback && ip && tcp.DstPort == <port> && tcp.PayloadLength > 0`.
/// The loopback clause is taken literally: `loopback` selects loopback
/// traffic only, `!loopback` excludes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub port: u16,
    pub loopback: bool,
}

impl Filter {
    pub fn from_rule(rule: &TargetRule) -> Self {
        Self {
            port: rule.port,
            loopback: rule.include_loopback,
        }
    }

    pub fn matches(&self, obs: &ConnectionObservation<'_>, meta: &PacketMeta) -> bool {
        meta.direction == Direction::Outbound
            && meta.loopback == self.loopback
            && obs.dst_port == self.port
            && !obs.payload.is_empty()
    }

    /// Arguments for `iptables` that send the candidate packets to `queue_num`.
    /// The payload-length clause cannot be expressed there and is checked
    /// in userspace by [`Filter::matches`].
    pub fn iptables_rule(&self, queue_num: u16) -> Vec<String> {
        let mut args: Vec<String> = ["OUTPUT", "-p", "tcp", "--dport"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(self.port.to_string());
        if !self.loopback {
            args.push("!".to_string());
        }
        args.extend(["-o", "lo", "-j", "NFQUEUE", "--queue-num"].iter().map(|s| s.to_string()));
        args.push(queue_num.to_string());
        args.push("--queue-bypass".to_string());
        args
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outbound && {}loopback && ip && tcp.DstPort == {} && tcp.PayloadLength > 0",
            if self.loopback { "" } else { "!" },
            self.port
        )
    }
}
