//! Endpoint address parsing and formatting.
//!
//! An endpoint address has the form `<nid>:<pid>:<portal>:<tmid>`, for
//! example `192.168.1.10@tcp:12345:30:10`. The network identifier names an
//! IPv4 address on a fabric network (`tcp`, `o2ib`, optionally followed by a
//! network number) or the loopback network `0@lo`. A tmid of `*` requests
//! dynamic assignment when the endpoint is started.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, FabricResult};
use crate::match_bits::TMID_MAX;

/// Fabric network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkKind {
    /// Loopback network.
    Lo = 0,
    /// Socket-based network.
    Tcp = 1,
    /// InfiniBand / RoCE network.
    O2ib = 2,
}

impl NetworkKind {
    fn name(self) -> &'static str {
        match self {
            NetworkKind::Lo => "lo",
            NetworkKind::Tcp => "tcp",
            NetworkKind::O2ib => "o2ib",
        }
    }

    /// Converts the wire code back into a network kind.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(NetworkKind::Lo),
            1 => Some(NetworkKind::Tcp),
            2 => Some(NetworkKind::O2ib),
            _ => None,
        }
    }
}

/// Network identifier: a node address on one fabric network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid {
    /// Network type.
    pub kind: NetworkKind,
    /// Network number, distinguishing several networks of the same type.
    pub net_num: u32,
    /// IPv4 address in host order; always zero for loopback.
    pub addr: u32,
}

impl Nid {
    /// The loopback network identifier `0@lo`.
    pub const LOOPBACK: Nid = Nid {
        kind: NetworkKind::Lo,
        net_num: 0,
        addr: 0,
    };

    /// Creates a TCP network identifier on network number zero.
    pub fn tcp(addr: Ipv4Addr) -> Self {
        Self {
            kind: NetworkKind::Tcp,
            net_num: 0,
            addr: u32::from(addr),
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        let (host, network) = s
            .split_once('@')
            .ok_or_else(|| "network identifier lacks an @network suffix".to_string())?;

        let (kind, digits) = if let Some(rest) = network.strip_prefix("o2ib") {
            (NetworkKind::O2ib, rest)
        } else if let Some(rest) = network.strip_prefix("tcp") {
            (NetworkKind::Tcp, rest)
        } else if let Some(rest) = network.strip_prefix("lo") {
            (NetworkKind::Lo, rest)
        } else {
            return Err(format!("unknown network {:?}", network));
        };

        // Network zero is spelled without digits so that formatting round-trips.
        let net_num = if digits.is_empty() {
            0
        } else if digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("bad network number {:?}", digits));
        } else {
            digits
                .parse::<u32>()
                .map_err(|_| format!("bad network number {:?}", digits))?
        };

        if kind == NetworkKind::Lo {
            if host != "0" || net_num != 0 {
                return Err("loopback identifier must be 0@lo".to_string());
            }
            return Ok(Nid::LOOPBACK);
        }

        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| format!("bad IPv4 address {:?}", host))?;
        Ok(Self {
            kind,
            net_num,
            addr: u32::from(ip),
        })
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == NetworkKind::Lo {
            return write!(f, "0@lo");
        }
        write!(f, "{}@{}", Ipv4Addr::from(self.addr), self.kind.name())?;
        if self.net_num != 0 {
            write!(f, "{}", self.net_num)?;
        }
        Ok(())
    }
}

/// Address of a fabric endpoint (transfer machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddr {
    /// Network identifier of the node.
    pub nid: Nid,
    /// Process identifier on the node.
    pub pid: u32,
    /// Portal number.
    pub portal: u32,
    /// Transfer machine identifier; `None` requests dynamic assignment.
    pub tmid: Option<u32>,
}

impl EndpointAddr {
    /// Creates an address with an explicit transfer machine identifier.
    pub fn new(nid: Nid, pid: u32, portal: u32, tmid: u32) -> Self {
        Self {
            nid,
            pid,
            portal,
            tmid: Some(tmid),
        }
    }

    /// Returns a copy of this address with the given transfer machine identifier.
    pub fn with_tmid(self, tmid: u32) -> Self {
        Self {
            tmid: Some(tmid),
            ..self
        }
    }

    /// Returns a copy with the transfer machine identifier cleared.
    pub fn without_tmid(self) -> Self {
        Self { tmid: None, ..self }
    }

    /// Returns true if both addresses name the same (nid, pid, portal) triple.
    pub fn same_portal(&self, other: &EndpointAddr) -> bool {
        self.nid == other.nid && self.pid == other.pid && self.portal == other.portal
    }

    /// Parses an address string; see the module documentation for the format.
    pub fn parse(s: &str) -> FabricResult<Self> {
        let invalid = |reason: String| FabricError::InvalidAddress {
            addr: s.to_string(),
            reason,
        };

        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 {
            return Err(invalid(format!(
                "expected 4 colon-separated fields, found {}",
                fields.len()
            )));
        }

        let nid = Nid::parse(fields[0]).map_err(invalid)?;
        let pid = fields[1]
            .parse::<u32>()
            .map_err(|_| invalid(format!("bad pid {:?}", fields[1])))?;
        let portal = fields[2]
            .parse::<u32>()
            .map_err(|_| invalid(format!("bad portal {:?}", fields[2])))?;
        let tmid = if fields[3] == "*" {
            None
        } else {
            let tmid = fields[3]
                .parse::<u32>()
                .map_err(|_| invalid(format!("bad transfer machine id {:?}", fields[3])))?;
            if tmid > TMID_MAX {
                return Err(invalid(format!(
                    "transfer machine id {} exceeds {}",
                    tmid, TMID_MAX
                )));
            }
            Some(tmid)
        };

        Ok(Self {
            nid,
            pid,
            portal,
            tmid,
        })
    }
}

impl FromStr for EndpointAddr {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointAddr::parse(s)
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:", self.nid, self.pid, self.portal)?;
        match self.tmid {
            Some(tmid) => write!(f, "{}", tmid),
            None => write!(f, "*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_valid_addresses() {
        let cases = [
            "127.0.0.1@tcp:12345:30:10",
            "127.0.0.1@tcp:12345:30:*",
            "4.4.4.4@tcp:42:29:28",
            "10.0.0.7@o2ib2:1:35:4095",
            "0@lo:12345:31:0",
        ];
        for s in cases {
            let addr = EndpointAddr::parse(s).unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn test_parse_fields() {
        let addr: EndpointAddr = "127.0.0.1@tcp:12345:30:10".parse().unwrap();
        assert_eq!(addr.nid, Nid::tcp(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(addr.pid, 12345);
        assert_eq!(addr.portal, 30);
        assert_eq!(addr.tmid, Some(10));

        let dynamic: EndpointAddr = "127.0.0.1@tcp:12345:30:*".parse().unwrap();
        assert_eq!(dynamic.tmid, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let cases = [
            "notip@tcp:12345:30:10",
            "notnid:12345:30:10",
            "127.0.0.1@tcp:notpid:30:10",
            "127.0.0.1@tcp:12:notportal:10",
            "127.0.0.1@tcp:12:30:nottm",
            "127.0.0.1@tcp:12:30:-10",
            "127.0.0.1@tcp:12:30:4096",
            "127.0.0.1@tcp:12:30",
            "127.0.0.1@ether:12:30:1",
            "1@lo:12:30:1",
            "127.0.0.1@tcp0:12:30:1",
            "127.0.0.1@tcp01:12:30:1",
            "127.0.0.1@o2ib+2:12:30:1",
        ];
        for s in cases {
            let err = EndpointAddr::parse(s).unwrap_err();
            assert!(
                matches!(err, FabricError::InvalidAddress { .. }),
                "{} should be rejected",
                s
            );
        }
    }

    #[test]
    fn test_same_portal_ignores_tmid() {
        let a = EndpointAddr::parse("127.0.0.1@tcp:1:30:5").unwrap();
        let b = a.with_tmid(9);
        assert!(a.same_portal(&b));
        assert_ne!(a, b);
        assert_eq!(a.without_tmid().tmid, None);
    }

    #[test]
    fn test_network_kind_codes() {
        for kind in [NetworkKind::Lo, NetworkKind::Tcp, NetworkKind::O2ib] {
            assert_eq!(NetworkKind::from_code(kind as u8), Some(kind));
        }
        assert_eq!(NetworkKind::from_code(9), None);
    }
}
