//! Packet filtering.
//!
//! Two layers: the named filter tree supplying the spoofed / erratic /
//! unrouted exclusion predicates workers apply to admitted packets, and
//! a small BPF-style expression filter the capture pump applies before
//! dispatch.

use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;

use tracemill_plugin::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use tracemill_plugin::{FlowKey, Packet};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("empty filter expression")]
    Empty,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("expected {0} after '{1}'")]
    MissingOperand(&'static str, &'static str),

    #[error("invalid address '{0}'")]
    BadAddress(String),

    #[error("invalid network '{0}'")]
    BadNetwork(String),

    #[error("unbalanced parentheses")]
    UnbalancedParens,

    #[error("trailing input after expression: '{0}'")]
    TrailingInput(String),
}

/// Which built-in predicate tree the worker filters come from.
///
/// The `telescope` tree is tuned for darknet captures and additionally
/// treats common scanning chatter as erratic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterTree {
    Standard,
    Telescope,
}

/// Per-worker filter handle built from `tree_filter_name`.
#[derive(Debug, Clone, Copy)]
pub struct CustomFilters {
    tree: FilterTree,
}

impl CustomFilters {
    pub fn new(tree_name: Option<&str>) -> Self {
        let tree = match tree_name {
            None | Some("standard") => FilterTree::Standard,
            Some("telescope") => FilterTree::Telescope,
            Some(other) => {
                warn!("unknown filter tree '{other}', using the standard tree");
                FilterTree::Standard
            }
        };
        Self { tree }
    }

    /// Source addresses that cannot legitimately originate traffic.
    pub fn spoofed(&self, packet: &Packet) -> bool {
        let Some(flow) = &packet.flow else {
            return false;
        };
        if flow.src_ip == flow.dst_ip {
            return true;
        }
        match flow.src_ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_multicast()
                    || v4.is_broadcast()
                    || v4.is_link_local()
                    || v4.octets()[0] == 0
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_multicast() || v6.is_unspecified(),
        }
    }

    /// Traffic patterns that pollute interval summaries.
    pub fn erratic(&self, packet: &Packet) -> bool {
        let Some(flow) = &packet.flow else {
            return false;
        };
        if (flow.proto == PROTO_TCP || flow.proto == PROTO_UDP)
            && (flow.src_port == 0 || flow.dst_port == 0)
        {
            return true;
        }
        match self.tree {
            FilterTree::Standard => false,
            FilterTree::Telescope => {
                // NetBIOS and SSDP background noise drowns darknet signal
                flow.proto == PROTO_UDP
                    && matches!(flow.dst_port, 137 | 138 | 1900)
            }
        }
    }

    /// Source addresses from space that is never routed globally.
    pub fn unrouted(&self, packet: &Packet) -> bool {
        let Some(flow) = &packet.flow else {
            return false;
        };
        match flow.src_ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                v4.is_private()
                    || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                    || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
                    || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
            }
            IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
        }
    }
}

/// Compiled packet-selection predicate, a conjunction/alternation
/// grammar over a handful of primitives:
///
/// ```text
/// expr    := term ('or' term)*
/// term    := unary ('and' unary)*
/// unary   := 'not' unary | '(' expr ')' | primary
/// primary := 'tcp' | 'udp' | 'icmp' | 'port' N | 'src' 'port' N
///          | 'dst' 'port' N | 'host' A | 'net' A/len
/// ```
#[derive(Debug)]
pub struct BpfFilter {
    root: Expr,
}

#[derive(Debug)]
enum Expr {
    Proto(u8),
    Port(u16),
    SrcPort(u16),
    DstPort(u16),
    Host(IpAddr),
    Net(IpAddr, u8),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl BpfFilter {
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(FilterError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(FilterError::TrailingInput(extra.to_string()));
        }
        Ok(Self { root })
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        eval(&self.root, packet.flow.as_ref())
    }
}

fn eval(expr: &Expr, flow: Option<&FlowKey>) -> bool {
    match expr {
        Expr::Not(inner) => !eval(inner, flow),
        Expr::And(a, b) => eval(a, flow) && eval(b, flow),
        Expr::Or(a, b) => eval(a, flow) || eval(b, flow),
        _ => {
            let Some(flow) = flow else {
                return false;
            };
            match expr {
                Expr::Proto(proto) => flow.proto == *proto,
                Expr::Port(port) => flow.src_port == *port || flow.dst_port == *port,
                Expr::SrcPort(port) => flow.src_port == *port,
                Expr::DstPort(port) => flow.dst_port == *port,
                Expr::Host(addr) => flow.src_ip == *addr || flow.dst_ip == *addr,
                Expr::Net(addr, len) => {
                    net_contains(addr, *len, &flow.src_ip) || net_contains(addr, *len, &flow.dst_ip)
                }
                _ => unreachable!("compound handled above"),
            }
        }
    }
}

fn net_contains(net: &IpAddr, prefix_len: u8, addr: &IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = v4_mask(prefix_len);
            (net.to_bits() & mask) == (addr.to_bits() & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = v6_mask(prefix_len);
            (net.to_bits() & mask) == (addr.to_bits() & mask)
        }
        _ => false,
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        1..=31 => u32::MAX << (32 - prefix_len),
        _ => u32::MAX,
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        1..=127 => u128::MAX << (128 - prefix_len),
        _ => u128::MAX,
    }
}

struct Parser<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'a str> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.term()?;
        while self.peek() == Some("or") {
            self.next();
            let right = self.term()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.unary()?;
        while self.peek() == Some("and") {
            self.next();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        match self.peek() {
            Some("not") => {
                self.next();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some("(") => {
                self.next();
                let inner = self.expr()?;
                if self.next() != Some(")") {
                    return Err(FilterError::UnbalancedParens);
                }
                Ok(inner)
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        let token = self.next().ok_or(FilterError::Empty)?;
        match token {
            "tcp" => Ok(Expr::Proto(PROTO_TCP)),
            "udp" => Ok(Expr::Proto(PROTO_UDP)),
            "icmp" => Ok(Expr::Proto(PROTO_ICMP)),
            "port" => Ok(Expr::Port(self.port_operand("port")?)),
            "src" => match self.next() {
                Some("port") => Ok(Expr::SrcPort(self.port_operand("src port")?)),
                _ => Err(FilterError::MissingOperand("'port'", "src")),
            },
            "dst" => match self.next() {
                Some("port") => Ok(Expr::DstPort(self.port_operand("dst port")?)),
                _ => Err(FilterError::MissingOperand("'port'", "dst")),
            },
            "host" => {
                let operand = self
                    .next()
                    .ok_or(FilterError::MissingOperand("an address", "host"))?;
                let addr = operand
                    .parse()
                    .map_err(|_| FilterError::BadAddress(operand.to_string()))?;
                Ok(Expr::Host(addr))
            }
            "net" => {
                let operand = self
                    .next()
                    .ok_or(FilterError::MissingOperand("a network", "net"))?;
                let (addr, len) = operand
                    .split_once('/')
                    .ok_or_else(|| FilterError::BadNetwork(operand.to_string()))?;
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|_| FilterError::BadNetwork(operand.to_string()))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| FilterError::BadNetwork(operand.to_string()))?;
                let max = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if len > max {
                    return Err(FilterError::BadNetwork(operand.to_string()));
                }
                Ok(Expr::Net(addr, len))
            }
            other => Err(FilterError::UnexpectedToken(other.to_string())),
        }
    }

    fn port_operand(&mut self, context: &'static str) -> Result<u16, FilterError> {
        let operand = self
            .next()
            .ok_or(FilterError::MissingOperand("a port number", context))?;
        operand
            .parse()
            .map_err(|_| FilterError::UnexpectedToken(operand.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, proto: u8) -> Packet {
        Packet {
            ts_sec: 0,
            ts_usec: 0,
            wire_len: 60,
            flow: Some(FlowKey {
                src_ip: IpAddr::from(src),
                dst_ip: IpAddr::from(dst),
                src_port,
                dst_port,
                proto,
            }),
            data: Vec::new(),
        }
    }

    #[test]
    fn spoofed_sources_match() {
        let filters = CustomFilters::new(None);
        assert!(filters.spoofed(&packet([127, 0, 0, 1], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
        assert!(filters.spoofed(&packet([224, 0, 0, 5], [198, 51, 100, 2], 1, 2, PROTO_UDP)));
        assert!(filters.spoofed(&packet([198, 51, 100, 2], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
        assert!(!filters.spoofed(&packet([203, 0, 113, 9], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
    }

    #[test]
    fn unrouted_sources_match() {
        let filters = CustomFilters::new(None);
        assert!(filters.unrouted(&packet([10, 1, 2, 3], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
        assert!(filters.unrouted(&packet([192, 168, 0, 1], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
        assert!(filters.unrouted(&packet([100, 64, 0, 1], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
        assert!(!filters.unrouted(&packet([203, 0, 113, 9], [198, 51, 100, 2], 1, 2, PROTO_TCP)));
    }

    #[test]
    fn telescope_tree_drops_ssdp() {
        let standard = CustomFilters::new(None);
        let telescope = CustomFilters::new(Some("telescope"));
        let ssdp = packet([203, 0, 113, 9], [198, 51, 100, 2], 5000, 1900, PROTO_UDP);
        assert!(!standard.erratic(&ssdp));
        assert!(telescope.erratic(&ssdp));
    }

    #[test]
    fn port_zero_is_erratic_everywhere() {
        let filters = CustomFilters::new(None);
        assert!(filters.erratic(&packet([203, 0, 113, 9], [198, 51, 100, 2], 0, 80, PROTO_TCP)));
    }

    #[test]
    fn bpf_proto_and_port() {
        let filter = BpfFilter::parse("udp and port 53").unwrap();
        assert!(filter.matches(&packet([1, 2, 3, 4], [5, 6, 7, 8], 53, 40000, PROTO_UDP)));
        assert!(filter.matches(&packet([1, 2, 3, 4], [5, 6, 7, 8], 40000, 53, PROTO_UDP)));
        assert!(!filter.matches(&packet([1, 2, 3, 4], [5, 6, 7, 8], 53, 40000, PROTO_TCP)));
    }

    #[test]
    fn bpf_or_and_not() {
        let filter = BpfFilter::parse("tcp or ( udp and not dst port 1900 )").unwrap();
        assert!(filter.matches(&packet([1, 2, 3, 4], [5, 6, 7, 8], 1, 80, PROTO_TCP)));
        assert!(filter.matches(&packet([1, 2, 3, 4], [5, 6, 7, 8], 1, 53, PROTO_UDP)));
        assert!(!filter.matches(&packet([1, 2, 3, 4], [5, 6, 7, 8], 1, 1900, PROTO_UDP)));
    }

    #[test]
    fn bpf_host_and_net() {
        let filter = BpfFilter::parse("host 192.0.2.7").unwrap();
        assert!(filter.matches(&packet([192, 0, 2, 7], [5, 6, 7, 8], 1, 2, PROTO_TCP)));
        assert!(filter.matches(&packet([5, 6, 7, 8], [192, 0, 2, 7], 1, 2, PROTO_TCP)));
        assert!(!filter.matches(&packet([192, 0, 2, 8], [5, 6, 7, 8], 1, 2, PROTO_TCP)));

        let filter = BpfFilter::parse("net 10.0.0.0/8").unwrap();
        assert!(filter.matches(&packet([10, 200, 1, 1], [5, 6, 7, 8], 1, 2, PROTO_TCP)));
        assert!(!filter.matches(&packet([11, 0, 0, 1], [5, 6, 7, 8], 1, 2, PROTO_TCP)));
    }

    #[test]
    fn bpf_rejects_malformed_input() {
        assert!(matches!(BpfFilter::parse(""), Err(FilterError::Empty)));
        assert!(matches!(
            BpfFilter::parse("tcp extra"),
            Err(FilterError::TrailingInput(_))
        ));
        assert!(matches!(
            BpfFilter::parse("port x"),
            Err(FilterError::UnexpectedToken(_))
        ));
        assert!(matches!(
            BpfFilter::parse("( tcp"),
            Err(FilterError::UnbalancedParens)
        ));
        assert!(matches!(
            BpfFilter::parse("net 10.0.0.0/40"),
            Err(FilterError::BadNetwork(_))
        ));
    }

    #[test]
    fn packets_without_flow_never_match_primitives() {
        let filter = BpfFilter::parse("tcp").unwrap();
        let bare = Packet {
            ts_sec: 0,
            ts_usec: 0,
            wire_len: 60,
            flow: None,
            data: Vec::new(),
        };
        assert!(!filter.matches(&bare));
    }
}
