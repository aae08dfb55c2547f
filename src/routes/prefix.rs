// IPv4 prefix and subnet mask arithmetic

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// A canonical IPv4 destination prefix (`A.B.C.D/N`) with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    len: u8,
}

impl Ipv4Prefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> AppResult<Self> {
        if len > 32 {
            return Err(AppError::InvalidPrefix(format!("{}/{}", addr, len)));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask_bits(len));
        Ok(Ipv4Prefix { network, len })
    }

    /// Build the destination prefix of a configured target.
    ///
    /// An embedded `/N` suffix in `target` takes precedence over `prefix_length`.
    pub fn from_target(target: &str, prefix_length: u8) -> AppResult<Self> {
        let target = target.trim();
        if target.contains('/') {
            return target.parse();
        }
        let addr: Ipv4Addr = target
            .parse()
            .map_err(|_| AppError::InvalidTarget(target.to_string()))?;
        Ipv4Prefix::new(addr, prefix_length)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn mask(&self) -> Ipv4Addr {
        prefix_to_mask(self.len)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = mask_bits(self.len);
        (u32::from(addr) & mask) == u32::from(self.network)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, len) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| AppError::InvalidTarget(s.to_string()))?;
        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|_| AppError::InvalidTarget(s.to_string()))?;
        let len: u8 = len
            .parse()
            .map_err(|_| AppError::InvalidPrefix(s.to_string()))?;
        Ipv4Prefix::new(addr, len)
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len if len >= 32 => 0xFFFF_FFFF,
        len => 0xFFFF_FFFF << (32 - len),
    }
}

/// Convert a prefix length to a dotted subnet mask. Out-of-range lengths give `0.0.0.0`.
pub fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len > 32 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(mask_bits(prefix_len))
}

/// Count the contiguous leading one bits of a subnet mask.
pub fn mask_to_prefix(mask: Ipv4Addr) -> u8 {
    u32::from(mask).leading_ones() as u8
}

pub fn is_same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

/// The address portion of a target, with any `/N` suffix stripped.
pub fn target_ip(target: &str) -> &str {
    target.split('/').next().unwrap_or(target).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_to_mask() {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_mask(33), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_mask_to_prefix() {
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 128, 0)), 17);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)), 0);
    }

    #[test]
    fn test_same_subnet() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(is_same_subnet(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 100),
            mask
        ));
        assert!(!is_same_subnet(
            Ipv4Addr::new(192, 168, 2, 1),
            Ipv4Addr::new(192, 168, 1, 100),
            mask
        ));
    }

    #[test]
    fn test_embedded_suffix_wins() {
        let prefix = Ipv4Prefix::from_target("10.0.0.0/24", 32).unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/24");

        let prefix = Ipv4Prefix::from_target("10.1.2.3", 32).unwrap();
        assert_eq!(prefix.to_string(), "10.1.2.3/32");
    }

    #[test]
    fn test_host_bits_cleared() {
        let prefix = Ipv4Prefix::from_target("10.0.0.5", 24).unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/24");
        assert!(prefix.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!prefix.contains(Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Ipv4Prefix::from_target("example.com", 32).is_err());
        assert!(Ipv4Prefix::from_target("10.0.0.0/40", 32).is_err());
        assert!(Ipv4Prefix::from_target("10.0.0.0", 33).is_err());
        assert!("10.0.0/8".parse::<Ipv4Prefix>().is_err());
    }

    #[test]
    fn test_target_ip() {
        assert_eq!(target_ip("10.0.0.0/24"), "10.0.0.0");
        assert_eq!(target_ip("8.8.8.8"), "8.8.8.8");
    }
}
