//! Static address-based access control.
//!
//! Grounded in the original `priskv_acl` rule list: each rule is a CIDR
//! prefix, and a peer address is allowed if it matches at least one rule.
//! An empty rule set allows everyone, matching the original's "no ACL
//! configured" behaviour.

use std::net::IpAddr;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy)]
struct Rule {
    addr: IpAddr,
    prefix_len: u8,
}

impl Rule {
    fn matches(&self, peer: &IpAddr) -> bool {
        match (self.addr, peer) {
            (IpAddr::V4(rule), IpAddr::V4(peer)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(rule) & mask == u32::from(*peer) & mask
            }
            (IpAddr::V6(rule), IpAddr::V6(peer)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(rule) & mask == u128::from(*peer) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits as u32)
    }
}

fn prefix_mask_v6(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - bits as u32)
    }
}

/// Static list of CIDR rules, verified against connecting peer addresses.
#[derive(Debug, Default)]
pub struct Acl {
    rules: Vec<Rule>,
}

impl Acl {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Build an ACL from a set of `addr/prefix_len` strings, as carried in
    /// `AclConfig::rules`.
    pub fn from_rules(rules: &[String]) -> Result<Self, EngineError> {
        let mut acl = Acl::new();
        for rule in rules {
            acl.add(rule)?;
        }
        Ok(acl)
    }

    pub fn add(&mut self, rule: &str) -> Result<(), EngineError> {
        let (addr_part, bits_part) = rule
            .split_once('/')
            .ok_or_else(|| EngineError::Config(format!("malformed acl rule: {rule}")))?;
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| EngineError::Config(format!("malformed acl address: {addr_part}")))?;
        let max_bits = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len: u8 = bits_part
            .parse()
            .map_err(|_| EngineError::Config(format!("malformed acl prefix: {bits_part}")))?;
        if prefix_len > max_bits {
            return Err(EngineError::Config(format!(
                "acl prefix {prefix_len} exceeds {max_bits} bits"
            )));
        }
        self.rules.push(Rule { addr, prefix_len });
        Ok(())
    }

    /// Remove a previously added `addr/prefix_len` rule. Returns `true` if a
    /// matching rule was present.
    pub fn remove(&mut self, rule: &str) -> bool {
        let Some((addr_part, bits_part)) = rule.split_once('/') else {
            return false;
        };
        let (Ok(addr), Ok(prefix_len)) = (addr_part.parse::<IpAddr>(), bits_part.parse::<u8>())
        else {
            return false;
        };
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.addr == addr && r.prefix_len == prefix_len));
        self.rules.len() != before
    }

    /// True if no rules are configured, or `peer` matches at least one rule.
    pub fn allows(&self, peer: &IpAddr) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r.matches(peer))
    }

    pub fn rules(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|r| format!("{}/{}", r.addr, r.prefix_len))
            .collect()
    }
}
