//! Range expansion
//!
//! Turns target expressions into ordered lists of atomic targets. A CIDR
//! block expands to every covered address in ascending order; blocks covering
//! more than two addresses drop their network and broadcast addresses, while
//! /31 and /32 (and IPv6 /127, /128) blocks are returned unmodified.
//! Expansion is all-or-nothing: an invalid expression yields an error and no
//! targets.

use super::{Target, TargetKind};
use crate::error::{ReconError, ReconResult};
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Largest block expanded by default
pub const DEFAULT_MAX_EXPANSION: u64 = 65_536;

/// Target expander with an expansion cap
#[derive(Debug, Clone)]
pub struct TargetExpander {
    max_expansion: u64,
}

impl Default for TargetExpander {
    fn default() -> Self {
        Self {
            max_expansion: DEFAULT_MAX_EXPANSION,
        }
    }
}

impl TargetExpander {
    pub fn new(max_expansion: u64) -> Self {
        Self { max_expansion }
    }

    pub fn max_expansion(&self) -> u64 {
        self.max_expansion
    }

    /// Expand a single expression
    pub fn expand(&self, input: &str) -> ReconResult<Vec<Target>> {
        let target = Target::classify(input)?;
        match target.kind() {
            TargetKind::Range => self.expand_cidr(target.value()),
            _ => Ok(vec![target]),
        }
    }

    /// Expand a comma-separated list, keeping input order and dropping
    /// repeated targets after their first occurrence
    pub fn expand_list(&self, input: &str) -> ReconResult<Vec<Target>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            for target in self.expand(part)? {
                if seen.insert(target.clone()) {
                    targets.push(target);
                }
            }
        }

        if targets.is_empty() {
            return Err(ReconError::InvalidAddress("no targets specified".to_string()));
        }

        let limit = self.max_expansion as usize;
        if targets.len() > limit {
            return Err(ReconError::InvalidRange(format!(
                "{} targets exceed the expansion limit of {}",
                targets.len(),
                limit
            )));
        }

        log::debug!("Expanded '{}' into {} target(s)", input, targets.len());
        Ok(targets)
    }

    fn expand_cidr(&self, input: &str) -> ReconResult<Vec<Target>> {
        let network: IpNetwork = input
            .parse()
            .map_err(|e| ReconError::InvalidRange(format!("{}: {}", input, e)))?;

        let (bits, base) = match network.ip() {
            IpAddr::V4(ip) => (32u32, u32::from(ip) as u128),
            IpAddr::V6(ip) => (128u32, u128::from(ip)),
        };
        let host_bits = bits - u32::from(network.prefix());

        let size = 1u128
            .checked_shl(host_bits)
            .filter(|size| *size <= u128::from(self.max_expansion))
            .ok_or_else(|| {
                ReconError::InvalidRange(format!(
                    "{} covers more than {} addresses",
                    input, self.max_expansion
                ))
            })?;

        let first = base & !(size - 1);
        let last = first + (size - 1);

        // Drop network and broadcast addresses for blocks larger than two
        let (start, end) = if size > 2 {
            (first + 1, last - 1)
        } else {
            (first, last)
        };

        let is_v4 = network.is_ipv4();
        let targets = (start..=end)
            .map(|n| {
                let ip = if is_v4 {
                    IpAddr::V4(Ipv4Addr::from(n as u32))
                } else {
                    IpAddr::V6(Ipv6Addr::from(n))
                };
                Target::address(ip)
            })
            .collect::<Vec<_>>();

        log::debug!("CIDR {} expanded to {} host(s)", input, targets.len());
        Ok(targets)
    }
}

/// Expand one expression with the default expansion cap
pub fn expand(input: &str) -> ReconResult<Vec<Target>> {
    TargetExpander::default().expand(input)
}

/// Expand a comma-separated list with the default expansion cap
pub fn expand_list(input: &str) -> ReconResult<Vec<Target>> {
    TargetExpander::default().expand_list(input)
}
