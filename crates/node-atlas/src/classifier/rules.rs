use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

pub const OTHER_PROVIDER: &str = "Other";

/// An IPv4 network in CIDR form, e.g. `172.16.0.0/12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self> {
        if len > 32 {
            return Err(Error::InvalidMatcher(format!("{addr}/{len}")));
        }
        Ok(Self {
            network: u32::from(addr) & Self::mask(len),
            len,
        })
    }

    fn mask(len: u8) -> u32 {
        match len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.len) == self.network
    }

    /// First and last address of the network as integers.
    pub fn bounds(&self) -> (u32, u32) {
        (self.network, self.network | !Self::mask(self.len))
    }

    fn covers(&self, other: &Ipv4Cidr) -> bool {
        self.len <= other.len && self.contains(Ipv4Addr::from(other.network))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidMatcher(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| Error::InvalidMatcher(s.to_string()))?;
        let len: u8 = len
            .trim()
            .parse()
            .map_err(|_| Error::InvalidMatcher(s.to_string()))?;
        Self::new(addr, len)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.len)
    }
}

/// Address matcher. Written in configuration as a plain string: anything
/// containing `/` is a CIDR network, everything else a textual prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Matcher {
    Prefix(String),
    Cidr(Ipv4Cidr),
}

impl Matcher {
    pub fn prefix(prefix: &str) -> Self {
        Matcher::Prefix(prefix.to_string())
    }

    pub fn matches(&self, address: &str, ip: IpAddr) -> bool {
        match self {
            Matcher::Prefix(prefix) => address.starts_with(prefix.as_str()),
            Matcher::Cidr(cidr) => match ip {
                IpAddr::V4(v4) => cidr.contains(v4),
                IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| cidr.contains(v4)),
            },
        }
    }

    /// Whole-octet prefixes such as `204.246.` are CIDR networks in disguise.
    fn as_cidr(&self) -> Option<Ipv4Cidr> {
        match self {
            Matcher::Cidr(cidr) => Some(*cidr),
            Matcher::Prefix(prefix) => {
                let octets = prefix.strip_suffix('.')?;
                let parsed = octets
                    .split('.')
                    .map(|octet| octet.parse::<u8>().ok())
                    .collect::<Option<Vec<_>>>()?;
                if parsed.is_empty() || parsed.len() > 3 {
                    return None;
                }
                let mut bytes = [0u8; 4];
                bytes[..parsed.len()].copy_from_slice(&parsed);
                Ipv4Cidr::new(Ipv4Addr::from(bytes), (parsed.len() * 8) as u8).ok()
            }
        }
    }

    /// True when every address matched by `other` is also matched by `self`.
    pub fn shadows(&self, other: &Matcher) -> bool {
        if let (Matcher::Prefix(a), Matcher::Prefix(b)) = (self, other)
            && b.starts_with(a.as_str())
        {
            return true;
        }
        match (self.as_cidr(), other.as_cidr()) {
            (Some(a), Some(b)) => a.covers(&b),
            _ => false,
        }
    }
}

impl TryFrom<String> for Matcher {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::InvalidMatcher("empty matcher".to_string()));
        }
        if value.contains('/') {
            Ok(Matcher::Cidr(value.parse()?))
        } else {
            Ok(Matcher::Prefix(value.to_string()))
        }
    }
}

impl From<Matcher> for String {
    fn from(matcher: Matcher) -> Self {
        matcher.to_string()
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Prefix(prefix) => f.write_str(prefix),
            Matcher::Cidr(cidr) => write!(f, "{cidr}"),
        }
    }
}

/// One hosting provider and the addresses attributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRule {
    pub provider: String,
    pub matchers: Vec<Matcher>,
    /// Addresses matching any exclusion are never attributed to this rule
    #[serde(default)]
    pub exclusions: Vec<Matcher>,
}

impl ProviderRule {
    pub fn new(provider: &str, prefixes: &[&str]) -> Self {
        Self {
            provider: provider.to_string(),
            matchers: prefixes.iter().map(|p| Matcher::prefix(p)).collect(),
            exclusions: Vec::new(),
        }
    }

    pub fn excluding(mut self, prefixes: &[&str]) -> Self {
        self.exclusions
            .extend(prefixes.iter().map(|p| Matcher::prefix(p)));
        self
    }

    pub fn matches(&self, address: &str, ip: IpAddr) -> bool {
        self.matchers.iter().any(|m| m.matches(address, ip))
            && !self.exclusions.iter().any(|m| m.matches(address, ip))
    }
}

/// An earlier rule's matcher that hides a later rule's matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOverlap {
    pub winner: String,
    pub winner_matcher: Matcher,
    pub shadowed: String,
    pub shadowed_matcher: Matcher,
}

impl fmt::Display for RuleOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} `{}` shadows {} `{}`",
            self.winner, self.winner_matcher, self.shadowed, self.shadowed_matcher
        )
    }
}

/// Ordered provider rules; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRuleset {
    rules: Vec<ProviderRule>,
}

impl ProviderRuleset {
    pub fn new(rules: Vec<ProviderRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ProviderRule] {
        &self.rules
    }

    pub fn provider_for(&self, address: &str, ip: IpAddr) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(address, ip))
            .map_or(OTHER_PROVIDER, |rule| rule.provider.as_str())
    }

    /// Matchers that can never fire because an earlier rule claims every
    /// address they cover. Order is left untouched; callers only report these.
    /// A later matcher lying inside one of the earlier rule's exclusions is
    /// not claimed by it.
    pub fn overlaps(&self) -> Vec<RuleOverlap> {
        let mut overlaps = Vec::new();
        for (idx, earlier) in self.rules.iter().enumerate() {
            for later in &self.rules[idx + 1..] {
                for winner in &earlier.matchers {
                    for shadowed in &later.matchers {
                        if winner.shadows(shadowed)
                            && !earlier.exclusions.iter().any(|ex| ex.shadows(shadowed))
                        {
                            overlaps.push(RuleOverlap {
                                winner: earlier.provider.clone(),
                                winner_matcher: winner.clone(),
                                shadowed: later.provider.clone(),
                                shadowed_matcher: shadowed.clone(),
                            });
                        }
                    }
                }
            }
        }
        overlaps
    }
}

impl Default for ProviderRuleset {
    fn default() -> Self {
        Self::new(vec![
            ProviderRule::new(
                "AWS",
                &[
                    "3.", "52.", "54.", "35.", "18.", "13.", "100.", "204.246.", "99.84.",
                ],
            ),
            ProviderRule::new(
                "Digital Ocean",
                &["64.", "167.99.", "137.184.", "207.154."],
            )
            .excluding(&["64.130."]),
            ProviderRule::new(
                "Google Cloud",
                &["35.184.", "34.", "130.211.", "172.217.", "199.36."],
            ),
            ProviderRule::new(
                "OVH",
                &["51.", "145.239.", "137.74.", "198.244.192.", "188.165."],
            ),
            ProviderRule::new(
                "Hetzner",
                &[
                    "185.125.188.",
                    "148.251.",
                    "116.203.",
                    "159.69.",
                    "194.67.120.",
                ],
            ),
            ProviderRule::new(
                "Linode",
                &[
                    "172.104.",
                    "192.81.208.",
                    "139.162.",
                    "66.228.",
                    "66.175.208.",
                ],
            ),
            ProviderRule::new(
                "Azure",
                &["13.64.", "20.38.", "40.64.", "65.52.", "104.40."],
            ),
            ProviderRule::new(
                "Vultr",
                &["108.61.", "45.32.", "64.90.60.", "66.42.48.", "169.57."],
            ),
        ])
    }
}
