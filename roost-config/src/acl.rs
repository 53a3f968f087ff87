use serde::{Deserialize, Serialize};

/// An ordered client address ACL.
///
/// The ACL is written as a space-separated list of glob patterns, each
/// optionally prefixed with `!` to deny. The first pattern that matches the
/// peer address decides; when no pattern matches, the peer is denied. The
/// default ACL is `"*"`, which allows everything.
///
/// ```
/// use roost_config::IpAcl;
///
/// let acl: IpAcl = "!10.1.2.* 10.* 192.168.0.1".parse().unwrap();
/// assert!(acl.is_allowed("10.0.0.5"));
/// assert!(!acl.is_allowed("10.1.2.3"));
/// assert!(acl.is_allowed("192.168.0.1"));
/// assert!(!acl.is_allowed("172.16.0.1"));
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub struct IpAcl {
    patterns: Vec<AclPattern>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct AclPattern {
    negated: bool,
    glob: String,
}

impl IpAcl {
    /// Returns the ACL that allows every peer.
    pub fn allow_all() -> Self {
        Self {
            patterns: vec![AclPattern {
                negated: false,
                glob: "*".to_owned(),
            }],
        }
    }

    /// Returns `true` if the given peer address is allowed by this ACL.
    pub fn is_allowed(&self, ip: &str) -> bool {
        for pattern in &self.patterns {
            if glob_match(&pattern.glob, ip) {
                return !pattern.negated;
            }
        }

        false
    }
}

impl Default for IpAcl {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl std::str::FromStr for IpAcl {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let patterns = s
            .split_whitespace()
            .map(|token| match token.strip_prefix('!') {
                Some(glob) => AclPattern {
                    negated: true,
                    glob: glob.to_owned(),
                },
                None => AclPattern {
                    negated: false,
                    glob: token.to_owned(),
                },
            })
            .collect::<Vec<_>>();

        // An empty list would deny everyone, which is never what an absent
        // value means.
        if patterns.is_empty() {
            return Ok(Self::allow_all());
        }

        Ok(Self { patterns })
    }
}

impl From<String> for IpAcl {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|never| match never {})
    }
}

impl From<IpAcl> for String {
    fn from(acl: IpAcl) -> Self {
        acl.patterns
            .iter()
            .map(|p| {
                if p.negated {
                    format!("!{}", p.glob)
                } else {
                    p.glob.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Matches `haystack` against a glob where `*` matches any run of characters.
fn glob_match(glob: &str, haystack: &str) -> bool {
    // No wildcard at all requires an exact match.
    if !glob.contains('*') {
        return glob == haystack;
    }

    let mut parts = glob.split('*');
    let first = parts.next().unwrap_or("");
    let mut rest = match haystack.strip_prefix(first) {
        Some(rest) => rest,
        None => return false,
    };

    let segments: Vec<&str> = parts.collect();
    for (index, part) in segments.iter().enumerate() {
        if part.is_empty() {
            continue;
        }

        // A trailing literal must anchor at the end of the haystack.
        if index == segments.len() - 1 && !glob.ends_with('*') {
            return rest.ends_with(part);
        }

        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    true
}
