// Represents a mDNS domain name.
use crate::errors::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::AddAssign;
use std::str::FromStr;

/// A DNS domain name: an ordered sequence of labels.
///
/// Labels are stored as received and compared case-insensitively, as
/// required by [rfc6762] section 16. Each label is at most 63 bytes and the
/// encoded name (length prefixes plus the root terminator) is at most 255
/// bytes.
///
/// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
#[derive(Clone, Debug, Default)]
pub struct DomainName {
    labels: Vec<String>,
}

impl DomainName {
    /// Restricts the length of a domain label to 63 bytes. [RFC1034]
    pub const MAX_LABEL_LEN: usize = 63;

    /// Maximum encoded size: length-prefixed labels plus the root byte.
    pub const MAX_WIRE_LEN: usize = 255;

    pub fn empty() -> DomainName {
        DomainName { labels: Vec::new() }
    }

    /// Builds a name from pre-split labels, validating length limits.
    pub fn new<L: Into<String>>(labels: impl IntoIterator<Item = L>) -> Result<DomainName> {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        for label in &labels {
            DomainName::valid_label(label)?;
        }
        let name = DomainName { labels };
        if name.wire_size() > DomainName::MAX_WIRE_LEN {
            return Err(Error::ParameterInvalid(format!(
                "domain name '{}' is too long",
                name
            )));
        }
        Ok(name)
    }

    fn valid_label(label: &str) -> Result<()> {
        if label.is_empty() {
            return Err(Error::ParameterInvalid(
                "empty labels are not valid".to_string(),
            ));
        }
        if !label.is_ascii() {
            return Err(Error::ParameterInvalid(format!(
                "label '{}' is not ascii",
                label
            )));
        }
        if label.len() > DomainName::MAX_LABEL_LEN {
            return Err(Error::ParameterInvalid(format!(
                "label '{}' is longer than {} bytes",
                label,
                DomainName::MAX_LABEL_LEN
            )));
        }
        Ok(())
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Size of this name on the wire with no compression applied.
    pub fn wire_size(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// The name with its first label removed, e.g. the service name of an
    /// instance name.
    pub fn parent(&self) -> DomainName {
        DomainName {
            labels: self.labels.iter().skip(1).cloned().collect(),
        }
    }

    /// True if `other` equals the trailing labels of this name.
    pub fn ends_with(&self, other: &DomainName) -> bool {
        if other.labels.len() > self.labels.len() {
            return false;
        }
        let offset = self.labels.len() - other.labels.len();
        self.labels[offset..]
            .iter()
            .zip(other.labels.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl FromStr for DomainName {
    type Err = Error;

    /// Parses a dotted domain name, e.g. `_openscreen._udp.local`.
    fn from_str(s: &str) -> Result<Self> {
        DomainName::new(s.split_terminator('.'))
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }

        for label in &self.labels {
            write!(f, "{}.", label)?
        }

        Ok(())
    }
}

impl PartialEq for DomainName {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for DomainName {}

impl Hash for DomainName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in &self.labels {
            label.to_ascii_lowercase().hash(state);
        }
    }
}

impl PartialOrd for DomainName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DomainName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = self.labels.iter().map(|l| l.to_ascii_lowercase());
        let rhs = other.labels.iter().map(|l| l.to_ascii_lowercase());
        lhs.cmp(rhs)
    }
}

impl AddAssign for DomainName {
    fn add_assign(&mut self, other: Self) {
        self.labels.extend_from_slice(&other.labels)
    }
}
