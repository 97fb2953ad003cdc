// Bind-spec parsing for `proto://iface:portspec` addresses.
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Port selector portion of a bind spec.
///
/// `*` means any free port, `N` a single port, `N-` an open-ended range
/// starting at N, and `N-M` an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Any,
    Exact(u16),
    From(u16),
    Range(u16, u16),
}

impl PortSpec {
    fn parse(input: &str) -> Result<Self> {
        if input == "*" {
            return Ok(Self::Any);
        }
        let parse_port = |s: &str| {
            s.parse::<u16>()
                .map_err(|_| Error::InvalidBindSpec(format!("bad port: {s}")))
        };
        match input.split_once('-') {
            None => Ok(Self::Exact(parse_port(input)?)),
            Some((lo, "")) => Ok(Self::From(parse_port(lo)?)),
            Some((lo, hi)) => {
                let lo = parse_port(lo)?;
                let hi = parse_port(hi)?;
                if hi < lo {
                    return Err(Error::InvalidBindSpec(format!(
                        "inverted port range: {lo}-{hi}"
                    )));
                }
                Ok(Self::Range(lo, hi))
            }
        }
    }
}

/// Parsed `tcp://iface:portspec` bind address.
///
/// ```
/// use trestle_common::BindSpec;
///
/// let spec: BindSpec = "tcp://127.0.0.1:5000-5010".parse().expect("spec");
/// assert_eq!(spec.iface, "127.0.0.1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub iface: String,
    pub ports: PortSpec,
}

impl BindSpec {
    /// Candidate `host:port` addresses to try in order.
    ///
    /// `Any` maps to port 0 so the OS picks; open-ended ranges are capped at
    /// the top of the port space.
    pub fn candidates(&self) -> Vec<String> {
        let iface = if self.iface == "*" {
            "0.0.0.0"
        } else {
            &self.iface
        };
        match self.ports {
            PortSpec::Any => vec![format!("{iface}:0")],
            PortSpec::Exact(port) => vec![format!("{iface}:{port}")],
            PortSpec::From(lo) => (lo..=u16::MAX).map(|p| format!("{iface}:{p}")).collect(),
            PortSpec::Range(lo, hi) => (lo..=hi).map(|p| format!("{iface}:{p}")).collect(),
        }
    }
}

impl FromStr for BindSpec {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidBindSpec(input.to_string()))?;
        if scheme != "tcp" {
            return Err(Error::UnsupportedScheme(scheme.to_string()));
        }
        // Split on the last colon so IPv6-ish interface strings survive.
        let (iface, ports) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidBindSpec(input.to_string()))?;
        if iface.is_empty() {
            return Err(Error::InvalidBindSpec(input.to_string()));
        }
        Ok(Self {
            iface: iface.to_string(),
            ports: PortSpec::parse(ports)?,
        })
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:", self.iface)?;
        match self.ports {
            PortSpec::Any => write!(f, "*"),
            PortSpec::Exact(port) => write!(f, "{port}"),
            PortSpec::From(lo) => write!(f, "{lo}-"),
            PortSpec::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_port() {
        let spec: BindSpec = "tcp://*:*".parse().expect("spec");
        assert_eq!(spec.ports, PortSpec::Any);
        assert_eq!(spec.candidates(), vec!["0.0.0.0:0".to_string()]);
    }

    #[test]
    fn parses_exact_port() {
        let spec: BindSpec = "tcp://127.0.0.1:9000".parse().expect("spec");
        assert_eq!(spec.ports, PortSpec::Exact(9000));
        assert_eq!(spec.candidates(), vec!["127.0.0.1:9000".to_string()]);
    }

    #[test]
    fn parses_port_ranges() {
        let spec: BindSpec = "tcp://0.0.0.0:5000-5002".parse().expect("spec");
        assert_eq!(spec.ports, PortSpec::Range(5000, 5002));
        assert_eq!(spec.candidates().len(), 3);

        let open: BindSpec = "tcp://0.0.0.0:65534-".parse().expect("spec");
        assert_eq!(open.ports, PortSpec::From(65534));
        assert_eq!(open.candidates().len(), 2);
    }

    #[test]
    fn rejects_bad_specs() {
        assert!("udp://0.0.0.0:1".parse::<BindSpec>().is_err());
        assert!("tcp://0.0.0.0".parse::<BindSpec>().is_err());
        assert!("tcp://0.0.0.0:10-5".parse::<BindSpec>().is_err());
        assert!("nonsense".parse::<BindSpec>().is_err());
    }

    #[test]
    fn round_trips_display() {
        for input in ["tcp://*:*", "tcp://127.0.0.1:9000", "tcp://x:10-20"] {
            let spec: BindSpec = input.parse().expect("spec");
            assert_eq!(spec.to_string(), input);
        }
    }
}
