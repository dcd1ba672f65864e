use std::{fmt, str::FromStr};

use crate::CoreError;

const CANDIDATE_PREFIX: &str = "candidate:";

/// A parsed `candidate:` attribute line.
///
/// Unknown trailing attributes are kept in arrival order so a line can be
/// forwarded without losing data this code does not understand yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateLine {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub typ: String,
    pub raddr: Option<String>,
    pub rport: Option<u16>,
    pub tcptype: Option<String>,
    pub generation: Option<u32>,
    pub ufrag: Option<String>,
    pub network_id: Option<u32>,
    pub network_cost: Option<u32>,
    pub extras: Vec<(String, Option<String>)>,
}

fn protocol_error(message: impl Into<String>) -> CoreError {
    CoreError::SignalingProtocol(message.into())
}

fn number<T: FromStr>(field: &str, raw: &str) -> Result<T, CoreError> {
    raw.parse()
        .map_err(|_| protocol_error(format!("candidate {field} is not a number: {raw:?}")))
}

impl IceCandidateLine {
    pub fn parse(line: &str) -> Result<Self, CoreError> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| protocol_error(format!("missing {CANDIDATE_PREFIX:?} prefix")))?;

        let mut tokens = body.split_whitespace();
        let mut required = |field: &str| {
            tokens
                .next()
                .ok_or_else(|| protocol_error(format!("candidate line is missing {field}")))
        };

        let foundation = required("foundation")?.to_owned();
        let component = number("component", required("component")?)?;
        let protocol = required("protocol")?.to_owned();
        let priority = number("priority", required("priority")?)?;
        let address = required("address")?.to_owned();
        let port = number("port", required("port")?)?;
        let typ_keyword = required("typ")?;
        if typ_keyword != "typ" {
            return Err(protocol_error(format!(
                "expected \"typ\", found {typ_keyword:?}"
            )));
        }
        let typ = required("candidate type")?.to_owned();

        let mut candidate = Self {
            foundation,
            component,
            protocol,
            priority,
            address,
            port,
            typ,
            raddr: None,
            rport: None,
            tcptype: None,
            generation: None,
            ufrag: None,
            network_id: None,
            network_cost: None,
            extras: Vec::new(),
        };

        let rest = tokens.collect::<Vec<_>>();
        for pair in rest.chunks(2) {
            let key = pair[0];
            let Some(value) = pair.get(1).copied() else {
                candidate.extras.push((key.to_owned(), None));
                continue;
            };
            match key {
                "raddr" => candidate.raddr = Some(value.to_owned()),
                "rport" => candidate.rport = Some(number("rport", value)?),
                "tcptype" => candidate.tcptype = Some(value.to_owned()),
                "generation" => candidate.generation = Some(number("generation", value)?),
                "ufrag" => candidate.ufrag = Some(value.to_owned()),
                "network-id" => candidate.network_id = Some(number("network-id", value)?),
                "network-cost" => candidate.network_cost = Some(number("network-cost", value)?),
                _ => candidate
                    .extras
                    .push((key.to_owned(), Some(value.to_owned()))),
            }
        }
        Ok(candidate)
    }
}

impl FromStr for IceCandidateLine {
    type Err = CoreError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::parse(line)
    }
}

impl fmt::Display for IceCandidateLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CANDIDATE_PREFIX}{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.typ
        )?;
        if let Some(raddr) = &self.raddr {
            write!(f, " raddr {raddr}")?;
        }
        if let Some(rport) = self.rport {
            write!(f, " rport {rport}")?;
        }
        if let Some(tcptype) = &self.tcptype {
            write!(f, " tcptype {tcptype}")?;
        }
        if let Some(generation) = self.generation {
            write!(f, " generation {generation}")?;
        }
        if let Some(ufrag) = &self.ufrag {
            write!(f, " ufrag {ufrag}")?;
        }
        if let Some(network_id) = self.network_id {
            write!(f, " network-id {network_id}")?;
        }
        if let Some(network_cost) = self.network_cost {
            write!(f, " network-cost {network_cost}")?;
        }
        for (key, value) in &self.extras {
            match value {
                Some(value) => write!(f, " {key} {value}")?,
                None => write!(f, " {key}")?,
            }
        }
        Ok(())
    }
}
