//! Batch port specifications and per-item batch results
//!
//! A spec is a comma-separated list of ports (`"80, 443"`); backends that
//! accept ranges also take inclusive `"start-end"` tokens. Bad tokens are
//! reported individually and never abort the rest of the batch.

use std::fmt;

use crate::error::{ErrorKind, ForwardError, ForwardResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortToken {
    Port(u16),
    Invalid { token: String, reason: String },
}

/// Parse a single port; 0 is not a forwardable port
pub fn parse_port(token: &str) -> ForwardResult<u16> {
    match token.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ForwardError::Validation(format!(
            "Invalid port number: {:?}",
            token.trim()
        ))),
        Ok(port) => Ok(port),
    }
}

pub fn parse_port_spec(spec: &str, allow_ranges: bool) -> Vec<PortToken> {
    let mut out = Vec::new();
    for raw in spec.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }

        let range = token
            .split_once('-')
            .filter(|(start, end)| is_digits(start) && is_digits(end));
        match range {
            Some((start, end)) if allow_ranges => match parse_range(start, end) {
                Ok((start, end)) => out.extend((start..=end).map(PortToken::Port)),
                Err(reason) => out.push(PortToken::Invalid {
                    token: token.to_string(),
                    reason,
                }),
            },
            Some(_) => out.push(PortToken::Invalid {
                token: token.to_string(),
                reason: "Port ranges are not supported by this backend".to_string(),
            }),
            None => match parse_port(token) {
                Ok(port) => out.push(PortToken::Port(port)),
                Err(_) => out.push(PortToken::Invalid {
                    token: token.to_string(),
                    reason: "Invalid port number".to_string(),
                }),
            },
        }
    }
    out
}

fn is_digits(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_range(start: &str, end: &str) -> Result<(u16, u16), String> {
    let start = parse_port(start).map_err(|_| "Invalid port range".to_string())?;
    let end = parse_port(end).map_err(|_| "Invalid port range".to_string())?;
    if start > end {
        return Err(format!("Range start {} is above range end {}", start, end));
    }
    Ok((start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    Add,
    Remove,
}

#[derive(Debug)]
pub struct BatchItem {
    /// The token as written, or the port for expanded ranges
    pub token: String,
    pub port: Option<u16>,
    pub outcome: ForwardResult<String>,
}

impl BatchItem {
    pub fn invalid(token: String, reason: String) -> Self {
        Self {
            token,
            port: None,
            outcome: Err(ForwardError::Validation(reason)),
        }
    }

    pub fn for_port(port: u16, outcome: ForwardResult<String>) -> Self {
        Self {
            token: port.to_string(),
            port: Some(port),
            outcome,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(ForwardError::kind)
    }
}

/// Outcome of a multi-port add or remove, one item per port or bad token
#[derive(Debug)]
pub struct BatchReport {
    pub op: BatchOp,
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn new(op: BatchOp) -> Self {
        Self {
            op,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, item: BatchItem) {
        self.items.push(item);
    }

    pub fn activated(&self) -> usize {
        self.items.iter().filter(|i| i.is_ok()).count()
    }

    pub fn inactive(&self) -> usize {
        self.items.len() - self.activated()
    }

    /// Tokens that never parsed to a port
    pub fn invalid(&self) -> usize {
        self.items.iter().filter(|i| i.port.is_none()).count()
    }

    pub fn conflicts(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.error_kind() == Some(ErrorKind::Conflict))
            .count()
    }

    pub fn succeeded_ports(&self) -> Vec<u16> {
        self.items
            .iter()
            .filter(|i| i.is_ok())
            .filter_map(|i| i.port)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        !self.items.is_empty() && self.inactive() == 0
    }

    fn summary(&self) -> Option<String> {
        let (ok, bad) = (self.activated(), self.inactive());
        match (self.op, ok, bad) {
            (_, 0, 0) => None,
            (BatchOp::Add, ok, 0) => Some(format!("All {} port(s) activated successfully", ok)),
            (BatchOp::Add, 0, bad) => Some(format!(
                "All {} port(s) inactive - unable to activate due to conflicts",
                bad
            )),
            (BatchOp::Add, ok, bad) => Some(format!(
                "Summary: {} port(s) activated, {} port(s) inactive due to conflicts",
                ok, bad
            )),
            (BatchOp::Remove, ok, bad) => {
                Some(format!("Summary: {} port(s) removed, {} failed", ok, bad))
            }
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            let label = match item.port {
                Some(port) => format!("Port {}", port),
                None => format!("Port '{}'", item.token),
            };
            match (self.op, &item.outcome) {
                (BatchOp::Add, Ok(msg)) => writeln!(f, "✓ {}: ACTIVE - {}", label, msg)?,
                (BatchOp::Add, Err(e)) => writeln!(f, "✗ {}: INACTIVE - {}", label, e)?,
                (BatchOp::Remove, Ok(msg)) => writeln!(f, "{}: {}", label, msg)?,
                (BatchOp::Remove, Err(e)) => writeln!(f, "{}: {}", label, e)?,
            }
        }
        if let Some(summary) = self.summary() {
            write!(f, "\n{}", summary)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_comma_list() {
        let tokens = parse_port_spec(" 80, 443 ,,8080", false);
        assert_eq!(
            tokens,
            vec![PortToken::Port(80), PortToken::Port(443), PortToken::Port(8080)]
        );
    }

    #[test]
    fn test_parse_range_inclusive() {
        let tokens = parse_port_spec("8000-8002,9000", true);
        assert_eq!(
            tokens,
            vec![
                PortToken::Port(8000),
                PortToken::Port(8001),
                PortToken::Port(8002),
                PortToken::Port(9000)
            ]
        );
    }

    #[test]
    fn test_range_rejected_when_not_allowed() {
        let tokens = parse_port_spec("80,8000-8002", false);
        assert_eq!(tokens[0], PortToken::Port(80));
        assert!(matches!(&tokens[1], PortToken::Invalid { token, .. } if token == "8000-8002"));
    }

    #[test]
    fn test_dashed_word_is_not_a_range() {
        let tokens = parse_port_spec("not-a-port", true);
        assert!(matches!(&tokens[0], PortToken::Invalid { reason, .. } if reason == "Invalid port number"));
    }

    #[test]
    fn test_invalid_tokens_are_individual() {
        let tokens = parse_port_spec("80,abc,0,70000,90-80,81", true);
        let invalid: Vec<_> = tokens
            .iter()
            .filter_map(|t| match t {
                PortToken::Invalid { token, .. } => Some(token.as_str()),
                PortToken::Port(_) => None,
            })
            .collect();
        assert_eq!(invalid, vec!["abc", "0", "70000", "90-80"]);
        assert_eq!(tokens.first(), Some(&PortToken::Port(80)));
        assert_eq!(tokens.last(), Some(&PortToken::Port(81)));
    }

    #[test]
    fn test_report_counts_and_summary() {
        let mut report = BatchReport::new(BatchOp::Add);
        report.push(BatchItem::for_port(80, Ok("created".into())));
        report.push(BatchItem::for_port(81, Err(ForwardError::port_in_use(81, None))));
        report.push(BatchItem::invalid("x".into(), "Invalid port number".into()));

        assert_eq!(report.activated(), 1);
        assert_eq!(report.inactive(), 2);
        assert_eq!(report.invalid(), 1);
        assert_eq!(report.conflicts(), 1);
        assert_eq!(report.succeeded_ports(), vec![80]);

        let text = report.to_string();
        assert!(text.contains("✓ Port 80: ACTIVE - created"));
        assert!(text.contains("✗ Port 81: INACTIVE - Port 81 is already in use"));
        assert!(text.contains("✗ Port 'x': INACTIVE - Invalid port number"));
        assert!(text.ends_with("Summary: 1 port(s) activated, 2 port(s) inactive due to conflicts"));
    }
}
