//! RFC 5988 `Link` header parsing for connectors that paginate via
//! `rel="next"` links.

use std::collections::HashMap;

use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;

use super::traits::{HeaderValues, Response};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub reference: String,
    pub parameters: HashMap<String, String>,
}

impl Link {
    /// Value of the `rel` parameter with surrounding quotes removed.
    pub fn rel(&self) -> Option<&str> {
        self.parameters.get("rel").map(|r| r.trim_matches('"'))
    }
}

pub fn parse(header: &str) -> FlowResult<Vec<Link>> {
    let mut links = Vec::new();
    for item in header.split(',') {
        let mut parts = item.split(';');
        let reference = parts.next().unwrap_or_default().trim();
        let reference = reference
            .strip_prefix('<')
            .and_then(|r| r.strip_suffix('>'))
            .ok_or_else(|| Error::InvalidInput(format!("invalid Link reference: {reference}")))?;

        let mut parameters = HashMap::new();
        for raw in parts {
            let (name, value) = raw
                .trim()
                .split_once('=')
                .ok_or_else(|| Error::InvalidInput(format!("invalid Link parameter in: {header}")))?;
            parameters.insert(name.trim().to_string(), value.trim().to_string());
        }
        if parameters.is_empty() {
            return Err(Error::InvalidInput(format!("Link entry without parameters: {item}")));
        }

        links.push(Link {
            reference: reference.to_string(),
            parameters,
        });
    }
    Ok(links)
}

/// URL of the `rel="next"` link, across every value of the `Link` header.
/// More than one candidate is an error.
pub fn next_page_url(response: &Response) -> FlowResult<Option<String>> {
    let Some(values) = response.header("link") else {
        return Ok(None);
    };

    let mut candidates = Vec::new();
    for value in values.iter() {
        for link in parse(value)? {
            if link.rel() == Some("next") {
                candidates.push(link.reference);
            }
        }
    }

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        _ if matches!(values, HeaderValues::Single(_)) => Err(Error::InvalidInput(
            "Link header carries several rel=next entries".to_string(),
        )),
        _ => Err(Error::InvalidInput(
            "received multiple Link headers with rel=next".to_string(),
        )),
    }
}
