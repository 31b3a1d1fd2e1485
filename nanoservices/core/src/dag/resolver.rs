use std::collections::{HashMap, HashSet, VecDeque};

use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;

use crate::dag::node::StreamNode;

/// A validated stream forest.
#[derive(Debug)]
pub struct StreamForest {
    /// Stream names in the order the source declared them.
    pub declared: Vec<String>,
    pub parents: HashMap<String, Option<String>>,
}

impl StreamForest {
    /// Ancestor chain from the root down to and including `name`.
    pub fn chain(&self, name: &str) -> FlowResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = Some(name.to_string());
        while let Some(node) = current {
            let parent = self
                .parents
                .get(&node)
                .ok_or_else(|| Error::InvalidStreams(format!("unknown stream '{node}'")))?;
            current = parent.clone();
            chain.push(node);
        }
        chain.reverse();
        Ok(chain)
    }
}

/// Validate a source's streams: unique names, known parents, no cycles.
pub fn resolve(nodes: Vec<StreamNode>) -> FlowResult<StreamForest> {
    let mut parents: HashMap<String, Option<String>> = HashMap::new();
    let mut declared = Vec::with_capacity(nodes.len());
    for node in &nodes {
        if parents.insert(node.name.clone(), node.parent.clone()).is_some() {
            return Err(Error::InvalidStreams(format!(
                "duplicate stream name '{}'",
                node.name
            )));
        }
        declared.push(node.name.clone());
    }

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for node in &nodes {
        children.entry(node.name.clone()).or_default();
        if let Some(parent) = &node.parent {
            if !parents.contains_key(parent) {
                return Err(Error::InvalidStreams(format!(
                    "stream '{}' names unknown parent '{parent}'",
                    node.name
                )));
            }
            children
                .entry(parent.clone())
                .or_default()
                .push(node.name.clone());
        }
    }

    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| (n.name.as_str(), usize::from(n.parent.is_some())))
        .collect();

    let mut queue: VecDeque<&str> = declared
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(stream) = queue.pop_front() {
        order.push(stream.to_string());
        for child in children.get(stream).map(Vec::as_slice).unwrap_or_default() {
            if let Some(deg) = in_degree.get_mut(child.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child.as_str());
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let remaining: Vec<&str> = declared
            .iter()
            .map(String::as_str)
            .filter(|n| !placed.contains(n))
            .collect();
        return Err(Error::InvalidStreams(format!(
            "parent cycle involving {remaining:?}"
        )));
    }

    Ok(StreamForest { declared, parents })
}
