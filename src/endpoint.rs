use crate::error::ConfigError;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Normalize a node address into a base HTTP URL.
///
/// Examples:
/// - "127.0.0.1:8030" -> "http://127.0.0.1:8030"
/// - "https://fe.example.com:8443/" -> "https://fe.example.com:8443"
pub fn normalize_node_url(node: &str) -> Result<String, ConfigError> {
    let node = node.trim().trim_end_matches('/');
    if node.is_empty() {
        return Err(ConfigError::Missing("node_urls"));
    }

    let lower = node.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(node.to_string())
    } else if lower.contains("://") {
        Err(ConfigError::Invalid {
            key: "node_urls",
            reason: format!("unsupported scheme in `{}`", node),
        })
    } else {
        Ok(format!("http://{}", node))
    }
}

/// Node addresses tried in round-robin order.
///
/// Each call to [`EndpointList::rotation`] starts one node further along,
/// spreading loads across nodes while still visiting every node once.
#[derive(Debug)]
pub struct EndpointList {
    urls: Vec<String>,
    next: AtomicUsize,
}

impl EndpointList {
    pub fn parse<S: AsRef<str>>(nodes: &[S]) -> Result<Self, ConfigError> {
        let urls = nodes
            .iter()
            .map(|n| normalize_node_url(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if urls.is_empty() {
            return Err(ConfigError::Missing("node_urls"));
        }
        Ok(EndpointList {
            urls,
            next: AtomicUsize::new(0),
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// All nodes, starting from the next one in round-robin order.
    pub fn rotation(&self) -> impl Iterator<Item = &str> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        self.urls
            .iter()
            .cycle()
            .skip(start)
            .take(self.urls.len())
            .map(String::as_str)
    }
}
