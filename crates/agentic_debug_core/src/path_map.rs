//! Remote/local path translation for breakpoint bookkeeping.

use serde::{Deserialize, Serialize};

use crate::config::PathMappings;

pub trait PathMapper: Send + Sync {
    fn to_remote(&self, local: &str) -> String;
    fn to_local(&self, remote: &str) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub remote: String,
    pub local: String,
}

/// Longest-prefix mapper. A prefix only matches on a path-segment boundary,
/// so `/app` maps `/app/index.php` but not `/application/index.php`.
#[derive(Debug, Clone, Default)]
pub struct PrefixPathMapper {
    mappings: Vec<PathMapping>,
}

impl PrefixPathMapper {
    pub fn new(mappings: Vec<PathMapping>) -> Self {
        let mappings = mappings
            .into_iter()
            .map(|m| PathMapping {
                remote: trim_separator(&m.remote).to_string(),
                local: trim_separator(&m.local).to_string(),
            })
            .collect();
        Self { mappings }
    }

    pub fn from_config(mappings: &PathMappings) -> Self {
        Self::new(
            mappings
                .iter()
                .map(|(remote, local)| PathMapping {
                    remote: remote.clone(),
                    local: local.clone(),
                })
                .collect(),
        )
    }

    fn translate<'a>(
        &'a self,
        path: &str,
        from: impl Fn(&'a PathMapping) -> &'a str,
        to: impl Fn(&'a PathMapping) -> &'a str,
    ) -> String {
        let best = self
            .mappings
            .iter()
            .filter_map(|m| strip_prefix(path, from(m)).map(|rest| (m, rest)))
            .max_by_key(|&(m, _)| from(m).len());

        match best {
            Some((m, rest)) => {
                let joined = format!("{}{}", to(m).trim_end_matches('/'), rest);
                if joined.is_empty() {
                    "/".to_string()
                } else {
                    joined
                }
            }
            None => path.to_string(),
        }
    }
}

impl PathMapper for PrefixPathMapper {
    fn to_remote(&self, local: &str) -> String {
        self.translate(local, |m| &m.local, |m| &m.remote)
    }

    fn to_local(&self, remote: &str) -> String {
        self.translate(remote, |m| &m.remote, |m| &m.local)
    }
}

fn trim_separator(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        &path[..path.len().min(1)]
    } else {
        trimmed
    }
}

/// Remainder of `path` after `prefix`, including the leading separator.
fn strip_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    if prefix == "/" {
        return path.starts_with('/').then_some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with(['/', '\\'])).then_some(rest)
}
