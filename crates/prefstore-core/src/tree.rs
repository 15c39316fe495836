//! The in-memory configuration tree.
//!
//! Resolution walks a path from the root. When an intermediate node is a
//! link, its target is spliced in front of the remaining segments and the
//! walk restarts from the root. Each restart counts as one hop; more than
//! [`MAX_LINK_HOPS`] hops is an error. Cycles are only ever caught by this
//! bound.
//!
//! A terminal link is not followed: `get` hands back `Value::Link(target)`
//! and the caller decides whether to dereference it.

use std::sync::Arc;

use crate::error::{PrefsError, Result};
use crate::model::{Mapping, Value};
use crate::path::TreePath;

/// Maximum number of link substitutions during a single resolution.
pub const MAX_LINK_HOPS: usize = 8;

/// A nested mapping with link-aware path addressing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: Arc<Mapping>,
}

impl ConfigTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing root mapping.
    pub fn from_mapping(root: Mapping) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    /// The root mapping.
    pub fn root(&self) -> &Mapping {
        &self.root
    }

    /// A cheap copy sharing structure with this tree.
    pub fn snapshot(&self) -> ConfigTree {
        self.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Top-level keys.
    pub fn root_keys(&self) -> Vec<String> {
        self.root.keys().cloned().collect()
    }

    /// Get the value at `path`, following intermediate links.
    pub fn get(&self, path: &str) -> Result<Value> {
        let path = TreePath::parse(path)?;
        let segments = self.resolve(&path, false)?;
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(PrefsError::BadArgument(format!("empty path {path}")));
        };

        let parent = walk(&self.root, parents)
            .ok_or_else(|| PrefsError::NotFound(path.to_string()))?;
        parent
            .get(leaf)
            .cloned()
            .ok_or_else(|| PrefsError::NotFound(path.to_string()))
    }

    /// Set the value at `path`, creating intermediate mappings as needed.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let path = TreePath::parse(path)?;
        let segments = self.resolve(&path, true)?;
        insert_at(Arc::make_mut(&mut self.root), &segments, value, &path)
    }

    /// Remove the value at `path`.
    pub fn remove(&mut self, path: &str) -> Result<Value> {
        let path = TreePath::parse(path)?;
        let segments = self.resolve(&path, false)?;
        remove_at(Arc::make_mut(&mut self.root), &segments, &path)
    }

    /// Return the link target if the node at `path` is a link.
    pub fn get_link(&self, path: &str) -> Result<Option<String>> {
        Ok(self.get(path)?.as_link().map(String::from))
    }

    /// Make `path` a link to `target`. The target must resolve to a mapping.
    pub fn set_link(&mut self, path: &str, target: &str) -> Result<()> {
        let normalized = TreePath::parse(target)?;
        match self.get(target)? {
            Value::Mapping(_) => {}
            _ => {
                return Err(PrefsError::BadArgument(format!(
                    "link target {normalized} is not a mapping"
                )))
            }
        }
        self.set(path, Value::Link(normalized.to_string()))
    }

    /// Child names of the mapping at `path`.
    pub fn keys(&self, path: &str) -> Result<Vec<String>> {
        match self.get(path)? {
            Value::Mapping(map) => Ok(map.keys().cloned().collect()),
            _ => Err(PrefsError::BadArgument(format!("{path} is not a mapping"))),
        }
    }

    /// Create an empty mapping under `prefix` with a fresh random name and
    /// return its path.
    pub fn unique_child(&mut self, prefix: &str) -> Result<String> {
        let prefix_path = TreePath::parse(prefix)?;
        match self.get(prefix) {
            Ok(Value::Mapping(_)) | Err(PrefsError::NotFound(_)) => {}
            Ok(Value::Link(_)) => {
                return Err(PrefsError::BadArgument(format!(
                    "{prefix_path} is a link"
                )))
            }
            Ok(_) => {
                return Err(PrefsError::BadArgument(format!(
                    "{prefix_path} is not a mapping"
                )))
            }
            Err(err) => return Err(err),
        }

        loop {
            let name = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
            let child = prefix_path.child(&name)?.to_string();
            match self.get(&child) {
                Err(PrefsError::NotFound(_)) => {
                    self.set(&child, Value::empty_mapping())?;
                    return Ok(child);
                }
                Ok(_) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolve intermediate links in `path`, returning the segments of the
    /// location the operation should touch.
    ///
    /// With `create`, a missing intermediate ends resolution successfully:
    /// everything below it will be synthesized, so no further link can be
    /// met.
    fn resolve(&self, path: &TreePath, create: bool) -> Result<Vec<String>> {
        let mut segments = path.segments().to_vec();
        let mut hops = 0;

        'restart: loop {
            let mut node: &Mapping = &self.root;

            for i in 0..segments.len() - 1 {
                match node.get(&segments[i]) {
                    None if create => return Ok(segments),
                    None => return Err(PrefsError::NotFound(path.to_string())),
                    Some(Value::Mapping(map)) => node = &**map,
                    Some(Value::Link(target)) => {
                        hops += 1;
                        if hops > MAX_LINK_HOPS {
                            return Err(PrefsError::MaxLinksExceeded(path.to_string()));
                        }
                        let target = TreePath::parse(target)
                            .map_err(|_| PrefsError::BadLink(segments[..=i].join("/")))?;
                        let mut next = target.segments().to_vec();
                        next.extend_from_slice(&segments[i + 1..]);
                        segments = next;
                        continue 'restart;
                    }
                    Some(_) => {
                        return Err(if create {
                            PrefsError::BadArgument(format!(
                                "/{} is not a mapping",
                                segments[..=i].join("/")
                            ))
                        } else {
                            PrefsError::NotFound(path.to_string())
                        })
                    }
                }
            }

            return Ok(segments);
        }
    }
}

impl From<Mapping> for ConfigTree {
    fn from(root: Mapping) -> Self {
        ConfigTree::from_mapping(root)
    }
}

/// Walk plain mappings without link handling.
fn walk<'a>(root: &'a Mapping, segments: &[String]) -> Option<&'a Mapping> {
    let mut node = root;
    for segment in segments {
        node = node.get(segment)?.as_mapping()?;
    }
    Some(node)
}

fn insert_at(map: &mut Mapping, segments: &[String], value: Value, path: &TreePath) -> Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(PrefsError::BadArgument(format!("empty path {path}")));
    };

    if rest.is_empty() {
        map.insert(head.clone(), value);
        return Ok(());
    }

    let child = map
        .entry(head.clone())
        .or_insert_with(Value::empty_mapping);
    match child {
        Value::Mapping(child) => insert_at(Arc::make_mut(child), rest, value, path),
        _ => Err(PrefsError::BadArgument(format!("{path} crosses a non-mapping"))),
    }
}

fn remove_at(map: &mut Mapping, segments: &[String], path: &TreePath) -> Result<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(PrefsError::BadArgument(format!("empty path {path}")));
    };

    if rest.is_empty() {
        return map
            .remove(head)
            .ok_or_else(|| PrefsError::NotFound(path.to_string()));
    }

    match map.get_mut(head) {
        Some(Value::Mapping(child)) => {
            if !child.contains_key(&rest[0]) && rest.len() == 1 {
                return Err(PrefsError::NotFound(path.to_string()));
            }
            remove_at(Arc::make_mut(child), rest, path)
        }
        _ => Err(PrefsError::NotFound(path.to_string())),
    }
}
