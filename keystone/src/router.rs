// src/router.rs
use crate::error::{KeystoneError, KeystoneResult};
use crate::view::ByteView;
use std::collections::HashMap;

/// Captured parameters beyond this are silently dropped.
pub const MAX_PARAMS: usize = 4;

/// Opaque per-worker identifier of a script-defined callable. Refs are
/// dense indices into the owning bridge's handler table and are not
/// comparable across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRef(pub u32);

/// Inline `(name, value)` capture storage. Names point into router-owned
/// pattern strings, values into the connection read buffer; both outlive
/// the array, which is cleared (not freed) between requests.
#[derive(Clone, Copy)]
pub struct ParamArray {
    entries: [(ByteView, ByteView); MAX_PARAMS],
    len: u8,
}

impl ParamArray {
    pub fn new() -> Self {
        Self {
            entries: [(ByteView::empty(), ByteView::empty()); MAX_PARAMS],
            len: 0,
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Capacity overflow drops the pair without signalling.
    #[inline]
    pub fn push(&mut self, name: ByteView, value: ByteView) {
        if (self.len as usize) < MAX_PARAMS {
            self.entries[self.len as usize] = (name, value);
            self.len += 1;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ByteView, ByteView)> + '_ {
        self.entries[..self.len as usize].iter().copied()
    }
}

impl Default for ParamArray {
    fn default() -> Self {
        Self::new()
    }
}

struct ParamEdge {
    name: String,
    node: RouteNode,
}

struct RouteNode {
    segment: String,
    children: Vec<RouteNode>,
    param: Option<Box<ParamEdge>>,
    handlers: HashMap<String, HandlerRef>,
}

impl RouteNode {
    fn new(segment: String) -> Self {
        Self {
            segment,
            children: Vec::new(),
            param: None,
            handlers: HashMap::new(),
        }
    }
}

/// Radix tree over `/`-delimited path segments. Static edges always win
/// over the (at most one) parameter edge at the same node, and a taken
/// parameter edge is never retracted: there is no backtracking, so a
/// pattern set mixing static and parameter siblings matches
/// asymmetrically. The tree owns copies of every string it stores;
/// matching allocates nothing.
pub struct Router {
    root: RouteNode,
}

impl Router {
    pub fn new() -> Self {
        Self {
            root: RouteNode::new(String::new()),
        }
    }

    /// Register `handler` for `method` under `pattern`. Segments wrapped
    /// in `{}` capture; empty names, a name repeated within one pattern,
    /// and a parameter that renames an existing parameter edge are
    /// rejected here rather than surprising anyone at match time.
    pub fn add_route(
        &mut self,
        method: &str,
        pattern: &str,
        handler: HandlerRef,
    ) -> KeystoneResult<()> {
        let mut seen_names: Vec<&str> = Vec::new();
        let mut node = &mut self.root;

        for segment in pattern.split('/').filter(|s| !s.is_empty()) {
            if let Some(name) = param_name(segment) {
                if name.is_empty() {
                    return Err(KeystoneError::InvalidPattern(format!(
                        "empty parameter name in '{}'",
                        pattern
                    )));
                }
                if seen_names.contains(&name) {
                    return Err(KeystoneError::InvalidPattern(format!(
                        "parameter '{}' appears twice in '{}'",
                        name, pattern
                    )));
                }
                seen_names.push(name);

                if let Some(edge) = node.param.as_deref() {
                    if edge.name != name {
                        return Err(KeystoneError::InvalidPattern(format!(
                            "parameter '{{{}}}' conflicts with existing '{{{}}}' in '{}'",
                            name, edge.name, pattern
                        )));
                    }
                } else {
                    node.param = Some(Box::new(ParamEdge {
                        name: name.to_string(),
                        node: RouteNode::new(String::new()),
                    }));
                }
                node = &mut node.param.as_mut().unwrap().node;
            } else {
                let idx = match node.children.iter().position(|c| c.segment == segment) {
                    Some(i) => i,
                    None => {
                        node.children.push(RouteNode::new(segment.to_string()));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[idx];
            }
        }

        node.handlers.insert(method.to_string(), handler);
        Ok(())
    }

    /// Walk `path` segment by segment, filling `params` along parameter
    /// edges. Returns the handler registered for `method` at the terminal
    /// node, or `None` when no edge applies or the method is unmapped.
    pub fn lookup(
        &self,
        method: &str,
        path: &str,
        params: &mut ParamArray,
    ) -> Option<HandlerRef> {
        let mut node = &self.root;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if let Some(child) = node.children.iter().find(|c| c.segment == segment) {
                node = child;
            } else if let Some(edge) = node.param.as_deref() {
                params.push(
                    ByteView::new(edge.name.as_bytes()),
                    ByteView::new(segment.as_bytes()),
                );
                node = &edge.node;
            } else {
                return None;
            }
        }

        node.handlers.get(method).copied()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn param_name(segment: &str) -> Option<&str> {
    if segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}') {
        Some(&segment[1..segment.len() - 1])
    } else {
        None
    }
}
