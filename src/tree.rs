//! In-memory view of an HDF5 hierarchy: groups, datasets, attributes and links.
//!
//! Paths are absolute and `/`-separated, with `/` as the root group. A child
//! entry resolves to a target path, which differs from `parent/name` when the
//! entry is a link; links are how repeated and cyclic structures appear.

use std::collections::BTreeMap;

use crate::value::AttrValue;

pub const ROOT: &str = "/";

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Group,
    Dataset { value: Option<AttrValue> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    path: String,
    kind: NodeKind,
    attrs: BTreeMap<String, AttrValue>,
    children: BTreeMap<String, String>,
}

impl Node {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group)
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn value(&self) -> Option<&AttrValue> {
        match &self.kind {
            NodeKind::Dataset { value } => value.as_ref(),
            NodeKind::Group => None,
        }
    }

    /// Child link names with their resolved target paths, in link-name order.
    pub fn child_links(&self) -> impl Iterator<Item = (&str, &str)> {
        self.children
            .iter()
            .map(|(name, target)| (name.as_str(), target.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTree {
    nodes: BTreeMap<String, Node>,
}

impl NodeTree {
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(&normalize_path(path))
    }

    /// Resolved child nodes of `node`. Dangling links are skipped.
    pub fn children<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        node.child_links()
            .filter_map(move |(_, target)| self.nodes.get(target))
    }

    /// Value of the dataset at `path`, if the path exists and holds a readable value.
    pub fn value_at(&self, path: &str) -> Option<&AttrValue> {
        self.get(path).and_then(Node::value)
    }
}

/// Incremental construction of a [`NodeTree`]. Parent groups are created on demand.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    nodes: BTreeMap<String, Node>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), new_node(ROOT.to_string(), NodeKind::Group));
        Self { nodes }
    }

    pub fn group(mut self, path: &str) -> Self {
        self.ensure(path, NodeKind::Group);
        self
    }

    pub fn dataset(mut self, path: &str, value: Option<AttrValue>) -> Self {
        self.ensure(path, NodeKind::Dataset { value });
        self
    }

    pub fn attr(mut self, path: &str, name: &str, value: AttrValue) -> Self {
        let node = self.ensure_existing(path);
        node.attrs.insert(name.to_string(), value);
        self
    }

    /// Adds a child entry at `path` that resolves to the existing or future node at `target`.
    pub fn link(mut self, path: &str, target: &str) -> Self {
        let path = normalize_path(path);
        let target = normalize_path(target);
        if let Some((parent, name)) = split_parent(&path) {
            self.ensure(&parent, NodeKind::Group);
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.insert(name, target);
            }
        }
        self
    }

    pub fn build(self) -> NodeTree {
        NodeTree { nodes: self.nodes }
    }

    fn ensure_existing(&mut self, path: &str) -> &mut Node {
        let path = normalize_path(path);
        if !self.nodes.contains_key(&path) {
            self.ensure(&path, NodeKind::Group);
        }
        self.nodes
            .entry(path.clone())
            .or_insert_with(|| new_node(path, NodeKind::Group))
    }

    fn ensure(&mut self, path: &str, kind: NodeKind) {
        let path = normalize_path(path);
        if path == ROOT {
            return;
        }
        if let Some((parent, name)) = split_parent(&path) {
            self.ensure(&parent, NodeKind::Group);
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.entry(name).or_insert_with(|| path.clone());
            }
        }
        match self.nodes.get_mut(&path) {
            Some(existing) => {
                if !matches!(kind, NodeKind::Group) {
                    existing.kind = kind;
                }
            }
            None => {
                self.nodes.insert(path.clone(), new_node(path, kind));
            }
        }
    }
}

fn new_node(path: String, kind: NodeKind) -> Node {
    Node {
        path,
        kind,
        attrs: BTreeMap::new(),
        children: BTreeMap::new(),
    }
}

pub fn normalize_path(path: &str) -> String {
    let parts = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>();
    format!("/{}", parts.join("/"))
}

fn split_parent(path: &str) -> Option<(String, String)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() { ROOT } else { parent };
    Some((parent.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_creates_intermediate_groups() {
        let tree = TreeBuilder::new()
            .dataset("general/subject/age", Some(AttrValue::from("P90D")))
            .build();

        assert!(tree.get("/general").unwrap().is_group());
        assert!(tree.get("general/subject").unwrap().is_group());
        assert_eq!(
            tree.value_at("/general/subject/age"),
            Some(&AttrValue::from("P90D"))
        );
        assert!(tree.value_at("/general/subject").is_none());
    }

    #[test]
    fn children_follow_links_in_name_order() {
        let tree = TreeBuilder::new()
            .group("/b")
            .group("/a")
            .link("/c", "/a")
            .build();

        let paths = tree
            .children(tree.get("/").unwrap())
            .map(|node| node.path().to_string())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/a", "/b", "/a"]);
    }

    #[test]
    fn dangling_links_are_skipped() {
        let tree = TreeBuilder::new().link("/gone", "/nowhere").build();
        assert_eq!(tree.children(tree.get("/").unwrap()).count(), 0);
    }

    #[test]
    fn attributes_attach_to_existing_nodes() {
        let tree = TreeBuilder::new()
            .dataset("/acquisition/data", None)
            .attr("/acquisition/data", "unit", AttrValue::from("volts"))
            .build();
        let node = tree.get("/acquisition/data").unwrap();
        assert!(!node.is_group());
        assert_eq!(node.attr("unit"), Some(&AttrValue::from("volts")));
        assert_eq!(node.attr("description"), None);
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("a//b/"), "/a/b");
        assert_eq!(normalize_path("/./a"), "/a");
    }
}
