// src/version/branch.rs

//! Branches: chains of labels joined by shadows and branch points
//!
//! String syntax:
//! - `/host@ns:tag` a root branch
//! - `/host@ns:tag//other@ns:tag` a shadow of the root branch
//! - `/host@ns:tag/1.0-1-1/other@ns:tag` a branch from revision `1.0-1-1`

use super::revision::Revision;
use crate::error::{Error, Result};
use crate::label::Label;
use std::fmt;
use std::str::FromStr;

/// One label of a branch and how it was reached from its parent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BranchNode {
    Root(Label),
    /// Reached with `//label`; inherits the parent's revisions
    Shadow(Label),
    /// Reached with `/revision/label`; new versions start from `parent`
    Branch { parent: Revision, label: Label },
}

impl BranchNode {
    pub fn label(&self) -> &Label {
        match self {
            BranchNode::Root(label) | BranchNode::Shadow(label) => label,
            BranchNode::Branch { label, .. } => label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch {
    nodes: Vec<BranchNode>,
}

impl Branch {
    pub fn root(label: Label) -> Self {
        Self {
            nodes: vec![BranchNode::Root(label)],
        }
    }

    pub(crate) fn from_nodes(nodes: Vec<BranchNode>) -> Result<Self> {
        match nodes.first() {
            Some(BranchNode::Root(_)) => {}
            _ => return Err(Error::VersionParse("branch must start at a root label".to_string())),
        }
        if nodes[1..].iter().any(|n| matches!(n, BranchNode::Root(_))) {
            return Err(Error::VersionParse("root label in the middle of a branch".to_string()));
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|n| n.label() == node.label()) {
                return Err(Error::VersionParse(format!(
                    "label {} appears twice in branch",
                    node.label()
                )));
            }
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[BranchNode] {
        &self.nodes
    }

    /// The branch's own (last) label
    pub fn label(&self) -> &Label {
        // from_nodes guarantees at least one node
        self.nodes[self.nodes.len() - 1].label()
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.nodes.iter().map(BranchNode::label)
    }

    pub fn has_label(&self, label: &Label) -> bool {
        self.labels().any(|l| l == label)
    }

    /// Number of shadow and branch steps below the root label
    pub fn depth(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.nodes.last(), Some(BranchNode::Shadow(_)))
    }

    pub fn parent_branch(&self) -> Option<Branch> {
        if self.nodes.len() < 2 {
            return None;
        }
        Some(Self {
            nodes: self.nodes[..self.nodes.len() - 1].to_vec(),
        })
    }

    pub(crate) fn with_node(&self, node: BranchNode) -> Result<Branch> {
        if self.has_label(node.label()) {
            return Err(Error::AlreadyExists(format!(
                "label {} is already part of branch {}",
                node.label(),
                self
            )));
        }
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Ok(Self { nodes })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (nodes, trailing) = parse_segments(s)?;
        if trailing.is_some() {
            return Err(Error::VersionParse(format!("'{}' is a version, not a branch", s)));
        }
        Self::from_nodes(nodes)
    }
}

/// Parse the shared branch/version grammar; returns the nodes and the
/// trailing revision when present
pub(crate) fn parse_segments(s: &str) -> Result<(Vec<BranchNode>, Option<Revision>)> {
    let bad = |why: &str| Error::VersionParse(format!("{}: '{}'", why, s));

    let rest = s.strip_prefix('/').ok_or_else(|| bad("must begin with '/'"))?;
    let parts: Vec<&str> = rest.split('/').collect();

    let mut nodes = Vec::new();
    let mut trailing = None;
    let mut i = 0;

    let root = parts.first().ok_or_else(|| bad("missing label"))?;
    nodes.push(BranchNode::Root(Label::parse(root).map_err(|e| bad(&e.to_string()))?));
    i += 1;

    while i < parts.len() {
        let part = parts[i];
        if part.is_empty() {
            // `//label`
            let label = parts.get(i + 1).ok_or_else(|| bad("dangling '//'"))?;
            nodes.push(BranchNode::Shadow(Label::parse(label).map_err(|e| bad(&e.to_string()))?));
            i += 2;
        } else if part.contains('@') {
            return Err(bad("labels must be separated by a revision or '//'"));
        } else {
            let revision = Revision::parse(part)?;
            if i + 1 == parts.len() {
                trailing = Some(revision);
                i += 1;
            } else {
                let label = parts[i + 1];
                if !label.contains('@') {
                    return Err(bad("expected a label after a branch revision"));
                }
                nodes.push(BranchNode::Branch {
                    parent: revision,
                    label: Label::parse(label).map_err(|e| bad(&e.to_string()))?,
                });
                i += 2;
            }
        }
    }

    Ok((nodes, trailing))
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            match node {
                BranchNode::Root(label) => write!(f, "/{}", label)?,
                BranchNode::Shadow(label) => write!(f, "//{}", label)?,
                BranchNode::Branch { parent, label } => write!(f, "/{}/{}", parent, label)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Branch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Branch::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_branches() {
        for s in [
            "/a@b:c",
            "/a@b:c//d@e:f",
            "/a@b:c/1.0-1-1/d@e:f",
            "/a@b:c//d@e:f/1.0-1.1-1/g@h:i",
        ] {
            let branch = Branch::parse(s).unwrap();
            assert_eq!(branch.to_string(), s);
        }
    }

    #[test]
    fn test_branch_structure() {
        let branch = Branch::parse("/a@b:c//d@e:f").unwrap();
        assert_eq!(branch.label().to_string(), "d@e:f");
        assert!(branch.is_shadow());
        assert_eq!(branch.depth(), 1);
        assert_eq!(branch.parent_branch().unwrap().to_string(), "/a@b:c");
        assert!(Branch::parse("/a@b:c").unwrap().parent_branch().is_none());
    }

    #[test]
    fn test_parse_branch_errors() {
        assert!(Branch::parse("a@b:c").is_err());
        assert!(Branch::parse("/a@b:c/1.0-1").is_err());
        assert!(Branch::parse("/a@b:c/d@e:f").is_err());
        assert!(Branch::parse("/a@b:c//").is_err());
        assert!(Branch::parse("/a@b:c//a@b:c").is_err());
    }
}
