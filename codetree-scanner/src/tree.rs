//! Classification tree model.
//!
//! The portal exposes a fixed three-level hierarchy (major, mid, minor). Nodes
//! are rebuilt from the live UI on every run; nothing here is cached across
//! sessions except the labels and ordinals needed to find a node again.

use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const KEY_SEPARATOR: &str = " > ";

/// Characters that carry meaning inside a key and are backslash-escaped in labels.
const KEY_SPECIALS: [char; 3] = ['\\', '>', '#'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Major,
    Mid,
    Minor,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Major => "major",
            Level::Mid => "mid",
            Level::Minor => "minor",
        }
    }

    /// Zero-based depth of nodes at this level below the root.
    pub fn depth(self) -> usize {
        match self {
            Level::Major => 0,
            Level::Mid => 1,
            Level::Minor => 2,
        }
    }

    pub fn at_depth(depth: usize) -> Option<Level> {
        match depth {
            0 => Some(Level::Major),
            1 => Some(Level::Mid),
            2 => Some(Level::Minor),
            _ => None,
        }
    }

    pub fn child(self) -> Option<Level> {
        Level::at_depth(self.depth() + 1)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryNode {
    pub level: Level,
    pub label: String,
    /// On-screen position among its siblings.
    pub ordinal: usize,
    /// 1-based count of siblings carrying the same label, up to and including this one.
    pub occurrence: u32,
}

impl CategoryNode {
    pub fn new(level: Level, label: impl Into<String>, ordinal: usize) -> Self {
        Self {
            level,
            label: label.into(),
            ordinal,
            occurrence: 1,
        }
    }

    /// Label as written in a path key, with `#n` appended for the n-th duplicate.
    pub fn key_segment(&self) -> String {
        let label = escape_label(&self.label);
        if self.occurrence > 1 {
            format!("{}#{}", label, self.occurrence)
        } else {
            label
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == Level::Minor
    }
}

/// Sort freshly enumerated siblings by on-screen position and number duplicate labels.
pub fn order_siblings(mut nodes: Vec<CategoryNode>) -> Vec<CategoryNode> {
    nodes.sort_by_key(|n| n.ordinal);
    let mut seen: Vec<(String, u32)> = Vec::new();
    for node in nodes.iter_mut() {
        match seen.iter_mut().find(|(label, _)| *label == node.label) {
            Some((_, count)) => {
                *count += 1;
                node.occurrence = *count;
            }
            None => {
                seen.push((node.label.clone(), 1));
                node.occurrence = 1;
            }
        }
    }
    nodes
}

/// Find `target` again in a freshly enumerated sibling list.
///
/// Exact label (with duplicate occurrence, then ordinal) wins. Falling back to
/// the bare ordinal is only allowed when `previous_len` says the sibling list
/// kept its shape, otherwise the node is considered gone.
pub fn locate<'a>(
    fresh: &'a [CategoryNode],
    target: &CategoryNode,
    previous_len: Option<usize>,
) -> Option<&'a CategoryNode> {
    let exact: Vec<&CategoryNode> = fresh.iter().filter(|n| n.label == target.label).collect();

    if let Some(node) = exact.iter().find(|n| n.occurrence == target.occurrence) {
        return Some(node);
    }
    if let Some(node) = exact.iter().find(|n| n.ordinal == target.ordinal) {
        return Some(node);
    }

    match previous_len {
        Some(len) if len == fresh.len() => fresh.iter().find(|n| n.ordinal == target.ordinal),
        _ => None,
    }
}

/// Ordered major > mid > minor path. The empty path is the classification root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CategoryPath {
    nodes: Vec<CategoryNode>,
}

impl CategoryPath {
    pub fn root() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn from_nodes(nodes: Vec<CategoryNode>) -> Result<Self> {
        let mut path = CategoryPath::root();
        for node in nodes {
            path = path.child(node)?;
        }
        Ok(path)
    }

    /// Extend the path by one level. The node must sit exactly one level deeper.
    pub fn child(&self, node: CategoryNode) -> Result<Self> {
        let expected = Level::at_depth(self.depth()).ok_or_else(|| {
            ScanError::InvalidPath(format!("cannot descend below a leaf: {}", self))
        })?;
        if node.level != expected {
            return Err(ScanError::InvalidPath(format!(
                "expected a {} node under '{}', got {} '{}'",
                expected, self, node.level, node.label
            )));
        }
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Ok(Self { nodes })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.nodes.is_empty() {
            return None;
        }
        Some(self.prefix(self.nodes.len() - 1))
    }

    pub fn prefix(&self, depth: usize) -> Self {
        Self {
            nodes: self.nodes[..depth.min(self.nodes.len())].to_vec(),
        }
    }

    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_root(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.nodes.last().is_some_and(CategoryNode::is_leaf)
    }

    /// Level of the children below this path, `None` at a leaf.
    pub fn child_level(&self) -> Option<Level> {
        Level::at_depth(self.depth())
    }

    pub fn nodes(&self) -> &[CategoryNode] {
        &self.nodes
    }

    pub fn last(&self) -> Option<&CategoryNode> {
        self.nodes.last()
    }

    pub fn node(&self, level: Level) -> Option<&CategoryNode> {
        self.nodes.get(level.depth())
    }

    pub fn labels(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.label.as_str()).collect()
    }

    pub fn key(&self) -> String {
        self.nodes
            .iter()
            .map(CategoryNode::key_segment)
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    /// Rebuild a path from its key. Ordinals are unknown and left at zero, so
    /// the result must be matched by label against the live tree.
    pub fn parse_key(key: &str) -> Result<Self> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(CategoryPath::root());
        }

        let mut nodes = Vec::new();
        for (depth, segment) in split_unescaped(key, '>').into_iter().enumerate() {
            let segment = segment.trim();
            let level = Level::at_depth(depth)
                .ok_or_else(|| ScanError::InvalidPath(format!("more than three levels in '{}'", key)))?;
            if segment.is_empty() {
                return Err(ScanError::InvalidPath(format!("empty segment in '{}'", key)));
            }
            let (label, occurrence) = split_occurrence(segment);
            let mut node = CategoryNode::new(level, unescape_label(label), 0);
            node.occurrence = occurrence;
            nodes.push(node);
        }
        CategoryPath::from_nodes(nodes)
    }
}

fn escape_label(label: &str) -> String {
    let mut escaped = String::with_capacity(label.len());
    for c in label.chars() {
        if KEY_SPECIALS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn unescape_label(label: &str) -> String {
    let mut plain = String::with_capacity(label.len());
    let mut chars = label.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => plain.extend(chars.next()),
            c => plain.push(c),
        }
    }
    plain
}

/// Split on every `sep` that is not preceded by a backslash escape.
fn split_unescaped(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Separate an unescaped `#n` duplicate marker from the escaped label.
fn split_occurrence(segment: &str) -> (&str, u32) {
    let parts = split_unescaped(segment, '#');
    if parts.len() >= 2
        && let Some(suffix) = parts.last()
        && let Ok(n) = suffix.parse::<u32>()
        && n >= 2
    {
        let label = &segment[..segment.len() - suffix.len() - 1];
        if !label.is_empty() {
            return (label, n);
        }
    }
    (segment, 1)
}

impl fmt::Display for CategoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            return f.write_str("<root>");
        }
        f.write_str(&self.key())
    }
}

/// Name and code carried inside an on-screen label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelParts {
    pub name: String,
    pub code: String,
}

impl LabelParts {
    /// Accepts `Name(CODE)`, `CODE Name` (upper-case alphanumeric code), or a bare name.
    pub fn parse(label: &str) -> Self {
        let text = label.trim();

        if text.ends_with(')')
            && let Some(open) = text.rfind('(')
        {
            let name = text[..open].trim();
            let code = text[open + 1..text.len() - 1].trim();
            if !name.is_empty() && !code.is_empty() {
                return Self {
                    name: name.to_string(),
                    code: code.to_string(),
                };
            }
        }

        if let Some((code, name)) = text.split_once(char::is_whitespace) {
            let name = name.trim();
            if !name.is_empty()
                && code
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            {
                return Self {
                    name: name.to_string(),
                    code: code.to_string(),
                };
            }
        }

        Self {
            name: text.to_string(),
            code: String::new(),
        }
    }
}
