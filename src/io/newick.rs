//! # Newick Reader
//!
//! Parses one or more `;`-terminated Newick trees. Tips are numbered first,
//! left to right, then internal nodes in post-order, so the root is the
//! last node. Every non-root node needs a branch length. Bracketed comments
//! are skipped and single-quoted labels may contain any character.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info_span;

use crate::data::Tree;
use crate::error::FelsenError;

type ParseResult<T> = std::result::Result<T, FelsenError>;

#[derive(Debug, Default)]
struct ParsedNode {
    name: Option<String>,
    length: Option<f64>,
    children: Vec<usize>,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    fn error(&self, message: impl Into<String>) -> FelsenError {
        FelsenError::parse(self.line(), message)
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_trivia(&mut self) -> ParseResult<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('[') => match self.text[self.pos..].find(']') {
                    Some(end) => self.pos += end + 1,
                    None => return Err(self.error("unterminated comment")),
                },
                _ => return Ok(()),
            }
        }
    }

    fn label(&mut self) -> ParseResult<Option<String>> {
        self.skip_trivia()?;
        if self.peek() == Some('\'') {
            self.bump();
            let mut label = String::new();
            loop {
                match self.bump() {
                    Some('\'') if self.peek() == Some('\'') => {
                        self.bump();
                        label.push('\'');
                    }
                    Some('\'') => return Ok(Some(label)),
                    Some(c) => label.push(c),
                    None => return Err(self.error("unterminated quoted label")),
                }
            }
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || "():,;[]".contains(c) {
                break;
            }
            self.bump();
        }
        Ok((self.pos > start).then(|| self.text[start..self.pos].to_string()))
    }

    fn length(&mut self) -> ParseResult<Option<f64>> {
        self.skip_trivia()?;
        if self.peek() != Some(':') {
            return Ok(None);
        }
        self.bump();
        self.skip_trivia()?;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || "+-.eE".contains(c) {
                self.bump();
            } else {
                break;
            }
        }
        let raw = &self.text[start..self.pos];
        raw.parse::<f64>()
            .map(Some)
            .map_err(|_| self.error(format!("invalid branch length '{}'", raw)))
    }

    /// Parse the next tree, or `None` at end of input.
    fn tree(&mut self) -> ParseResult<Option<Vec<ParsedNode>>> {
        self.skip_trivia()?;
        if self.peek().is_none() {
            return Ok(None);
        }

        let mut nodes: Vec<ParsedNode> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        let mut expect_node = true;

        loop {
            self.skip_trivia()?;
            match self.peek() {
                Some('(') if expect_node => {
                    self.bump();
                    let idx = nodes.len();
                    nodes.push(ParsedNode::default());
                    if let Some(&parent) = open.last() {
                        nodes[parent].children.push(idx);
                    }
                    open.push(idx);
                }
                Some(',') if !expect_node && !open.is_empty() => {
                    self.bump();
                    expect_node = true;
                }
                Some(')') if !expect_node => {
                    self.bump();
                    let Some(idx) = open.pop() else {
                        return Err(self.error("unbalanced ')'"));
                    };
                    nodes[idx].name = self.label()?;
                    nodes[idx].length = self.length()?;
                }
                Some(';') if !expect_node => {
                    self.bump();
                    if !open.is_empty() {
                        return Err(self.error("missing ')' before ';'"));
                    }
                    return Ok(Some(nodes));
                }
                Some(_) if expect_node => {
                    let name = self.label()?;
                    let length = self.length()?;
                    if name.is_none() && length.is_none() {
                        return Err(self.error(format!("unexpected character {:?}", self.peek())));
                    }
                    let idx = nodes.len();
                    nodes.push(ParsedNode {
                        name,
                        length,
                        children: Vec::new(),
                    });
                    match open.last() {
                        Some(&parent) => nodes[parent].children.push(idx),
                        None => return Err(self.error("a tree needs at least two tips")),
                    }
                    expect_node = false;
                }
                Some(c) => return Err(self.error(format!("unexpected character '{}'", c))),
                None => return Err(self.error("tree is not terminated by ';'")),
            }
        }
    }
}

/// Renumber parsed nodes (tips first, root last) and build the tree.
fn build(nodes: Vec<ParsedNode>) -> Result<Tree> {
    let n = nodes.len();
    let mut post_order = Vec::with_capacity(n);
    let mut stack = vec![(0usize, false)];
    while let Some((idx, expanded)) = stack.pop() {
        if expanded {
            post_order.push(idx);
        } else {
            stack.push((idx, true));
            for &c in nodes[idx].children.iter().rev() {
                stack.push((c, false));
            }
        }
    }

    let mut new_index = vec![0usize; n];
    let mut next = 0;
    for &idx in post_order.iter().filter(|&&i| nodes[i].children.is_empty()) {
        new_index[idx] = next;
        next += 1;
    }
    for &idx in post_order.iter().filter(|&&i| !nodes[i].children.is_empty()) {
        new_index[idx] = next;
        next += 1;
    }

    let mut parents = vec![None; n];
    let mut lengths = vec![0.0; n];
    let mut names = vec![None; n];
    for (idx, node) in nodes.into_iter().enumerate() {
        let new = new_index[idx];
        for &c in &node.children {
            parents[new_index[c]] = Some(new);
        }
        if idx != 0 {
            lengths[new] = match node.length {
                Some(l) => l,
                None => bail!(
                    "branch above {} has no length",
                    node.name.as_deref().unwrap_or("an unnamed node")
                ),
            };
        }
        names[new] = node.name;
    }

    let tree = Tree::from_parents(&parents, &lengths)?;
    Ok(tree.with_names(names)?)
}

/// Parse every tree in a Newick string.
pub fn parse_newick(text: &str) -> Result<Vec<Tree>> {
    let mut parser = Parser::new(text);
    let mut trees = Vec::new();
    while let Some(nodes) = parser.tree()? {
        trees.push(build(nodes).with_context(|| format!("tree {}", trees.len() + 1))?);
    }
    if trees.is_empty() {
        bail!("no trees found");
    }
    Ok(trees)
}

/// Read all trees from a Newick file (optionally gzipped).
pub fn read_trees(path: &Path) -> Result<Vec<Tree>> {
    info_span!("read_trees", path = ?path).in_scope(|| {
        let mut text = String::new();
        super::open_text(path)?
            .read_to_string(&mut text)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_newick(&text).with_context(|| format!("Failed to parse Newick file {}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NodeIdx;

    #[test]
    fn test_rooted_binary() {
        let trees = parse_newick("((a:0.1,b:0.2)ab:0.05,c:0.3);").unwrap();
        let tree = &trees[0];
        assert_eq!(tree.n_nodes(), 5);
        assert_eq!(tree.n_tips(), 3);
        assert_eq!(tree.name(NodeIdx(0)), Some("a"));
        assert_eq!(tree.name(NodeIdx(2)), Some("c"));
        assert_eq!(tree.name(NodeIdx(3)), Some("ab"));
        assert_eq!(tree.root(), NodeIdx(4));
        assert_eq!(tree.branch_length(NodeIdx(1)), 0.2);
        assert_eq!(tree.parent(NodeIdx(0)), Some(NodeIdx(3)));
    }

    #[test]
    fn test_unrooted_trifurcation_and_comments() {
        let text = "[&U] (a:1e-2, 'b c':0.2 [comment], d:0.3);\n(x:1,y:1);";
        let trees = parse_newick(text).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].children(trees[0].root()).len(), 3);
        assert_eq!(trees[0].name(NodeIdx(1)), Some("b c"));
        assert_eq!(trees[0].branch_length(NodeIdx(0)), 0.01);
    }

    #[test]
    fn test_malformed_trees() {
        assert!(parse_newick("(a:0.1,b:0.2").is_err());
        assert!(parse_newick("(a:0.1,b:0.2));").is_err());
        assert!(parse_newick("(a:0.1,b);").is_err());
        assert!(parse_newick("((a:0.1):0.2,b:0.1);").is_err());
        assert!(parse_newick("(a:x,b:0.1);").is_err());
        assert!(parse_newick("").is_err());
    }

    #[test]
    fn test_duplicate_tip_names() {
        let err = parse_newick("(a:0.1,a:0.1,b:0.1);").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FelsenError>(),
            Some(FelsenError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_syntax_errors_carry_line() {
        let err = parse_newick("(a:0.1,\nb:0.2,\n(c:0.1;").unwrap_err();
        match err.downcast_ref::<FelsenError>() {
            Some(FelsenError::Parse { line, .. }) => assert_eq!(*line, 3),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }
}
