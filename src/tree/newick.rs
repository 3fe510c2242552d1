//! Newick reader and writer.
//!
//! Supports quoted labels, branch lengths, and bracketed attribute comments in
//! both the `[&key=value,...]` and `[&&NHX:key=value:...]` forms. A file may
//! hold several trees, each terminated by `;`.

use super::{AttributeValue, NodeIdx, Tree, TreeCollection};
use crate::error::{Result, TreeVisError};

/// Parse every tree in `text`.
pub fn parse_newick_collection(text: &str) -> Result<TreeCollection> {
    let mut trees = Vec::new();
    let mut parser = Parser::new(text);
    loop {
        parser.skip_whitespace();
        if parser.at_end() {
            break;
        }
        trees.push(parser.parse_tree()?);
    }
    if trees.is_empty() {
        return Err(TreeVisError::Tree("no trees found in Newick input".to_string()));
    }
    Ok(TreeCollection::new(trees))
}

/// Parse exactly one tree.
pub fn parse_newick(text: &str) -> Result<Tree> {
    let mut parser = Parser::new(text);
    parser.skip_whitespace();
    let tree = parser.parse_tree()?;
    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(parser.error("unexpected content after first tree"));
    }
    Ok(tree)
}

/// Serialize `tree` as a Newick string, attributes included as `[&...]`.
pub fn write_newick(tree: &Tree) -> String {
    let mut out = String::new();
    write_node(tree, tree.root(), &mut out);
    out.push(';');
    out
}

fn write_node(tree: &Tree, idx: NodeIdx, out: &mut String) {
    let Some(node) = tree.get(idx) else {
        return;
    };
    if !node.children.is_empty() {
        out.push('(');
        for (i, &child) in node.children.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_node(tree, child, out);
        }
        out.push(')');
    }
    if let Some(name) = &node.name {
        if name.chars().any(|c| "(),:;[]' \t".contains(c)) {
            out.push('\'');
            out.push_str(&name.replace('\'', "''"));
            out.push('\'');
        } else {
            out.push_str(name);
        }
    }
    if let Some(length) = node.length {
        out.push(':');
        out.push_str(&length.to_string());
    }
    let mut attrs: Vec<String> = node
        .attributes
        .iter()
        .map(|(k, v)| match v {
            AttributeValue::Number(n) => format!("{}={}", k, n),
            AttributeValue::Text(s) => format!("{}=\"{}\"", k, s),
        })
        .collect();
    if let Some(support) = node.support {
        attrs.insert(0, format!("Support={}", support));
    }
    if !attrs.is_empty() {
        out.push_str("[&");
        out.push_str(&attrs.join(","));
        out.push(']');
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn error(&self, message: &str) -> TreeVisError {
        TreeVisError::Tree(format!("Newick parse error at {}: {}", self.pos, message))
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_tree(&mut self) -> Result<Tree> {
        let mut tree = Tree::new();
        let root = tree.root();
        self.parse_subtree(&mut tree, root)?;
        self.skip_whitespace();
        match self.peek() {
            Some(';') => {
                self.pos += 1;
                Ok(tree)
            }
            _ => Err(self.error("expected ';'")),
        }
    }

    fn parse_subtree(&mut self, tree: &mut Tree, idx: NodeIdx) -> Result<()> {
        self.skip_whitespace();
        if self.peek() == Some('(') {
            self.pos += 1;
            loop {
                let child = tree.add_child(idx);
                self.parse_subtree(tree, child)?;
                self.skip_whitespace();
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }
        self.parse_label(tree, idx)
    }

    fn parse_label(&mut self, tree: &mut Tree, idx: NodeIdx) -> Result<()> {
        self.skip_whitespace();
        let name = if self.peek() == Some('\'') {
            Some(self.parse_quoted()?)
        } else {
            let raw = self.take_while(|c| !"(),:;[".contains(c));
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.replace('_', " "))
        };
        if let Some(node) = tree.get_mut(idx) {
            node.name = name;
        }
        self.skip_whitespace();
        if self.peek() == Some('[') {
            self.parse_comment(tree, idx)?;
        }
        self.skip_whitespace();
        if self.peek() == Some(':') {
            self.pos += 1;
            self.skip_whitespace();
            let raw = self.take_while(|c| !"(),;[".contains(c));
            let length: f64 = raw
                .trim()
                .parse()
                .map_err(|_| self.error(&format!("invalid branch length '{}'", raw.trim())))?;
            if let Some(node) = tree.get_mut(idx) {
                node.length = Some(length);
            }
        }
        self.skip_whitespace();
        if self.peek() == Some('[') {
            self.parse_comment(tree, idx)?;
        }
        Ok(())
    }

    fn parse_quoted(&mut self) -> Result<String> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted label")),
                Some('\'') => {
                    self.pos += 1;
                    if self.peek() == Some('\'') {
                        out.push('\'');
                        self.pos += 1;
                    } else {
                        return Ok(out);
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn parse_comment(&mut self, tree: &mut Tree, idx: NodeIdx) -> Result<()> {
        self.pos += 1;
        let body = self.take_while(|c| c != ']');
        if self.peek() != Some(']') {
            return Err(self.error("unterminated comment"));
        }
        self.pos += 1;

        let pairs: Vec<&str> = if let Some(nhx) = body.strip_prefix("&&NHX:") {
            nhx.split(':').collect()
        } else if let Some(attrs) = body.strip_prefix('&') {
            attrs.split(',').collect()
        } else {
            return Ok(());
        };
        for pair in pairs {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            let parsed = match value.parse::<f64>() {
                Ok(n) => AttributeValue::Number(n),
                Err(_) => AttributeValue::Text(value.to_string()),
            };
            tree.set_attribute(idx, key.trim(), Some(parsed))
                .map_err(|e| self.error(&e))?;
        }
        Ok(())
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if pred(c)) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ATTR_LENGTH, ATTR_SUPPORT};

    #[test]
    fn test_parse_simple() {
        let tree = parse_newick("((A:1,B:2)ab:0.5,C:3)root;").unwrap();
        assert_eq!(tree.len(), 5);
        let b = tree.find_by_name("B")[0];
        assert_eq!(tree.get(b).unwrap().length, Some(2.0));
        assert_eq!(tree.root_distance(b), 2.5);
    }

    #[test]
    fn test_parse_quoted_and_attributes() {
        let tree = parse_newick("('Homo sapiens':1[&Host=\"none\",Support=0.9],B);").unwrap();
        let h = tree.find_by_name("Homo sapiens")[0];
        assert_eq!(
            tree.attribute(h, "Host"),
            Some(AttributeValue::Text("none".into()))
        );
        assert_eq!(tree.attribute(h, ATTR_SUPPORT), Some(AttributeValue::Number(0.9)));
        assert_eq!(tree.attribute(h, ATTR_LENGTH), Some(AttributeValue::Number(1.0)));
    }

    #[test]
    fn test_parse_nhx() {
        let tree = parse_newick("(A[&&NHX:S=human:E=1.1],B);").unwrap();
        let a = tree.find_by_name("A")[0];
        assert_eq!(tree.attribute(a, "S"), Some(AttributeValue::Text("human".into())));
        assert_eq!(tree.attribute(a, "E"), Some(AttributeValue::Number(1.1)));
    }

    #[test]
    fn test_collection() {
        let trees = parse_newick_collection("(A,B);\n(C,(D,E));\n").unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees.get(1).unwrap().leaves(NodeIdx(0)).len(), 3);
    }

    #[test]
    fn test_errors() {
        assert!(parse_newick("(A,B").is_err());
        assert!(parse_newick("(A:x,B);").is_err());
        assert!(parse_newick_collection("   ").is_err());
    }

    #[test]
    fn test_write_reparses() {
        let tree = parse_newick("((A:1,'B c':2)ab,C[&Host=\"x\"]);").unwrap();
        let text = write_newick(&tree);
        let again = parse_newick(&text).unwrap();
        assert_eq!(again.len(), tree.len());
        assert_eq!(again.find_by_name("B c").len(), 1);
        let c = again.find_by_name("C")[0];
        assert_eq!(again.attribute(c, "Host"), Some(AttributeValue::Text("x".into())));
    }
}
