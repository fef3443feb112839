//! XML mutations over a lightweight DOM.
//!
//! The parser covers what real-world seed documents need: a prolog,
//! comments, processing instructions, CDATA (kept verbatim), elements with
//! attributes, and raw text. Every emitted variant is serialized and parsed
//! again; anything that fails the round trip is dropped, so the engine only
//! ever sees well-formed XML from this mutator. The prolog, when present,
//! is always preserved.

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};

use super::fallback_perturbation;

const DEFAULT_VARIANTS: usize = 12;
const EDITS_PER_VARIANT: usize = 2;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    /// Verbatim markup we do not model (PIs, CDATA, doctype).
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
struct Document {
    prolog: Option<String>,
    root: Element,
}

#[derive(Debug)]
pub struct XmlMutator {
    rng: SmallRng,
    variants: usize,
    /// Down-weights destructive tree surgery.
    safe_mode: bool,
}

impl XmlMutator {
    pub fn new(seed: u64) -> Self {
        Self::with_safe_mode(seed, true)
    }

    pub fn with_safe_mode(seed: u64, safe_mode: bool) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            variants: DEFAULT_VARIANTS,
            safe_mode,
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let Ok(text) = std::str::from_utf8(data) else {
            return vec![fallback_perturbation(&mut self.rng, data)];
        };
        let Some(document) = parse_document(text) else {
            return vec![fallback_perturbation(&mut self.rng, data)];
        };

        let mut variants = Vec::with_capacity(self.variants);
        for _ in 0..self.variants {
            let mut candidate = document.clone();
            for _ in 0..self.rng.random_range(1..=EDITS_PER_VARIANT) {
                self.apply_edit(&mut candidate.root);
            }
            let serialized = serialize_document(&candidate);
            // Round-trip guarantee: drop anything the parser rejects.
            if parse_document(&serialized).is_some() {
                variants.push(serialized.into_bytes());
            }
        }
        if variants.is_empty() {
            variants.push(fallback_perturbation(&mut self.rng, data));
        }
        variants
    }

    fn apply_edit(&mut self, root: &mut Element) {
        // Destructive ops (delete, move) sit at the end of the table so
        // safe mode can shrink the dice range instead of keeping weights.
        let op_count = if self.safe_mode { 9 } else { 11 };
        match self.rng.random_range(0..op_count) {
            0 => self.rename_tag(root),
            1 => self.insert_element(root),
            2 => self.duplicate_element(root),
            3 => self.swap_siblings(root),
            4 => self.tweak_attribute(root),
            5 => self.delete_attribute(root),
            6 => self.mutate_numeric_text(root),
            7 => self.insert_comment(root),
            8 => self.replace_entity(root),
            9 => self.delete_element(root),
            _ => self.move_subtree(root),
        }
    }

    fn rename_tag(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let Some(path) = paths.choose(&mut self.rng) else {
            return;
        };
        if let Some(element) = element_at_mut(root, path) {
            element.tag = self.mutate_name(&element.tag.clone());
        }
    }

    fn insert_element(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let Some(path) = paths.choose(&mut self.rng) else {
            return;
        };
        let tag = format!("x{}", self.rng.random_range(0..1000u32));
        let mut fresh = Element {
            tag,
            attributes: Vec::new(),
            children: Vec::new(),
        };
        if self.rng.random_bool(0.6) {
            let text = self.random_text(8);
            fresh.children.push(Node::Text(text));
        }
        if let Some(parent) = element_at_mut(root, path) {
            let index = if parent.children.is_empty() {
                0
            } else {
                self.rng.random_range(0..=parent.children.len())
            };
            parent.children.insert(index, Node::Element(fresh));
        }
    }

    fn delete_element(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        // Never delete the root itself.
        let deletable: Vec<&Vec<usize>> =
            paths.iter().filter(|path| !path.is_empty()).collect();
        let Some(path) = deletable.choose(&mut self.rng) else {
            return;
        };
        let (parent_path, index) = path.split_at(path.len() - 1);
        if let Some(parent) = element_at_mut(root, parent_path) {
            let child_index = element_child_index(parent, index[0]);
            if let Some(position) = child_index {
                parent.children.remove(position);
            }
        }
    }

    fn duplicate_element(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let duplicable: Vec<&Vec<usize>> =
            paths.iter().filter(|path| !path.is_empty()).collect();
        let Some(path) = duplicable.choose(&mut self.rng) else {
            return;
        };
        let (parent_path, index) = path.split_at(path.len() - 1);
        if let Some(parent) = element_at_mut(root, parent_path) {
            if let Some(position) = element_child_index(parent, index[0]) {
                let copy = parent.children[position].clone();
                parent.children.insert(position, copy);
            }
        }
    }

    /// Detaches a non-root subtree and re-inserts it under another element.
    fn move_subtree(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let movable: Vec<&Vec<usize>> =
            paths.iter().filter(|path| !path.is_empty()).collect();
        let Some(path) = movable.choose(&mut self.rng) else {
            return;
        };
        let (parent_path, index) = path.split_at(path.len() - 1);
        let Some(parent) = element_at_mut(root, parent_path) else {
            return;
        };
        let Some(position) = element_child_index(parent, index[0]) else {
            return;
        };
        let subtree = parent.children.remove(position);

        // Re-collect: paths changed after the removal.
        let destinations = element_paths(root);
        let Some(dest_path) = destinations.choose(&mut self.rng) else {
            root.children.push(subtree);
            return;
        };
        match element_at_mut(root, dest_path) {
            Some(dest) => dest.children.push(subtree),
            None => root.children.push(subtree),
        }
    }

    fn swap_siblings(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let Some(path) = paths.choose(&mut self.rng) else {
            return;
        };
        if let Some(parent) = element_at_mut(root, path) {
            let elements: Vec<usize> = parent
                .children
                .iter()
                .enumerate()
                .filter(|(_, node)| matches!(node, Node::Element(_)))
                .map(|(index, _)| index)
                .collect();
            if elements.len() >= 2 {
                let first = self.rng.random_range(0..elements.len() - 1);
                parent
                    .children
                    .swap(elements[first], elements[first + 1]);
            }
        }
    }

    fn tweak_attribute(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let Some(path) = paths.choose(&mut self.rng) else {
            return;
        };
        let value = self.random_text(6);
        let name = format!("a{}", self.rng.random_range(0..100u32));
        let roll = self.rng.random_bool(0.5);
        if let Some(element) = element_at_mut(root, path) {
            if element.attributes.is_empty() || roll {
                element.attributes.push((name, value));
            } else {
                let index = self.rng.random_range(0..element.attributes.len());
                element.attributes[index].1 = value;
            }
        }
    }

    fn delete_attribute(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let Some(path) = paths.choose(&mut self.rng) else {
            return;
        };
        if let Some(element) = element_at_mut(root, path)
            && !element.attributes.is_empty()
        {
            let index = self.rng.random_range(0..element.attributes.len());
            element.attributes.remove(index);
        }
    }

    /// Applies a small delta to a text node that parses as a number.
    fn mutate_numeric_text(&mut self, root: &mut Element) {
        let delta = self.rng.random_range(-10..=10i64);
        visit_text_nodes(root, &mut |text| {
            if let Ok(value) = text.trim().parse::<i64>() {
                *text = (value + delta).to_string();
                return true;
            }
            if let Ok(value) = text.trim().parse::<f64>() {
                *text = format!("{}", value + delta as f64 * 0.5);
                return true;
            }
            false
        });
    }

    fn insert_comment(&mut self, root: &mut Element) {
        let paths = element_paths(root);
        let Some(path) = paths.choose(&mut self.rng) else {
            return;
        };
        let comment = self.random_text(10);
        if let Some(element) = element_at_mut(root, path) {
            let index = if element.children.is_empty() {
                0
            } else {
                self.rng.random_range(0..=element.children.len())
            };
            element.children.insert(index, Node::Comment(comment));
        }
    }

    /// Replaces one entity reference with its literal character. Variants
    /// that become ill-formed (a literal `<`) fail the round trip and are
    /// dropped by `mutate`.
    fn replace_entity(&mut self, root: &mut Element) {
        let replacements = [
            ("&amp;", "&"),
            ("&lt;", "<"),
            ("&gt;", ">"),
            ("&quot;", "\""),
        ];
        let (entity, literal) = *replacements.choose(&mut self.rng).unwrap_or(&replacements[0]);
        visit_text_nodes(root, &mut |text| {
            if text.contains(entity) {
                *text = text.replacen(entity, literal, 1);
                true
            } else {
                false
            }
        });
    }

    fn mutate_name(&mut self, name: &str) -> String {
        match self.rng.random_range(0..3u8) {
            0 if name.len() > 1 => {
                let index = self.rng.random_range(0..name.len());
                let replacement = self.random_text(1);
                let mut out = String::with_capacity(name.len());
                for (position, ch) in name.chars().enumerate() {
                    if position == index {
                        out.push_str(&replacement);
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
            1 => format!("{name}{}", self.rng.random_range(0..100u32)),
            _ => name.chars().rev().collect(),
        }
    }

    fn random_text(&mut self, max_len: usize) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let len = self.rng.random_range(1..=max_len);
        (0..len)
            .map(|_| ALPHABET[self.rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

/// Paths of every element in the tree as child-index chains from the root
/// (the root itself is the empty path). Indices count element children
/// only, which keeps paths stable across text-node edits.
fn element_paths(root: &Element) -> Vec<Vec<usize>> {
    let mut paths = vec![Vec::new()];
    fn walk(element: &Element, prefix: &[usize], paths: &mut Vec<Vec<usize>>) {
        let mut element_index = 0;
        for child in &element.children {
            if let Node::Element(child_element) = child {
                let mut path = prefix.to_vec();
                path.push(element_index);
                paths.push(path.clone());
                walk(child_element, &path, paths);
                element_index += 1;
            }
        }
    }
    walk(root, &[], &mut paths);
    paths
}

fn element_at_mut<'e>(root: &'e mut Element, path: &[usize]) -> Option<&'e mut Element> {
    let mut current = root;
    for index in path {
        let mut seen = 0;
        let mut found = None;
        for child in &mut current.children {
            if let Node::Element(element) = child {
                if seen == *index {
                    found = Some(element);
                    break;
                }
                seen += 1;
            }
        }
        current = found?;
    }
    Some(current)
}

/// Position in `children` of the element with element-index `index`.
fn element_child_index(parent: &Element, index: usize) -> Option<usize> {
    let mut seen = 0;
    for (position, child) in parent.children.iter().enumerate() {
        if matches!(child, Node::Element(_)) {
            if seen == index {
                return Some(position);
            }
            seen += 1;
        }
    }
    None
}

/// Applies `edit` to text nodes until one reports a change.
fn visit_text_nodes(element: &mut Element, edit: &mut impl FnMut(&mut String) -> bool) -> bool {
    for child in &mut element.children {
        match child {
            Node::Text(text) => {
                if edit(text) {
                    return true;
                }
            }
            Node::Element(inner) => {
                if visit_text_nodes(inner, edit) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

// ---- parsing ----

struct Parser<'s> {
    input: &'s str,
    position: usize,
}

impl<'s> Parser<'s> {
    fn rest(&self) -> &'s str {
        &self.input[self.position..]
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.rest().starts_with(prefix)
    }

    fn advance(&mut self, count: usize) {
        self.position += count;
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.position = self.input.len() - trimmed.len();
    }

    fn take_until(&mut self, delimiter: &str) -> Option<&'s str> {
        let offset = self.rest().find(delimiter)?;
        let taken = &self.rest()[..offset];
        self.advance(offset + delimiter.len());
        Some(taken)
    }

    fn take_name(&mut self) -> Option<&'s str> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || "_:.-".contains(c)))
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        let name = &rest[..end];
        self.advance(end);
        Some(name)
    }
}

fn parse_document(input: &str) -> Option<Document> {
    let mut parser = Parser { input, position: 0 };
    parser.skip_whitespace();

    let mut prolog = None;
    if parser.starts_with("<?xml") {
        let start = parser.position;
        parser.take_until("?>")?;
        prolog = Some(input[start..parser.position].to_string());
        parser.skip_whitespace();
    }

    // Skip any doctype and leading comments before the root element.
    loop {
        if parser.starts_with("<!--") {
            parser.advance(4);
            parser.take_until("-->")?;
            parser.skip_whitespace();
        } else if parser.starts_with("<!DOCTYPE") {
            parser.take_until(">")?;
            parser.skip_whitespace();
        } else {
            break;
        }
    }

    let root = parse_element(&mut parser)?;
    parser.skip_whitespace();
    if !parser.rest().is_empty() {
        return None;
    }
    Some(Document { prolog, root })
}

fn parse_element(parser: &mut Parser<'_>) -> Option<Element> {
    if !parser.starts_with("<") {
        return None;
    }
    parser.advance(1);
    let tag = parser.take_name()?.to_string();
    let attributes = parse_attributes(parser)?;

    parser.skip_whitespace();
    if parser.starts_with("/>") {
        parser.advance(2);
        return Some(Element {
            tag,
            attributes,
            children: Vec::new(),
        });
    }
    if !parser.starts_with(">") {
        return None;
    }
    parser.advance(1);

    let mut children = Vec::new();
    loop {
        if parser.starts_with("</") {
            parser.advance(2);
            let closing = parser.take_name()?;
            if closing != tag {
                return None;
            }
            parser.skip_whitespace();
            if !parser.starts_with(">") {
                return None;
            }
            parser.advance(1);
            return Some(Element {
                tag,
                attributes,
                children,
            });
        } else if parser.starts_with("<!--") {
            parser.advance(4);
            let comment = parser.take_until("-->")?;
            children.push(Node::Comment(comment.to_string()));
        } else if parser.starts_with("<![CDATA[") {
            let start = parser.position;
            parser.take_until("]]>")?;
            children.push(Node::Raw(parser.input[start..parser.position].to_string()));
        } else if parser.starts_with("<?") {
            let start = parser.position;
            parser.take_until("?>")?;
            children.push(Node::Raw(parser.input[start..parser.position].to_string()));
        } else if parser.starts_with("<") {
            children.push(Node::Element(parse_element(parser)?));
        } else {
            let rest = parser.rest();
            if rest.is_empty() {
                return None;
            }
            let end = rest.find('<').unwrap_or(rest.len());
            children.push(Node::Text(rest[..end].to_string()));
            parser.advance(end);
        }
    }
}

fn parse_attributes(parser: &mut Parser<'_>) -> Option<Vec<(String, String)>> {
    let mut attributes = Vec::new();
    loop {
        parser.skip_whitespace();
        if parser.starts_with(">") || parser.starts_with("/>") || parser.rest().is_empty() {
            return Some(attributes);
        }
        let name = parser.take_name()?.to_string();
        parser.skip_whitespace();
        if !parser.starts_with("=") {
            return None;
        }
        parser.advance(1);
        parser.skip_whitespace();
        let quote = parser.rest().chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        parser.advance(1);
        let value = parser.take_until(&quote.to_string())?.to_string();
        attributes.push((name, value));
    }
}

// ---- serialization ----

fn serialize_document(document: &Document) -> String {
    let mut out = String::new();
    if let Some(prolog) = &document.prolog {
        out.push_str(prolog);
        out.push('\n');
    }
    serialize_element(&document.root, &mut out);
    out
}

fn serialize_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.tag);
    for (name, value) in &element.attributes {
        let quote = if value.contains('"') { '\'' } else { '"' };
        out.push(' ');
        out.push_str(name);
        out.push('=');
        out.push(quote);
        out.push_str(value);
        out.push(quote);
    }
    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &element.children {
        match child {
            Node::Element(inner) => serialize_element(inner, out),
            Node::Text(text) => out.push_str(text),
            Node::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(comment);
                out.push_str("-->");
            }
            Node::Raw(raw) => out.push_str(raw),
        }
    }
    out.push_str("</");
    out.push_str(&element.tag);
    out.push('>');
}
