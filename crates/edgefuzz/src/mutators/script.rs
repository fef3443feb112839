//! Script-source mutations for Lua and ES-module JavaScript.
//!
//! Inputs that do not decode as UTF-8 fall back to a byte perturbation.
//! A few regions are protected from every edit: the shebang line, `import`/
//! `export` lines (MJS), and `require('…')` path strings, since breaking
//! those stops the interpreter before any interesting code runs. Emitted
//! variants are re-balanced (brackets and quote parity) and dropped when
//! balance cannot be restored.

use std::{ops::Range, sync::LazyLock};

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};
use regex::Regex;

use super::fallback_perturbation;

const DEFAULT_VARIANTS: usize = 12;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][A-Za-z0-9_$]*").expect("valid regex"));
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+\.?\d*|\d*\.\d+)\b").expect("valid regex"));
static STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"`(?:\\`|[^`])*`|'(?:\\'|[^'])*'|"(?:\\"|[^"])*""#).expect("valid regex")
});
static REQUIRE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"require\(\s*['"][^'"]*['"]\s*\)"#).expect("valid regex"));

const LUA_KEYWORDS: [&str; 21] = [
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

const JS_KEYWORDS: [&str; 35] = [
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "super", "switch",
    "this", "throw", "true", "try", "typeof", "var",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptDialect {
    Lua,
    Mjs,
}

impl ScriptDialect {
    fn keywords(self) -> &'static [&'static str] {
        match self {
            ScriptDialect::Lua => &LUA_KEYWORDS,
            ScriptDialect::Mjs => &JS_KEYWORDS,
        }
    }

    fn comment_prefix(self) -> &'static str {
        match self {
            ScriptDialect::Lua => "--",
            ScriptDialect::Mjs => "//",
        }
    }

    fn literals(self) -> &'static [&'static str] {
        match self {
            ScriptDialect::Lua => &["nil", "true", "false", "0"],
            ScriptDialect::Mjs => &["undefined", "null", "0", "false"],
        }
    }
}

#[derive(Debug)]
pub struct ScriptMutator {
    rng: SmallRng,
    dialect: ScriptDialect,
    variants: usize,
    corpus: Vec<std::sync::Arc<[u8]>>,
}

impl ScriptMutator {
    pub fn new(seed: u64, dialect: ScriptDialect) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            dialect,
            variants: DEFAULT_VARIANTS,
            corpus: Vec::new(),
        }
    }

    pub fn set_corpus(&mut self, corpus: &[std::sync::Arc<[u8]>]) {
        self.corpus = corpus.to_vec();
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let Ok(source) = std::str::from_utf8(data) else {
            return vec![fallback_perturbation(&mut self.rng, data)];
        };

        let input_fingerprint = balance_fingerprint(source);
        let mut variants = Vec::with_capacity(self.variants);
        for _ in 0..self.variants {
            let mut candidate = source.to_string();
            for _ in 0..self.rng.random_range(1..=2usize) {
                candidate = self.apply_edit(&candidate);
            }
            let candidate = restore_balance(&candidate);
            let fingerprint = balance_fingerprint(&candidate);
            if fingerprint.is_balanced() || fingerprint == input_fingerprint {
                variants.push(candidate.into_bytes());
            }
        }
        if variants.is_empty() {
            variants.push(fallback_perturbation(&mut self.rng, data));
        }
        variants
    }

    fn apply_edit(&mut self, source: &str) -> String {
        let protected = protected_spans(source, self.dialect);
        match self.rng.random_range(0..8u8) {
            0 => self.rename_identifier(source, &protected),
            1 => self.tweak_number(source, &protected),
            2 => self.corrupt_string(source, &protected),
            3 => self.flip_operator(source),
            4 => self.toggle_comment_line(source, &protected),
            5 => self.insert_literal(source, &protected),
            6 => self.swap_adjacent_lines(source, &protected),
            _ => self.splice_donor(source),
        }
    }

    fn rename_identifier(&mut self, source: &str, protected: &[Range<usize>]) -> String {
        let keywords = self.dialect.keywords();
        let candidates: Vec<regex::Match<'_>> = IDENT_RE
            .find_iter(source)
            .filter(|m| !keywords.contains(&m.as_str()))
            .filter(|m| !is_protected(protected, m.start()..m.end()))
            .collect();
        let Some(target) = candidates.choose(&mut self.rng) else {
            return source.to_string();
        };
        let name = target.as_str();
        let renamed = match self.rng.random_range(0..3u8) {
            0 if name.len() > 1 => {
                let index = self.rng.random_range(0..name.len());
                let replacement = self.random_char();
                let mut out = String::with_capacity(name.len());
                for (position, ch) in name.char_indices() {
                    if position == index {
                        out.push(replacement);
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
            1 => format!(
                "{name}{}",
                *["_x", "_v", "_tmp"].choose(&mut self.rng).unwrap_or(&"_x")
            ),
            _ => name.chars().rev().collect(),
        };
        format!("{}{renamed}{}", &source[..target.start()], &source[target.end()..])
    }

    fn tweak_number(&mut self, source: &str, protected: &[Range<usize>]) -> String {
        let candidates: Vec<regex::Match<'_>> = NUMBER_RE
            .find_iter(source)
            .filter(|m| !is_protected(protected, m.start()..m.end()))
            .collect();
        let Some(target) = candidates.choose(&mut self.rng) else {
            return source.to_string();
        };
        let literal = target.as_str();
        let replacement = if literal.contains('.') {
            let value: f64 = literal.parse().unwrap_or(0.0);
            format!("{:.3}", value + self.rng.random_range(-5.0..5.0))
        } else {
            let value: i64 = literal.parse().unwrap_or(0);
            (value + self.rng.random_range(-50..=50i64)).max(0).to_string()
        };
        format!(
            "{}{replacement}{}",
            &source[..target.start()],
            &source[target.end()..]
        )
    }

    fn corrupt_string(&mut self, source: &str, protected: &[Range<usize>]) -> String {
        let candidates: Vec<regex::Match<'_>> = STRING_RE
            .find_iter(source)
            .filter(|m| !is_protected(protected, m.start()..m.end()))
            .collect();
        let Some(target) = candidates.choose(&mut self.rng) else {
            return source.to_string();
        };
        let literal = target.as_str();
        if literal.len() < 2 {
            return source.to_string();
        }
        let quote = &literal[..1];
        let inner = &literal[1..literal.len() - 1];
        let new_inner = match self.rng.random_range(0..3u8) {
            0 if !inner.is_empty() => {
                let index = self.rng.random_range(0..inner.len());
                let replacement = self.random_char();
                let mut out = String::with_capacity(inner.len());
                for (position, ch) in inner.char_indices() {
                    if position == index {
                        out.push(replacement);
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
            1 => format!("{inner}{}", self.random_word(3)),
            _ => String::new(),
        };
        format!(
            "{}{quote}{new_inner}{quote}{}",
            &source[..target.start()],
            &source[target.end()..]
        )
    }

    fn flip_operator(&mut self, source: &str) -> String {
        let flips: &[(&str, &str)] = match self.dialect {
            ScriptDialect::Mjs => &[("===", "=="), ("==", "==="), ("!==", "!="), ("!=", "!==")],
            ScriptDialect::Lua => &[("==", "~="), ("~=", "=="), ("<=", "<"), (">=", ">")],
        };
        let (from, to) = *flips.choose(&mut self.rng).unwrap_or(&flips[0]);
        if source.contains(from) {
            source.replacen(from, to, 1)
        } else {
            source.to_string()
        }
    }

    fn toggle_comment_line(&mut self, source: &str, protected: &[Range<usize>]) -> String {
        let prefix = self.dialect.comment_prefix();
        let lines = line_spans(source);
        let editable: Vec<&Range<usize>> = lines
            .iter()
            .filter(|span| !is_protected(protected, (*span).clone()))
            .collect();
        let Some(span) = editable.choose(&mut self.rng) else {
            return source.to_string();
        };
        let line = &source[(*span).clone()];
        let stripped = line.trim_start();
        let indent = &line[..line.len() - stripped.len()];
        let toggled = match stripped.strip_prefix(prefix) {
            Some(uncommented) => format!("{indent}{uncommented}"),
            None => format!("{indent}{prefix}{stripped}"),
        };
        format!("{}{toggled}{}", &source[..span.start], &source[span.end..])
    }

    fn insert_literal(&mut self, source: &str, protected: &[Range<usize>]) -> String {
        let literal = *self
            .dialect
            .literals()
            .choose(&mut self.rng)
            .unwrap_or(&"0");
        let position = (0..=source.len())
            .filter(|offset| source.is_char_boundary(*offset))
            .filter(|offset| !is_protected(protected, *offset..*offset))
            .nth(self.rng.random_range(0..source.len().max(1)))
            .unwrap_or(source.len());
        format!("{} {literal} {}", &source[..position], &source[position..])
    }

    fn swap_adjacent_lines(&mut self, source: &str, protected: &[Range<usize>]) -> String {
        let mut lines: Vec<&str> = source.lines().collect();
        if lines.len() < 2 {
            return source.to_string();
        }
        let spans = line_spans(source);
        let index = self.rng.random_range(0..lines.len() - 1);
        let either_protected = is_protected(protected, spans[index].clone())
            || is_protected(protected, spans[index + 1].clone());
        if either_protected {
            return source.to_string();
        }
        lines.swap(index, index + 1);
        let mut out = lines.join("\n");
        if source.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    fn splice_donor(&mut self, source: &str) -> String {
        let donors: Vec<String> = self
            .corpus
            .iter()
            .filter_map(|donor| std::str::from_utf8(donor).ok().map(str::to_string))
            .collect();
        let Some(donor) = donors.choose(&mut self.rng) else {
            return source.to_string();
        };
        let own_lines: Vec<&str> = source.split_inclusive('\n').collect();
        let donor_lines: Vec<&str> = donor.split_inclusive('\n').collect();
        if own_lines.is_empty() || donor_lines.is_empty() {
            return source.to_string();
        }
        let own_split = self.rng.random_range(0..=own_lines.len());
        let donor_split = self.rng.random_range(0..donor_lines.len());
        let mut out = String::new();
        for line in &own_lines[..own_split] {
            out.push_str(line);
        }
        for line in &donor_lines[donor_split..] {
            out.push_str(line);
        }
        out
    }

    fn random_char(&mut self) -> char {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789_";
        ALPHABET[self.rng.random_range(0..ALPHABET.len())] as char
    }

    fn random_word(&mut self, max_len: usize) -> String {
        let len = self.rng.random_range(1..=max_len);
        (0..len).map(|_| self.random_char()).collect()
    }
}

/// Byte spans no edit may touch: the shebang, import/export lines (MJS),
/// and `require('…')` argument strings.
fn protected_spans(source: &str, dialect: ScriptDialect) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    for span in line_spans(source) {
        let line = &source[span.clone()];
        let trimmed = line.trim_start();
        let is_shebang = span.start == 0 && trimmed.starts_with("#!");
        let is_module_line = dialect == ScriptDialect::Mjs
            && (trimmed.starts_with("import ")
                || trimmed.starts_with("import{")
                || trimmed.starts_with("export "));
        if is_shebang || is_module_line {
            spans.push(span);
        }
    }
    for matched in REQUIRE_RE.find_iter(source) {
        spans.push(matched.start()..matched.end());
    }
    spans
}

fn line_spans(source: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for line in source.split_inclusive('\n') {
        spans.push(start..start + line.len());
        start += line.len();
    }
    if spans.is_empty() {
        spans.push(0..0);
    }
    spans
}

fn is_protected(protected: &[Range<usize>], span: Range<usize>) -> bool {
    protected.iter().any(|region| {
        if span.is_empty() {
            region.contains(&span.start)
        } else {
            span.start < region.end && region.start < span.end
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BalanceFingerprint {
    parens: i64,
    brackets: i64,
    braces: i64,
    quote_parity: [bool; 3],
}

impl BalanceFingerprint {
    fn is_balanced(self) -> bool {
        self.parens == 0
            && self.brackets == 0
            && self.braces == 0
            && self.quote_parity.iter().all(|even| *even)
    }
}

fn balance_fingerprint(source: &str) -> BalanceFingerprint {
    let mut parens = 0i64;
    let mut brackets = 0i64;
    let mut braces = 0i64;
    let mut quotes = [0usize; 3];
    for ch in source.chars() {
        match ch {
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            '"' => quotes[0] += 1,
            '\'' => quotes[1] += 1,
            '`' => quotes[2] += 1,
            _ => {}
        }
    }
    BalanceFingerprint {
        parens,
        brackets,
        braces,
        quote_parity: [quotes[0] % 2 == 0, quotes[1] % 2 == 0, quotes[2] % 2 == 0],
    }
}

/// Appends missing closers and quote characters. Surplus closers cannot be
/// repaired by appending; those variants fail the fingerprint check.
fn restore_balance(source: &str) -> String {
    let fingerprint = balance_fingerprint(source);
    let mut out = source.to_string();
    for (count, closer) in [
        (fingerprint.parens, ')'),
        (fingerprint.brackets, ']'),
        (fingerprint.braces, '}'),
    ] {
        for _ in 0..count.max(0) {
            out.push(closer);
        }
    }
    for (even, quote) in fingerprint
        .quote_parity
        .iter()
        .zip(['"', '\'', '`'])
    {
        if !even {
            out.push(quote);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LUA_SAMPLE: &[u8] = b"local x = 42\nlocal s = \"hello\"\nfor i=1,5 do\n    x = x + i\n    print(s, x)\nend\n";

    const MJS_SAMPLE: &[u8] = b"#!/usr/bin/env node\nimport { add } from './math.mjs'\nconst s = `sum`\nif (1 === 2) {\n  add(1, 2)\n}\nexport const VALUE = 42\n";

    #[test]
    fn non_utf8_falls_back_to_one_perturbation() {
        let mut mutator = ScriptMutator::new(1, ScriptDialect::Lua);
        assert_eq!(mutator.mutate(&[0xff, 0xfe, 0x80]).len(), 1);
    }

    #[test]
    fn variants_keep_brackets_and_quotes_balanced() {
        let mut mutator = ScriptMutator::new(2, ScriptDialect::Lua);
        for _ in 0..10 {
            for variant in mutator.mutate(LUA_SAMPLE) {
                let text = String::from_utf8(variant).expect("utf-8 output");
                let fingerprint = balance_fingerprint(&text);
                assert!(
                    fingerprint.is_balanced()
                        || fingerprint
                            == balance_fingerprint(std::str::from_utf8(LUA_SAMPLE).unwrap()),
                    "unbalanced variant: {text}"
                );
            }
        }
    }

    #[test]
    fn shebang_and_module_lines_survive() {
        let mut mutator = ScriptMutator::new(3, ScriptDialect::Mjs);
        for _ in 0..10 {
            for variant in mutator.mutate(MJS_SAMPLE) {
                let text = String::from_utf8(variant).unwrap();
                assert!(text.starts_with("#!/usr/bin/env node"), "shebang lost: {text}");
                assert!(
                    text.contains("import { add } from './math.mjs'"),
                    "import line damaged: {text}"
                );
            }
        }
    }

    #[test]
    fn lua_keywords_are_never_renamed() {
        let mut mutator = ScriptMutator::new(4, ScriptDialect::Lua);
        for _ in 0..20 {
            let out = mutator.rename_identifier("local x = nil", &[]);
            assert!(out.contains("local"));
            assert!(out.contains("nil"));
        }
    }

    #[test]
    fn operator_flip_changes_equality() {
        let mut mutator = ScriptMutator::new(5, ScriptDialect::Mjs);
        let mut seen_flip = false;
        for _ in 0..40 {
            let out = mutator.flip_operator("if (a === b) {}");
            if out.contains("==") && !out.contains("===") {
                seen_flip = true;
            }
        }
        assert!(seen_flip);
    }

    #[test]
    fn restore_balance_appends_missing_closers() {
        assert_eq!(restore_balance("f(a[b{"), "f(a[b{)]}");
        assert_eq!(restore_balance("\"open"), "\"open\"");
        assert_eq!(restore_balance("done()"), "done()");
    }

    #[test]
    fn donor_splice_mixes_sources() {
        let mut mutator = ScriptMutator::new(6, ScriptDialect::Lua);
        mutator.set_corpus(&[std::sync::Arc::from(&b"print('donor line')\n"[..])]);
        let mixed = (0..40).any(|_| {
            let out = mutator.splice_donor("local a = 1\nlocal b = 2\n");
            out.contains("donor line") && out.contains("local")
        });
        assert!(mixed);
    }

    #[test]
    fn require_paths_are_protected() {
        let source = "const m = require('./secret/path')\nconst x = other\n";
        let spans = protected_spans(source, ScriptDialect::Mjs);
        let require_start = source.find("require").unwrap();
        assert!(spans.iter().any(|span| span.start == require_start));
    }
}
