//! Regex and indentation/brace scanning backend. Needs no grammars, so it works
//! on every platform and for every [`Lang`].

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{IndexError, Result};
use crate::languages::Lang;
use crate::unit::{SemanticUnit, UnitType};

struct Patterns {
    function: Regex,
    class: Regex,
    /// Method declarations that only count inside a class body.
    method: Option<Regex>,
}

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => unreachable!("invalid built-in pattern {pattern}: {e}"),
    }
}

static RUST: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    function: compile(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)"#,
    ),
    class: compile(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:unsafe\s+)?(?:(?:struct|enum|trait|union)\s+([A-Za-z_][A-Za-z0-9_]*)|impl(?:<[^{]*?>)?\s+(?:[^{]*?\s+for\s+)?([A-Za-z_][A-Za-z0-9_:]*))",
    ),
    method: None,
});

static PYTHON: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    function: compile(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)"),
    class: compile(r"^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)"),
    method: None,
});

static JS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    function: compile(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][A-Za-z0-9_$]*)",
    ),
    class: compile(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:class|interface)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
    ),
    method: Some(compile(
        r"^\s+(?:(?:static|async|get|set|public|private|protected|readonly|override)\s+)*\*?([A-Za-z_$][A-Za-z0-9_$]*)\s*(?:<[^>]*>)?\(",
    )),
});

static GO: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    function: compile(r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)"),
    class: compile(r"^type\s+([A-Za-z_][A-Za-z0-9_]*)\b"),
    method: None,
});

const NOT_METHODS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "function", "with", "super", "new",
];

/// Line-oriented parser. Unit names and start lines match the tree-sitter
/// backend for conventionally formatted code.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableParser;

impl PortableParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn supported_languages(&self) -> BTreeSet<Lang> {
        Lang::ALL.into_iter().collect()
    }

    pub(super) fn parse_source(
        &self,
        source: &str,
        file_path: &str,
        lang: Lang,
    ) -> Result<Vec<SemanticUnit>> {
        let patterns: &Patterns = match lang {
            Lang::Rust => &RUST,
            Lang::Python => &PYTHON,
            Lang::JavaScript | Lang::TypeScript => &JS,
            Lang::Go => &GO,
            other => {
                return Err(IndexError::ParseFailure {
                    path: file_path.to_owned(),
                    reason: format!("no declaration patterns for {other}"),
                });
            }
        };
        let lines: Vec<&str> = source.lines().collect();
        let scanner = Scanner {
            lines: &lines,
            file_path,
            lang,
            patterns,
        };
        let mut units = Vec::new();
        scanner.scan(0, lines.len(), false, &mut units);
        Ok(units)
    }
}

struct Scanner<'a> {
    lines: &'a [&'a str],
    file_path: &'a str,
    lang: Lang,
    patterns: &'a Patterns,
}

enum Decl {
    Function(String),
    Class(String),
}

impl Scanner<'_> {
    /// Scan lines `[start, end)`. Functions are skipped over whole; class bodies
    /// are scanned again for methods.
    fn scan(&self, start: usize, end: usize, in_class: bool, out: &mut Vec<SemanticUnit>) {
        let mut i = start;
        while i < end {
            let Some(decl) = self.declaration(i, in_class) else {
                i += 1;
                continue;
            };
            let Some(last) = self.block_end(i, end) else {
                // Declaration without a body, such as a trait method signature.
                i += 1;
                continue;
            };
            match decl {
                Decl::Function(name) => {
                    if last.has_body {
                        out.push(self.unit(UnitType::Function, name, i, last.line));
                    }
                }
                Decl::Class(name) => {
                    out.push(self.unit(UnitType::Class, name, i, last.line));
                    self.scan(i + 1, last.line + 1, true, out);
                }
            }
            i = last.line + 1;
        }
    }

    fn declaration(&self, idx: usize, in_class: bool) -> Option<Decl> {
        let line = self.lines[idx];
        if let Some(caps) = self.patterns.function.captures(line) {
            return Some(Decl::Function(caps[1].to_owned()));
        }
        if let Some(caps) = self.patterns.class.captures(line) {
            let name = caps.get(1).or_else(|| caps.get(2))?.as_str();
            return Some(Decl::Class(name.to_owned()));
        }
        if in_class
            && let Some(re) = &self.patterns.method
            && let Some(caps) = re.captures(line)
            && !NOT_METHODS.contains(&&caps[1])
        {
            return Some(Decl::Function(caps[1].to_owned()));
        }
        None
    }

    fn block_end(&self, start: usize, limit: usize) -> Option<BlockEnd> {
        if self.lang == Lang::Python {
            Some(self.indent_block_end(start, limit))
        } else {
            self.brace_block_end(start, limit)
        }
    }

    fn indent_block_end(&self, start: usize, limit: usize) -> BlockEnd {
        let base = indent_of(self.lines[start]);
        // Header may continue over several lines inside parentheses.
        let mut depth: i32 = 0;
        let mut header_end = start;
        for (offset, line) in self.lines[start..limit].iter().enumerate() {
            depth += paren_delta(line);
            header_end = start + offset;
            if depth <= 0 {
                break;
            }
        }
        let mut last = header_end;
        for idx in header_end + 1..limit {
            let line = self.lines[idx];
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if indent_of(line) <= base {
                if trimmed.starts_with('#') {
                    continue;
                }
                break;
            }
            last = idx;
        }
        BlockEnd {
            line: last,
            has_body: true,
        }
    }

    /// `None` when the declaration never opens a body or terminates.
    fn brace_block_end(&self, start: usize, limit: usize) -> Option<BlockEnd> {
        let mut depth: i32 = 0;
        let mut parens: i32 = 0;
        let mut opened = false;
        for idx in start..limit {
            let line = self.lines[idx];
            for c in code_chars(line) {
                match c {
                    '(' => parens += 1,
                    ')' => parens -= 1,
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => {
                        depth -= 1;
                        if opened && depth == 0 {
                            return Some(BlockEnd {
                                line: idx,
                                has_body: true,
                            });
                        }
                    }
                    ';' if !opened && parens <= 0 => {
                        return Some(BlockEnd {
                            line: idx,
                            has_body: false,
                        });
                    }
                    _ => {}
                }
            }
            if !opened && parens <= 0 && !self.header_continues(idx, limit) {
                return Some(BlockEnd {
                    line: idx,
                    has_body: false,
                });
            }
        }
        None
    }

    fn header_continues(&self, idx: usize, limit: usize) -> bool {
        let line = self.lines[idx].trim_end();
        if line.ends_with(',') || line.ends_with("->") || line.ends_with("where") || line.ends_with('=') {
            return true;
        }
        let Some(next) = self.lines.get(idx + 1).filter(|_| idx + 1 < limit) else {
            return false;
        };
        let next = next.trim_start();
        ["{", "where", "->", ")", "+", ":", "extends", "implements"]
            .iter()
            .any(|p| next.starts_with(p))
            || (indent_of(self.lines[idx + 1]) > indent_of(self.lines[idx]) && next.ends_with(','))
    }

    fn unit(&self, unit_type: UnitType, name: String, start: usize, end: usize) -> SemanticUnit {
        let content = self.lines[start..=end].join("\n");
        SemanticUnit::new(
            self.file_path,
            unit_type,
            name,
            content,
            (start + 1, end + 1),
            self.lang,
        )
    }
}

struct BlockEnd {
    line: usize,
    has_body: bool,
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn paren_delta(line: &str) -> i32 {
    code_chars(line).fold(0, |acc, c| match c {
        '(' | '[' => acc + 1,
        ')' | ']' => acc - 1,
        _ => acc,
    })
}

/// Characters outside double-quoted strings and line comments.
fn code_chars(line: &str) -> impl Iterator<Item = char> + '_ {
    let mut in_string = false;
    let mut escaped = false;
    let mut prev = '\0';
    let mut done = false;
    line.chars().filter(move |&c| {
        if done {
            return false;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            prev = c;
            return false;
        }
        if c == '"' {
            in_string = true;
            prev = c;
            return false;
        }
        if c == '/' && prev == '/' {
            done = true;
            return false;
        }
        prev = c;
        c != '/'
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str, lang: Lang) -> Vec<SemanticUnit> {
        PortableParser::new().parse_source(source, "f", lang).unwrap()
    }

    fn spans(units: &[SemanticUnit]) -> Vec<(UnitType, &str, usize, usize)> {
        units
            .iter()
            .map(|u| (u.unit_type, u.name.as_str(), u.start_line, u.end_line))
            .collect()
    }

    #[test]
    fn python_class_methods_and_functions() {
        let units = parse(
            "class A:\n    def m(self):\n        return 1\n\n    def n(self):\n        pass\n\ndef f(\n    x,\n):\n    return x\n",
            Lang::Python,
        );
        assert_eq!(
            spans(&units),
            [
                (UnitType::Class, "A", 1, 6),
                (UnitType::Function, "m", 2, 3),
                (UnitType::Function, "n", 5, 6),
                (UnitType::Function, "f", 8, 11),
            ]
        );
    }

    #[test]
    fn python_one_line_def() {
        let units = parse("def f(): return 1\ndef g():\n    pass\n", Lang::Python);
        assert_eq!(
            spans(&units),
            [(UnitType::Function, "f", 1, 1), (UnitType::Function, "g", 2, 3)]
        );
    }

    #[test]
    fn python_nested_functions_are_not_units() {
        let units = parse("def outer():\n    def inner():\n        pass\n    return inner\n", Lang::Python);
        assert_eq!(spans(&units), [(UnitType::Function, "outer", 1, 4)]);
    }

    #[test]
    fn rust_braces_in_strings_do_not_confuse_matching() {
        let units = parse(
            "fn a() {\n    let s = \"}\";\n}\nfn b() {}\n",
            Lang::Rust,
        );
        assert_eq!(
            spans(&units),
            [(UnitType::Function, "a", 1, 3), (UnitType::Function, "b", 4, 4)]
        );
    }

    #[test]
    fn rust_multiline_signature() {
        let units = parse(
            "pub fn new(\n    a: i32,\n    b: i32,\n) -> Self {\n    todo!()\n}\n",
            Lang::Rust,
        );
        assert_eq!(spans(&units), [(UnitType::Function, "new", 1, 6)]);
    }

    #[test]
    fn rust_trait_signatures_are_skipped() {
        let units = parse(
            "pub trait Store {\n    fn get(&self) -> u8;\n    fn put(&self) {}\n}\n",
            Lang::Rust,
        );
        assert_eq!(
            spans(&units),
            [(UnitType::Class, "Store", 1, 4), (UnitType::Function, "put", 3, 3)]
        );
    }

    #[test]
    fn rust_unit_struct_is_single_line() {
        let units = parse("struct Marker;\nfn after() {}\n", Lang::Rust);
        assert_eq!(
            spans(&units),
            [(UnitType::Class, "Marker", 1, 1), (UnitType::Function, "after", 2, 2)]
        );
    }

    #[test]
    fn rust_trait_impl_uses_self_type() {
        let units = parse("impl<T: Clone> From<T> for Wrapper {\n}\n", Lang::Rust);
        assert_eq!(spans(&units), [(UnitType::Class, "Wrapper", 1, 2)]);
    }

    #[test]
    fn js_methods_only_inside_classes() {
        let units = parse(
            "class Box {\n  open(lid) {\n    if (lid) { return 1; }\n  }\n}\nfoo(1);\nfunction bar() {\n}\n",
            Lang::JavaScript,
        );
        assert_eq!(
            spans(&units),
            [
                (UnitType::Class, "Box", 1, 5),
                (UnitType::Function, "open", 2, 4),
                (UnitType::Function, "bar", 7, 8),
            ]
        );
    }

    #[test]
    fn go_receivers_and_simple_types() {
        let units = parse(
            "package x\n\ntype ID int\n\nfunc (s *S) Get() int {\n\treturn 0\n}\n",
            Lang::Go,
        );
        assert_eq!(
            spans(&units),
            [(UnitType::Class, "ID", 3, 3), (UnitType::Function, "Get", 5, 7)]
        );
    }

    #[test]
    fn config_languages_have_no_patterns() {
        let err = PortableParser::new()
            .parse_source("a = 1", "a.toml", Lang::Toml)
            .unwrap_err();
        assert!(matches!(err, IndexError::ParseFailure { .. }));
    }

    #[test]
    fn comment_stripping_keeps_code() {
        let chars: String = code_chars("a(b) // c(").collect();
        assert_eq!(chars.trim(), "a(b)");
    }
}
