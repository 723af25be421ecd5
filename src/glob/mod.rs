//! Glob pattern parsing, variable expansion, and filesystem traversal
//! (§4.6 "Glob patterns").
//!
//! Filesystem traversal uses `walkdir` for recursive directory walks.
//! Pattern parsing and Cartesian `${var}` expansion are this crate's own.
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::diagnostics::{Diagnostic, Value};

/// One segment of a parsed pattern: a literal path component, or a
/// wildcard construct.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Star,        // `*`: any run of characters except `/`
    Question,    // `?`: exactly one character except `/`
    Class(Vec<ClassItem>, bool), // `[...]`/`[!...]`: character class, negated flag
    Globstar,     // `**`: any number of path components
    Variable(String), // `${name}`
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

/// A compiled glob pattern, ready for variable expansion and matching.
#[derive(Debug, Clone)]
pub struct Pattern {
    components: Vec<Vec<Token>>,
}

impl Pattern {
    /// Parses `pattern` (a `/`-separated path pattern) into its
    /// component tokens. Returns a `glob_error` diagnostic for malformed
    /// constructs (an unterminated `[...]` or `${...}`).
    pub fn parse(pattern: &str) -> Result<Self, Diagnostic> {
        let mut components = Vec::new();
        for part in pattern.split('/') {
            if part == "**" {
                components.push(vec![Token::Globstar]);
                continue;
            }
            components.push(parse_component(part)?);
        }
        Ok(Pattern { components })
    }

    /// Every distinct `${var}` name referenced in the pattern, in the
    /// order first seen.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        for component in &self.components {
            for token in component {
                if let Token::Variable(name) = token {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        names
    }

    /// Expands every `${var}` in the pattern against `bindings` (a single
    /// assignment per variable), returning a concrete glob-free-of-
    /// variables pattern string. Missing bindings raise `glob_error`.
    fn substitute(&self, bindings: &[(&str, &str)]) -> Result<String, Diagnostic> {
        let mut parts = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let mut literal = String::new();
            for token in component {
                match token {
                    Token::Literal(s) => literal.push_str(s),
                    Token::Star => literal.push('*'),
                    Token::Question => literal.push('?'),
                    Token::Globstar => literal.push_str("**"),
                    Token::Class(items, negated) => {
                        literal.push('[');
                        if *negated {
                            literal.push('!');
                        }
                        for item in items {
                            match item {
                                ClassItem::Char(c) => literal.push(*c),
                                ClassItem::Range(a, b) => {
                                    literal.push(*a);
                                    literal.push('-');
                                    literal.push(*b);
                                }
                            }
                        }
                        literal.push(']');
                    }
                    Token::Variable(name) => {
                        let value = bindings
                            .iter()
                            .find(|(key, _)| key == name)
                            .map(|(_, v)| *v)
                            .ok_or_else(|| {
                                Diagnostic::new(
                                    "glob_error: no binding for variable '${1}'",
                                    vec![Value::from(name.as_str())],
                                )
                            })?;
                        literal.push_str(value);
                    }
                }
            }
            parts.push(literal);
        }
        Ok(parts.join("/"))
    }

    /// Expands every combination of `variables` × their candidate value
    /// lists into concrete patterns (the Cartesian product), in the
    /// order the value lists are given.
    pub fn expand_cartesian(&self, choices: &[(&str, Vec<String>)]) -> Result<Vec<String>, Diagnostic> {
        let mut combos: Vec<Vec<(&str, &str)>> = vec![Vec::new()];
        for (name, values) in choices {
            if values.is_empty() {
                return Err(Diagnostic::new(
                    "glob_error: variable '${1}' has no candidate values",
                    vec![Value::from(*name)],
                ));
            }
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut extended = combo.clone();
                    extended.push((*name, value.as_str()));
                    next.push(extended);
                }
            }
            combos = next;
        }
        combos.iter().map(|bindings| self.substitute(bindings)).collect()
    }

    /// True if `path` (relative, `/`-separated) matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path_components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        match_components(&self.components, &path_components)
    }

    /// Whether a dot-named entry at `depth` (a 1-based count of path
    /// components below the walk root) should be visited rather than
    /// skipped (§4.6 "dot-files are skipped unless the pattern segment
    /// begins with `.`"). Once a `**` makes component-to-depth position
    /// ambiguous, falls back to "any component in the pattern begins
    /// with `.`".
    fn allows_dot_at(&self, depth: usize) -> bool {
        let begins_with_dot = |tokens: &[Token]| {
            matches!(tokens.first(), Some(Token::Literal(s)) if s.starts_with('.'))
        };
        if self.components.iter().any(|c| c == &[Token::Globstar]) {
            return self.components.iter().any(|c| begins_with_dot(c));
        }
        self.components
            .get(depth.saturating_sub(1))
            .map(|c| begins_with_dot(c))
            .unwrap_or(false)
    }
}

fn parse_component(part: &str) -> Result<Vec<Token>, Diagnostic> {
    let chars: Vec<char> = part.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                flush_literal(&mut literal, &mut tokens);
                tokens.push(Token::Star);
                i += 1;
            }
            '?' => {
                flush_literal(&mut literal, &mut tokens);
                tokens.push(Token::Question);
                i += 1;
            }
            '[' => {
                flush_literal(&mut literal, &mut tokens);
                let (class, consumed) = parse_class(&chars[i..])?;
                tokens.push(class);
                i += consumed;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                flush_literal(&mut literal, &mut tokens);
                let end = chars[i + 2..]
                    .iter()
                    .position(|&c| c == '}')
                    .ok_or_else(|| {
                        Diagnostic::new(
                            "glob_error: unterminated variable reference in pattern",
                            Vec::<Value>::new(),
                        )
                    })?;
                let name: String = chars[i + 2..i + 2 + end].iter().collect();
                tokens.push(Token::Variable(name));
                i += 2 + end + 1;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    flush_literal(&mut literal, &mut tokens);
    Ok(tokens)
}

fn flush_literal(literal: &mut String, tokens: &mut Vec<Token>) {
    if !literal.is_empty() {
        tokens.push(Token::Literal(std::mem::take(literal)));
    }
}

fn parse_class(chars: &[char]) -> Result<(Token, usize), Diagnostic> {
    debug_assert_eq!(chars[0], '[');
    let mut i = 1;
    let negated = matches!(chars.get(i), Some('!'));
    if negated {
        i += 1;
    }
    let mut items = Vec::new();
    while i < chars.len() && chars[i] != ']' {
        if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i + 2] != ']' {
            items.push(ClassItem::Range(chars[i], chars[i + 2]));
            i += 3;
        } else {
            items.push(ClassItem::Char(chars[i]));
            i += 1;
        }
    }
    if i >= chars.len() {
        return Err(Diagnostic::new(
            "glob_error: unterminated character class in pattern",
            Vec::<Value>::new(),
        ));
    }
    Ok((Token::Class(items, negated), i + 1))
}

fn token_matches_char(token: &Token, c: char) -> bool {
    match token {
        Token::Class(items, negated) => {
            let hit = items.iter().any(|item| match item {
                ClassItem::Char(x) => *x == c,
                ClassItem::Range(a, b) => *a <= c && c <= *b,
            });
            hit != *negated
        }
        _ => false,
    }
}

fn match_component(tokens: &[Token], text: &str) -> bool {
    fn go(tokens: &[Token], chars: &[char]) -> bool {
        match tokens.split_first() {
            None => chars.is_empty(),
            Some((Token::Literal(lit), rest)) => {
                let lit_chars: Vec<char> = lit.chars().collect();
                chars.len() >= lit_chars.len()
                    && chars[..lit_chars.len()] == lit_chars[..]
                    && go(rest, &chars[lit_chars.len()..])
            }
            Some((Token::Question, rest)) => !chars.is_empty() && go(rest, &chars[1..]),
            Some((Token::Class(..), rest)) => {
                !chars.is_empty() && token_matches_char(&tokens[0], chars[0]) && go(rest, &chars[1..])
            }
            Some((Token::Star, rest)) => {
                for split in 0..=chars.len() {
                    if go(rest, &chars[split..]) {
                        return true;
                    }
                }
                false
            }
            Some((Token::Globstar, _)) | Some((Token::Variable(_), _)) => {
                unreachable!("globstar/variable never appear inside a single component")
            }
        }
    }
    let chars: Vec<char> = text.chars().collect();
    go(tokens, &chars)
}

fn match_components(components: &[Vec<Token>], path: &[&str]) -> bool {
    match components.split_first() {
        None => path.is_empty(),
        Some((tokens, rest)) if tokens == &[Token::Globstar] => {
            for split in 0..=path.len() {
                if match_components(rest, &path[split..]) {
                    return true;
                }
            }
            false
        }
        Some((tokens, rest)) => {
            !path.is_empty() && match_component(tokens, path[0]) && match_components(rest, &path[1..])
        }
    }
}

/// Walks `root`, returning every regular file whose path (relative to
/// `root`) matches `pattern`. Dot-files and dot-directories are skipped
/// unless the pattern segment at that depth itself begins with `.`,
/// mirroring a shell glob's default behavior.
pub fn glob(root: &Path, pattern: &Pattern) -> Result<Vec<PathBuf>, Diagnostic> {
    let mut matches = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry
                .file_name()
                .to_str()
                .map(|s| s.starts_with('.'))
                .unwrap_or(false)
            || pattern.allows_dot_at(entry.depth())
    });
    for entry in walker {
        let entry = entry.map_err(|e| {
            Diagnostic::new(
                "glob_error: failed to walk '${1}': ${2}",
                vec![Value::from(root.display().to_string()), Value::from(e.to_string())],
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if pattern.matches(&relative_str) {
            matches.push(entry.into_path());
        }
    }
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_within_a_component() {
        let p = Pattern::parse("src/*.rs").unwrap();
        assert!(p.matches("src/lib.rs"));
        assert!(!p.matches("src/sub/lib.rs"));
    }

    #[test]
    fn globstar_matches_across_components() {
        let p = Pattern::parse("src/**/*.rs").unwrap();
        assert!(p.matches("src/lib.rs"));
        assert!(p.matches("src/a/b/lib.rs"));
    }

    #[test]
    fn character_class_and_negation() {
        let p = Pattern::parse("file[0-9].txt").unwrap();
        assert!(p.matches("file5.txt"));
        assert!(!p.matches("fileA.txt"));
    }

    #[test]
    fn variable_cartesian_expansion() {
        let p = Pattern::parse("build/${target}/${profile}.bin").unwrap();
        let expanded = p
            .expand_cartesian(&[
                ("target", vec!["linux".to_owned(), "macos".to_owned()]),
                ("profile", vec!["debug".to_owned()]),
            ])
            .unwrap();
        assert_eq!(
            expanded,
            vec![
                "build/linux/debug.bin".to_owned(),
                "build/macos/debug.bin".to_owned(),
            ]
        );
    }

    #[test]
    fn unterminated_variable_is_a_glob_error() {
        let err = Pattern::parse("src/${oops").unwrap_err();
        assert_eq!(err.kind(), "glob_error");
    }

    #[test]
    fn missing_binding_is_a_glob_error() {
        let p = Pattern::parse("${missing}/file").unwrap();
        let err = p.expand_cartesian(&[]).unwrap_err();
        assert_eq!(err.kind(), "glob_error");
    }

    #[test]
    fn dot_files_are_skipped_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"a").unwrap();
        std::fs::write(dir.path().join(".hidden.txt"), b"b").unwrap();
        let pattern = Pattern::parse("*.txt").unwrap();
        let found = glob(dir.path(), &pattern).unwrap();
        assert_eq!(found, vec![dir.path().join("visible.txt")]);
    }

    #[test]
    fn dot_files_are_visited_when_the_pattern_segment_begins_with_a_dot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"a").unwrap();
        std::fs::write(dir.path().join(".env"), b"b").unwrap();
        let pattern = Pattern::parse(".*").unwrap();
        let found = glob(dir.path(), &pattern).unwrap();
        assert_eq!(found, vec![dir.path().join(".env")]);
    }

    #[test]
    fn dot_directories_are_pruned_unless_the_matching_segment_begins_with_a_dot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), b"x").unwrap();
        let skip_pattern = Pattern::parse("**/*.txt").unwrap();
        assert!(glob(dir.path(), &skip_pattern).unwrap().is_empty());

        let include_pattern = Pattern::parse(".git/config").unwrap();
        let found = glob(dir.path(), &include_pattern).unwrap();
        assert_eq!(found, vec![dir.path().join(".git/config")]);
    }
}
