//! Shell-glob matching for phase markers
//!
//! Supports:
//! - `*` matches any run of characters (including none)
//! - `?` matches exactly one character
//! - every other character matches itself
//!
//! The whole line must match, as with `fnmatch(3)` without flags.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    AnyRun,
    AnyOne,
    Literal(char),
}

/// A compiled glob pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    source: String,
    tokens: Vec<Token>,
}

impl GlobPattern {
    /// Compile a pattern
    pub fn new(pattern: &str) -> Self {
        let mut tokens = Vec::with_capacity(pattern.len());
        for c in pattern.chars() {
            let token = match c {
                '*' => Token::AnyRun,
                '?' => Token::AnyOne,
                c => Token::Literal(c),
            };
            // Consecutive stars are equivalent to one
            if token == Token::AnyRun && tokens.last() == Some(&Token::AnyRun) {
                continue;
            }
            tokens.push(token);
        }
        Self {
            source: pattern.to_string(),
            tokens,
        }
    }

    /// The pattern as given by the operator
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check whether `text` matches the whole pattern
    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        let tokens = &self.tokens;

        let (mut ti, mut ci) = (0, 0);
        // Position of the last star and the text index it currently absorbs up to
        let mut backtrack: Option<(usize, usize)> = None;

        while ci < text.len() {
            match tokens.get(ti) {
                Some(Token::AnyRun) => {
                    backtrack = Some((ti, ci));
                    ti += 1;
                }
                Some(Token::AnyOne) => {
                    ti += 1;
                    ci += 1;
                }
                Some(Token::Literal(c)) if *c == text[ci] => {
                    ti += 1;
                    ci += 1;
                }
                _ => match backtrack {
                    Some((star, absorbed)) => {
                        ti = star + 1;
                        ci = absorbed + 1;
                        backtrack = Some((star, absorbed + 1));
                    }
                    None => return false,
                },
            }
        }

        tokens[ti..].iter().all(|t| *t == Token::AnyRun)
    }
}

/// Match `text` against a glob `pattern`
pub fn matches(pattern: &str, text: &str) -> bool {
    GlobPattern::new(pattern).matches(text)
}
