//! Pre-execution checks for playground scripts.
//!
//! Scripts run as classic scripts, not modules. Instead of rewriting
//! `import` into `require`, module syntax is detected up front and reported
//! with a message that points at `require()`. The lexical scanner here
//! skips strings, template literals, comments and regex literals, so
//! `"import x from 'y'"` inside a string is not a false positive.

use crate::error::SandboxError;

/// Maximum script size in bytes (1 MiB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 1024 * 1024;

/// A top-level `import`/`export` statement found in a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSyntax {
    /// `import` or `export`.
    pub keyword: &'static str,
    /// 1-based line of the keyword.
    pub line: usize,
}

impl ModuleSyntax {
    /// The failure reported to the user.
    pub fn into_error(self) -> SandboxError {
        SandboxError::Syntax {
            message: format!(
                "SyntaxError: Cannot use {} statement outside a module (line {}). \
                 Scripts run as CommonJS; load packages with require() instead.",
                self.keyword, self.line
            ),
        }
    }
}

/// Validate a script before it reaches V8.
///
/// Empty source is valid and evaluates to `undefined`.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    #[cfg(feature = "ast-validator")]
    let found = crate::ast_validator::detect_module_syntax(code);
    #[cfg(not(feature = "ast-validator"))]
    let found = detect_module_syntax(code);

    match found {
        Some(syntax) => Err(syntax.into_error()),
        None => Ok(()),
    }
}

/// What the scanner saw last, for telling `/` (divide) from `/re/`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Prev {
    Start,
    /// An identifier or keyword; `true` if it ends an expression.
    Word { ends_expr: bool },
    /// A number, string, template or regex literal.
    Value,
    Punct(char),
}

impl Prev {
    fn slash_starts_regex(self) -> bool {
        match self {
            Prev::Start => true,
            Prev::Word { ends_expr } => !ends_expr,
            Prev::Value => false,
            Prev::Punct(c) => !matches!(c, ')' | ']'),
        }
    }
}

/// Keywords after which an expression (and so a regex) may start.
const EXPR_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case",
    "do", "else", "yield", "await",
];

/// Scan for `import`/`export` statements outside strings, comments and regexes.
pub fn detect_module_syntax(source: &str) -> Option<ModuleSyntax> {
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut line = 1;
    let mut prev = Prev::Start;
    // Open `${` expressions inside template literals, with their brace depth
    let mut template_braces: Vec<usize> = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
            }
            '/' if prev.slash_starts_regex() => {
                i = skip_regex(&chars, i + 1);
                prev = Prev::Value;
            }
            '\'' | '"' => {
                i = skip_string(&chars, i + 1, c);
                prev = Prev::Value;
            }
            '`' => {
                let (next, lines, opened) = skip_template(&chars, i + 1);
                i = next;
                line += lines;
                if opened {
                    template_braces.push(0);
                    prev = Prev::Punct('{');
                } else {
                    prev = Prev::Value;
                }
            }
            '{' => {
                if let Some(depth) = template_braces.last_mut() {
                    *depth += 1;
                }
                prev = Prev::Punct('{');
                i += 1;
            }
            '}' => {
                if template_braces.last() == Some(&0) {
                    template_braces.pop();
                    let (next, lines, opened) = skip_template(&chars, i + 1);
                    i = next;
                    line += lines;
                    if opened {
                        template_braces.push(0);
                        prev = Prev::Punct('{');
                    } else {
                        prev = Prev::Value;
                    }
                    continue;
                }
                if let Some(depth) = template_braces.last_mut() {
                    *depth -= 1;
                }
                prev = Prev::Punct('}');
                i += 1;
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
                prev = Prev::Value;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_part(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let after_dot = prev == Prev::Punct('.');
                if !after_dot {
                    if let Some(keyword) = module_keyword(&word, &chars, i) {
                        return Some(ModuleSyntax { keyword, line });
                    }
                }
                prev = Prev::Word {
                    ends_expr: after_dot || !EXPR_KEYWORDS.contains(&word.as_str()),
                };
            }
            c => {
                prev = Prev::Punct(c);
                i += 1;
            }
        }
    }
    None
}

/// `import`/`export` used as a statement keyword at `chars[end..]`.
fn module_keyword(word: &str, chars: &[char], end: usize) -> Option<&'static str> {
    let keyword = match word {
        "import" => "import",
        "export" => "export",
        _ => return None,
    };
    let mut j = end;
    while j < chars.len() && chars[j].is_whitespace() {
        j += 1;
    }
    let next = chars.get(j).copied()?;
    let statement = match keyword {
        // import(...) and import.meta are expressions
        "import" => matches!(next, '{' | '*' | '\'' | '"') || is_ident_start(next),
        _ => matches!(next, '{' | '*') || is_ident_start(next),
    };
    statement.then_some(keyword)
}

fn skip_string(chars: &[char], mut i: usize, quote: char) -> usize {
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '\n' => return i,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// Skip template text. Returns the next index, newlines crossed, and
/// whether the text stopped at a `${` rather than the closing backtick.
fn skip_template(chars: &[char], mut i: usize) -> (usize, usize, bool) {
    let mut lines = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '`' => return (i + 1, lines, false),
            '$' if chars.get(i + 1) == Some(&'{') => return (i + 2, lines, true),
            '\n' => {
                lines += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    (i, lines, false)
}

fn skip_regex(chars: &[char], mut i: usize) -> usize {
    let mut in_class = false;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '\n' => return i,
            '[' => {
                in_class = true;
                i += 1;
            }
            ']' => {
                in_class = false;
                i += 1;
            }
            '/' if !in_class => {
                i += 1;
                while i < chars.len() && is_ident_part(chars[i]) {
                    i += 1;
                }
                return i;
            }
            _ => i += 1,
        }
    }
    i
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
