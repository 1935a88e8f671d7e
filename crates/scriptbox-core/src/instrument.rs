//! Source instrumentation
//!
//! Rewrites blocking call-sites so the program can be driven from an
//! asynchronous host:
//!
//! - `input(...)` becomes `await __await_input__(...)`
//! - `time.sleep(...)` becomes `await __sleep__(...)`, and so does a bare
//!   `sleep(...)` when the program does `from time import sleep`
//!
//! The rewritten program is indented one level and wrapped in
//! `async def __user_main__():`, which the interpreter awaits.
//!
//! Matching is token-aware: string literals and comments are skipped,
//! attribute calls like `obj.input(` are left alone, and identifiers that
//! merely contain a stub name never match. When a rewrite would produce
//! invalid code (an `await` inside a nested synchronous function or a
//! lambda) or the program already uses one of the reserved names, the source
//! passes through untouched with `instrumented = false`.
//!
//! A program that already starts with the entry point header is treated as
//! instrumented output: stub names are expected there, any remaining
//! call-sites are rewritten in place and no second wrapper is added.

use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Awaitable replacement for `input()`
pub const INPUT_STUB: &str = "__await_input__";
/// Awaitable replacement for `time.sleep()`
pub const SLEEP_STUB: &str = "__sleep__";
/// Name of the generated asynchronous entry point
pub const ENTRY_POINT: &str = "__user_main__";
/// Graphics flusher installed by the interpreter bootstrap
pub const FLUSH_PLOTS_STUB: &str = "__flush_plots__";

/// Names the instrumented program relies on; user code must not use them
pub const RESERVED_NAMES: [&str; 4] = [INPUT_STUB, SLEEP_STUB, ENTRY_POINT, FLUSH_PLOTS_STUB];

static GRAPHICS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(^|\n)[ \t]*(from[ \t]+matplotlib\b|import[ \t]+matplotlib(\.pyplot)?\b)|\bpyplot[ \t]*\.")
        .expect("graphics pattern is valid")
});

static FROM_TIME_IMPORT_SLEEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+time[ \t]+import[^\n#]*\bsleep\b")
        .expect("sleep import pattern is valid")
});

/// Instrumentation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentOptions {
    /// Spaces per indentation level; tabs expand to this many spaces
    pub indent_width: usize,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            indent_width: crate::config::defaults::instrumentation::INDENT_WIDTH,
        }
    }
}

/// Why a program was left uninstrumented
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Passthrough {
    /// The program already uses a reserved stub name
    ReservedName(String),
    /// A blocking call-site sits where `await` is not allowed (1-based line)
    SynchronousScope { line: usize },
}

impl fmt::Display for Passthrough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedName(name) => write!(f, "program uses reserved name '{}'", name),
            Self::SynchronousScope { line } => write!(
                f,
                "blocking call on line {} is inside a synchronous function or lambda",
                line
            ),
        }
    }
}

/// Result of instrumenting a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrumented {
    /// Program text to send to the sandbox
    pub code: String,
    /// Whether `code` is wrapped in the asynchronous entry point
    pub instrumented: bool,
    /// Whether the program uses the plotting library
    pub needs_graphics: bool,
    /// Number of call-sites rewritten
    pub rewrites: usize,
    /// Set when the program passed through unchanged
    pub passthrough: Option<Passthrough>,
}

/// Instrument a program for cooperative execution
pub fn instrument(source: &str, options: &InstrumentOptions) -> Instrumented {
    let needs_graphics = needs_graphics(source);
    let expanded = expand_tabs(source, options.indent_width);
    let wrapped = is_wrapped(&expanded);
    let scan = Scanner::new(&expanded, FROM_TIME_IMPORT_SLEEP.is_match(&expanded))
        .stubs_allowed(wrapped)
        .run();

    if let Some(reason) = scan.passthrough() {
        warn!(%reason, "program left uninstrumented");
        return Instrumented {
            code: source.to_string(),
            instrumented: false,
            needs_graphics,
            rewrites: 0,
            passthrough: Some(reason),
        };
    }

    let body = apply_rewrites(&expanded, &scan.call_sites);
    let code = if wrapped {
        body
    } else {
        wrap_entry_point(&body, &scan.string_lines, options.indent_width, scan.has_code)
    };
    debug!(rewrites = scan.call_sites.len(), needs_graphics, "program instrumented");

    Instrumented {
        code,
        instrumented: true,
        needs_graphics,
        rewrites: scan.call_sites.len(),
        passthrough: None,
    }
}

/// Static check for plotting library usage
pub fn needs_graphics(source: &str) -> bool {
    GRAPHICS_IMPORT.is_match(source)
}

fn expand_tabs(source: &str, indent_width: usize) -> String {
    if source.contains('\t') {
        source.replace('\t', &" ".repeat(indent_width))
    } else {
        source.to_string()
    }
}

/// Whether the text already begins with the generated entry point header
fn is_wrapped(source: &str) -> bool {
    let first = source.lines().next().unwrap_or_default();
    first.trim_end() == format!("async def {}():", ENTRY_POINT)
}

fn apply_rewrites(source: &str, call_sites: &[CallSite]) -> String {
    let mut out = String::with_capacity(source.len() + call_sites.len() * 16);
    let mut cursor = 0;
    for site in call_sites {
        out.push_str(&source[cursor..site.start]);
        out.push_str("await ");
        out.push_str(site.kind.stub());
        out.push('(');
        cursor = site.end;
    }
    out.push_str(&source[cursor..]);
    out
}

fn wrap_entry_point(
    body: &str,
    string_lines: &HashSet<usize>,
    indent_width: usize,
    has_code: bool,
) -> String {
    let indent = " ".repeat(indent_width);
    let mut out = format!("async def {}():\n", ENTRY_POINT);
    for (number, line) in body.split('\n').enumerate() {
        if !line.is_empty() && !string_lines.contains(&number) {
            out.push_str(&indent);
        }
        out.push_str(line);
        out.push('\n');
    }
    if !has_code {
        out.push_str(&indent);
        out.push_str("pass\n");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocking {
    Input,
    Sleep,
}

impl Blocking {
    fn stub(self) -> &'static str {
        match self {
            Self::Input => INPUT_STUB,
            Self::Sleep => SLEEP_STUB,
        }
    }
}

/// Byte range `[start, end)` covering the callee name through its `(`
#[derive(Debug, Clone, Copy)]
struct CallSite {
    start: usize,
    end: usize,
    kind: Blocking,
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    indent: usize,
    synchronous: bool,
}

#[derive(Debug, Default)]
struct ScanResult {
    call_sites: Vec<CallSite>,
    reserved: Option<String>,
    sync_call_line: Option<usize>,
    /// 0-based lines that begin inside a multi-line string literal
    string_lines: HashSet<usize>,
    has_code: bool,
}

impl ScanResult {
    fn passthrough(&self) -> Option<Passthrough> {
        if let Some(name) = &self.reserved {
            return Some(Passthrough::ReservedName(name.clone()));
        }
        self.sync_call_line
            .map(|line| Passthrough::SynchronousScope { line: line + 1 })
    }
}

/// Single forward pass over the program text
struct Scanner<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: usize,
    bare_sleep: bool,
    depth: usize,
    at_line_start: bool,
    scopes: Vec<Scope>,
    line_indent: usize,
    /// `def`/`class` header seen on the current logical line
    header: Option<Scope>,
    lambda_on_line: bool,
    last_word: Option<&'a str>,
    prev_significant: Option<char>,
    /// Stub names are expected rather than reserved
    allow_stubs: bool,
    result: ScanResult,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str, bare_sleep: bool) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            line: 0,
            bare_sleep,
            depth: 0,
            at_line_start: true,
            scopes: Vec::new(),
            line_indent: 0,
            header: None,
            lambda_on_line: false,
            last_word: None,
            prev_significant: None,
            allow_stubs: false,
            result: ScanResult::default(),
        }
    }

    fn stubs_allowed(mut self, allow: bool) -> Self {
        self.allow_stubs = allow;
        self
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).map(|&(_, c)| c)
    }

    fn byte_at(&self, index: usize) -> usize {
        self.chars.get(index).map_or(self.src.len(), |&(b, _)| b)
    }

    fn run(mut self) -> ScanResult {
        while self.pos < self.chars.len() {
            if self.at_line_start {
                self.begin_logical_line();
                continue;
            }

            let c = self.chars[self.pos].1;
            match c {
                '#' => self.skip_comment(),
                '\'' | '"' => self.skip_string(c),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.depth == 0 {
                        self.at_line_start = true;
                    }
                }
                '(' | '[' | '{' => {
                    self.depth += 1;
                    self.significant(c);
                }
                ')' | ']' | '}' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.significant(c);
                }
                c if c.is_ascii_digit() => self.skip_number(),
                c if is_ident_start(c) => self.word(),
                c if c.is_whitespace() => self.pos += 1,
                c => self.significant(c),
            }
        }
        self.result
    }

    fn significant(&mut self, c: char) {
        self.result.has_code = true;
        self.prev_significant = Some(c);
        self.pos += 1;
    }

    fn begin_logical_line(&mut self) {
        self.at_line_start = false;
        let mut indent = 0;
        while self.peek(indent) == Some(' ') {
            indent += 1;
        }
        match self.peek(indent) {
            None | Some('\n') | Some('#') | Some('\r') => {
                self.pos += indent;
                return;
            }
            _ => {}
        }

        while self.scopes.last().is_some_and(|s| indent <= s.indent) {
            self.scopes.pop();
        }
        if let Some(header) = self.header.take() {
            if indent > header.indent {
                self.scopes.push(header);
            }
        }
        self.line_indent = indent;
        self.lambda_on_line = false;
        self.last_word = None;
        self.pos += indent;
    }

    fn skip_comment(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn skip_string(&mut self, quote: char) {
        self.result.has_code = true;
        self.prev_significant = Some(quote);
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        while let Some(c) = self.peek(0) {
            match c {
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                        self.result.string_lines.insert(self.line);
                    }
                    self.pos += 2;
                }
                '\n' if triple => {
                    self.pos += 1;
                    self.line += 1;
                    self.result.string_lines.insert(self.line);
                }
                // Unterminated single-quoted literal; let the interpreter report it
                '\n' => return,
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        return;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        return;
                    }
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
    }

    fn skip_number(&mut self) {
        self.result.has_code = true;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            self.pos += 1;
        }
        self.prev_significant = Some('0');
    }

    fn word(&mut self) {
        self.result.has_code = true;
        let start_index = self.pos;
        while self.peek(0).is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        let src = self.src;
        let start = self.byte_at(start_index);
        let end = self.byte_at(self.pos);
        let word = &src[start..end];
        let after_dot = self.prev_significant == Some('.');

        match word {
            "def" => {
                self.header = Some(Scope {
                    indent: self.line_indent,
                    synchronous: self.last_word != Some("async"),
                });
            }
            "class" => {
                self.header = Some(Scope {
                    indent: self.line_indent,
                    synchronous: true,
                });
            }
            "lambda" => self.lambda_on_line = true,
            name if !self.allow_stubs && RESERVED_NAMES.contains(&name) => {
                if self.result.reserved.is_none() {
                    self.result.reserved = Some(name.to_string());
                }
            }
            "input" if !after_dot && self.last_word != Some("def") => {
                if let Some(open) = self.call_paren(self.pos) {
                    self.record(start, open, Blocking::Input);
                    return;
                }
            }
            "sleep" if self.bare_sleep && !after_dot && self.last_word != Some("def") => {
                if let Some(open) = self.call_paren(self.pos) {
                    self.record(start, open, Blocking::Sleep);
                    return;
                }
            }
            "time" if !after_dot => {
                if let Some(open) = self.time_sleep_paren() {
                    self.record(start, open, Blocking::Sleep);
                    return;
                }
            }
            _ => {}
        }

        self.last_word = Some(word);
        self.prev_significant = Some('a');
    }

    /// Char index just past `(` if only spaces separate `from` and `(`
    fn call_paren(&self, from: usize) -> Option<usize> {
        let mut index = from;
        while self.chars.get(index).is_some_and(|&(_, c)| c == ' ') {
            index += 1;
        }
        (self.chars.get(index)?.1 == '(').then_some(index + 1)
    }

    /// Matches `time . sleep (` starting right after the `time` word
    fn time_sleep_paren(&self) -> Option<usize> {
        let mut index = self.pos;
        let skip_spaces = |mut i: usize| {
            while self.chars.get(i).is_some_and(|&(_, c)| c == ' ') {
                i += 1;
            }
            i
        };
        index = skip_spaces(index);
        if self.chars.get(index)?.1 != '.' {
            return None;
        }
        index = skip_spaces(index + 1);
        let word_start = index;
        while self.chars.get(index).is_some_and(|&(_, c)| is_ident_continue(c)) {
            index += 1;
        }
        if &self.src[self.byte_at(word_start)..self.byte_at(index)] != "sleep" {
            return None;
        }
        self.call_paren(index)
    }

    fn record(&mut self, start: usize, open_index: usize, kind: Blocking) {
        let synchronous = self.lambda_on_line
            || self
                .header
                .or_else(|| self.scopes.last().copied())
                .is_some_and(|scope| scope.synchronous);
        if synchronous && self.result.sync_call_line.is_none() {
            self.result.sync_call_line = Some(self.line);
        }
        self.result.call_sites.push(CallSite {
            start,
            end: self.byte_at(open_index),
            kind,
        });
        // Resume after the '(' so the call's arguments are still scanned
        self.pos = open_index;
        self.depth += 1;
        self.last_word = None;
        self.prev_significant = Some('(');
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

#[cfg(test)]
mod tests;
