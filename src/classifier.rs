//! Turns raw interpreter error text into a beginner-friendly description.
//!
//! Classification is a pure string transform: an ordered table of
//! `(kind, pattern, template)` rules is evaluated top to bottom and the first
//! rule whose pattern matches produces the message. Text that no rule
//! recognises is passed through unchanged as [`ErrorKind::RuntimeOther`].

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    Indentation,
    NameUndefined,
    TypeMismatch,
    DivisionByZero,
    IndexOutOfRange,
    KeyMissing,
    ValueInvalid,
    AttributeMissing,
    Timeout,
    RuntimeOther,
}

impl ErrorKind {
    /// One short actionable tip for the categories that have one.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            Self::Syntax => Some("Check for missing parentheses, quotes, or colons."),
            Self::Indentation => Some("Use 4 spaces for indentation after colons (:)."),
            Self::NameUndefined => Some("Make sure you've defined the variable before using it."),
            Self::Timeout => Some("Your code might be stuck in an infinite loop."),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Syntax => "syntax",
            Self::Indentation => "indentation",
            Self::NameUndefined => "name_undefined",
            Self::TypeMismatch => "type_mismatch",
            Self::DivisionByZero => "division_by_zero",
            Self::IndexOutOfRange => "index_out_of_range",
            Self::KeyMissing => "key_missing",
            Self::ValueInvalid => "value_invalid",
            Self::AttributeMissing => "attribute_missing",
            Self::Timeout => "timeout",
            Self::RuntimeOther => "runtime_other",
        };
        f.write_str(label)
    }
}

/// A raw error rewritten into a structured, plain-language description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub friendly_message: String,
    pub hint: Option<String>,
    /// Line of the submitted code the traceback points at, if any
    pub line: Option<u32>,
}

impl ClassifiedError {
    /// The fixed result for an execution cut off by its deadline.
    pub fn timeout(seconds: u64) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            friendly_message: format!("Execution timed out after {} seconds.", seconds),
            hint: ErrorKind::Timeout.hint().map(str::to_string),
            line: None,
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.friendly_message)?;
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nTip: {}", hint)?;
        }
        Ok(())
    }
}

/// One entry of the classification table.
pub struct Rule {
    pub kind: ErrorKind,
    pub pattern: &'static str,
    /// Replacement text; `${n}` expands to the n-th capture group
    pub template: &'static str,
}

/// Classification rules in priority order. First match wins.
pub const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::Syntax,
        pattern: r"SyntaxError: .+",
        template: "Syntax Error: There's a mistake in your code structure. Check for missing colons (:), parentheses, or quotes.",
    },
    Rule {
        kind: ErrorKind::Indentation,
        pattern: r"IndentationError: expected an indented block",
        template: "Indentation Error: Python needs proper spacing. After lines ending with ':', the next line should be indented (4 spaces).",
    },
    Rule {
        kind: ErrorKind::Indentation,
        pattern: r"IndentationError: unindent does not match any outer indentation level",
        template: "Indentation Error: Your spacing doesn't match. Make sure all lines at the same level have the same indentation.",
    },
    Rule {
        kind: ErrorKind::NameUndefined,
        pattern: r"NameError: name '(.+?)' is not defined",
        template: "Variable Error: The variable '${1}' hasn't been created yet. Make sure you define it before using it.",
    },
    Rule {
        kind: ErrorKind::TypeMismatch,
        pattern: r"TypeError: unsupported operand type\(s\) for (.+?): '(.+?)' and '(.+?)'",
        template: "Type Error: You can't use '${1}' with ${2} and ${3}. Make sure both values are compatible types.",
    },
    Rule {
        kind: ErrorKind::DivisionByZero,
        pattern: r"ZeroDivisionError",
        template: "Division Error: You're trying to divide by zero, which isn't allowed in math!",
    },
    Rule {
        kind: ErrorKind::IndexOutOfRange,
        pattern: r"IndexError: list index out of range",
        template: "List Error: You're trying to access an item that doesn't exist in the list. Check the list length.",
    },
    Rule {
        kind: ErrorKind::KeyMissing,
        pattern: r"KeyError: '?([^'\n]+?)'?\s*$",
        template: "Dictionary Error: The key '${1}' doesn't exist in the dictionary. Check your spelling or add the key first.",
    },
    Rule {
        kind: ErrorKind::ValueInvalid,
        pattern: r"ValueError: (.+?)\.?\s*$",
        template: "Value Error: ${1}. Make sure you're using the right type of value.",
    },
    Rule {
        kind: ErrorKind::AttributeMissing,
        pattern: r"AttributeError: '(.+?)' object has no attribute '(.+?)'",
        template: "Attribute Error: ${1} doesn't have a '${2}' method or property. Check the documentation for available methods.",
    },
];

struct CompiledRule {
    kind: ErrorKind,
    regex: Regex,
    template: &'static str,
}

static COMPILED: LazyLock<Vec<CompiledRule>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|rule| {
            // Case-insensitive, `$` anchors at line ends
            match Regex::new(&format!("(?im){}", rule.pattern)) {
                Ok(regex) => Some(CompiledRule {
                    kind: rule.kind,
                    regex,
                    template: rule.template,
                }),
                Err(e) => {
                    tracing::error!(pattern = rule.pattern, error = %e, "Invalid classifier rule");
                    None
                }
            }
        })
        .collect()
});

/// Name the submitted code is saved under unless configured otherwise.
pub const DEFAULT_SCRIPT_NAME: &str = "main.py";

/// A traceback frame header: `File "<path>", line <n>`
static FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]*)", line (\d+)"#).expect("static regex"));

/// A raised exception as Python prints it: unindented `Name: message`.
static EXCEPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][\w.]*(Error|Exception|Warning|Interrupt|Exit|Iteration)\b(:.*)?$")
        .expect("static regex")
});

/// Classify raw error text produced by a script saved as [`DEFAULT_SCRIPT_NAME`].
pub fn classify(raw: &str) -> ClassifiedError {
    classify_script(raw, DEFAULT_SCRIPT_NAME)
}

/// Classify raw error text produced by the script named `script_name`.
///
/// Rules only see the exception that was finally raised, so source lines
/// echoed by the traceback and earlier chained exceptions never decide the
/// kind. Text without a recognisable exception line is matched as a whole.
pub fn classify_script(raw: &str, script_name: &str) -> ClassifiedError {
    let raw = raw.trim();
    let line = traceback_line(raw, script_name);
    let subject = raised_exception(raw).unwrap_or(raw);

    for rule in COMPILED.iter() {
        if let Some(caps) = rule.regex.captures(subject) {
            let mut message = String::new();
            caps.expand(rule.template, &mut message);
            return ClassifiedError {
                kind: rule.kind,
                friendly_message: message,
                hint: rule.kind.hint().map(str::to_string),
                line,
            };
        }
    }

    ClassifiedError {
        kind: ErrorKind::RuntimeOther,
        friendly_message: strip_foreign_frames(raw, script_name),
        hint: None,
        line,
    }
}

/// Last unindented exception line, which is the error that ended the program.
fn raised_exception(raw: &str) -> Option<&str> {
    raw.lines()
        .rev()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .find(|line| EXCEPTION_LINE.is_match(line))
}

fn is_script_frame(path: &str, script_name: &str) -> bool {
    path.rsplit(['/', '\\']).next() == Some(script_name)
}

/// Innermost frame inside the submitted script.
fn traceback_line(raw: &str, script_name: &str) -> Option<u32> {
    FRAME
        .captures_iter(raw)
        .filter(|caps| is_script_frame(&caps[1], script_name))
        .last()
        .and_then(|caps| caps[2].parse().ok())
}

/// Drop frames from other files (stdlib, site-packages) together with their
/// echoed source, and shorten the script's own path to its name.
fn strip_foreign_frames(raw: &str, script_name: &str) -> String {
    let mut kept = Vec::new();
    let mut skipping = false;

    for line in raw.lines() {
        if let Some(caps) = FRAME.captures(line) {
            let path = &caps[1];
            skipping = !is_script_frame(path, script_name);
            if !skipping {
                kept.push(line.replacen(path, script_name, 1));
            }
            continue;
        }
        // Source echo and caret lines belong to the preceding frame
        if skipping && line.starts_with(' ') {
            continue;
        }
        skipping = false;
        kept.push(line.to_string());
    }

    kept.join("\n")
}
