use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources.
const SOURCE_DIRS: [&str; 4] = ["fit", "cli", "tests", "benches"];

const EDIT_LOG_WORDS: &str =
    "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    EditLogComment,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::EditLogComment => format!(r"(//|/\*).*(?:{EDIT_LOG_WORDS})"),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCapsComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed variables",
            Rule::EditLogComment => "edit-log comments",
            Rule::StarsInComment => "'**' in non-doc comments",
            Rule::AllCapsComment => "comments with all uppercase alphabetic characters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Either use the variable (removing the underscore) or remove it completely."
            }
            Rule::EditLogComment => {
                "Comments must describe the code, not its history. Remove the comment."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::AllCapsComment => "STRONGLY CONSIDER deleting the comment completely.",
            Rule::AllowDeadCode => "Either use the code or remove it completely.",
        }
    }

    // Decides whether a line matched by the regex is a real violation.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscorePrefix => !trimmed.starts_with("//") && !in_string_literal(line),
            Rule::EditLogComment | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::AllCapsComment => {
                let Some(text) = comment_text(line) else {
                    return false;
                };
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(|c| c.is_uppercase())
            }
        }
    }
}

struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.describe(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!(
            "\n⚠️ These are STRICTLY FORBIDDEN in this project.\n   {}\n",
            self.rule.advice()
        ));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// A match inside double quotes is part of a string, not an identifier.
fn in_string_literal(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
    {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in source_files() {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let rules = [
        Rule::UnderscorePrefix,
        Rule::EditLogComment,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule) {
            // eprintln! so the message shows up in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
