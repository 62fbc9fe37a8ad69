use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::trace;

use crate::descriptor::annotation_descriptor;

pub const DEFAULT_NOT_NULL: &str = "org.jetbrains.annotations.NotNull";
pub const DEFAULT_NULLABLE: &str = "org.jetbrains.annotations.Nullable";

const REGEX_PREFIX: &str = "regex:";

/// Options as written in a JSON configuration file or collected from the command line.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub not_null: Vec<String>,
    #[serde(default)]
    pub nullable: Vec<String>,
    #[serde(default)]
    pub implicit: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let deserializer = &mut serde_json::Deserializer::from_str(content);
        let settings = serde_path_to_error::deserialize(deserializer).map_err(|err| {
            let path = err.path().to_string();
            anyhow::anyhow!("{} at {}", err.into_inner(), path)
        })?;
        Ok(settings)
    }

    /// Add another source's values; sets are unioned and implicit mode is sticky.
    pub fn extend(&mut self, other: Settings) {
        self.not_null.extend(other.not_null);
        self.nullable.extend(other.nullable);
        self.implicit |= other.implicit;
        self.exclude.extend(other.exclude);
    }

    /// Resolve names and compile exclusion patterns. Empty name sets fall back to the defaults.
    pub fn resolve(self) -> Result<Configuration> {
        let not_null = if self.not_null.is_empty() {
            vec![DEFAULT_NOT_NULL.to_string()]
        } else {
            self.not_null
        };
        let nullable = if self.nullable.is_empty() {
            vec![DEFAULT_NULLABLE.to_string()]
        } else {
            self.nullable
        };
        let exclusions = self
            .exclude
            .iter()
            .map(|pattern| ClassPattern::parse(pattern))
            .collect::<Result<Vec<_>>>()?;
        Ok(Configuration {
            not_null: not_null.iter().map(|name| annotation_descriptor(name)).collect(),
            nullable: nullable.iter().map(|name| annotation_descriptor(name)).collect(),
            implicit: self.implicit,
            exclusions,
        })
    }
}

/// Resolved, immutable options shared by every instrumented class of a run.
#[derive(Clone, Debug)]
pub struct Configuration {
    not_null: BTreeSet<String>,
    nullable: BTreeSet<String>,
    implicit: bool,
    exclusions: Vec<ClassPattern>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            not_null: BTreeSet::from([annotation_descriptor(DEFAULT_NOT_NULL)]),
            nullable: BTreeSet::from([annotation_descriptor(DEFAULT_NULLABLE)]),
            implicit: false,
            exclusions: Vec::new(),
        }
    }
}

impl Configuration {
    /// Whether an annotation type descriptor (`Lpkg/Name;`) marks a not-null slot.
    pub fn is_not_null(&self, descriptor: &str) -> bool {
        self.not_null.contains(descriptor)
    }

    pub fn is_nullable(&self, descriptor: &str) -> bool {
        self.nullable.contains(descriptor)
    }

    pub fn implicit(&self) -> bool {
        self.implicit
    }

    /// Match a dotted or slash-separated class name against the exclusion patterns.
    pub fn is_excluded(&self, class_name: &str) -> bool {
        if self.exclusions.is_empty() {
            return false;
        }
        let dotted = class_name.replace('/', ".");
        match self.exclusions.iter().find(|pattern| pattern.matches(&dotted)) {
            Some(pattern) => {
                trace!(class = %dotted, pattern = pattern.as_str(), "exclusion matched");
                true
            }
            None => false,
        }
    }
}

/// Class-name exclusion pattern: a package glob or a `regex:` expression.
#[derive(Clone, Debug)]
pub struct ClassPattern {
    source: String,
    regex: Regex,
}

impl ClassPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let expression = match pattern.strip_prefix(REGEX_PREFIX) {
            Some(raw) => format!("^(?:{raw})$"),
            None => glob_to_regex(&pattern.replace('/', ".")),
        };
        let regex = Regex::new(&expression)
            .with_context(|| format!("invalid exclusion pattern {pattern:?}"))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, dotted_class_name: &str) -> bool {
        self.regex.is_match(dotted_class_name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut expression = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                expression.push_str(".*");
            }
            '*' => expression.push_str("[^.]*"),
            '?' => expression.push_str("[^.]"),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    expression
}
