//! Name filters
//!
//! A pattern list is a comma-separated list of names where `*` matches any
//! run of characters. Matching is case-insensitive and anchored on the whole
//! name, so `sales_*` matches `sales_orders` but not `my_sales_orders`.
//! An empty or absent list matches every name.

use regex::{Regex, RegexBuilder};

/// A compiled pattern list
#[derive(Debug, Clone)]
pub struct PatternList {
    /// Empty means "no filter"
    patterns: Vec<Matcher>,

    source: String,
}

impl PatternList {
    /// Compile a comma-separated pattern list
    pub fn parse(list: &str) -> Self {
        let patterns = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(compile)
            .collect();

        Self {
            patterns,
            source: list.trim().to_string(),
        }
    }

    /// A list that matches everything
    pub fn any() -> Self {
        Self {
            patterns: Vec::new(),
            source: String::new(),
        }
    }

    /// Compile an optional list; `None` matches everything
    pub fn from_option(list: Option<&str>) -> Self {
        list.map(Self::parse).unwrap_or_else(Self::any)
    }

    pub fn is_unfiltered(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|m| m.is_match(name))
    }

    /// The list as written
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Default for PatternList {
    fn default() -> Self {
        Self::any()
    }
}

/// `Matches(name, patternList)`
pub fn matches(name: &str, pattern_list: Option<&str>) -> bool {
    PatternList::from_option(pattern_list).matches(name)
}

fn compile(pattern: &str) -> Matcher {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    // Literal pieces are escaped, so only the size limit can reject a pattern.
    let built = RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build();
    match built {
        Ok(re) => Matcher::Glob(re),
        Err(_) => Matcher::Literal(pattern.to_lowercase()),
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Glob(Regex),
    Literal(String),
}

impl Matcher {
    fn is_match(&self, name: &str) -> bool {
        match self {
            Self::Glob(re) => re.is_match(name),
            Self::Literal(literal) => name.to_lowercase() == *literal,
        }
    }
}
