//! Scope descriptors: which databases, schemas and tables a run covers

use serde::{Deserialize, Serialize};

use crate::pattern::PatternList;

fn default_true() -> bool {
    true
}

/// Filters applied uniformly after every enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    /// Database pattern list
    #[serde(default)]
    pub databases: Option<String>,

    /// Schema pattern list
    #[serde(default)]
    pub schemas: Option<String>,

    /// Table/view pattern list
    #[serde(default)]
    pub tables: Option<String>,

    #[serde(default = "default_true")]
    pub include_views: bool,

    #[serde(default)]
    pub include_system_objects: bool,
}

impl Default for ScopeDescriptor {
    fn default() -> Self {
        Self {
            databases: None,
            schemas: None,
            tables: None,
            include_views: true,
            include_system_objects: false,
        }
    }
}

impl ScopeDescriptor {
    pub fn with_databases(mut self, patterns: impl Into<String>) -> Self {
        self.databases = Some(patterns.into());
        self
    }

    pub fn with_schemas(mut self, patterns: impl Into<String>) -> Self {
        self.schemas = Some(patterns.into());
        self
    }

    pub fn with_tables(mut self, patterns: impl Into<String>) -> Self {
        self.tables = Some(patterns.into());
        self
    }

    pub fn with_views(mut self, include: bool) -> Self {
        self.include_views = include;
        self
    }

    pub fn with_system_objects(mut self, include: bool) -> Self {
        self.include_system_objects = include;
        self
    }

    /// No schema filter and no table filter at all
    pub fn is_unfiltered(&self) -> bool {
        let compiled = self.compile();
        compiled.schemas.is_unfiltered() && compiled.tables.is_unfiltered()
    }

    /// Compile every pattern list once for a run
    pub fn compile(&self) -> CompiledScope {
        CompiledScope {
            databases: PatternList::from_option(self.databases.as_deref()),
            schemas: PatternList::from_option(self.schemas.as_deref()),
            tables: PatternList::from_option(self.tables.as_deref()),
            include_views: self.include_views,
            include_system_objects: self.include_system_objects,
        }
    }
}

/// A scope with its pattern lists compiled
#[derive(Debug, Clone, Default)]
pub struct CompiledScope {
    pub databases: PatternList,
    pub schemas: PatternList,
    pub tables: PatternList,
    pub include_views: bool,
    pub include_system_objects: bool,
}

impl CompiledScope {
    pub fn admits_database(&self, name: &str, is_system: bool) -> bool {
        (self.include_system_objects || !is_system) && self.databases.matches(name)
    }

    pub fn admits_schema(&self, name: &str, is_system: bool) -> bool {
        (self.include_system_objects || !is_system) && self.schemas.matches(name)
    }

    pub fn admits_table(&self, name: &str, is_view: bool, is_system: bool) -> bool {
        (self.include_views || !is_view)
            && (self.include_system_objects || !is_system)
            && self.tables.matches(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_views_but_not_system_objects() {
        let scope = ScopeDescriptor::default();
        assert!(scope.include_views);
        assert!(!scope.include_system_objects);
        assert!(scope.is_unfiltered());
    }

    #[test]
    fn database_filter_alone_is_still_unfiltered() {
        let scope = ScopeDescriptor::default().with_databases("D1");
        assert!(scope.is_unfiltered());

        let scope = scope.with_schemas("S1");
        assert!(!scope.is_unfiltered());

        let scope = ScopeDescriptor::default().with_tables("orders_*");
        assert!(!scope.is_unfiltered());
    }

    #[test]
    fn blank_patterns_count_as_unfiltered() {
        let scope = ScopeDescriptor::default().with_schemas(" ").with_tables("");
        assert!(scope.is_unfiltered());
    }

    #[test]
    fn compiled_scope_applies_flags() {
        let scope = ScopeDescriptor::default()
            .with_schemas("sales_*")
            .with_views(false)
            .compile();

        assert!(scope.admits_schema("sales_eu", false));
        assert!(!scope.admits_schema("sales_eu", true));
        assert!(!scope.admits_schema("hr", false));
        assert!(scope.admits_table("orders", false, false));
        assert!(!scope.admits_table("orders_v", true, false));
        assert!(scope.admits_database("anything", false));
        assert!(!scope.admits_database("template0", true));
    }

    #[test]
    fn deserializes_with_defaults() {
        let scope: ScopeDescriptor = serde_json::from_str(r#"{"schemas":"public"}"#).unwrap();
        assert_eq!(scope.schemas.as_deref(), Some("public"));
        assert!(scope.include_views);
        assert!(!scope.include_system_objects);
    }
}
