//! Node drafts for store contract tests
//!
//! A small warehouse shape: one server, one `shop` database and a `sales`
//! schema holding tables, views and columns. The server host is a parameter
//! so runs against a shared PostgreSQL store don't collide.

use metasync_core::{qualified, NewRun, NodeAttributes, NodeDraft, NodeRef, NodeType, ScopeDescriptor};

pub struct Shop {
    pub host: String,
}

impl Shop {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn server_name(&self) -> String {
        qualified::server(&self.host, Some(5432))
    }

    pub fn database_name(&self) -> String {
        qualified::child(NodeType::Server, &self.server_name(), "shop")
    }

    pub fn schema_name(&self) -> String {
        qualified::child(NodeType::Database, &self.database_name(), "sales")
    }

    pub fn new_run(&self) -> NewRun {
        NewRun {
            connection: self.host.clone(),
            scope: ScopeDescriptor::default().with_databases("shop").with_schemas("sales"),
            log_reference: Some(format!("/var/log/metasync/{}.log", self.host)),
        }
    }

    pub fn server(&self) -> NodeDraft {
        NodeDraft::new(
            self.host.clone(),
            self.server_name(),
            None,
            NodeAttributes::Server { host: self.host.clone(), engine: "postgres".to_string() },
        )
    }

    pub fn database(&self, server: &NodeRef) -> NodeDraft {
        NodeDraft::new("shop", self.database_name(), Some(server.clone()), NodeAttributes::Database)
    }

    pub fn schema(&self, database: &NodeRef) -> NodeDraft {
        NodeDraft::new("sales", self.schema_name(), Some(database.clone()), NodeAttributes::Schema)
    }

    pub fn table(&self, schema: &NodeRef, name: &str) -> NodeDraft {
        NodeDraft::new(
            name,
            qualified::child(NodeType::Schema, &schema.qualified_name, name),
            Some(schema.clone()),
            NodeAttributes::Table { table_type: "BASE TABLE".to_string() },
        )
    }

    pub fn view(&self, schema: &NodeRef, name: &str) -> NodeDraft {
        NodeDraft::new(
            name,
            qualified::child(NodeType::Schema, &schema.qualified_name, name),
            Some(schema.clone()),
            NodeAttributes::View { table_type: "VIEW".to_string() },
        )
    }

    pub fn column(&self, table: &NodeRef, name: &str, data_type: &str, position: i32) -> NodeDraft {
        NodeDraft::new(
            name,
            qualified::child(table.node_type, &table.qualified_name, name),
            Some(table.clone()),
            NodeAttributes::Column {
                data_type: data_type.to_string(),
                is_nullable: true,
                ordinal_position: position,
            },
        )
    }
}
