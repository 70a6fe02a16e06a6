//! Deterministic hierarchical names
//!
//! `host[:port]` for servers, `host/db` for databases and dotted paths below
//! that: `host/db.schema.table.column`. A segment holding a separator or a
//! double quote is written as a quoted identifier (`"a.b"`, with embedded
//! quotes doubled), so distinct paths never share a name.

use std::borrow::Cow;

use crate::node::NodeType;

/// Qualified name of a server node
pub fn server(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Qualified name of a child from its parent's qualified name and type
pub fn child(parent_type: NodeType, parent_qualified_name: &str, name: &str) -> String {
    let segment = segment(name);
    match parent_type {
        NodeType::Server => format!("{}/{}", parent_qualified_name, segment),
        _ => format!("{}.{}", parent_qualified_name, segment),
    }
}

/// One path segment, quoted when it would otherwise be ambiguous
pub fn segment(name: &str) -> Cow<'_, str> {
    if name.contains(['.', '/', '"']) {
        Cow::Owned(format!("\"{}\"", name.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(name)
    }
}
