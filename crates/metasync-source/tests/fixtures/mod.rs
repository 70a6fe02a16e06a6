//! Test fixtures for source enumerator integration tests
//!
//! Reusable catalog layouts shaped like the warehouses these enumerators
//! crawl: an application database with a few schemas, plus an engine-owned
//! database that default scopes skip.

use metasync_source::{ColumnInfo, MockSource, TableFixture};

/// Columns of a typical users table
pub fn users_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", "bigint", false, 1),
        ColumnInfo::new("email", "text", false, 2),
        ColumnInfo::new("name", "text", true, 3),
        ColumnInfo::new("created_at", "timestamp with time zone", false, 4),
    ]
}

/// Columns of a typical orders table
pub fn orders_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", "bigint", false, 1),
        ColumnInfo::new("user_id", "bigint", false, 2),
        ColumnInfo::new("total_amount", "numeric(10,2)", false, 3),
        ColumnInfo::new("status", "text", false, 4),
    ]
}

/// `shop` database with `public` and `reporting` schemas and a system database
pub fn warehouse() -> MockSource {
    MockSource::builder()
        .system_database("template1")
        .system_schema("shop", "pg_catalog")
        .table("shop", "public", TableFixture::table("users", users_columns()).with_row_count(1200))
        .table("shop", "public", TableFixture::table("orders", orders_columns()).with_row_count(48_000))
        .table(
            "shop",
            "reporting",
            TableFixture::view(
                "daily_revenue",
                "SELECT created_at::date AS day, sum(total_amount) FROM public.orders GROUP BY 1",
                vec![
                    ColumnInfo::new("day", "date", true, 1),
                    ColumnInfo::new("sum", "numeric", true, 2),
                ],
            ),
        )
        .build()
}

/// The same layout as JSON, as the CLI reads it for fixture connections
pub const WAREHOUSE_JSON: &str = r#"{
  "databases": [
    { "name": "template1", "is_system": true },
    {
      "name": "shop",
      "schemas": [
        {
          "name": "public",
          "tables": [
            {
              "name": "users",
              "table_type": "BASE TABLE",
              "row_count": 1200,
              "columns": [
                { "name": "id", "data_type": "bigint", "is_nullable": false, "ordinal_position": 1 },
                { "name": "email", "data_type": "text", "is_nullable": false, "ordinal_position": 2 }
              ]
            }
          ]
        },
        {
          "name": "reporting",
          "tables": [
            {
              "name": "daily_revenue",
              "kind": "view",
              "table_type": "VIEW",
              "view_definition": "SELECT 1",
              "columns": [
                { "name": "day", "data_type": "date", "is_nullable": true, "ordinal_position": 1 }
              ]
            }
          ]
        }
      ]
    }
  ]
}"#;
