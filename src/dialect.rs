//! SQL dialect hooks used by the cluster itself.
//!
//! Only the statements the cluster issues on its own behalf live here: the
//! liveness probe and the table locks taken during synchronization.

/// Dialect-specific statements.
pub trait Dialect: Send + Sync {
    /// Minimal round-trip statement used by liveness probes.
    fn simple_sql(&self) -> &str {
        "SELECT 1"
    }

    /// Schema-qualified table name.
    fn qualified_table_name(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("{}.{}", schema, table),
            None => table.to_string(),
        }
    }

    /// Statement that blocks writers to a table until the transaction ends.
    fn lock_table_sql(&self, schema: Option<&str>, table: &str) -> String {
        format!(
            "LOCK TABLE {} IN SHARE MODE",
            self.qualified_table_name(schema, table)
        )
    }
}

/// ANSI-flavoured default dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDialect;

impl Dialect for StandardDialect {}
