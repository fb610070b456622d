//! Access checks for the objects a query references.

use quarry_protocol::Identity;

use crate::config::{PermissionConfig, QueryConfig};
use crate::processor::{ColumnRef, TableRef};

pub trait PermissionChecker: Send + Sync {
    /// Every violation found, as user-facing messages. Empty means allowed.
    fn check(
        &self,
        identity: Option<&Identity>,
        keywords: &[String],
        tables: &[TableRef],
        columns: &[ColumnRef],
        functions: &[String],
    ) -> Vec<String>;
}

/// Grants from configuration: public schemas, schemas granted to groups,
/// the submitter's own schema and the upload schema.
#[derive(Debug, Clone)]
pub struct GrantChecker {
    grants: PermissionConfig,
    user_schema_prefix: String,
    upload_schema: String,
}

impl GrantChecker {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            grants: config.permissions.clone(),
            user_schema_prefix: config.user_schema_prefix.clone(),
            upload_schema: config.upload_schema.clone(),
        }
    }

    fn resolve_schema<'a>(&'a self, schema: &'a str) -> Option<&'a str> {
        if schema.is_empty() {
            self.grants.default_schema.as_deref()
        } else {
            Some(schema)
        }
    }

    fn schema_allowed(&self, identity: Option<&Identity>, schema: &str) -> bool {
        let own_schema = format!(
            "{}{}",
            self.user_schema_prefix,
            quarry_protocol::display_name(identity)
        );
        if schema == own_schema || schema == self.upload_schema {
            return true;
        }
        if self.grants.public_schemas.iter().any(|s| s == schema) {
            return true;
        }
        identity.map_or(false, |identity| {
            identity.groups.iter().any(|group| {
                self.grants
                    .group_schemas
                    .get(group)
                    .map_or(false, |schemas| schemas.iter().any(|s| s == schema))
            })
        })
    }
}

impl PermissionChecker for GrantChecker {
    fn check(
        &self,
        identity: Option<&Identity>,
        keywords: &[String],
        tables: &[TableRef],
        columns: &[ColumnRef],
        functions: &[String],
    ) -> Vec<String> {
        let mut messages = Vec::new();

        for keyword in keywords {
            if self
                .grants
                .blocked_keywords
                .iter()
                .any(|k| k.eq_ignore_ascii_case(keyword))
            {
                messages.push(format!("Keyword \"{}\" is not allowed.", keyword));
            }
        }

        for table in tables {
            match self.resolve_schema(&table.schema) {
                None => messages.push(format!("No schema given for \"{}\".", table.table)),
                // Denied tables are reported as missing.
                Some(schema) if !self.schema_allowed(identity, schema) => {
                    messages.push(format!("Table \"{}.{}\" not found.", schema, table.table))
                }
                Some(_) => {}
            }
        }

        for column in columns.iter().filter(|c| !c.schema.is_empty()) {
            if !self.schema_allowed(identity, &column.schema) {
                messages.push(format!(
                    "Column \"{}.{}.{}\" not found.",
                    column.schema, column.table, column.column
                ));
            }
        }

        if !self.grants.functions.is_empty() {
            for function in functions {
                if !self
                    .grants
                    .functions
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(function))
                {
                    messages.push(format!("Function \"{}\" is not allowed.", function));
                }
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> GrantChecker {
        let mut config = QueryConfig::default();
        config.permissions.public_schemas = vec!["gaia".to_string()];
        config
            .permissions
            .group_schemas
            .insert("survey".to_string(), vec!["sdss".to_string()]);
        config.permissions.functions = vec!["count".to_string()];
        config.permissions.blocked_keywords = vec!["UNION".to_string()];
        GrantChecker::from_config(&config)
    }

    #[test]
    fn test_allows_public_own_and_group_schemas() {
        let alice = Identity::new("alice").with_groups(["survey"]);
        let tables = vec![
            TableRef::new("gaia", "dr3"),
            TableRef::new("sdss", "dr16"),
            TableRef::new("quarry_user_alice", "t1"),
        ];
        let messages = checker().check(Some(&alice), &[], &tables, &[], &["count".into()]);
        assert!(messages.is_empty(), "{messages:?}");
    }

    #[test]
    fn test_collects_every_violation() {
        let tables = vec![
            TableRef::new("sdss", "dr16"),
            TableRef::new("", "orphan"),
            TableRef::new("quarry_user_bob", "t1"),
        ];
        let messages = checker().check(
            None,
            &["SELECT".into(), "UNION".into()],
            &tables,
            &[],
            &["pg_sleep".into()],
        );
        assert_eq!(
            messages,
            vec![
                "Keyword \"UNION\" is not allowed.",
                "Table \"sdss.dr16\" not found.",
                "No schema given for \"orphan\".",
                "Table \"quarry_user_bob.t1\" not found.",
                "Function \"pg_sleep\" is not allowed.",
            ]
        );
    }
}
