//! Identifier validation for table, column and bridge names.
//!
//! Generated SQL embeds identifiers unquoted, so every name a descriptor
//! carries must pass [`validate_identifier`] at registration time.

use unicode_normalization::UnicodeNormalization;

use crate::{Result, TableGraphError};

/// Maximum identifier length in bytes (PostgreSQL's NAMEDATALEN - 1).
const MAX_IDENTIFIER_LEN: usize = 63;

const SQL_KEYWORDS: &[&str] = &[
    "select", "insert", "update", "delete", "drop", "create", "alter",
    "truncate", "grant", "revoke", "exec", "execute", "union", "declare",
    "table", "index", "view", "schema", "database", "user", "role",
    "from", "where", "join", "inner", "outer", "left", "right",
    "on", "using", "and", "or", "not", "in", "exists", "between",
    "like", "ilike", "is", "null", "true", "false", "case", "when",
    "then", "else", "end", "as", "order", "by", "group", "having",
    "limit", "offset", "distinct", "all", "any", "some",
];

/// Validates a table or column name.
///
/// Accepts a plain identifier or a `schema.table` pair.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TableGraphError::Configuration(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('.') {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() != 2 {
            return Err(TableGraphError::Configuration(format!(
                "Invalid qualified identifier '{}': must be in format 'schema.table'",
                name
            )));
        }
        for part in parts {
            validate_identifier_part(part)?;
        }
        return Ok(());
    }

    validate_identifier_part(name)
}

/// Validates one dot-free identifier part.
pub fn validate_identifier_part(name: &str) -> Result<()> {
    // NFKC first so confusable code points cannot slip past the ASCII checks.
    let name = name.nfkc().collect::<String>();

    let first_char = name.chars().next().ok_or_else(|| {
        TableGraphError::Configuration("Identifier part cannot be empty".to_string())
    })?;

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(TableGraphError::Configuration(format!(
            "Identifier '{}' exceeds maximum length of {}",
            name, MAX_IDENTIFIER_LEN
        )));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(TableGraphError::Configuration(format!(
            "Identifier '{}' must start with a letter or underscore",
            name
        )));
    }

    if let Some(ch) = name.chars().find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_') {
        return Err(TableGraphError::Configuration(format!(
            "Identifier '{}' contains invalid character '{}'",
            name, ch
        )));
    }

    if SQL_KEYWORDS.contains(&name.to_lowercase().as_str()) {
        return Err(TableGraphError::Configuration(format!(
            "Identifier '{}' is a reserved SQL keyword",
            name
        )));
    }

    Ok(())
}
