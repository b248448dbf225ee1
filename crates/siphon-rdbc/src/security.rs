//! Identifier and literal safety helpers.
//!
//! Schema, table and column names taken from configuration end up inside
//! generated SQL. They are validated here before any statement is built, and
//! the few values interpolated into `information_schema` lookups are escaped.

use crate::error::Error;

/// Validate a SQL identifier (schema, table or column name).
///
/// Rules:
/// - Must not be empty
/// - Maximum 63 bytes (PostgreSQL `NAMEDATALEN - 1`)
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters, underscores and `$`
///
/// # Examples
///
/// ```
/// use siphon_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("account").is_ok());
/// assert!(validate_sql_identifier("account_instance_2").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("9lives").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 63 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} bytes (max 63)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(Error::config(format!(
            "invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Apply PostgreSQL's identifier case folding to a configured name.
///
/// A name wrapped in double quotes keeps its case (with `""` unescaped);
/// any other name is lowercased, as the server does for unquoted names.
///
/// ```
/// use siphon_rdbc::security::fold_identifier;
///
/// assert_eq!(fold_identifier("Account"), "account");
/// assert_eq!(fold_identifier("\"Account\""), "Account");
/// ```
pub fn fold_identifier(name: &str) -> String {
    let trimmed = name.trim();
    match trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) if trimmed.len() >= 2 => inner.replace("\"\"", "\""),
        _ => trimmed.to_ascii_lowercase(),
    }
}

/// Escape a string for a single-quoted SQL literal context.
///
/// ```
/// use siphon_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("account"), "account");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_length_limit() {
        assert!(validate_sql_identifier(&"a".repeat(63)).is_ok());
        assert!(validate_sql_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_fold_identifier() {
        assert_eq!(fold_identifier("Sales"), "sales");
        assert_eq!(fold_identifier(" ORDERS "), "orders");
        assert_eq!(fold_identifier("\"MixedCase\""), "MixedCase");
        assert_eq!(fold_identifier("\"\""), "");
        assert!(validate_sql_identifier(&fold_identifier("\"\"")).is_err());
    }

    #[test]
    fn test_identifier_rejects_quotes_and_dots() {
        assert!(validate_sql_identifier("public.account").is_err());
        assert!(validate_sql_identifier("acc\"ount").is_err());
        assert!(validate_sql_identifier("acc ount").is_err());
        assert!(validate_sql_identifier("_tmp$1").is_ok());
    }
}
