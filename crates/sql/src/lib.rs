use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use svq_common::{Result, SvqError};

pub use sqlparser::ast;

/// Parse SQL text with the generic dialect.
///
/// Syntax errors are reported as [`SvqError::Unsupported`]: the text is not
/// part of the accepted SQL subset.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SvqError::Unsupported(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::parse_sql;

    #[test]
    fn parses_single_select() {
        let stmts = parse_sql("SELECT a FROM svc WHERE a > 1").expect("parse");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_sql("SELEKT nope").expect_err("must fail");
        assert!(err.to_string().contains("unsupported"));
    }
}
