//! Bind-parameter rendering for the query history. Substituted text is
//! display-only; execution always forwards the raw bound values.

/// A bound parameter as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindValue {
    Null,
    /// Text-format value.
    Text(String),
    /// Binary-format value the proxy does not interpret.
    Bytes(Vec<u8>),
}

impl BindValue {
    pub fn from_wire(value: Option<&[u8]>, format_code: i16) -> Self {
        match value {
            None => Self::Null,
            Some(bytes) if format_code == 0 => match std::str::from_utf8(bytes) {
                Ok(text) => Self::Text(text.to_string()),
                Err(_) => Self::Bytes(bytes.to_vec()),
            },
            Some(bytes) => Self::Bytes(bytes.to_vec()),
        }
    }
}

/// Renders one bound value as a SQL literal: numbers and booleans bare,
/// strings and byte sequences single-quoted with internal quotes
/// doubled, null as NULL.
pub fn literal(value: &BindValue) -> String {
    match value {
        BindValue::Null => "NULL".to_string(),
        BindValue::Text(text) => {
            if text.parse::<i64>().is_ok() || text.parse::<f64>().is_ok() {
                text.clone()
            } else if text == "true" || text == "false" {
                text.clone()
            } else {
                format!("'{}'", text.replace('\'', "''"))
            }
        }
        BindValue::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
    }
}

/// Replaces `$1`, `$2`, ... with rendered literals, highest index first so
/// `$12` is not clobbered by `$1`.
pub fn substitute_params(sql: &str, args: &[BindValue]) -> String {
    let mut out = sql.to_string();
    for (i, value) in args.iter().enumerate().rev() {
        out = out.replace(&format!("${}", i + 1), &literal(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_literals() {
        assert_eq!(literal(&BindValue::Null), "NULL");
        assert_eq!(literal(&BindValue::Text("42".to_string())), "42");
        assert_eq!(literal(&BindValue::Text("-3.5".to_string())), "-3.5");
        assert_eq!(literal(&BindValue::Text("true".to_string())), "true");
        assert_eq!(literal(&BindValue::Text("it's".to_string())), "'it''s'");
        assert_eq!(literal(&BindValue::Bytes(b"it's".to_vec())), "'it''s'");
    }

    #[test]
    fn substitutes_in_reverse_index_order() {
        let args = vec![
            BindValue::Text("1".to_string()),
            BindValue::Text("two".to_string()),
            BindValue::Null,
        ];
        assert_eq!(
            substitute_params("SELECT $1, $2, $3", &args),
            "SELECT 1, 'two', NULL"
        );
    }

    #[test]
    fn double_digit_markers_survive() {
        let args: Vec<BindValue> = (1..=12)
            .map(|i| BindValue::Text(i.to_string()))
            .collect();
        assert_eq!(substitute_params("SELECT $12, $1", &args), "SELECT 12, 1");
    }

    #[test]
    fn wire_conversion_prefers_text() {
        assert_eq!(
            BindValue::from_wire(Some(b"abc"), 0),
            BindValue::Text("abc".to_string())
        );
        assert_eq!(
            BindValue::from_wire(Some(&[0xff]), 1),
            BindValue::Bytes(vec![0xff])
        );
        assert_eq!(BindValue::from_wire(None, 0), BindValue::Null);
    }
}
