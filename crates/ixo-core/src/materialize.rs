//! Code materializer: deterministic template substitution.
//!
//! Replaces `{name}` placeholders in a template with the JSON textual form
//! of `params[name]`. String values are inserted in their quoted JSON form
//! so the result is a syntactically valid literal in the generated
//! program. `{{` and `}}` escape literal braces.
//!
//! The materializer performs no execution, import, or evaluation of any
//! kind - it is a pure string pass, and the only component allowed to see
//! template text before the sandbox.

use serde_json::Value;
use thiserror::Error;

/// Maximum rendered program size (256 KiB). A template and parameter bag
/// that expand beyond this are rejected rather than handed to the sandbox.
pub const MAX_RENDERED_BYTES: usize = 256 * 1024;

/// Maximum placeholder name length.
const MAX_PLACEHOLDER_LEN: usize = 128;

/// Materialization failures. All are detected before any sandbox work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MaterializeError {
    /// A placeholder has no matching parameter.
    #[error("missing parameter for placeholder {{{name}}}")]
    MissingParameter {
        /// The placeholder name.
        name: String,
    },

    /// A `{` opened a placeholder that never closes, or the name is not a
    /// valid identifier.
    #[error("malformed placeholder at byte {offset}: {reason}")]
    MalformedPlaceholder {
        /// Byte offset of the opening brace.
        offset: usize,
        /// What is wrong.
        reason: String,
    },

    /// The rendered program exceeds [`MAX_RENDERED_BYTES`].
    #[error("rendered program of {size} bytes exceeds limit of {max} bytes")]
    RenderedTooLarge {
        /// Actual rendered size.
        size: usize,
        /// The ceiling.
        max: usize,
    },
}

fn is_placeholder_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Renders a template against a parameter bag.
///
/// Parameters present in the bag but absent from the template are
/// silently ignored, which keeps intents forward-compatible with older
/// templates.
///
/// # Errors
///
/// [`MaterializeError::MissingParameter`] when a placeholder has no
/// parameter; [`MaterializeError::MalformedPlaceholder`] for unclosed or
/// non-identifier placeholders; [`MaterializeError::RenderedTooLarge`]
/// when the output exceeds the size ceiling.
pub fn render(
    template: &str,
    params: &serde_json::Map<String, Value>,
) -> Result<String, MaterializeError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, nc) in chars.by_ref() {
                    if nc == '}' {
                        closed = true;
                        break;
                    }
                    if !is_placeholder_char(nc) {
                        return Err(MaterializeError::MalformedPlaceholder {
                            offset,
                            reason: format!("invalid character {nc:?} in placeholder name"),
                        });
                    }
                    name.push(nc);
                    if name.len() > MAX_PLACEHOLDER_LEN {
                        return Err(MaterializeError::MalformedPlaceholder {
                            offset,
                            reason: "placeholder name too long".to_string(),
                        });
                    }
                }
                if !closed {
                    return Err(MaterializeError::MalformedPlaceholder {
                        offset,
                        reason: "unclosed placeholder".to_string(),
                    });
                }
                if name.is_empty() {
                    return Err(MaterializeError::MalformedPlaceholder {
                        offset,
                        reason: "empty placeholder".to_string(),
                    });
                }
                let value = params
                    .get(&name)
                    .ok_or(MaterializeError::MissingParameter { name })?;
                // JSON textual form, inserted literally.
                out.push_str(&value.to_string());
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                }
                out.push('}');
            }
            other => out.push(other),
        }
        if out.len() > MAX_RENDERED_BYTES {
            return Err(MaterializeError::RenderedTooLarge {
                size: out.len(),
                max: MAX_RENDERED_BYTES,
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_string_value_renders_as_json_literal() {
        let out = render("print({message})\n", &params(&[("message", json!("hi"))])).unwrap();
        assert_eq!(out, "print(\"hi\")\n");
    }

    #[test]
    fn test_number_bool_null_values() {
        let out = render(
            "f({n}, {b}, {z})",
            &params(&[("n", json!(42)), ("b", json!(true)), ("z", json!(null))]),
        )
        .unwrap();
        assert_eq!(out, "f(42, true, null)");
    }

    #[test]
    fn test_object_and_array_values() {
        let out = render(
            "data = {payload}",
            &params(&[("payload", json!({"a": [1, 2]}))]),
        )
        .unwrap();
        assert_eq!(out, "data = {\"a\":[1,2]}");
    }

    #[test]
    fn test_missing_parameter_fails_before_any_work() {
        let err = render("print({message})", &params(&[])).unwrap_err();
        assert_eq!(
            err,
            MaterializeError::MissingParameter {
                name: "message".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_parameters_silently_ignored() {
        let out = render(
            "print({message})",
            &params(&[("message", json!("hi")), ("extra", json!(1))]),
        )
        .unwrap();
        assert_eq!(out, "print(\"hi\")");
    }

    #[test]
    fn test_escaped_braces() {
        let out = render("d = {{'k': {v}}}", &params(&[("v", json!(1))])).unwrap();
        assert_eq!(out, "d = {'k': 1}");
    }

    #[test]
    fn test_repeated_placeholder() {
        let out = render("{x} + {x}", &params(&[("x", json!(2))])).unwrap();
        assert_eq!(out, "2 + 2");
    }

    #[test]
    fn test_unclosed_placeholder_rejected() {
        let err = render("print({message", &params(&[("message", json!("hi"))])).unwrap_err();
        assert!(matches!(
            err,
            MaterializeError::MalformedPlaceholder { .. }
        ));
    }

    #[test]
    fn test_injection_stays_quoted() {
        // A hostile string parameter cannot break out of its JSON literal.
        let out = render(
            "print({message})",
            &params(&[("message", json!("\"); import os #"))]),
        )
        .unwrap();
        assert_eq!(out, "print(\"\\\"); import os #\")");
    }

    #[test]
    fn test_rendered_size_ceiling() {
        let big = "x".repeat(MAX_RENDERED_BYTES);
        let err = render("{v}{v}", &params(&[("v", json!(big))])).unwrap_err();
        assert!(matches!(err, MaterializeError::RenderedTooLarge { .. }));
    }
}
