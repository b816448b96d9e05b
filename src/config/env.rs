use crate::{Error, Result};

/// Substitute `${VAR}` and `${VAR:-default}` patterns using `lookup`.
///
/// A variable that is unset (or empty, for the `:-` form) falls back to its
/// default; an unset variable without a default is an error.
pub fn substitute<F>(template: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(var_start) = result[start..].find("${") {
        let var_start = start + var_start;
        let Some(var_end) = result[var_start..].find('}') else {
            break;
        };
        let var_end = var_start + var_end;

        let expr = &result[var_start + 2..var_end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        let value = match (lookup(name), default) {
            (Some(v), Some(d)) if v.is_empty() => d.to_string(),
            (Some(v), _) => v,
            (None, Some(d)) => d.to_string(),
            (None, None) => {
                return Err(Error::Config(format!(
                    "environment variable {} is not set",
                    name
                )));
            }
        };

        result.replace_range(var_start..=var_end, &value);
        start = var_start + value.len();
    }

    Ok(result)
}

/// Whether `s` is a single `${...}` expression and nothing else.
fn is_whole_expression(s: &str) -> bool {
    let s = s.trim();
    s.starts_with("${") && s.find('}') == Some(s.len() - 1)
}

/// Read a substituted scalar as YAML so numbers and booleans keep their type.
fn retype(text: String) -> serde_yaml::Value {
    match serde_yaml::from_str::<serde_yaml::Value>(&text) {
        Ok(v @ (serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_))) => v,
        _ => serde_yaml::Value::String(text),
    }
}

/// Recursively substitute variables in every string of a YAML document.
///
/// A scalar that is exactly one `${...}` expression takes the type of its
/// substituted text, so `timeout_secs: ${RUN_TIMEOUT:-120}` is a number.
pub fn substitute_value<F>(value: &mut serde_yaml::Value, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        serde_yaml::Value::String(s) => {
            let whole = is_whole_expression(s);
            let substituted = substitute(s, lookup)?;
            *value = if whole {
                retype(substituted)
            } else {
                serde_yaml::Value::String(substituted)
            };
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, lookup)?;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_value(v, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Lookup backed by the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
