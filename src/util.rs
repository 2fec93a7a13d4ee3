//! Small utility helpers used across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Wall-clock milliseconds since the unix epoch (0 if the clock is before it).
pub fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Log-safe truncation for large strings. Cuts on a char boundary.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.chars().count() <= max {
    s.to_string()
  } else {
    let head: String = s.chars().take(max).collect();
    format!("{}… ({} bytes total)", head, s.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fills_known_placeholders_only() {
    let out = fill_template("Q: {prompt} / {missing}", &[("prompt", "why?")]);
    assert_eq!(out, "Q: why? / {missing}");
  }

  #[test]
  fn truncates_on_char_boundary() {
    let out = trunc_for_log("ééééé", 2);
    assert!(out.starts_with("éé…"));
    assert_eq!(trunc_for_log("short", 10), "short");
  }
}
