//! Human-readable duration parsing.

use std::time::Duration;

use crate::error::TaskError;

/// Parses a human-readable duration.
///
/// Accepts a concatenation of `<number><unit>` terms with units `ns`,
/// `us`/`µs`, `ms`, `s`, `m`, `h` and optional fractions ("300ms",
/// "1.5s", "1h30m"), or a bare number meaning seconds ("2", "0.25").
pub fn parse_duration(input: &str) -> Result<Duration, TaskError> {
  let trimmed = input.trim();
  if trimmed.is_empty() {
    return Err(TaskError::Argument("empty duration".to_string()));
  }

  // Bare numbers are seconds.
  if let Ok(seconds) = trimmed.parse::<f64>() {
    if !seconds.is_finite() || seconds < 0.0 {
      return Err(TaskError::Argument(format!(
        "duration out of range: {:?}",
        input
      )));
    }
    return Ok(Duration::from_secs_f64(seconds));
  }

  let mut total = Duration::ZERO;
  let mut rest = trimmed;
  while !rest.is_empty() {
    let number_len = rest
      .find(|c: char| !c.is_ascii_digit() && c != '.')
      .unwrap_or(rest.len());
    if number_len == 0 {
      return Err(TaskError::Argument(format!(
        "malformed duration: {:?}",
        input
      )));
    }
    let (number, tail) = rest.split_at(number_len);
    let value: f64 = number
      .parse()
      .map_err(|_| TaskError::Argument(format!("malformed duration: {:?}", input)))?;

    let unit_len = tail
      .find(|c: char| c.is_ascii_digit() || c == '.')
      .unwrap_or(tail.len());
    let (unit, next) = tail.split_at(unit_len);
    let unit_seconds = match unit {
      "ns" => 1e-9,
      "us" | "µs" => 1e-6,
      "ms" => 1e-3,
      "s" => 1.0,
      "m" => 60.0,
      "h" => 3600.0,
      _ => {
        return Err(TaskError::Argument(format!(
          "unknown duration unit {:?} in {:?}",
          unit, input
        )))
      }
    };

    total += Duration::from_secs_f64(value * unit_seconds);
    rest = next;
  }

  Ok(total)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_terms() {
    assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
    assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
    assert_eq!(parse_duration("10µs").unwrap(), Duration::from_micros(10));
    assert_eq!(parse_duration("250ns").unwrap(), Duration::from_nanos(250));
    assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
  }

  #[test]
  fn test_fractional_terms() {
    assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    assert_eq!(parse_duration("0.5h").unwrap(), Duration::from_secs(1800));
  }

  #[test]
  fn test_concatenated_terms() {
    assert_eq!(
      parse_duration("1h30m").unwrap(),
      Duration::from_secs(3600 + 1800)
    );
    assert_eq!(
      parse_duration("1m30s500ms").unwrap(),
      Duration::from_millis(90_500)
    );
  }

  #[test]
  fn test_bare_numbers_are_seconds() {
    assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
    assert_eq!(parse_duration("0.25").unwrap(), Duration::from_millis(250));
    assert_eq!(parse_duration(" 3 ").unwrap(), Duration::from_secs(3));
  }

  #[test]
  fn test_rejects_malformed_input() {
    assert!(matches!(parse_duration(""), Err(TaskError::Argument(_))));
    assert!(matches!(parse_duration("abc"), Err(TaskError::Argument(_))));
    assert!(matches!(parse_duration("5x"), Err(TaskError::Argument(_))));
    assert!(matches!(parse_duration("-5"), Err(TaskError::Argument(_))));
    assert!(matches!(parse_duration("ms"), Err(TaskError::Argument(_))));
    assert!(matches!(
      parse_duration("300ms300"),
      Err(TaskError::Argument(_))
    ));
  }
}
