//! Command code table.
//!
//! | Code      | Command            |
//! |-----------|--------------------|
//! | `3217`    | `Clear`            |
//! | `31<v>7`  | `LoadAmount(v * 5)` |
//! | `3567`    | `LoadAmount(100)`  |
//! | `3131`    | `LoadAmount(1)`    |
//! | `3687`    | `LoadAmount(500)`  |
//! | `3357`    | `ToggleGame`       |
//! | `4455`    | `ShowEarnings`     |

use kiosk_core::Command;

use crate::DecodeError;

const CLEAR: &str = "3217";
const LOAD_PREFIX: &str = "31";
const LOAD_SUFFIX: &str = "7";
const LOAD_MULTIPLIER: i64 = 5;
const TOGGLE_GAME: &str = "3357";
const SHOW_EARNINGS: &str = "4455";

/// Fixed load codes. Checked before the generic `31<v>7` rule claims them.
const FIXED_LOADS: [(&str, i64); 3] = [("3567", 100), ("3131", 1), ("3687", 500)];

/// Decode a short line into a command. Rules are evaluated top to bottom,
/// first match wins.
///
/// # Errors
/// Returns error if a `31<v>7` line has a non-numeric or overflowing middle.
pub fn decode_command(line: &str) -> Result<Command, DecodeError> {
    if line == CLEAR {
        return Ok(Command::Clear);
    }

    if is_generic_load(line) {
        let middle = &line[LOAD_PREFIX.len()..line.len() - LOAD_SUFFIX.len()];
        let value: i64 = middle.parse().map_err(|source| DecodeError::InvalidAmount {
            line: line.to_string(),
            source,
        })?;
        let amount = value
            .checked_mul(LOAD_MULTIPLIER)
            .ok_or_else(|| DecodeError::Overflow {
                line: line.to_string(),
            })?;
        return Ok(Command::LoadAmount(amount));
    }

    if let Some((_, amount)) = FIXED_LOADS.iter().find(|(code, _)| *code == line) {
        return Ok(Command::LoadAmount(*amount));
    }

    Ok(match line {
        TOGGLE_GAME => Command::ToggleGame,
        SHOW_EARNINGS => Command::ShowEarnings,
        _ => Command::Unknown(line.to_string()),
    })
}

fn is_generic_load(line: &str) -> bool {
    line.len() > LOAD_PREFIX.len() + LOAD_SUFFIX.len()
        && line.starts_with(LOAD_PREFIX)
        && line.ends_with(LOAD_SUFFIX)
        && line.is_char_boundary(LOAD_PREFIX.len())
        && line.is_char_boundary(line.len() - LOAD_SUFFIX.len())
        && !FIXED_LOADS.iter().any(|(code, _)| *code == line)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_fixed_codes() {
        assert_eq!(decode_command("3217").unwrap(), Command::Clear);
        assert_eq!(decode_command("3567").unwrap(), Command::LoadAmount(100));
        assert_eq!(decode_command("3131").unwrap(), Command::LoadAmount(1));
        assert_eq!(decode_command("3687").unwrap(), Command::LoadAmount(500));
        assert_eq!(decode_command("3357").unwrap(), Command::ToggleGame);
        assert_eq!(decode_command("4455").unwrap(), Command::ShowEarnings);
    }

    #[test]
    fn test_generic_load() {
        assert_eq!(decode_command("3127").unwrap(), Command::LoadAmount(10));
        assert_eq!(decode_command("3117").unwrap(), Command::LoadAmount(5));
        assert_eq!(decode_command("31107").unwrap(), Command::LoadAmount(50));
        assert_eq!(decode_command("3107").unwrap(), Command::LoadAmount(0));
    }

    #[test]
    fn test_three_char_code_is_unknown() {
        assert_eq!(
            decode_command("317").unwrap(),
            Command::Unknown("317".to_string())
        );
    }

    #[test]
    fn test_non_numeric_middle_fails() {
        assert!(matches!(
            decode_command("31ab7"),
            Err(DecodeError::InvalidAmount { .. })
        ));
    }

    // Unreachable through `LineDecoder`: command lines are at most 12 chars.
    #[test]
    fn test_overflow_fails() {
        // i64::MAX / 5 + 1 parses but does not survive the multiplier.
        assert!(matches!(
            decode_command("3118446744073709551627"),
            Err(DecodeError::Overflow { .. })
        ));
        assert!(matches!(
            decode_command("3120000000000000000007"),
            Err(DecodeError::Overflow { .. })
        ));
        // Largest multiplier input that still fits.
        assert_eq!(
            decode_command("3118446744073709551617").unwrap(),
            Command::LoadAmount(9_223_372_036_854_775_805)
        );
        // Does not parse as i64 at all.
        assert!(matches!(
            decode_command("3199999999999999999999997"),
            Err(DecodeError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(
            decode_command("9999").unwrap(),
            Command::Unknown("9999".to_string())
        );
    }

    proptest! {
        #[test]
        fn prop_generic_load_multiplies(v in 0i64..1_000_000_000) {
            let line = format!("31{v}7");
            prop_assume!(!["3567", "3131", "3687", "3217"].contains(&line.as_str()));
            prop_assert_eq!(decode_command(&line).unwrap(), Command::LoadAmount(v * 5));
        }
    }
}
