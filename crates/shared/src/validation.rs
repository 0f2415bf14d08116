//! Input validation helpers

use crate::error::ValidationError;

/// Lowercase and trim an email address for storage and lookup
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Validate an email address against `local@domain.tld`
///
/// Local part: ASCII letters, digits and `._%+-`. Domain: letters, digits,
/// `.` and `-`, ending in an alphabetic TLD of at least two characters.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let (local, domain) = email.split_once('@').ok_or(ValidationError::InvalidEmail)?;

    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));

    let (host, tld) = domain.rsplit_once('.').ok_or(ValidationError::InvalidEmail)?;
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());

    if local_ok && host_ok && tld_ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidEmail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_emails() {
        for email in ["user@example.com", "first.last+tag@sub.domain.org", "a_b%c@x-y.io"] {
            assert!(validate_email(email).is_ok(), "{email} should be valid");
        }
    }

    #[test]
    fn test_invalid_emails() {
        for email in [
            "",
            "plainaddress",
            "@example.com",
            "user@",
            "user@example",
            "user@example.c",
            "user@exa mple.com",
            "us er@example.com",
            "user@example.c0m",
        ] {
            assert_eq!(validate_email(email), Err(ValidationError::InvalidEmail), "{email}");
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Jane.Doe@Example.COM "), "jane.doe@example.com");
    }
}
