//! Password hashing and strength rules for password-provider accounts

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Special characters accepted by the strength rule
const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?/~`";

/// Hash a password using Argon2id
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::Hashing(e.to_string()))
}

/// Verify a password against a stored PHC hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHash(e.to_string()))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Validate password strength for signup
pub fn validate_password_strength(password: &str) -> Result<(), PasswordValidationError> {
    let length = password.chars().count();
    if length < 12 {
        return Err(PasswordValidationError::TooShort);
    }
    if length > 128 {
        return Err(PasswordValidationError::TooLong);
    }

    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PasswordValidationError::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(PasswordValidationError::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordValidationError::MissingDigit);
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        return Err(PasswordValidationError::MissingSpecialChar);
    }

    if is_common_password(password) {
        return Err(PasswordValidationError::TooCommon);
    }

    Ok(())
}

fn is_common_password(password: &str) -> bool {
    const COMMON_PASSWORDS: &[&str] = &[
        "password123!",
        "password1234!",
        "p@ssword1234",
        "p@ssw0rd1234",
        "welcome123!!",
        "qwerty123456!",
        "administrator1!",
        "letmein12345!",
        "iloveyou1234!",
        "changeme1234!",
    ];

    let lowered = password.to_lowercase();
    COMMON_PASSWORDS.contains(&lowered.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Password hashing failed: {0}")]
    Hashing(String),
    #[error("Invalid password hash: {0}")]
    InvalidHash(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PasswordValidationError {
    #[error("Password must be at least 12 characters")]
    TooShort,
    #[error("Password must be at most 128 characters")]
    TooLong,
    #[error("Password must contain at least one lowercase letter")]
    MissingLowercase,
    #[error("Password must contain at least one uppercase letter")]
    MissingUppercase,
    #[error("Password must contain at least one digit")]
    MissingDigit,
    #[error("Password must contain at least one special character (!@#$%^&*)")]
    MissingSpecialChar,
    #[error("This password is too common - please choose a unique password")]
    TooCommon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("Family-Law-2024!").expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("Family-Law-2024!", &hash).expect("verify"));
        assert!(!verify_password("family-law-2024!", &hash).expect("verify"));
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(matches!(
            verify_password("anything", "not-a-phc-string"),
            Err(PasswordError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_strength_rules() {
        assert_eq!(validate_password_strength("Short1!"), Err(PasswordValidationError::TooShort));
        assert_eq!(
            validate_password_strength("ALLUPPERCASE123!"),
            Err(PasswordValidationError::MissingLowercase)
        );
        assert_eq!(
            validate_password_strength("alllowercase123!"),
            Err(PasswordValidationError::MissingUppercase)
        );
        assert_eq!(
            validate_password_strength("NoDigitsHere!!!"),
            Err(PasswordValidationError::MissingDigit)
        );
        assert_eq!(
            validate_password_strength("NoSpecials12345"),
            Err(PasswordValidationError::MissingSpecialChar)
        );
        assert_eq!(
            validate_password_strength("Password123!"),
            Err(PasswordValidationError::TooCommon)
        );
        assert!(validate_password_strength("Custody-Plan-77").is_ok());
    }
}
