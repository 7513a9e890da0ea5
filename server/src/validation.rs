//! Input validation functions for the MatchMates server
//!
//! Validators take already-trimmed input where trimming is part of the
//! contract (usernames, emails) and return a human-readable reason on failure.

/// Maximum length of a direct or group message, in characters
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Validates username format
///
/// Requirements:
/// - 3-32 characters
/// - Alphanumeric characters plus underscore and hyphen
/// - Cannot start or end with underscore or hyphen
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.len() < 3 {
        return Err("Username must be at least 3 characters long".to_string());
    }

    if name.len() > 32 {
        return Err("Username must not exceed 32 characters".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "Username can only contain alphanumeric characters, underscores, and hyphens"
                .to_string(),
        );
    }

    if name.starts_with('_') || name.starts_with('-') || name.ends_with('_') || name.ends_with('-')
    {
        return Err("Username cannot start or end with underscore or hyphen".to_string());
    }

    Ok(())
}

/// Validates email format
///
/// Requires a single `@`, a non-empty local part, and a domain
/// containing a dot that is neither first nor last.
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.len() > 254 {
        return Err("Email must not exceed 254 characters".to_string());
    }

    if email.chars().any(char::is_whitespace) {
        return Err("Email cannot contain whitespace".to_string());
    }

    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return Err("Email must contain '@'".to_string()),
    };

    if local.is_empty() || domain.contains('@') {
        return Err("Email is malformed".to_string());
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err("Email domain is malformed".to_string());
    }

    Ok(())
}

/// Validates password strength
///
/// Requirements:
/// - 6-128 characters
pub fn validate_password(password: &str) -> Result<(), String> {
    let len = password.chars().count();
    if len < 6 {
        return Err("Password must be at least 6 characters long".to_string());
    }

    if len > 128 {
        return Err("Password must not exceed 128 characters".to_string());
    }

    Ok(())
}

/// Validates group name format
///
/// Requirements:
/// - 1-100 characters after trimming
pub fn validate_group_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err("Group name cannot be empty".to_string());
    }

    if trimmed.chars().count() > 100 {
        return Err("Group name must not exceed 100 characters".to_string());
    }

    Ok(())
}

/// Checks message length against [`MAX_MESSAGE_CHARS`]
pub fn message_within_limit(content: &str) -> bool {
    content.chars().count() <= MAX_MESSAGE_CHARS
}
