//! Input checks applied before anything touches the repository or disk.

use crate::error::{Result, ServiceError};

const MAX_EMAIL_LENGTH: usize = 255;
const MIN_PASSWORD_LENGTH: usize = 6;
const MAX_PASSWORD_LENGTH: usize = 100;
const MIN_DISPLAY_NAME_LENGTH: usize = 2;
const MAX_DISPLAY_NAME_LENGTH: usize = 50;
const MAX_FILENAME_LENGTH: usize = 255;
const SHA256_HEX_LENGTH: usize = 64;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Trimmed, lowercased email if it looks like `local@domain.tld`.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ServiceError::validation("Email is required"));
    }
    if email.chars().count() > MAX_EMAIL_LENGTH {
        return Err(ServiceError::validation(format!(
            "Email must be at most {} characters",
            MAX_EMAIL_LENGTH
        )));
    }
    if !is_email_shaped(email) {
        return Err(ServiceError::validation("Invalid email format"));
    }
    Ok(email.to_lowercase())
}

fn is_email_shaped(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'));

    // The top-level label is the text after the last dot and must be 2+ letters.
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());

    local_ok && host_ok && tld_ok
}

pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if len == 0 {
        return Err(ServiceError::validation("Password is required"));
    }
    if len < MIN_PASSWORD_LENGTH {
        return Err(ServiceError::validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    if len > MAX_PASSWORD_LENGTH {
        return Err(ServiceError::validation(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Returns the trimmed display name.
pub fn normalize_display_name(name: &str) -> Result<String> {
    let name = name.trim();
    let len = name.chars().count();
    if len == 0 {
        return Err(ServiceError::validation("Display name is required"));
    }
    if len < MIN_DISPLAY_NAME_LENGTH {
        return Err(ServiceError::validation(format!(
            "Display name must be at least {} characters",
            MIN_DISPLAY_NAME_LENGTH
        )));
    }
    if len > MAX_DISPLAY_NAME_LENGTH {
        return Err(ServiceError::validation(format!(
            "Display name must be at most {} characters",
            MAX_DISPLAY_NAME_LENGTH
        )));
    }
    Ok(name.to_string())
}

/// Reduce a client-supplied name to a safe leaf name.
pub fn sanitize_filename(raw: &str) -> Result<String> {
    let invalid = || ServiceError::validation("Invalid filename");

    if raw.trim().is_empty() {
        return Err(invalid());
    }
    if has_traversal(raw) {
        tracing::warn!(file_name = %raw.escape_debug(), "path traversal attempt rejected");
        return Err(invalid());
    }

    let unified = raw.replace('\\', "/");
    let leaf = unified.rsplit('/').next().unwrap_or_default();

    let replaced: String = leaf
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') {
                '_'
            } else {
                c
            }
        })
        .collect();

    let mut name = replaced.trim_start_matches('.').to_string();

    if is_reserved_device_name(&name) {
        name.insert(0, '_');
    }

    let name = truncate_keeping_extension(&name, MAX_FILENAME_LENGTH);
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid());
    }
    Ok(name.to_string())
}

fn has_traversal(name: &str) -> bool {
    ["../", "..\\", "/..", "\\.."].iter().any(|p| name.contains(p))
}

fn is_reserved_device_name(name: &str) -> bool {
    let stem = match name.find('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    };
    let upper = stem.to_ascii_uppercase();
    RESERVED_NAMES.contains(&upper.as_str())
}

fn truncate_keeping_extension(name: &str, max: usize) -> String {
    let len = name.chars().count();
    if len <= max {
        return name.to_string();
    }
    if let Some(dot) = name.rfind('.').filter(|&d| d > 0) {
        let (stem, ext) = name.split_at(dot);
        let ext_len = ext.chars().count();
        if ext_len < max {
            let stem: String = stem.chars().take(max - ext_len).collect();
            return stem + ext;
        }
    }
    name.chars().take(max).collect()
}

/// `size` must be positive and within `max`.
pub fn validate_file_size(size: i64, max: u64) -> Result<u64> {
    if size <= 0 {
        return Err(ServiceError::validation("File size must be positive"));
    }
    let size = size as u64;
    if size > max {
        return Err(ServiceError::validation(format!(
            "File too large. Maximum size is {}MB",
            max / 1024 / 1024
        )));
    }
    Ok(size)
}

/// 64 hex characters, returned lowercase.
pub fn normalize_sha256(hash: &str) -> Result<String> {
    let hash = hash.trim();
    if hash.is_empty() {
        return Err(ServiceError::validation("SHA256 hash is required"));
    }
    if hash.len() != SHA256_HEX_LENGTH || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ServiceError::validation(
            "Invalid SHA256 format (must be 64 hex characters)",
        ));
    }
    Ok(hash.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email() {
        assert_eq!(normalize_email("  Alice@Example.COM ").unwrap(), "alice@example.com");
        assert!(normalize_email("a.b+tag@mail.example.org").is_ok());
        assert!(normalize_email("").is_err());
        assert!(normalize_email("no-at-sign.com").is_err());
        assert!(normalize_email("a@localhost").is_err());
        assert!(normalize_email("a@b.c").is_err());
        assert!(normalize_email("a b@example.com").is_err());
        assert!(normalize_email("a@exa_mple.com").is_err());
        let long = format!("{}@example.com", "a".repeat(250));
        assert!(normalize_email(&long).is_err());
    }

    #[test]
    fn test_password_and_display_name() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
        assert!(validate_password(&"x".repeat(101)).is_err());

        assert_eq!(normalize_display_name("  Bob ").unwrap(), "Bob");
        assert!(normalize_display_name(" B ").is_err());
        assert!(normalize_display_name(&"n".repeat(51)).is_err());
    }

    #[test]
    fn test_filename_rejects_traversal() {
        assert!(sanitize_filename("../etc/passwd").is_err());
        assert!(sanitize_filename("..\\windows\\system32").is_err());
        assert!(sanitize_filename("dir/../secret").is_err());
        assert!(sanitize_filename("   ").is_err());
    }

    #[test]
    fn test_filename_strips_directories_and_bad_chars() {
        assert_eq!(sanitize_filename("photos/2024/cat.png").unwrap(), "cat.png");
        assert_eq!(sanitize_filename("C:\\Users\\me\\report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("what?<now>.txt").unwrap(), "what__now_.txt");
        assert_eq!(sanitize_filename("tab\there.txt").unwrap(), "tab_here.txt");
        assert_eq!(sanitize_filename("..hidden").unwrap(), "hidden");
        assert_eq!(sanitize_filename(".bashrc").unwrap(), "bashrc");
        assert!(sanitize_filename("...").is_err());
    }

    #[test]
    fn test_filename_reserved_device_names() {
        assert_eq!(sanitize_filename("CON").unwrap(), "_CON");
        assert_eq!(sanitize_filename("nul.txt").unwrap(), "_nul.txt");
        assert_eq!(sanitize_filename("lpt9.log").unwrap(), "_lpt9.log");
        assert_eq!(sanitize_filename("CONSOLE.txt").unwrap(), "CONSOLE.txt");
    }

    #[test]
    fn test_filename_truncation_keeps_extension() {
        let long = format!("{}.tar.gz", "a".repeat(300));
        let name = sanitize_filename(&long).unwrap();
        assert_eq!(name.chars().count(), 255);
        assert!(name.ends_with(".gz"));

        let no_ext = "b".repeat(400);
        assert_eq!(sanitize_filename(&no_ext).unwrap().len(), 255);
    }

    #[test]
    fn test_file_size() {
        assert!(validate_file_size(0, 100).is_err());
        assert!(validate_file_size(-5, 100).is_err());
        assert!(validate_file_size(101, 100).is_err());
        assert_eq!(validate_file_size(100, 100).unwrap(), 100);
    }

    #[test]
    fn test_sha256() {
        let upper = "A".repeat(64);
        assert_eq!(normalize_sha256(&upper).unwrap(), "a".repeat(64));
        assert!(normalize_sha256(&"g".repeat(64)).is_err());
        assert!(normalize_sha256(&"a".repeat(63)).is_err());
        assert!(normalize_sha256("").is_err());
    }
}
