/// Returns the portion of `email` after its last `@`.
///
/// Addresses without an `@` are returned whole so that the lookup still runs
/// against the raw value instead of being rejected.
pub fn extract_domain(email: &str) -> &str {
    match email.rfind('@') {
        Some(index) => &email[index + 1..],
        None => email,
    }
}
