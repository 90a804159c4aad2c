/// Prepends `entry` to `lines` (newest first) and drops everything past
/// `capacity`.
pub fn prepend_bounded(lines: &mut Vec<String>, entry: String, capacity: usize) {
    lines.insert(0, entry);
    lines.truncate(capacity);
}
