/// Compute the BLAKE3 hash of a byte slice, hex-encoded.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Short (16 hex char) prefix of [`content_hash`].
///
/// Used for ETags on static responses: the tag changes exactly when the
/// served bytes change, and a full digest is overkill there.
#[must_use]
pub fn short_hash(data: &[u8]) -> String {
    let mut full = content_hash(data);
    full.truncate(16);
    full
}
