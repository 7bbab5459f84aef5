use metrohash::MetroHash64;
use std::hash::Hasher;

// Case-folded 64-bit hash for identifiers that compare case-insensitively
// (asset names, logical paths); keys the registry's name/path indices
#[must_use]
pub fn hash_str_nocase(value: &str) -> u64
{
    let mut hasher = MetroHash64::new();
    for c in value.chars().flat_map(char::to_lowercase)
    {
        let mut buf = [0u8; size_of::<char>()];
        hasher.write(c.encode_utf8(&mut buf).as_bytes());
    }
    hasher.finish()
}
