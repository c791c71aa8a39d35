/// Utility functions and helpers
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Hash function used to place keys and virtual spots on the ring
pub type HashFn = fn(&str) -> u32;

/// Selectable ring hash functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    /// CRC32-IEEE of the SHA-1 digest
    #[default]
    Sha1Crc32,
    /// First four bytes of the MD5 digest, little endian (ketama style)
    Md5,
    /// 32-bit FNV-1a
    Fnv,
}

impl HashKind {
    pub fn hash_fn(self) -> HashFn {
        match self {
            HashKind::Sha1Crc32 => hash_sha1_crc32,
            HashKind::Md5 => hash_md5,
            HashKind::Fnv => hash_fnv1a,
        }
    }
}

/// CRC32 of the SHA-1 digest of `key`
pub fn hash_sha1_crc32(key: &str) -> u32 {
    let digest = Sha1::digest(key.as_bytes());
    crc32fast::hash(&digest)
}

/// Ketama style MD5 point
pub fn hash_md5(key: &str) -> u32 {
    let md5::Digest(bs) = md5::compute(key.as_bytes());
    u32::from_le_bytes([bs[0], bs[1], bs[2], bs[3]])
}

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a
pub fn hash_fnv1a(key: &str) -> u32 {
    key.bytes()
        .fold(FNV32_OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(FNV32_PRIME))
}

/// Strip a `scheme://` prefix from a configured server address
pub fn strip_scheme(addr: &str) -> &str {
    match addr.find("://") {
        Some(pos) => &addr[pos + 3..],
        None => addr,
    }
}

/// Addresses containing a path separator are Unix domain sockets
pub fn is_unix_addr(addr: &str) -> bool {
    addr.contains('/')
}

/// Host name used to build per-host check keys
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
