//! MD5 checksums, rendered as fixed-width lowercase hex wherever they are
//! stored or compared.

use std::fmt;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt};

/// Number of hex characters in a rendered checksum.
pub const CHECKSUM_HEX_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 16]);

impl Checksum {
    pub fn of(data: &[u8]) -> Self {
        Checksum(Md5::digest(data).into())
    }

    pub fn from_hasher(hasher: Md5) -> Self {
        Checksum(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != CHECKSUM_HEX_LEN {
            return Err(format!(
                "checksum must be {CHECKSUM_HEX_LEN} hex digits, got {}",
                s.len()
            ));
        }
        let mut out = [0u8; 16];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut out)
            .map_err(|e| format!("invalid checksum {s}: {e}"))?;
        Ok(Checksum(out))
    }
}

/// Stream-hash a file.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn md5_file(path: &Path) -> Result<Checksum> {
    let file = std::fs::File::open(path).at(path)?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Checksum::from_hasher(hasher))
}

/// Like [`md5_file`], but `None` when the file does not exist.
pub fn md5_file_if_exists(path: &Path) -> Result<Option<Checksum>> {
    match std::fs::metadata(path) {
        Ok(_) => md5_file(path).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(crate::error::Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(Checksum::of(b"").to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(Checksum::of(b"abc").to_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parse_accepts_uppercase_and_renders_lowercase() {
        let sum: Checksum = "900150983CD24FB0D6963F7D28E17F72".parse().unwrap();
        assert_eq!(sum, Checksum::of(b"abc"));
        assert_eq!(sum.to_string(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parse_rejects_wrong_width() {
        assert!("abc".parse::<Checksum>().is_err());
        assert!("zz0150983cd24fb0d6963f7d28e17f72".parse::<Checksum>().is_err());
    }

    #[test]
    fn test_file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(md5_file(&path).unwrap(), Checksum::of(&data));
        assert_eq!(md5_file_if_exists(&dir.path().join("nope")).unwrap(), None);
    }
}
