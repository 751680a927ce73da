//! Typed file operations and the `Patch` aggregate that carries them.

use std::path::PathBuf;

use crate::checksum::Checksum;

/// Create a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPath {
    pub dst: String,
    pub mode: u32,
    /// Set once the directory was actually created by an apply run.
    pub performed: bool,
}

/// Materialize a whole file from the payload store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFile {
    pub dst: String,
    /// Payload path relative to the store.
    pub src: String,
    pub checksum: Checksum,
    pub mode: u32,
    pub size: u64,
    pub performed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkFile {
    pub dst: String,
    pub link: String,
    pub performed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelFile {
    pub dst: String,
}

/// Remove a directory and everything below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelPath {
    pub dst: String,
}

/// One known prior state of a patched file and the delta that leaves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOption {
    pub old_checksum: Checksum,
    /// Delta archive path relative to the store.
    pub src: String,
    pub new_checksum: Checksum,
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFile {
    pub dst: String,
    pub mode: u32,
    /// Largest output size across the options.
    pub size: u64,
    pub options: Vec<DeltaOption>,
    /// A missing destination is skipped rather than fatal.
    pub optional: bool,
}

impl PatchFile {
    pub fn option_from(&self, current: &Checksum) -> Option<usize> {
        self.options.iter().position(|o| &o.old_checksum == current)
    }

    pub fn produces(&self, current: &Checksum) -> bool {
        self.options.iter().any(|o| &o.new_checksum == current)
    }
}

/// An ordered set of operations plus the metadata describing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    /// Directory payloads and deltas are stored under.
    pub base: PathBuf,
    pub product: String,
    pub component: Option<String>,
    pub version: String,
    pub description: String,
    pub prepatch: Option<String>,
    pub postpatch: Option<String>,
    /// Extra header fields, exported to scripts as `PATCH_<KEY>`.
    pub fields: Vec<(String, String)>,

    pub add_path: Vec<AddPath>,
    pub add_file: Vec<AddFile>,
    pub patch_file: Vec<PatchFile>,
    pub symlink_file: Vec<SymlinkFile>,
    pub del_file: Vec<DelFile>,
    pub del_path: Vec<DelPath>,

    /// Paths, relative to the target, that an apply run deleted.
    pub removed_paths: Vec<String>,
}

impl Patch {
    pub fn new(product: &str, version: &str, base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            product: product.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add_path.is_empty()
            && self.add_file.is_empty()
            && self.patch_file.is_empty()
            && self.symlink_file.is_empty()
            && self.del_file.is_empty()
            && self.del_path.is_empty()
    }

    pub fn store_path(&self, src: &str) -> PathBuf {
        self.base.join(src)
    }

    /// Space needed on the target, in KiB, each file rounded up.
    pub fn required_kib(&self) -> u64 {
        let add = self.add_file.iter().map(|op| op.size.div_ceil(1024));
        let patch = self.patch_file.iter().map(|op| op.size.div_ceil(1024));
        add.chain(patch).sum()
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_kib_rounds_each_file_up() {
        let mut patch = Patch::new("game", "1.1", "/tmp/p/data");
        patch.add_file.push(AddFile {
            dst: "a".into(),
            src: "a".into(),
            checksum: Checksum::of(b"a"),
            mode: 0o644,
            size: 1,
            performed: false,
        });
        patch.patch_file.push(PatchFile {
            dst: "b".into(),
            mode: 0o644,
            size: 2049,
            options: vec![],
            optional: false,
        });
        assert_eq!(patch.required_kib(), 1 + 3);
    }

    #[test]
    fn test_option_lookup() {
        let op = PatchFile {
            dst: "bin/game".into(),
            mode: 0o755,
            size: 10,
            options: vec![
                DeltaOption {
                    old_checksum: Checksum::of(b"A"),
                    src: "bin/game.0".into(),
                    new_checksum: Checksum::of(b"B"),
                    installed: false,
                },
                DeltaOption {
                    old_checksum: Checksum::of(b"C"),
                    src: "bin/game.1".into(),
                    new_checksum: Checksum::of(b"D"),
                    installed: false,
                },
            ],
            optional: false,
        };
        assert_eq!(op.option_from(&Checksum::of(b"C")), Some(1));
        assert_eq!(op.option_from(&Checksum::of(b"B")), None);
        assert!(op.produces(&Checksum::of(b"D")));
    }
}
