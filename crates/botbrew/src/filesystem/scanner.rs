//! Live mount table parsing.

use std::path::{Path, PathBuf};

use botbrew_common::{BotbrewError, BotbrewResult};

use super::loopdev;

/// One entry of the system mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Mounted device or pseudo source.
    pub source: String,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Comma separated mount options.
    pub options: String,
}

impl MountRecord {
    /// `true` when the mount is backed by a loop device.
    #[must_use]
    pub fn is_loop_backed(&self) -> bool {
        loopdev::is_loop_device(&self.source)
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let source = unescape(fields.next()?);
        let target = PathBuf::from(unescape(fields.next()?));
        let fstype = unescape(fields.next()?);
        let options = fields.next()?.to_string();
        Some(Self {
            source,
            target,
            fstype,
            options,
        })
    }
}

/// An ordered snapshot of the mount table, in kernel report order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    /// Read and parse a mount table file.
    pub fn read(path: impl AsRef<Path>) -> BotbrewResult<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| BotbrewError::MountTableUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        let table = Self::parse(&content);
        tracing::trace!(path = %path.display(), entries = table.len(), "Read mount table");
        Ok(table)
    }

    /// Parse mount table text. Malformed lines are skipped.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let records = content.lines().filter_map(MountRecord::parse).collect();
        Self { records }
    }

    /// Build a table from records.
    #[must_use]
    pub fn from_records(records: Vec<MountRecord>) -> Self {
        Self { records }
    }

    /// All records in report order.
    #[must_use]
    pub fn records(&self) -> &[MountRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when the table has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record mounted exactly at `target`.
    #[must_use]
    pub fn find_by_target(&self, target: &Path) -> Option<&MountRecord> {
        self.records.iter().find(|r| r.target == target)
    }

    /// Records mounted strictly below `prefix`, in report order.
    #[must_use]
    pub fn find_by_prefix(&self, prefix: &Path) -> Vec<&MountRecord> {
        self.records
            .iter()
            .filter(|r| is_descendant(&r.target, prefix))
            .collect()
    }

    /// Records mounted at `root` or below it, in report order.
    #[must_use]
    pub fn subtree(&self, root: &Path) -> Vec<&MountRecord> {
        self.records
            .iter()
            .filter(|r| r.target == root || is_descendant(&r.target, root))
            .collect()
    }
}

/// `true` if `path` lies strictly below `prefix`, component-wise.
///
/// `/mnt/sdcard` is below `/mnt`; `/mnt2` is not.
#[must_use]
pub fn is_descendant(path: &Path, prefix: &Path) -> bool {
    path != prefix && path.starts_with(prefix)
}

/// Decode the octal escapes (`\040`, `\011`, `\012`, `\134`) the kernel uses
/// for whitespace and backslashes in mount table fields.
#[must_use]
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "\
rootfs / rootfs ro,relatime 0 0
tmpfs /mnt tmpfs rw,relatime,mode=755,gid=1000 0 0
/dev/block/vold/179:1 /mnt/sdcard vfat rw,dirsync,nosuid,nodev 0 0
/dev/block/vold/179:9 /mnt/sdcard/external_sd vfat rw,nosuid 0 0
tmpfs /mnt2 tmpfs rw 0 0
/dev/block/loop0 /data/botbrew ext4 rw,noatime 0 0
none /data/botbrew/proc proc rw 0 0
/dev/block/mmcblk0p5 /data/My\\040Files ext4 rw 0 0
garbage
";

    #[test]
    fn parse_preserves_order() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.len(), 8);
        assert_eq!(table.records()[0].target, PathBuf::from("/"));
        assert_eq!(table.records()[2].source, "/dev/block/vold/179:1");
        assert_eq!(table.records()[2].fstype, "vfat");
        assert_eq!(table.records()[2].options, "rw,dirsync,nosuid,nodev");
    }

    #[test]
    fn parse_unescapes_fields() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.find_by_target(Path::new("/data/My Files")).is_some());
    }

    #[test]
    fn find_by_target_exact() {
        let table = MountTable::parse(SAMPLE);
        let record = table.find_by_target(Path::new("/data/botbrew")).unwrap();
        assert!(record.is_loop_backed());
        assert!(table.find_by_target(Path::new("/data")).is_none());
    }

    #[test]
    fn find_by_prefix_is_strict() {
        let table = MountTable::parse(SAMPLE);
        let below: Vec<_> = table
            .find_by_prefix(Path::new("/mnt"))
            .into_iter()
            .map(|r| r.target.clone())
            .collect();
        assert_eq!(
            below,
            [
                PathBuf::from("/mnt/sdcard"),
                PathBuf::from("/mnt/sdcard/external_sd")
            ]
        );
    }

    #[test]
    fn subtree_includes_root() {
        let table = MountTable::parse(SAMPLE);
        let subtree = table.subtree(Path::new("/data/botbrew"));
        assert_eq!(subtree.len(), 2);
        assert_eq!(subtree[0].target, PathBuf::from("/data/botbrew"));
        assert_eq!(subtree[1].fstype, "proc");
    }

    #[test]
    fn read_missing_table() {
        let err = MountTable::read("/nonexistent/mounts").unwrap_err();
        assert!(matches!(err, BotbrewError::MountTableUnavailable { .. }));
    }

    #[test]
    fn read_table_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("mounts");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(MountTable::read(&path).unwrap(), MountTable::parse(SAMPLE));
    }

    #[test]
    fn unescape_edge_cases() {
        assert_eq!(unescape(r"a\040b"), "a b");
        assert_eq!(unescape(r"tab\011"), "tab\t");
        assert_eq!(unescape(r"back\134slash"), "back\\slash");
        assert_eq!(unescape(r"short\04"), r"short\04");
        assert_eq!(unescape(r"not\999octal"), r"not\999octal");
    }

    proptest! {
        #[test]
        fn sibling_with_shared_prefix_is_not_descendant(
            base in "/[a-z]{1,8}",
            suffix in "[a-z0-9]{1,8}",
        ) {
            let sibling = format!("{base}{suffix}");
            prop_assert!(!is_descendant(Path::new(&sibling), Path::new(&base)));
            let child = format!("{base}/{suffix}");
            prop_assert!(is_descendant(Path::new(&child), Path::new(&base)));
            prop_assert!(!is_descendant(Path::new(&base), Path::new(&base)));
        }

        #[test]
        fn unescape_is_identity_without_backslash(field in "[^\\\\]{0,32}") {
            prop_assert_eq!(unescape(&field), field);
        }
    }
}
