//! `AvStat`: a superset of POSIX `stat` with nanosecond timestamps,
//! exposed as a stable structure to frontends.

/// File type bits, analogous to POSIX `S_IF*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// Nanosecond-precision timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timespec {
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timespec { seconds: d.as_secs() as i64, nanos: d.subsec_nanos() }
    }

    pub fn from_unix(seconds: i64) -> Self {
        Timespec { seconds, nanos: 0 }
    }
}

/// Device major/minor pair, for special nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Device {
    pub major: u32,
    pub minor: u32,
}

/// `AvStat`: superset of POSIX `stat`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvStat {
    pub dev: u64,
    pub ino: u64,
    pub file_type: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: Device,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl AvStat {
    /// A zeroed-out stat for `file_type`, with sane defaults for mode and
    /// block size, as the archive skeleton's `new_node` relies on.
    pub fn default_for(file_type: FileType, dev: u64, ino: u64) -> Self {
        let now = Timespec::now();
        let mode = match file_type {
            FileType::Directory => 0o755,
            FileType::Symlink => 0o777,
            _ => 0o644,
        };
        AvStat {
            dev,
            ino,
            file_type,
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: Device::default(),
            size: 0,
            blksize: 4096,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Signature used by the filecache staleness invariant:
    /// `(dev, ino, size, mtime)`.
    pub fn signature(&self) -> (u64, u64, u64, i64) {
        (self.dev, self.ino, self.size, self.mtime.seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_for_directory_has_exec_bits() {
        let st = AvStat::default_for(FileType::Directory, 1, 2);
        assert_eq!(st.mode, 0o755);
        assert_eq!(st.file_type, FileType::Directory);
    }

    #[test]
    fn signature_reflects_size_and_mtime() {
        let mut a = AvStat::default_for(FileType::Regular, 1, 1);
        a.size = 10;
        a.mtime = Timespec::from_unix(100);
        let mut b = a;
        b.size = 11;
        assert_ne!(a.signature(), b.signature());
    }
}
