use std::{
    ffi::CString,
    fs, io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use indexmap::{IndexMap, IndexSet};
use netfs_wire::{NotifyKind, PathKind};
use tracing::{debug, warn};

use crate::{
    BackendFile, FileMode, FileStat, FilesystemBackend, FsError, ListEntry, NotifyEvent,
    NotifyHandle,
};

const WATCH_MASK: u32 = libc::IN_CREATE |
    libc::IN_DELETE |
    libc::IN_DELETE_SELF |
    libc::IN_MODIFY |
    libc::IN_CLOSE_WRITE |
    libc::IN_MOVED_FROM |
    libc::IN_MOVED_TO;

/// Local-disk backend rooted at a directory.
///
/// Request paths are interpreted relative to the root; leading slashes are
/// stripped and `..` components are rejected, so a client can never reach
/// outside the served tree. Change notifications come from an inotify
/// instance whose fd is exposed for readiness polling.
pub struct LocalBackend {
    root: PathBuf,
    inotify: OwnedFd,
    next_handle: NotifyHandle,
    /// Kernel watch descriptor → watch target and its subscription handles.
    /// Several handles on the same path share one descriptor.
    watches: IndexMap<i32, Watch>,
    handles: IndexMap<NotifyHandle, i32>,
}

struct Watch {
    path: String,
    handles: IndexSet<NotifyHandle>,
}

struct LocalFile {
    path: PathBuf,
    mode: FileMode,
    disk_size: u64,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            root: root.into(),
            inotify: unsafe { OwnedFd::from_raw_fd(fd) },
            next_handle: 0,
            watches: IndexMap::new(),
            handles: IndexMap::new(),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut full = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                _ => return Err(FsError::InvalidPath(path.to_owned())),
            }
        }
        Ok(full)
    }

    fn walk_dir(&self, dir: &Path, base: &str, out: &mut Vec<ListEntry>) -> Result<(), FsError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let file_type = entry.file_type()?;
            let rel = join_rel(base, name);
            out.push(ListEntry { path: rel.clone(), kind: kind_of(file_type) });
            if file_type.is_dir() {
                self.walk_dir(&entry.path(), &rel, out)?;
            }
        }
        Ok(())
    }

    fn parse_events(&mut self, mut bytes: &[u8], out: &mut Vec<NotifyEvent>) {
        const HEADER: usize = std::mem::size_of::<libc::inotify_event>();
        while bytes.len() >= HEADER {
            let wd = i32::from_ne_bytes(bytes[0..4].try_into().unwrap());
            let mask = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
            let name_len = u32::from_ne_bytes(bytes[12..16].try_into().unwrap()) as usize;
            if bytes.len() < HEADER + name_len {
                warn!("truncated inotify event, dropping rest of batch");
                return;
            }
            let name = &bytes[HEADER..HEADER + name_len];
            bytes = &bytes[HEADER + name_len..];

            if mask & libc::IN_IGNORED != 0 {
                // Kernel dropped the watch (target deleted or unmounted).
                if let Some(watch) = self.watches.swap_remove(&wd) {
                    for handle in &watch.handles {
                        self.handles.swap_remove(handle);
                    }
                }
                continue;
            }

            let Some(watch) = self.watches.get(&wd) else { continue };
            let Some(kind) = change_kind(mask) else { continue };
            let name = name.split(|b| *b == 0).next().unwrap_or(&[]);
            let path = match std::str::from_utf8(name) {
                Ok("") => watch.path.clone(),
                Ok(name) => join_rel(&watch.path, name),
                Err(_) => continue,
            };
            for &handle in &watch.handles {
                out.push(NotifyEvent { handle, path: path.clone(), kind });
            }
        }
    }
}

impl FilesystemBackend for LocalBackend {
    fn open(&mut self, path: &str, mode: FileMode) -> Result<Box<dyn BackendFile>, FsError> {
        let full = self.resolve(path)?;
        let disk_size = match mode {
            FileMode::Read => fs::metadata(&full)?.len(),
            FileMode::Write => {
                // Create/truncate up front so open failure surfaces before
                // the client commits to streaming a body.
                fs::File::create(&full)?;
                0
            }
        };
        Ok(Box::new(LocalFile { path: full, mode, disk_size }))
    }

    fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let meta = fs::symlink_metadata(self.resolve(path)?)?;
        Ok(FileStat { size: meta.len(), kind: kind_of(meta.file_type()) })
    }

    fn list(&self, path: &str) -> Result<Vec<ListEntry>, FsError> {
        let dir = self.resolve(path)?;
        let base = rel_base(path);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            out.push(ListEntry {
                path: join_rel(base, name),
                kind: kind_of(entry.file_type()?),
            });
        }
        Ok(out)
    }

    fn walk(&self, path: &str) -> Result<Vec<ListEntry>, FsError> {
        let dir = self.resolve(path)?;
        let mut out = Vec::new();
        self.walk_dir(&dir, rel_base(path), &mut out)?;
        Ok(out)
    }

    fn notification_fd(&self) -> Option<RawFd> {
        Some(self.inotify.as_raw_fd())
    }

    fn install_notification(&mut self, path: &str) -> Result<NotifyHandle, FsError> {
        let full = self.resolve(path)?;
        let cpath = CString::new(full.as_os_str().as_bytes())
            .map_err(|_| FsError::InvalidPath(path.to_owned()))?;
        let wd = unsafe {
            libc::inotify_add_watch(self.inotify.as_raw_fd(), cpath.as_ptr(), WATCH_MASK)
        };
        if wd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.watches
            .entry(wd)
            .or_insert_with(|| Watch { path: rel_base(path).to_owned(), handles: IndexSet::new() })
            .handles
            .insert(handle);
        self.handles.insert(handle, wd);
        debug!(path, handle, wd, "notification installed");
        Ok(handle)
    }

    fn uninstall_notification(&mut self, handle: NotifyHandle) {
        let Some(wd) = self.handles.swap_remove(&handle) else { return };
        let Some(watch) = self.watches.get_mut(&wd) else { return };
        watch.handles.swap_remove(&handle);
        if watch.handles.is_empty() {
            self.watches.swap_remove(&wd);
            unsafe { libc::inotify_rm_watch(self.inotify.as_raw_fd(), wd) };
        }
        debug!(handle, wd, "notification uninstalled");
    }

    fn poll_notifications(&mut self) -> Vec<NotifyEvent> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::read(self.inotify.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        warn!(%err, "inotify read failed");
                        break;
                    }
                }
            }
            if n == 0 {
                break;
            }
            self.parse_events(&buf[..n as usize], &mut out);
        }
        out
    }
}

impl BackendFile for LocalFile {
    fn size(&self) -> u64 {
        self.disk_size
    }

    fn map(&mut self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn map_write(&mut self, len: usize) -> io::Result<Vec<u8>> {
        Ok(vec![0; len])
    }

    fn unmap(&mut self, region: Vec<u8>) -> io::Result<()> {
        if self.mode == FileMode::Write {
            fs::write(&self.path, &region)?;
            self.disk_size = region.len() as u64;
        }
        Ok(())
    }
}

fn kind_of(file_type: fs::FileType) -> PathKind {
    if file_type.is_file() {
        PathKind::Plain
    } else if file_type.is_dir() {
        PathKind::Directory
    } else {
        PathKind::Special
    }
}

fn change_kind(mask: u32) -> Option<NotifyKind> {
    if mask & (libc::IN_CREATE | libc::IN_MOVED_TO) != 0 {
        Some(NotifyKind::Created)
    } else if mask & (libc::IN_DELETE | libc::IN_DELETE_SELF | libc::IN_MOVED_FROM) != 0 {
        Some(NotifyKind::Deleted)
    } else if mask & (libc::IN_MODIFY | libc::IN_CLOSE_WRITE) != 0 {
        Some(NotifyKind::Changed)
    } else {
        None
    }
}

fn rel_base(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches('/')
}

fn join_rel(base: &str, name: &str) -> String {
    if base.is_empty() { name.to_owned() } else { format!("{base}/{name}") }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    fn fixture() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"ABC").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.bin"), [0u8; 16]).unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn stat_reports_size_and_kind() {
        let (_dir, backend) = fixture();
        let stat = backend.stat("a.txt").unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.kind, PathKind::Plain);
        assert_eq!(backend.stat("sub").unwrap().kind, PathKind::Directory);
        assert!(backend.stat("missing.txt").is_err());
    }

    #[test]
    fn list_is_one_level_and_subset_of_walk() {
        let (_dir, backend) = fixture();
        let mut list: Vec<_> = backend.list("/").unwrap();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            list.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            ["a.txt", "sub"]
        );

        let walk = backend.walk("/").unwrap();
        assert!(walk.iter().any(|e| e.path == "sub/inner.bin"));
        for entry in &list {
            assert!(walk.contains(entry));
        }
    }

    #[test]
    fn walk_bases_paths_on_the_request() {
        let (_dir, backend) = fixture();
        let walk = backend.walk("sub").unwrap();
        assert_eq!(walk.len(), 1);
        assert_eq!(walk[0].path, "sub/inner.bin");
    }

    #[test]
    fn read_and_write_mappings_round_trip() {
        let (_dir, mut backend) = fixture();

        let mut file = backend.open("b.bin", FileMode::Write).unwrap();
        assert_eq!(file.size(), 0);
        let mut region = file.map_write(4).unwrap();
        region.copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        file.unmap(region).unwrap();
        assert_eq!(file.size(), 4);

        let mut file = backend.open("b.bin", FileMode::Read).unwrap();
        assert_eq!(file.size(), 4);
        let region = file.map().unwrap();
        assert_eq!(region, [0xde, 0xad, 0xbe, 0xef]);
        file.unmap(region).unwrap();
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let (_dir, backend) = fixture();
        assert!(matches!(backend.stat("../secret"), Err(FsError::InvalidPath(_))));
        assert!(matches!(backend.stat("sub/../../x"), Err(FsError::InvalidPath(_))));
        // A leading slash anchors at the served root instead.
        assert!(backend.stat("/a.txt").is_ok());
    }

    #[test]
    fn notifications_fire_per_handle_and_stop_after_uninstall() {
        let (dir, mut backend) = fixture();
        assert!(backend.notification_fd().is_some());

        let handle = backend.install_notification("").unwrap();
        assert!(handle >= 0);

        fs::write(dir.path().join("a.txt"), b"changed").unwrap();
        let mut events = Vec::new();
        for _ in 0..100 {
            events = backend.poll_notifications();
            if !events.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(events.iter().any(|e| e.handle == handle && e.path == "a.txt"));

        backend.uninstall_notification(handle);
        fs::write(dir.path().join("a.txt"), b"again").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(backend.poll_notifications().is_empty());

        // Uninstalling twice is a no-op.
        backend.uninstall_notification(handle);
    }

    #[test]
    fn shared_watch_reports_every_handle() {
        let (dir, mut backend) = fixture();
        let first = backend.install_notification("").unwrap();
        let second = backend.install_notification("").unwrap();
        assert_ne!(first, second);

        fs::write(dir.path().join("fresh.txt"), b"x").unwrap();
        let mut events = Vec::new();
        for _ in 0..100 {
            events = backend.poll_notifications();
            if !events.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(events.iter().any(|e| e.handle == first));
        assert!(events.iter().any(|e| e.handle == second));

        // Dropping one handle keeps the shared watch alive.
        backend.uninstall_notification(first);
        fs::write(dir.path().join("fresh.txt"), b"y").unwrap();
        let mut events = Vec::new();
        for _ in 0..100 {
            events = backend.poll_notifications();
            if !events.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(events.iter().all(|e| e.handle != first));
        assert!(events.iter().any(|e| e.handle == second));
    }
}
