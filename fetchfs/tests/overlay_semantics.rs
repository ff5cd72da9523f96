use async_trait::async_trait;
use fetchfs::error::{FsError, RemoteError};
use fetchfs::remote::localfs::LocalDirConnection;
use fetchfs::remote::{Connection, LocalDirTransport, Transport};
use fetchfs::vfs::attr::{Attributes, DirEntry};
use fetchfs::vfs::path::VirtualPath;
use fetchfs::OverlayFs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Local directory transport that counts connects and fetches and can slow
/// fetches down to widen race windows.
#[derive(Clone, Default)]
struct CountingTransport {
    connects: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
    fetch_delay: Duration,
}

struct CountingConnection {
    inner: LocalDirConnection,
    fetches: Arc<AtomicUsize>,
    fetch_delay: Duration,
}

#[async_trait]
impl Transport for CountingTransport {
    type Conn = CountingConnection;

    async fn connect(&self) -> Result<Self::Conn, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(CountingConnection {
            inner: LocalDirTransport::new().connect().await?,
            fetches: self.fetches.clone(),
            fetch_delay: self.fetch_delay,
        })
    }
}

#[async_trait]
impl Connection for CountingConnection {
    async fn stat(&self, path: &Path) -> Result<Attributes, RemoteError> {
        self.inner.stat(path).await
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, RemoteError> {
        self.inner.list_dir(path).await
    }

    async fn fetch(&self, remote: &Path, dest: &Path) -> Result<(), RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.inner.fetch(remote, dest).await
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.inner.close().await
    }
}

/// A remote store that cannot be reached.
struct UnreachableTransport;

#[async_trait]
impl Transport for UnreachableTransport {
    type Conn = LocalDirConnection;

    async fn connect(&self) -> Result<Self::Conn, RemoteError> {
        Err(RemoteError::connection("connection refused"))
    }
}

struct Env {
    cache: tempfile::TempDir,
    remote: tempfile::TempDir,
    transport: CountingTransport,
    fs: Arc<OverlayFs<CountingTransport>>,
}

fn env_with_delay(fetch_delay: Duration) -> Env {
    let cache = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let transport = CountingTransport {
        fetch_delay,
        ..Default::default()
    };
    let fs = Arc::new(OverlayFs::new(
        cache.path(),
        remote.path(),
        transport.clone(),
    ));
    Env {
        cache,
        remote,
        transport,
        fs,
    }
}

fn env() -> Env {
    env_with_delay(Duration::ZERO)
}

impl Env {
    fn fetches(&self) -> usize {
        self.transport.fetches.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn ensure_cached_copies_full_content_once() {
    let e = env();
    let content: Vec<u8> = (0..=255u8).cycle().take(300_000).collect();
    std::fs::create_dir_all(e.remote.path().join("deep/er")).unwrap();
    std::fs::write(e.remote.path().join("deep/er/blob"), &content).unwrap();

    let vp = VirtualPath::new("/deep/er/blob");
    assert!(e.fs.ensure_cached(&vp).await.unwrap());
    assert!(e.fs.ensure_cached(&vp).await.unwrap());

    assert_eq!(std::fs::read(e.cache.path().join("deep/er/blob")).unwrap(), content);
    assert_eq!(e.fetches(), 1);
}

#[tokio::test]
async fn cached_copy_is_never_refreshed() {
    let e = env();
    std::fs::write(e.remote.path().join("f"), b"first").unwrap();
    e.fs.ensure_cached(&VirtualPath::new("f")).await.unwrap();

    std::fs::write(e.remote.path().join("f"), b"second version").unwrap();
    let out = e.fs.read(&VirtualPath::new("f"), 0, 64).await.unwrap();
    assert_eq!(out, b"first");
    assert_eq!(e.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_cached_fetches_once() {
    let e = env_with_delay(Duration::from_millis(50));
    let content = vec![7u8; 64 * 1024];
    std::fs::write(e.remote.path().join("hot.bin"), &content).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let fs = e.fs.clone();
        tasks.push(tokio::spawn(async move {
            let vp = VirtualPath::new("/hot.bin");
            fs.ensure_cached(&vp).await.unwrap();
            fs.read(&vp, 0, 128 * 1024).await.unwrap()
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap(), content);
    }
    assert_eq!(e.fetches(), 1);
    assert_eq!(e.transport.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fetches_under_one_new_directory() {
    let e = env_with_delay(Duration::from_millis(20));
    std::fs::create_dir_all(e.remote.path().join("new/sub")).unwrap();
    for i in 0..8 {
        std::fs::write(e.remote.path().join(format!("new/sub/f{i}")), format!("{i}")).unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..8 {
        let fs = e.fs.clone();
        tasks.push(tokio::spawn(async move {
            fs.read(&VirtualPath::new(&format!("new/sub/f{i}")), 0, 8)
                .await
                .unwrap()
        }));
    }
    for (i, t) in tasks.into_iter().enumerate() {
        assert_eq!(t.await.unwrap(), format!("{i}").into_bytes());
    }
    assert_eq!(e.fetches(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_create_during_fetch_is_not_overwritten() {
    let e = env_with_delay(Duration::from_millis(300));
    std::fs::write(e.remote.path().join("doc"), b"remote-data").unwrap();
    let vp = VirtualPath::new("doc");

    let fs = e.fs.clone();
    let reader = tokio::spawn(async move { fs.read(&VirtualPath::new("doc"), 0, 64).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    e.fs.create(&vp, 0o644).await.unwrap();
    e.fs.write(&vp, 0, b"local-data").await.unwrap();

    assert_eq!(reader.await.unwrap().unwrap(), b"local-data");
    assert_eq!(std::fs::read(e.cache.path().join("doc")).unwrap(), b"local-data");
    assert_eq!(e.fetches(), 1);

    let leftovers: Vec<_> = std::fs::read_dir(e.cache.path())
        .unwrap()
        .map(|d| d.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".fetchfs-partial."))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn local_attributes_win_over_remote() {
    let e = env();
    std::fs::write(e.remote.path().join("a"), vec![0u8; 50]).unwrap();
    std::fs::write(e.cache.path().join("a"), vec![0u8; 5]).unwrap();

    let attr = e.fs.getattr(&VirtualPath::new("/a")).await.unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(e.fetches(), 0);
}

#[tokio::test]
async fn listing_unions_local_and_remote() {
    let e = env();
    std::fs::create_dir(e.remote.path().join("a")).unwrap();
    std::fs::write(e.remote.path().join("a/x"), b"rx").unwrap();
    std::fs::write(e.remote.path().join("a/y"), b"ry").unwrap();
    std::fs::create_dir(e.cache.path().join("a")).unwrap();
    std::fs::write(e.cache.path().join("a/x"), b"lx").unwrap();

    let names: Vec<String> = e
        .fs
        .readdir(&VirtualPath::new("/a"))
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec![".", "..", "x", "y"]);
}

#[tokio::test]
async fn listing_keeps_local_file_deleted_upstream() {
    let e = env();
    std::fs::write(e.remote.path().join("gone"), b"x").unwrap();
    e.fs.ensure_cached(&VirtualPath::new("gone")).await.unwrap();
    std::fs::remove_file(e.remote.path().join("gone")).unwrap();

    let names: Vec<String> = e
        .fs
        .readdir(&VirtualPath::root())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec![".", "..", "gone"]);
}

#[tokio::test]
async fn write_materializes_then_patches() {
    let e = env();
    let original: Vec<u8> = (0..100u8).collect();
    std::fs::write(e.remote.path().join("p.bin"), &original).unwrap();

    e.fs.write(&VirtualPath::new("p.bin"), 0, b"XYZ").await.unwrap();

    let local = std::fs::read(e.cache.path().join("p.bin")).unwrap();
    assert_eq!(local.len(), 100);
    assert_eq!(&local[..3], b"XYZ");
    assert_eq!(&local[3..], &original[3..]);
    assert_eq!(std::fs::read(e.remote.path().join("p.bin")).unwrap(), original);
}

#[tokio::test]
async fn unlink_re_resolves_to_remote() {
    let e = env();
    std::fs::write(e.remote.path().join("r"), vec![1u8; 9]).unwrap();
    e.fs.write(&VirtualPath::new("r"), 0, b"ab").await.unwrap();
    std::fs::write(e.cache.path().join("local-only"), b"l").unwrap();

    e.fs.unlink(&VirtualPath::new("r")).await.unwrap();
    let attr = e.fs.getattr(&VirtualPath::new("r")).await.unwrap();
    assert_eq!(attr.size, 9);
    assert!(!e.cache.path().join("r").exists());

    e.fs.unlink(&VirtualPath::new("local-only")).await.unwrap();
    let err = e.fs.getattr(&VirtualPath::new("local-only")).await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));
}

#[tokio::test]
async fn rmdir_without_local_directory_is_noop() {
    let e = env();
    std::fs::create_dir(e.remote.path().join("remote-dir")).unwrap();

    e.fs.rmdir(&VirtualPath::new("remote-dir")).await.unwrap();
    e.fs.rmdir(&VirtualPath::new("nowhere")).await.unwrap();

    assert!(e.remote.path().join("remote-dir").is_dir());
    assert!(std::fs::read_dir(e.cache.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn rename_adopts_remote_object_under_new_name() {
    let e = env();
    std::fs::write(e.remote.path().join("before"), b"adopted").unwrap();

    e.fs
        .rename(&VirtualPath::new("before"), &VirtualPath::new("after"))
        .await
        .unwrap();
    let out = e.fs.read(&VirtualPath::new("after"), 0, 64).await.unwrap();
    assert_eq!(out, b"adopted");
    assert_eq!(e.fetches(), 1);

    // the old name is served from the untouched remote object again
    let again = e.fs.read(&VirtualPath::new("before"), 0, 64).await.unwrap();
    assert_eq!(again, b"adopted");
    assert_eq!(e.fetches(), 2);
}

#[tokio::test]
async fn unreachable_remote_is_not_reported_as_missing() {
    let cache = tempfile::tempdir().unwrap();
    let fs = OverlayFs::new(cache.path(), "/srv", UnreachableTransport);

    let err = fs.getattr(&VirtualPath::new("/any")).await.unwrap_err();
    assert!(matches!(err, FsError::Connection(_)));
    assert_eq!(err.errno(), libc::EIO);

    let err = fs.readdir(&VirtualPath::root()).await.unwrap_err();
    assert!(matches!(err, FsError::Connection(_)));

    let err = fs.read(&VirtualPath::new("/any"), 0, 1).await.unwrap_err();
    assert!(matches!(err, FsError::Connection(_)));

    // the cache keeps serving what it already has
    std::fs::write(cache.path().join("held"), b"ok").unwrap();
    assert_eq!(fs.read(&VirtualPath::new("held"), 0, 8).await.unwrap(), b"ok");
}

#[tokio::test]
async fn teardown_closes_session_for_good() {
    let e = env();
    std::fs::write(e.remote.path().join("x"), b"x").unwrap();
    e.fs.getattr(&VirtualPath::new("x")).await.unwrap();
    assert!(e.fs.session().is_open().await);

    e.fs.destroy().await;
    let err = e.fs.getattr(&VirtualPath::new("x")).await.unwrap_err();
    assert!(matches!(err, FsError::Connection(_)));
    assert_eq!(e.transport.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn escaping_paths_stay_inside_roots() {
    let e = env();
    std::fs::write(e.remote.path().join("top"), b"t").unwrap();

    let vp = VirtualPath::new("/../../top");
    assert_eq!(vp, VirtualPath::new("top"));
    assert_eq!(e.fs.read(&vp, 0, 4).await.unwrap(), b"t");
    assert!(e.cache.path().join("top").exists());
}
