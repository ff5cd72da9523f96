use fetchfs::config::MountConfig;
use fetchfs::fuse::FetchFs;
use fetchfs::fuse::mount::mount_fetchfs;
use fetchfs::remote::LocalDirTransport;
use fetchfs::OverlayFs;

const USAGE: &str = "Usage: mount_local <remote_dir> <cache_dir> <mount_point>";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("This mount demo only works on Linux (FUSE).");
        std::process::exit(2);
    }

    #[cfg(target_os = "linux")]
    {
        tracing_subscriber::fmt::init();

        let mut args = std::env::args().skip(1);
        let (Some(remote_dir), Some(cache_dir), Some(mount_point)) =
            (args.next(), args.next(), args.next())
        else {
            eprintln!(
                "{USAGE}\n\n  remote_dir: directory standing in for the remote store (never written)\n  cache_dir: local cache root (will be created if not exist)\n  mount_point: empty directory to mount fetchfs\n\nExample:\n  mount_local /srv/export /tmp/fetchfs-cache /tmp/fetchfs-mnt"
            );
            std::process::exit(2);
        };

        for dir in [&cache_dir, &mount_point] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("create {dir} failed: {e}");
                std::process::exit(1);
            }
        }

        let engine = OverlayFs::new(&cache_dir, &remote_dir, LocalDirTransport::new());
        println!("Mounting fetchfs at {mount_point} (remote: {remote_dir}, cache: {cache_dir})...");
        println!("Press Ctrl+C to unmount and exit.");
        let handle =
            match mount_fetchfs(FetchFs::new(engine), &mount_point, &MountConfig::default()).await
            {
                Ok(h) => h,
                Err(e) => {
                    eprintln!(
                        "mount failed: {e}\n\nHint: ensure you are on Linux with FUSE (fusermount3) available."
                    );
                    std::process::exit(1);
                }
            };

        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("signal error: {e}");
        }

        println!("Unmounting...");
        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
