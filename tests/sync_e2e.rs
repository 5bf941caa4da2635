use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use treesync::config::Config;
use treesync::logger::{read_journal, JournalEvent, JsonLogger, NoopLogger};
use treesync::net_async;

fn write_file(path: &Path, data: &[u8], mtime: i64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0))?;
    Ok(())
}

fn patterned(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn fast_config(root: &Path) -> Config {
    Config {
        root: root.to_path_buf(),
        tick_interval_ms: 50,
        rescan_cycle: 2,
        ..Config::default()
    }
}

/// Poll until `check` passes or give up after a few seconds
async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200u32 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn start_server(config: Config) -> Result<(String, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let task = tokio::spawn(async move {
        let _ = net_async::server::serve_listener(listener, config, Arc::new(NoopLogger)).await;
    });
    Ok((addr, task))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::read(a), std::fs::read(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirror_converges_and_follows_changes() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    let dst: PathBuf = cli.path().join("mirror");

    write_file(&srv.path().join("a.txt"), b"alpha", 100)?;
    write_file(&srv.path().join("b.txt"), b"bravo", 100)?;
    // crosses the 1 MiB frame size, so it travels as several frames
    write_file(&srv.path().join("dir1/dir2/c.dat"), &patterned(1_100_000), 200)?;

    let (addr, server_task) = start_server(fast_config(srv.path())).await?;

    let journal = cli.path().join("journal.jsonl");
    let logger = Arc::new(JsonLogger::new(&journal)?);
    let client_cfg = fast_config(&dst);
    let client_addr = addr.clone();
    let client_task = tokio::spawn(async move {
        let _ = net_async::client::run(client_cfg, &client_addr, logger).await;
    });

    let synced = wait_for(|| {
        ["a.txt", "b.txt", "dir1/dir2/c.dat"]
            .iter()
            .all(|n| same_file(&srv.path().join(n), &dst.join(n)))
    })
    .await;
    assert!(synced, "initial mirror did not converge");
    assert_eq!(
        treesync::fs_enum::file_mtime(&dst.join("dir1/dir2/c.dat"))?,
        200
    );

    // modify one file, delete another, add a third
    write_file(&srv.path().join("a.txt"), b"alpha, second edition", 300)?;
    std::fs::remove_file(srv.path().join("b.txt"))?;
    write_file(&srv.path().join("new/d.txt"), b"delta", 400)?;

    let followed = wait_for(|| {
        same_file(&srv.path().join("a.txt"), &dst.join("a.txt"))
            && same_file(&srv.path().join("new/d.txt"), &dst.join("new/d.txt"))
            && !dst.join("b.txt").exists()
    })
    .await;
    assert!(followed, "mirror did not follow server changes");

    client_task.abort();
    server_task.abort();

    let events = read_journal(&journal)?;
    assert!(events.iter().any(|e| e.event == JournalEvent::Start));
    assert!(events
        .iter()
        .any(|e| e.event == JournalEvent::Delete && e.name.as_deref() == Some("b.txt")));
    assert!(events
        .iter()
        .any(|e| e.event == JournalEvent::Fetch && e.name.as_deref() == Some("new/d.txt")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_server_restart() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    write_file(&srv.path().join("one.txt"), b"1", 100)?;

    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);

    let serve = |cfg: Config, addr: String| {
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            net_async::server::serve_listener(listener, cfg, Arc::new(NoopLogger)).await
        })
    };
    let first = serve(fast_config(srv.path()), addr.clone());

    let client_cfg = fast_config(cli.path());
    let client_addr = addr.clone();
    let client_task = tokio::spawn(async move {
        let _ = net_async::client::run(client_cfg, &client_addr, Arc::new(NoopLogger)).await;
    });

    assert!(wait_for(|| cli.path().join("one.txt").exists()).await);
    first.abort();
    let _ = first.await;

    write_file(&srv.path().join("two.txt"), b"2", 100)?;
    let second = serve(fast_config(srv.path()), addr.clone());

    assert!(
        wait_for(|| same_file(&srv.path().join("two.txt"), &cli.path().join("two.txt"))).await,
        "client did not resync after reconnect"
    );

    client_task.abort();
    second.abort();
    Ok(())
}

#[tokio::test]
async fn excess_connections_are_refused() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cfg = Config {
        max_connections: 1,
        ..fast_config(srv.path())
    };
    let (addr, server_task) = start_server(cfg).await?;

    let _held = tokio::net::TcpStream::connect(&addr).await?;
    let mut extra = tokio::net::TcpStream::connect(&addr).await?;

    // the server drops the extra socket right after accepting it
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), extra.read(&mut buf)).await??;
    assert_eq!(n, 0);

    server_task.abort();
    Ok(())
}
