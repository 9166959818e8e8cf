#![cfg(target_os = "linux")]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dirwatch::{ChangeKind, Error, Server, Sink, WatcherConfig};
use tempfile::TempDir;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

struct ChannelSink {
    events: Sender<(ChangeKind, PathBuf)>,
}

impl Sink for ChannelSink {
    fn path_changed(&mut self, kind: ChangeKind, path: &Path) {
        let _ = self.events.send((kind, path.to_path_buf()));
    }

    fn report_error(&mut self, message: &str) {
        eprintln!("watcher error: {message}");
    }
}

fn start_server() -> (Server, Receiver<(ChangeKind, PathBuf)>) {
    let (events, received) = mpsc::channel();
    let server = Server::new(Box::new(ChannelSink { events }), WatcherConfig::default())
        .expect("couldn't start watcher");
    (server, received)
}

fn next_event(received: &Receiver<(ChangeKind, PathBuf)>) -> (ChangeKind, PathBuf) {
    received
        .recv_timeout(EVENT_TIMEOUT)
        .expect("no event within timeout")
}

#[test]
fn file_creation_is_reported() {
    let dir = TempDir::new().unwrap();
    let (server, received) = start_server();
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    fs::File::create(dir.path().join("f.txt")).unwrap();

    assert_eq!(
        next_event(&received),
        (ChangeKind::Created, dir.path().join("f.txt"))
    );
    server.close().unwrap();
}

#[test]
fn modification_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("f.txt"), b"before").unwrap();

    let (server, received) = start_server();
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    fs::write(dir.path().join("f.txt"), b"after").unwrap();

    assert_eq!(
        next_event(&received),
        (ChangeKind::Modified, dir.path().join("f.txt"))
    );
    server.close().unwrap();
}

#[test]
fn rename_is_reported_as_removed_then_created() {
    let dir = TempDir::new().unwrap();
    fs::File::create(dir.path().join("a")).unwrap();

    let (server, received) = start_server();
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    fs::rename(dir.path().join("a"), dir.path().join("b")).unwrap();

    assert_eq!(next_event(&received), (ChangeKind::Removed, dir.path().join("a")));
    assert_eq!(next_event(&received), (ChangeKind::Created, dir.path().join("b")));
    server.close().unwrap();
}

#[test]
fn deleting_watched_directory_drops_the_watch() {
    let dir = TempDir::new().unwrap();
    let watched = dir.path().join("wA");
    fs::create_dir(&watched).unwrap();

    let (server, received) = start_server();
    server.register_paths(&[watched.clone()]).unwrap();

    fs::remove_dir(&watched).unwrap();

    assert_eq!(next_event(&received), (ChangeKind::Removed, watched.clone()));
    // give the loop a moment to consume the trailing IGNORED record
    thread::sleep(Duration::from_millis(200));
    assert!(!server.unregister_paths(&[watched]).unwrap());
    server.close().unwrap();
}

#[test]
fn duplicate_registration_fails() {
    let dir = TempDir::new().unwrap();
    let (server, _received) = start_server();
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    let result = server.register_paths(&[dir.path().to_path_buf()]);
    assert!(matches!(result, Err(Error::AlreadyWatching { .. })));

    server.close().unwrap();
}

#[test]
fn registering_missing_directory_fails() {
    let dir = TempDir::new().unwrap();
    let (server, _received) = start_server();

    let result = server.register_paths(&[dir.path().join("nonexistent")]);
    assert!(matches!(result, Err(Error::Register { .. })));

    server.close().unwrap();
}

#[test]
fn unregistering_unknown_path_returns_false() {
    let dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let (server, _received) = start_server();
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    assert!(!server
        .unregister_paths(&[other.path().to_path_buf(), dir.path().to_path_buf()])
        .unwrap());
    // the known path was still unregistered along the way
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    server.close().unwrap();
}

#[test]
fn reregistration_after_unregister_works() {
    let dir = TempDir::new().unwrap();
    let (server, received) = start_server();

    server.register_paths(&[dir.path().to_path_buf()]).unwrap();
    assert!(server.unregister_paths(&[dir.path().to_path_buf()]).unwrap());
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();

    fs::File::create(dir.path().join("again.txt")).unwrap();
    assert_eq!(
        next_event(&received),
        (ChangeKind::Created, dir.path().join("again.txt"))
    );
    server.close().unwrap();
}

#[test]
fn concurrent_registrations_all_land() {
    let dir = TempDir::new().unwrap();
    let paths: Vec<PathBuf> = (0..8)
        .map(|index| {
            let path = dir.path().join(format!("w{index}"));
            fs::create_dir(&path).unwrap();
            path
        })
        .collect();

    let (server, received) = start_server();
    let server = Arc::new(server);

    let handles: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| {
            let server = Arc::clone(&server);
            thread::spawn(move || server.register_paths(&[path]))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    // every directory is live: a change in each one is observed
    for path in &paths {
        fs::File::create(path.join("probe")).unwrap();
    }
    let mut seen = std::collections::HashSet::new();
    for _ in 0..paths.len() {
        let (kind, path) = next_event(&received);
        assert_eq!(kind, ChangeKind::Created);
        seen.insert(path.parent().unwrap().to_path_buf());
    }
    assert_eq!(seen.len(), paths.len());

    assert!(server.unregister_paths(&paths).unwrap());
    server.close().unwrap();
}

#[test]
fn close_twice_is_an_error() {
    let (server, _received) = start_server();
    server.close().unwrap();
    assert!(matches!(server.close(), Err(Error::ClosedAlready)));
    assert!(matches!(
        server.register_paths(&[PathBuf::from("/tmp")]),
        Err(Error::ClosedAlready)
    ));
}

#[test]
fn drop_without_close_tears_down() {
    let dir = TempDir::new().unwrap();
    let (server, _received) = start_server();
    server.register_paths(&[dir.path().to_path_buf()]).unwrap();
    drop(server);
}
