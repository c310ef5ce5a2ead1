use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{LocalChange, LocalEvent};
use super::paths::{is_partial_file, remote_path_for};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Starts a recursive watcher on `root`.
///
/// Raw notify events are mapped on the notify thread and coalesced per path by
/// a tokio task for `debounce` before being sent on a channel bounded to
/// `capacity`. When the engine falls behind the coalescing task waits, and so
/// does everything upstream of it. Must be called inside a tokio runtime.
pub fn start_notify_watcher(
    root: &Path,
    capacity: usize,
    debounce: Duration,
    cancel: CancellationToken,
) -> notify::Result<(RecommendedWatcher, mpsc::Receiver<LocalEvent>)> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                let _ = raw_tx.send(local);
            }
        }
        Err(err) => warn!(error = %err, "local watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    tokio::spawn(coalesce(raw_rx, tx, debounce, cancel));
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    let paths: Vec<PathBuf> = event
        .paths
        .into_iter()
        .filter(|path| !is_partial_file(path))
        .collect();
    let to_local = |path: &PathBuf, kind: LocalChange, is_dir: bool| {
        remote_path_for(root, path).map(|remote| LocalEvent::new(remote, kind, is_dir))
    };

    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths
                .iter()
                .filter_map(|path| to_local(path, LocalChange::Deleted, false))
                .collect(),
            RenameMode::To => paths
                .iter()
                .filter_map(|path| to_local(path, LocalChange::Created, path.is_dir()))
                .collect(),
            // inotify already reported the From and To halves separately.
            RenameMode::Both => Vec::new(),
            RenameMode::Any | RenameMode::Other => paths
                .iter()
                .filter_map(|path| {
                    if path.exists() {
                        to_local(path, LocalChange::Created, path.is_dir())
                    } else {
                        to_local(path, LocalChange::Deleted, false)
                    }
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Create(kind) => paths
            .iter()
            .filter_map(|path| {
                let is_dir = matches!(kind, CreateKind::Folder)
                    || (!matches!(kind, CreateKind::File) && path.is_dir());
                to_local(path, LocalChange::Created, is_dir)
            })
            .collect(),
        EventKind::Modify(_) => paths
            .iter()
            .filter(|path| !path.is_dir())
            .filter_map(|path| to_local(path, LocalChange::Modified, false))
            .collect(),
        EventKind::Remove(kind) => paths
            .iter()
            .filter_map(|path| {
                to_local(path, LocalChange::Deleted, matches!(kind, RemoveKind::Folder))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Collapses events for the same path into their net effect while keeping the
/// order in which paths were first seen.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending: Vec<LocalEvent>,
}

impl Coalescer {
    pub fn push(&mut self, event: LocalEvent) {
        match self
            .pending
            .iter_mut()
            .find(|pending| pending.path == event.path)
        {
            Some(pending) => {
                pending.kind = merge(pending.kind, event.kind);
                pending.is_dir |= event.is_dir;
            }
            None => self.pending.push(event),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> Vec<LocalEvent> {
        std::mem::take(&mut self.pending)
    }
}

fn merge(earlier: LocalChange, later: LocalChange) -> LocalChange {
    match (earlier, later) {
        (_, LocalChange::Deleted) => LocalChange::Deleted,
        (LocalChange::Deleted, _) => LocalChange::Modified,
        (LocalChange::Created, _) => LocalChange::Created,
        (LocalChange::Modified, _) => LocalChange::Modified,
    }
}

async fn coalesce(
    mut raw_rx: mpsc::UnboundedReceiver<LocalEvent>,
    tx: mpsc::Sender<LocalEvent>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let mut coalescer = Coalescer::default();
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            event = raw_rx.recv() => event,
        };
        let Some(first) = first else {
            return;
        };
        coalescer.push(first);

        let deadline = tokio::time::Instant::now() + debounce;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = raw_rx.recv() => match event {
                    Some(event) => coalescer.push(event),
                    None => break,
                },
            }
        }

        for event in coalescer.drain() {
            debug!(path = %event.path, kind = ?event.kind, "local change");
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, ModifyKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_modify_event_to_modified() {
        let root = Path::new("/tmp/root");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Data(DataChange::Any)),
                &["/tmp/root/Docs/A.txt"],
            ),
        );
        assert_eq!(
            mapped,
            vec![LocalEvent::new("/Docs/A.txt", LocalChange::Modified, false)]
        );
    }

    #[test]
    fn maps_rename_halves_to_delete_and_create() {
        let root = Path::new("/tmp/root");
        let from = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/tmp/root/Docs/A.txt"],
            ),
        );
        let to = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/tmp/root/Docs/B.txt"],
            ),
        );
        let both = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/root/Docs/A.txt", "/tmp/root/Docs/B.txt"],
            ),
        );

        assert_eq!(
            from,
            vec![LocalEvent::new("/Docs/A.txt", LocalChange::Deleted, false)]
        );
        assert_eq!(
            to,
            vec![LocalEvent::new("/Docs/B.txt", LocalChange::Created, false)]
        );
        assert!(both.is_empty());
    }

    #[test]
    fn ignores_partial_downloads_and_root() {
        let root = Path::new("/tmp/root");
        let mapped = map_event(
            root,
            event(
                EventKind::Create(CreateKind::File),
                &["/tmp/root/a.txt.dsync-partial", "/tmp/root"],
            ),
        );
        assert!(mapped.is_empty());
    }

    #[test]
    fn folder_create_and_remove_carry_is_dir() {
        let root = Path::new("/tmp/root");
        let created = map_event(
            root,
            event(EventKind::Create(CreateKind::Folder), &["/tmp/root/Docs"]),
        );
        let removed = map_event(
            root,
            event(EventKind::Remove(RemoveKind::Folder), &["/tmp/root/Docs"]),
        );
        assert_eq!(
            created,
            vec![LocalEvent::new("/Docs", LocalChange::Created, true)]
        );
        assert_eq!(
            removed,
            vec![LocalEvent::new("/Docs", LocalChange::Deleted, true)]
        );
    }

    #[test]
    fn coalescer_merges_per_path_and_keeps_first_seen_order() {
        let mut coalescer = Coalescer::default();
        coalescer.push(LocalEvent::new("/a.txt", LocalChange::Created, false));
        coalescer.push(LocalEvent::new("/b.txt", LocalChange::Modified, false));
        coalescer.push(LocalEvent::new("/a.txt", LocalChange::Modified, false));
        coalescer.push(LocalEvent::new("/c.txt", LocalChange::Deleted, false));
        coalescer.push(LocalEvent::new("/c.txt", LocalChange::Created, false));
        coalescer.push(LocalEvent::new("/b.txt", LocalChange::Deleted, false));

        assert_eq!(
            coalescer.drain(),
            vec![
                LocalEvent::new("/a.txt", LocalChange::Created, false),
                LocalEvent::new("/b.txt", LocalChange::Deleted, false),
                LocalEvent::new("/c.txt", LocalChange::Modified, false),
            ]
        );
        assert!(coalescer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_task_emits_one_event_per_net_change() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(coalesce(raw_rx, tx, Duration::from_millis(100), cancel.clone()));

        raw_tx
            .send(LocalEvent::new("/new.txt", LocalChange::Created, false))
            .unwrap();
        raw_tx
            .send(LocalEvent::new("/new.txt", LocalChange::Modified, false))
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, LocalEvent::new("/new.txt", LocalChange::Created, false));

        raw_tx
            .send(LocalEvent::new("/new.txt", LocalChange::Modified, false))
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, LocalChange::Modified);

        cancel.cancel();
    }
}
