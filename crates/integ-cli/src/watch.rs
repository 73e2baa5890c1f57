//! File system change source for watch mode

use crate::discovery::is_output_dir;
use async_trait::async_trait;
use integ_core::{ChangeSource, TestDescriptor};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path};
use std::time::Duration;
use tokio::sync::mpsc;

/// Quiet period that folds a burst of events into one change
pub const DEBOUNCE: Duration = Duration::from_millis(300);

/// Check if an event should trigger a new iteration
fn is_relevant(event: &Event) -> bool {
    let kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    kind && event.paths.iter().any(|p| !in_output_dir(p))
}

fn in_output_dir(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => is_output_dir(&name.to_string_lossy()),
        _ => false,
    })
}

/// Watches the test program's directory; stops on Ctrl-C
pub struct FsChangeSource {
    events: mpsc::UnboundedReceiver<Event>,
    watcher: Option<RecommendedWatcher>,
}

impl FsChangeSource {
    /// Watch the directory containing `test`
    ///
    /// # Errors
    /// Returns the watcher error when the directory cannot be watched.
    pub fn new(test: &TestDescriptor) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            },
            Config::default(),
        )?;

        let dir = match test.file_name().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::Recursive)?;
        tracing::info!(dir = %dir.display(), "watching for changes");

        Ok(Self {
            events: rx,
            watcher: Some(watcher),
        })
    }

    #[cfg(test)]
    fn from_receiver(events: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { events, watcher: None }
    }

    async fn settle(&mut self) {
        loop {
            match tokio::time::timeout(DEBOUNCE, self.events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return,
            }
        }
    }
}

impl std::fmt::Debug for FsChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsChangeSource")
            .field("watching", &self.watcher.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeSource for FsChangeSource {
    async fn next_change(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, leaving watch mode");
                    return false;
                }
                event = self.events.recv() => match event {
                    None => return false,
                    Some(event) if is_relevant(&event) => {
                        tracing::debug!(paths = ?event.paths, "change detected");
                        self.settle().await;
                        return true;
                    }
                    Some(_) => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn output_directories_are_ignored() {
        assert!(is_relevant(&event(EventKind::Modify(ModifyKind::Any), "test/integ.a.js")));
        assert!(!is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "test/integ.out.integ.a.js.snapshot/Stack.template.json"
        )));
        assert!(!is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "test/integ.a.js.snapshot/Stack.template.json"
        )));
        assert!(!is_relevant(&event(EventKind::Access(notify::event::AccessKind::Any), "test/integ.a.js")));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_is_one_change() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = FsChangeSource::from_receiver(rx);
        for _ in 0..5 {
            tx.send(event(EventKind::Modify(ModifyKind::Any), "test/integ.a.js")).unwrap();
        }
        tx.send(event(EventKind::Modify(ModifyKind::Any), "test/integ.out.x/S.template.json"))
            .unwrap();

        assert!(source.next_change().await);
        drop(tx);
        assert!(!source.next_change().await);
    }
}
