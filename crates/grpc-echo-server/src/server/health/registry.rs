use core::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::{Stream, StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tonic_health::ServingStatus;

/// Per-service serving status.
///
/// Each service name owns a `watch` channel holding its latest status, or
/// `None` while the name is only being watched and has never been set.
/// Writers replace the whole value; readers never block writers for longer
/// than a map lookup. Names that are only watched are forgotten again once
/// their last watcher goes away.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<String, watch::Sender<Option<ServingStatus>>>,
    /// Statuses as they were when the registry closed.
    frozen: Option<HashMap<String, ServingStatus>>,
}

/// Stream of status updates for one service name.
///
/// `None` items mean the name is not registered. The stream ends when the
/// registry is closed.
pub type StatusWatch = BoxStream<'static, Option<ServingStatus>>;

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status of `name`. Watchers are notified only if it changed.
    ///
    /// Ignored once the registry is closed.
    pub fn set_status(&self, name: &str, status: ServingStatus) {
        let mut inner = self.inner.write();
        if inner.frozen.is_some() {
            return;
        }

        match inner.services.get(name) {
            Some(tx) => {
                tx.send_if_modified(|current| {
                    if *current == Some(status) {
                        false
                    } else {
                        *current = Some(status);
                        true
                    }
                });
            }
            None => {
                let (tx, _) = watch::channel(Some(status));
                inner.services.insert(name.to_string(), tx);
            }
        }
        tracing::debug!(service = name, ?status, "health status set");
    }

    /// The current status of `name`, or `None` if it was never set.
    pub fn check(&self, name: &str) -> Option<ServingStatus> {
        let inner = self.inner.read();
        match &inner.frozen {
            Some(frozen) => frozen.get(name).copied(),
            None => inner.services.get(name).and_then(|tx| *tx.borrow()),
        }
    }

    /// Yields the current status of `name` immediately, then one item per
    /// change.
    ///
    /// Unknown names stay watched: a later [`set_status`](Self::set_status)
    /// is delivered to the stream. On a closed registry the stream is empty.
    pub fn watch(&self, name: &str) -> StatusWatch {
        if let Some(tx) = self.inner.read().services.get(name) {
            if tx.borrow().is_some() {
                return WatchStream::new(tx.subscribe()).boxed();
            }
        }

        let mut inner = self.inner.write();
        if inner.frozen.is_some() {
            return futures::stream::empty().boxed();
        }
        let rx = match inner.services.get(name) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(None);
                inner.services.insert(name.to_string(), tx);
                rx
            }
        };
        UnsetWatch {
            updates: WatchStream::new(rx),
            _release: Release {
                inner: Arc::downgrade(&self.inner),
                name: name.to_string(),
            },
        }
        .boxed()
    }

    /// Ends every active watch after it has seen the latest status.
    ///
    /// `check` keeps answering with the statuses held at this point; later
    /// updates are ignored. Closing twice is a no-op.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.frozen.is_some() {
            return;
        }
        let frozen = inner
            .services
            .drain()
            .filter_map(|(name, tx)| {
                let status = *tx.borrow();
                status.map(|status| (name, status))
            })
            .collect();
        inner.frozen = Some(frozen);
    }
}

/// Watch on a name that had no status when it was subscribed.
struct UnsetWatch {
    updates: WatchStream<Option<ServingStatus>>,
    // Declared after `updates` so the receiver is gone before it runs.
    _release: Release,
}

impl Stream for UnsetWatch {
    type Item = Option<ServingStatus>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_next_unpin(cx)
    }
}

/// Drops a watched-only name once nobody is subscribed to it.
struct Release {
    inner: Weak<RwLock<Inner>>,
    name: String,
}

impl Drop for Release {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.write();
        let unused = inner
            .services
            .get(&self.name)
            .is_some_and(|tx| tx.borrow().is_none() && tx.receiver_count() == 0);
        if unused {
            inner.services.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reports_last_write() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.check("svc"), None);

        registry.set_status("svc", ServingStatus::Serving);
        registry.set_status("svc", ServingStatus::NotServing);
        assert_eq!(registry.check("svc"), Some(ServingStatus::NotServing));
        assert_eq!(registry.check(""), None);
    }

    #[tokio::test]
    async fn watch_yields_current_then_changes() {
        let registry = HealthRegistry::new();
        registry.set_status("svc", ServingStatus::Serving);

        let mut watch = registry.watch("svc");
        assert_eq!(watch.next().await, Some(Some(ServingStatus::Serving)));

        // Rewriting the same value is not a change.
        registry.set_status("svc", ServingStatus::Serving);
        registry.set_status("svc", ServingStatus::NotServing);
        assert_eq!(watch.next().await, Some(Some(ServingStatus::NotServing)));
    }

    #[tokio::test]
    async fn unknown_names_stay_watched() {
        let registry = HealthRegistry::new();
        let mut watch = registry.watch("later");
        assert_eq!(watch.next().await, Some(None));
        assert_eq!(registry.check("later"), None);

        registry.set_status("later", ServingStatus::Serving);
        assert_eq!(watch.next().await, Some(Some(ServingStatus::Serving)));
    }

    #[tokio::test]
    async fn dropped_watches_on_unset_names_are_forgotten() {
        let registry = HealthRegistry::new();
        for i in 0..10_000 {
            let mut watch = registry.watch(&format!("svc-{i}"));
            assert_eq!(watch.next().await, Some(None));
        }
        assert!(registry.inner.read().services.is_empty());

        let first = registry.watch("shared");
        let second = registry.watch("shared");
        drop(first);
        assert_eq!(registry.inner.read().services.len(), 1);
        drop(second);
        assert!(registry.inner.read().services.is_empty());

        // A name that got a status while watched is kept.
        let watch = registry.watch("late");
        registry.set_status("late", ServingStatus::Serving);
        drop(watch);
        assert_eq!(registry.check("late"), Some(ServingStatus::Serving));
    }

    #[tokio::test]
    async fn close_ends_every_watch() {
        let registry = HealthRegistry::new();
        registry.set_status("", ServingStatus::Serving);
        let mut watch = registry.watch("");
        assert_eq!(watch.next().await, Some(Some(ServingStatus::Serving)));

        registry.set_status("", ServingStatus::NotServing);
        registry.close();
        assert_eq!(watch.next().await, Some(Some(ServingStatus::NotServing)));
        assert_eq!(watch.next().await, None);

        registry.set_status("", ServingStatus::Serving);
        assert_eq!(registry.check(""), Some(ServingStatus::NotServing));
        assert_eq!(registry.watch("").next().await, None);
    }
}
