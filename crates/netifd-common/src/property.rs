use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// A stream of values produced by a [`Property`].
pub type PropertyStream<T> = WatchStream<T>;

/// A reactive cell: holds the latest value of `T` and lets callers either
/// poll the current snapshot or subscribe to a stream of later values.
///
/// Built on [`tokio::sync::watch`], so subscribers only ever see the most
/// recent value — intermediate updates can be coalesced if a subscriber
/// doesn't poll in time. That's the right tool for status snapshots
/// (`device up/down`, `interface state`) but not for anything that needs
/// every event delivered in order; the device/interface dependent
/// broadcast uses a direct callback list instead, not this type.
#[derive(Debug)]
pub struct Property<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Property<T> {
    /// Creates a new cell seeded with `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Updates the value. A no-op (no subscriber wakeup) if `value` equals
    /// the current value.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Subscribes to a stream of future values. The stream yields the
    /// current value first, then each subsequent change.
    pub fn watch(&self) -> PropertyStream<T> {
        WatchStream::new(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_updates_get() {
        let prop = Property::new(0u32);
        prop.set(5);
        assert_eq!(prop.get(), 5);
    }

    #[test]
    fn set_same_value_is_noop() {
        let prop = Property::new("down".to_string());
        let mut rx = prop.tx.subscribe();
        prop.set("down".to_string());
        assert!(rx.has_changed().is_ok_and(|changed| !changed));
    }

    #[tokio::test]
    async fn watch_observes_later_updates() {
        use futures::StreamExt;

        let prop = Property::new(0u32);
        let mut stream = prop.watch();
        assert_eq!(stream.next().await, Some(0));

        prop.set(1);
        assert_eq!(stream.next().await, Some(1));
    }
}
