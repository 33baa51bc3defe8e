use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Internal type, a listener that turns its argument into a future.
pub(crate) type Handler<A> = Box<dyn FnMut(A) -> BoxFuture<'static, ()> + Send + 'static>;

pub(crate) type SharedHandler<A> = Arc<Mutex<Handler<A>>>;

/// Locks listener state. A listener that panicked leaves the map intact, so
/// poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identifies a registered listener, see `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

struct Listener<K, A> {
    id: ListenerId,
    /// `None` listens to every event.
    key: Option<K>,
    once: bool,
    /// Answers acknowledgement requests.
    acks: bool,
    handler: SharedHandler<A>,
}

/// The listeners of a manager or socket, keyed by event.
pub(crate) struct Emitter<K, A> {
    listeners: Vec<Listener<K, A>>,
    next_id: usize,
}

impl<K, A> Default for Emitter<K, A> {
    fn default() -> Self {
        Emitter {
            listeners: Vec::new(),
            next_id: 0,
        }
    }
}

impl<K: Debug, A> Debug for Emitter<K, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_list()
            .entries(self.listeners.iter().map(|l| (&l.id, &l.key, l.once)))
            .finish()
    }
}

impl<K: PartialEq, A: Clone + Send + 'static> Emitter<K, A> {
    pub(crate) fn on(&mut self, key: K, once: bool, handler: Handler<A>) -> ListenerId {
        self.add(Some(key), once, false, handler)
    }

    /// Like `on`, for a listener that answers acknowledgement requests.
    pub(crate) fn on_acking(&mut self, key: K, handler: Handler<A>) -> ListenerId {
        self.add(Some(key), false, true, handler)
    }

    pub(crate) fn on_any(&mut self, handler: Handler<A>) -> ListenerId {
        self.add(None, false, false, handler)
    }

    fn add(&mut self, key: Option<K>, once: bool, acks: bool, handler: Handler<A>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push(Listener {
            id,
            key,
            once,
            acks,
            handler: Arc::new(Mutex::new(handler)),
        });
        id
    }

    /// Removes one listener, returns whether it was registered.
    pub(crate) fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        self.listeners.len() != before
    }

    pub(crate) fn off_key(&mut self, key: &K) {
        self.listeners
            .retain(|listener| listener.key.as_ref() != Some(key));
    }

    pub(crate) fn off_any(&mut self) {
        self.listeners.retain(|listener| listener.key.is_some());
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }

    pub(crate) fn has_listeners(&self, key: &K) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.key.as_ref() == Some(key))
    }

    /// Whether a listener of `key` answers acknowledgement requests.
    pub(crate) fn acks(&self, key: &K) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.acks && listener.key.as_ref() == Some(key))
    }

    /// The handlers an emit of `key` reaches, catch-all listeners first when
    /// `include_any` is set. Listeners added with `once` are removed.
    pub(crate) fn take(&mut self, key: &K, include_any: bool) -> Vec<SharedHandler<A>> {
        let mut any = Vec::new();
        let mut keyed = Vec::new();
        self.listeners.retain(|listener| match &listener.key {
            None if include_any => {
                any.push(listener.handler.clone());
                true
            }
            Some(k) if k == key => {
                keyed.push(listener.handler.clone());
                !listener.once
            }
            _ => true,
        });
        any.extend(keyed);
        any
    }
}

/// Calls `handlers` one after another with `arg`.
pub(crate) fn deliver<A: Clone + Send + 'static>(
    handlers: Vec<SharedHandler<A>>,
    arg: A,
) -> BoxFuture<'static, ()> {
    async move {
        for handler in handlers {
            let future = {
                let mut handler = lock(&handler);
                (handler)(arg.clone())
            };
            future.await;
        }
    }
    .boxed()
}

/// Runs listener futures in order on a task of their own, so that a slow
/// listener never holds up the protocol.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: UnboundedSender<BoxFuture<'static, ()>>,
}

impl Dispatcher {
    /// Must be called from within a tokio runtime. The task ends with the
    /// last clone.
    pub(crate) fn spawn() -> Self {
        let (tx, mut rx) = unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(future) = rx.recv().await {
                future.await;
            }
        });
        Dispatcher { tx }
    }

    pub(crate) fn dispatch(&self, future: BoxFuture<'static, ()>) {
        let _ = self.tx.send(future);
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("Dispatcher")
    }
}
