use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::emitter::lock;
use crate::error::{Error, Result};
use crate::manager::{Manager, ManagerOptions};
use crate::socket::{Socket, SocketOptions};

/// Options of [`ManagerRegistry::socket`].
#[derive(Debug, Clone)]
pub struct LookupOptions {
    /// Always create a new manager.
    pub force_new: bool,
    /// Share one manager between the namespaces of a server.
    pub multiplex: bool,
    /// Used when a manager is created.
    pub manager: ManagerOptions,
    pub socket: SocketOptions,
}

impl Default for LookupOptions {
    fn default() -> Self {
        LookupOptions {
            force_new: false,
            multiplex: true,
            manager: ManagerOptions::default(),
            socket: SocketOptions::default(),
        }
    }
}

/// Hands out sockets by url, sharing one [`Manager`] per server. The path of
/// the url names the namespace.
///
/// A second socket for a namespace that already has one gets a manager of its
/// own, as do lookups with `force_new` or without `multiplex`. Those managers
/// are not cached.
#[derive(Debug, Default)]
pub struct ManagerRegistry {
    managers: Mutex<HashMap<String, Manager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket<T: AsRef<str>>(&self, uri: T, options: LookupOptions) -> Result<Socket> {
        let url = Url::parse(uri.as_ref())?;
        let key = cache_key(&url, &options.manager.engine.path)?;
        let nsp = match url.path() {
            "" => "/",
            path => path,
        };

        let mut managers = lock(&self.managers);
        let same_namespace = managers
            .get(&key)
            .is_some_and(|manager| manager.has_socket(nsp));
        let manager = if options.force_new || !options.multiplex || same_namespace {
            debug!("creating a new manager for {url}");
            Manager::new(url.as_str(), options.manager)?
        } else {
            match managers.get(&key) {
                Some(manager) => manager.clone(),
                None => {
                    debug!("creating a cached manager for {key}");
                    let manager = Manager::new(url.as_str(), options.manager)?;
                    managers.insert(key, manager.clone());
                    manager
                }
            }
        };
        drop(managers);

        manager.socket_with_options(nsp, options.socket)
    }

    /// Number of cached managers.
    pub fn len(&self) -> usize {
        lock(&self.managers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and forgets every cached manager.
    pub fn clear(&self) {
        for (_, manager) in lock(&self.managers).drain() {
            let _ = manager.disconnect();
        }
    }
}

fn cache_key(url: &Url, path: &str) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidUrlScheme(url.scheme().to_owned()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidUrlScheme(url.scheme().to_owned()))?;
    Ok(format!("{}://{host}:{port}{path}", url.scheme()))
}

#[cfg(test)]
mod test {
    use super::*;
    use engineio_client::testing::MockTransportFactory;
    use std::sync::Arc;

    fn options(factory: &MockTransportFactory) -> LookupOptions {
        let mut options = LookupOptions::default();
        options.manager.engine.transport_factory = Arc::new(factory.clone());
        options.manager.engine.upgrade = false;
        options
    }

    #[test]
    fn cache_keys_ignore_the_namespace() -> Result<()> {
        let a = cache_key(&Url::parse("http://localhost/chat")?, "/socket.io")?;
        let b = cache_key(&Url::parse("http://localhost:80/admin")?, "/socket.io")?;
        let c = cache_key(&Url::parse("https://localhost/chat")?, "/socket.io")?;
        assert_eq!(a, "http://localhost:80/socket.io");
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[tokio::test]
    async fn namespaces_share_a_manager() -> Result<()> {
        let (factory, _server) = MockTransportFactory::paired();
        let registry = ManagerRegistry::new();

        let chat = registry.socket("http://localhost:4200/chat", options(&factory))?;
        let admin = registry.socket("http://localhost:4200/admin", options(&factory))?;
        assert_eq!(registry.len(), 1);
        assert_eq!(chat.nsp(), "/chat");
        assert_eq!(admin.nsp(), "/admin");
        assert!(admin.io().has_socket("/chat"));

        let root = registry.socket("http://localhost:4200", options(&factory))?;
        assert_eq!(root.nsp(), "/");
        assert!(chat.io().has_socket("/"));
        Ok(())
    }

    #[tokio::test]
    async fn same_namespace_gets_a_new_manager() -> Result<()> {
        let (factory, _server) = MockTransportFactory::paired();
        let registry = ManagerRegistry::new();

        let first = registry.socket("http://localhost:4200/chat", options(&factory))?;
        let second = registry.socket("http://localhost:4200/chat", options(&factory))?;
        assert_eq!(registry.len(), 1);
        first.io().socket("/admin")?;
        assert!(second.io().has_socket("/chat"));
        assert!(!second.io().has_socket("/admin"));

        let mut forced = options(&factory);
        forced.force_new = true;
        let third = registry.socket("http://localhost:4200/other", forced)?;
        assert!(!first.io().has_socket("/other"));
        assert!(third.io().has_socket("/other"));

        let mut single = options(&factory);
        single.multiplex = false;
        registry.socket("http://localhost:4200/news", single)?;
        assert!(!first.io().has_socket("/news"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        Ok(())
    }
}
