use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use crate::{FilesystemBackend, FsError};

/// Protocol assumed for request paths without a `proto://` qualifier.
pub const DEFAULT_PROTOCOL: &str = "file";

/// Backends are shared between the registry, the notification broker, and
/// in-flight connections; the whole server runs on one thread.
pub type SharedBackend = Rc<RefCell<dyn FilesystemBackend>>;

/// Protocol name → backend table.
#[derive(Default)]
pub struct BackendRegistry {
    backends: IndexMap<String, SharedBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, protocol: &str, backend: SharedBackend) {
        self.backends.insert(protocol.to_owned(), backend);
    }

    pub fn get(&self, protocol: &str) -> Option<SharedBackend> {
        self.backends.get(protocol).cloned()
    }

    /// Resolve a request path to its backend and backend-relative path.
    pub fn resolve<'p>(&self, path: &'p str) -> Result<(SharedBackend, &'p str), FsError> {
        let (protocol, rest) = split_protocol(path);
        self.get(protocol)
            .map(|backend| (backend, rest))
            .ok_or_else(|| FsError::UnknownProtocol(protocol.to_owned()))
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

/// Split `"assets://images/a.png"` into `("assets", "images/a.png")`;
/// unqualified paths fall back to [`DEFAULT_PROTOCOL`].
pub fn split_protocol(path: &str) -> (&str, &str) {
    match path.split_once("://") {
        Some((protocol, rest)) => (protocol, rest),
        None => (DEFAULT_PROTOCOL, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_and_bare_paths() {
        assert_eq!(split_protocol("assets://images/a.png"), ("assets", "images/a.png"));
        assert_eq!(split_protocol("a.txt"), (DEFAULT_PROTOCOL, "a.txt"));
        assert_eq!(split_protocol("dir/a.txt"), (DEFAULT_PROTOCOL, "dir/a.txt"));
    }
}
