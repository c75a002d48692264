//! Persistence abstraction
//!
//! The core never touches the filesystem directly; router descriptors and
//! peer profiles go through this trait. The in-memory implementation backs
//! the tests; embedders provide a real one.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

pub trait Storage: Send + Sync {
    /// Human-readable location, for logs
    fn path(&self) -> String;

    fn save(&self, name: &str, bytes: &[u8]) -> io::Result<()>;

    fn load(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    fn remove(&self, name: &str) -> io::Result<()>;

    /// Names of every stored entry
    fn iterate(&self) -> io::Result<Vec<String>>;
}

/// In-memory storage for tests and ephemeral routers
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn path(&self) -> String {
        ":memory:".to_string()
    }

    fn save(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.entries
            .lock()
            .expect("storage lock")
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().expect("storage lock").get(name).cloned())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.entries.lock().expect("storage lock").remove(name);
        Ok(())
    }

    fn iterate(&self) -> io::Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .expect("storage lock")
            .keys()
            .cloned()
            .collect())
    }
}
