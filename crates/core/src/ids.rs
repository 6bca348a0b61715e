use gridserve_models::{Id, IdGenerator};
use std::sync::Mutex;

/// IdSource is the one process-wide mutable singleton this crate allows
/// (alongside the connection pool), per §9's "global mutable state" note: it
/// is an explicit capability threaded into every operation that mints a new
/// [`Id`], never ambient global state.
pub struct IdSource(Mutex<IdGenerator>);

impl IdSource {
    pub fn new(shard: u16) -> Self {
        Self(Mutex::new(IdGenerator::new(shard)))
    }

    pub fn next(&self) -> Id {
        self.0
            .lock()
            .expect("id generator mutex poisoned")
            .next()
    }
}
