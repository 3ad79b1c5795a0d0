use parking_lot::Mutex;
use std::sync::Arc;

/// État partagé entre tâches. Verrou synchrone : ne jamais le garder à travers un `.await`.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
