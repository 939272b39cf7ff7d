use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::info;

pub trait ConnectivityGate: Send + Sync {
    fn is_link_up(&self) -> bool;
}

impl<G: ConnectivityGate + ?Sized> ConnectivityGate for Arc<G> {
    fn is_link_up(&self) -> bool {
        (**self).is_link_up()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkState {
    up: Arc<AtomicBool>,
}

impl LinkState {
    pub fn new(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
        }
    }

    pub fn set(&self, up: bool) {
        let previous = self.up.swap(up, Ordering::AcqRel);
        if previous != up {
            info!("network link {}", if up { "up" } else { "down" });
        }
    }
}

impl ConnectivityGate for LinkState {
    fn is_link_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }
}
