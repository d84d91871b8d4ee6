use tokio::sync::watch;
use tracing::info;

/// Gate consulted before every network-touching call.
pub trait Connectivity {
    fn is_online(&self) -> bool;
}

/// What a call to [`ConnectivityMonitor::set_online`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
    Unchanged,
}

/// Connectivity flag fed by the host platform's network signal.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            state: watch::channel(online).0,
        }
    }

    pub fn set_online(&self, online: bool) -> Transition {
        let previous = self.state.send_replace(online);
        let transition = match (previous, online) {
            (false, true) => Transition::CameOnline,
            (true, false) => Transition::WentOffline,
            _ => Transition::Unchanged,
        };
        if transition != Transition::Unchanged {
            info!(online, "connectivity changed");
        }
        transition
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }
}

impl<C: Connectivity + ?Sized> Connectivity for &C {
    fn is_online(&self) -> bool {
        (**self).is_online()
    }
}
