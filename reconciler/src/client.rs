use crate::error::DataplaneError;

/// The lifecycle of a lazily-opened dataplane client (spec.md §9): unopened,
/// open and usable, or stuck sticky-unsupported until the next resync.
#[derive(Debug)]
enum ClientState<T> {
    Unopened,
    Open(T),
    Unsupported,
}

/// Owns one client's open/rebuild lifecycle (C6). Generic over the client
/// type and the fallible factory that opens it, so the same logic drives
/// both the netlink client and the wireguard-config client.
pub struct ClientManager<T, F>
where
    F: FnMut() -> Result<T, DataplaneError>,
{
    state: ClientState<T>,
    open: F,
    rebuild_count: u64,
}

impl<T, F> ClientManager<T, F>
where
    F: FnMut() -> Result<T, DataplaneError>,
{
    pub fn new(open: F) -> Self {
        Self {
            state: ClientState::Unopened,
            open,
            rebuild_count: 0,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self.state, ClientState::Unsupported)
    }

    /// Marks the client dead after a failing call; the next `ensure_open`
    /// rebuilds it.
    pub fn mark_dead(&mut self) {
        if matches!(self.state, ClientState::Open(_)) {
            self.state = ClientState::Unopened;
        }
    }

    /// Clears a sticky UNSUPPORTED verdict so the next `ensure_open` retries
    /// opening the client. Called when `QueueResync` fires.
    pub fn invalidate_unsupported(&mut self) {
        if matches!(self.state, ClientState::Unsupported) {
            self.state = ClientState::Unopened;
        }
    }

    /// Forces the sticky UNSUPPORTED verdict directly, for calls other than
    /// opening the client that can themselves return NOT_SUPPORTED (e.g.
    /// link-add, spec.md §6).
    pub fn mark_unsupported(&mut self) {
        self.state = ClientState::Unsupported;
    }

    /// Number of times this client has been (re)opened successfully.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    /// Ensures a client is open, (re)opening it if necessary. Returns
    /// `Ok(None)` if the client is sticky-unsupported rather than an error,
    /// per spec.md §4.5/§7: NOT_SUPPORTED is not an error class at the Apply
    /// boundary.
    pub fn ensure_open(&mut self) -> Result<Option<&mut T>, DataplaneError> {
        if matches!(self.state, ClientState::Unsupported) {
            return Ok(None);
        }
        if matches!(self.state, ClientState::Unopened) {
            match (self.open)() {
                Ok(client) => {
                    self.state = ClientState::Open(client);
                    self.rebuild_count += 1;
                },
                Err(e) if e.is_not_supported() => {
                    self.state = ClientState::Unsupported;
                    return Ok(None);
                },
                Err(e) => return Err(e),
            }
        }
        match &mut self.state {
            ClientState::Open(client) => Ok(Some(client)),
            _ => unreachable!("client state must be Open after a successful ensure_open"),
        }
    }
}
