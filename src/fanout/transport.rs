use crate::envelope::Envelope;
use crate::Error;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Moves envelopes to the relay.
///
/// Implementations return [`Error::Transport`] for connectivity problems so
/// the coordinator retries them; any other error fails the entry for good.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, envelope: &Envelope) -> Result<(), Error>;
}

/// In-process transport that collects accepted envelopes.
///
/// Can be switched offline to simulate degraded connectivity.
#[derive(Debug)]
pub struct MemoryTransport {
    online: AtomicBool,
    sent: Mutex<Vec<Envelope>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Removes and returns everything accepted so far.
    pub fn take_sent(&self) -> Result<Vec<Envelope>, Error> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| Error::Transport("outbox lock poisoned".to_string()))?;
        Ok(std::mem::take(&mut *sent))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), Error> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Transport("relay unreachable".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| Error::Transport("outbox lock poisoned".to_string()))?
            .push(envelope.clone());
        Ok(())
    }
}
