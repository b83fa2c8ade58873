//! Process-wide hub holding the progress and interactive client slots

use super::messages::{ActionMessage, ActionResponse, ProgressMessage};
use crate::config::DeploySettings;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Which of the two singleton connections a client occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Server to client deployment progress
    Progress,
    /// Prompts and their answers
    Interactive,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Progress => "progress",
            Slot::Interactive => "interactive",
        }
    }
}

struct ClientHandle {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Prompt timing knobs
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub prompt_timeout: Duration,
    pub client_wait_retries: u32,
    pub client_wait_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&DeploySettings::default())
    }
}

impl From<&DeploySettings> for HubSettings {
    fn from(settings: &DeploySettings) -> Self {
        Self {
            prompt_timeout: Duration::from_secs(settings.prompt_timeout_secs),
            client_wait_retries: settings.client_wait_retries,
            client_wait_interval: Duration::from_millis(settings.client_wait_interval_ms),
        }
    }
}

type PendingAnswer = oneshot::Sender<HashMap<String, String>>;

/// Notification hub
///
/// Each slot holds at most one client. A client is just the sending half of its
/// socket's outbound queue, so the hub never touches the socket itself. Attaching
/// a new client to an occupied slot replaces the old one, whose writer then sees
/// its queue close and shuts the connection down. Prompts are answered one at a
/// time; a second `ask` waits until the first is settled.
pub struct NotificationHub {
    progress: Mutex<Option<ClientHandle>>,
    interactive: Mutex<Option<ClientHandle>>,
    pending: Mutex<HashMap<String, PendingAnswer>>,
    prompt_turn: AsyncMutex<()>,
    next_id: AtomicU64,
    settings: HubSettings,
}

impl NotificationHub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            progress: Mutex::new(None),
            interactive: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            prompt_turn: AsyncMutex::new(()),
            next_id: AtomicU64::new(1),
            settings,
        }
    }

    fn slot(&self, slot: Slot) -> &Mutex<Option<ClientHandle>> {
        match slot {
            Slot::Progress => &self.progress,
            Slot::Interactive => &self.interactive,
        }
    }

    /// Occupy a slot; returns the client id and its outbound message queue
    pub fn attach(&self, slot: Slot) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if self.slot(slot).lock().replace(ClientHandle { id, tx }).is_some() {
            info!(slot = slot.as_str(), client = id, "Replaced notification client");
        } else {
            info!(slot = slot.as_str(), client = id, "Notification client attached");
        }
        (id, rx)
    }

    /// Release a slot, but only if `id` still owns it
    pub fn detach(&self, slot: Slot, id: u64) {
        let mut guard = self.slot(slot).lock();
        if guard.as_ref().map(|c| c.id) != Some(id) {
            return;
        }
        *guard = None;
        drop(guard);

        if slot == Slot::Interactive {
            // Dropping the senders wakes every waiting prompt.
            self.pending.lock().clear();
        }
        info!(slot = slot.as_str(), client = id, "Notification client detached");
    }

    pub fn has_client(&self, slot: Slot) -> bool {
        self.slot(slot)
            .lock()
            .as_ref()
            .map(|c| !c.tx.is_closed())
            .unwrap_or(false)
    }

    /// Serialize and queue a message for a slot; false if nobody is listening
    pub fn send<T: Serialize>(&self, slot: Slot, message: &T) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode notification: {}", e);
                return false;
            }
        };

        match self.slot(slot).lock().as_ref() {
            Some(client) => client.tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Push a progress tick to the progress listener, if one is attached
    pub fn broadcast_progress(&self, progress: u8, message: &str) {
        debug!(progress, message, "Deployment progress");
        if !self.send(Slot::Progress, &ProgressMessage::new(progress, message)) {
            debug!("No progress listener attached");
        }
    }

    /// Ask the interactive client a question and wait for its answers
    pub async fn ask(&self, request: ActionMessage) -> Result<HashMap<String, String>> {
        let mut attempts = 0;
        while !self.has_client(Slot::Interactive) {
            if attempts >= self.settings.client_wait_retries {
                return Err(Error::NoInteractiveClient);
            }
            attempts += 1;
            debug!(attempt = attempts, "Waiting for an interactive client");
            tokio::time::sleep(self.settings.client_wait_interval).await;
        }

        let _turn = self.prompt_turn.lock().await;
        let action = request.action.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(action.clone(), tx);

        if !self.send(Slot::Interactive, &request) {
            self.pending.lock().remove(&action);
            return Err(Error::NoInteractiveClient);
        }
        info!(action = %action, "Prompt sent to interactive client");

        match tokio::time::timeout(self.settings.prompt_timeout, rx).await {
            Ok(Ok(answers)) => Ok(answers),
            Ok(Err(_)) => Err(Error::NoInteractiveClient),
            Err(_) => {
                self.pending.lock().remove(&action);
                Err(Error::PromptTimeout(action))
            }
        }
    }

    /// Route a text frame received from the interactive client
    pub fn handle_incoming(&self, text: &str) {
        let response: ActionResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring malformed client message: {}", e);
                return;
            }
        };

        if response.kind != "response" {
            debug!(kind = %response.kind, "Ignoring client message");
            return;
        }

        match self.pending.lock().remove(&response.action) {
            Some(waiter) => {
                let action = response.action.clone();
                if waiter.send(response.into_answers()).is_err() {
                    debug!(action = %action, "Prompt was abandoned before the answer arrived");
                }
            }
            None => warn!(action = %response.action, "Answer for unknown prompt"),
        }
    }
}
