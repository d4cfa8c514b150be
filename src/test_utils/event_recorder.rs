use std::sync::Arc;

use parking_lot::Mutex;

use super::wait_until;
use crate::cache::CacheEvent;
use crate::cache::ListenerContainer;

/// Collects every event delivered to a cache listener
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl EventRecorder {
    pub fn attach(listeners: &ListenerContainer) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        listeners.add_listener(move |event| sink.lock().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Waits until at least `n` events were recorded and returns them all
    pub async fn wait_for(
        &self,
        n: usize,
    ) -> Vec<CacheEvent> {
        let events = self.events.clone();
        wait_until(move || events.lock().len() >= n).await;
        self.events()
    }

    /// Paths of the recorded node events of one kind, in order
    pub fn paths(
        &self,
        matches: impl Fn(&CacheEvent) -> bool,
    ) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches(e))
            .filter_map(|e| e.path().map(str::to_string))
            .collect()
    }
}
