//! In-process loopback backend.
//!
//! Nothing leaves the process. Descriptions are small JSON documents: the
//! offer names the engine that produced it, and a valid answer must point back
//! at that offer. A [`LoopbackControl`] shared with the provider lets callers
//! script delays and failures and inject events, which makes this backend the
//! test double for the facade as well as the engine behind
//! `rover-call loopback`.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{MediaConstraints, SessionConfig};
use crate::engine::{
    Backend, EngineError, EngineEvent, EngineProvider, TransportEngine, TransportStats,
};
use crate::model::control::ControlMessage;
use crate::model::description::{LocalDescription, RemoteDescription};

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackOffer {
    offer: u64,
    audio: bool,
    video: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackAnswer {
    #[serde(rename = "type")]
    kind: String,
    offer: u64,
    /// Makes negotiation fail fatally with this reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fail: Option<String>,
}

/// Builds an answer the loopback engine that produced `offer` will accept.
pub fn answer_for(offer: &LocalDescription) -> Result<RemoteDescription, EngineError> {
    let offer: LoopbackOffer = serde_json::from_str(offer.as_str())
        .map_err(|e| EngineError::MalformedDescription(e.to_string()))?;
    let answer = LoopbackAnswer {
        kind: "answer".into(),
        offer: offer.offer,
        fail: None,
    };
    Ok(RemoteDescription::new(json(&answer)))
}

/// Builds an answer that makes negotiation fail with a transport error.
pub fn failing_answer_for(
    offer: &LocalDescription,
    reason: &str,
) -> Result<RemoteDescription, EngineError> {
    let offer: LoopbackOffer = serde_json::from_str(offer.as_str())
        .map_err(|e| EngineError::MalformedDescription(e.to_string()))?;
    let answer = LoopbackAnswer {
        kind: "answer".into(),
        offer: offer.offer,
        fail: Some(reason.to_string()),
    };
    Ok(RemoteDescription::new(json(&answer)))
}

fn json<T: Serialize>(value: &T) -> String {
    // Plain structs of strings, integers and bools always serialize.
    serde_json::to_string(value).unwrap_or_default()
}

#[derive(Debug, Default)]
struct Script {
    offer_delay: Option<Duration>,
    negotiation_delay: Option<Duration>,
    refuse_create: Option<String>,
    created: u64,
    released: u64,
    sent: Vec<ControlMessage>,
    event_senders: Vec<mpsc::UnboundedSender<EngineEvent>>,
}

/// Shared handle for scripting and observing loopback engines.
#[derive(Debug, Clone, Default)]
pub struct LoopbackControl {
    script: Arc<Mutex<Script>>,
}

impl LoopbackControl {
    fn script(&self) -> MutexGuard<'_, Script> {
        // A poisoned script only means a test panicked mid-update.
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every following `create_offer` waits this long before completing.
    pub fn set_offer_delay(&self, delay: Option<Duration>) {
        self.script().offer_delay = delay;
    }

    /// Every following `negotiate` waits this long before completing.
    pub fn set_negotiation_delay(&self, delay: Option<Duration>) {
        self.script().negotiation_delay = delay;
    }

    /// Makes the provider refuse to create engines.
    pub fn refuse_create(&self, reason: Option<&str>) {
        self.script().refuse_create = reason.map(str::to_string);
    }

    /// Sends `event` to every live engine.
    pub fn emit(&self, event: EngineEvent) {
        self.script()
            .event_senders
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn engines_created(&self) -> u64 {
        self.script().created
    }

    pub fn engines_released(&self) -> u64 {
        self.script().released
    }

    /// Control messages delivered so far, in order.
    pub fn sent(&self) -> Vec<ControlMessage> {
        self.script().sent.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackProvider {
    control: LoopbackControl,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }
}

#[async_trait]
impl EngineProvider for LoopbackProvider {
    fn backend(&self) -> Backend {
        Backend::Loopback
    }

    async fn create(&self, config: &SessionConfig) -> Result<Box<dyn TransportEngine>, EngineError> {
        let (serial, events_tx, events_rx) = {
            let mut script = self.control.script();
            if let Some(reason) = &script.refuse_create {
                return Err(EngineError::Configuration(reason.clone()));
            }
            script.created += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            script.event_senders.push(tx.clone());
            (script.created, tx, rx)
        };

        debug!("Loopback engine {} created", serial);

        Ok(Box::new(LoopbackEngine {
            serial,
            media: config.media_constraints,
            control: self.control.clone(),
            connected: false,
            released: false,
            stats: TransportStats::default(),
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
        }))
    }
}

#[derive(Debug)]
pub struct LoopbackEngine {
    serial: u64,
    media: MediaConstraints,
    control: LoopbackControl,
    connected: bool,
    released: bool,
    stats: TransportStats,
    events_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

#[async_trait]
impl TransportEngine for LoopbackEngine {
    async fn create_offer(&mut self) -> Result<LocalDescription, EngineError> {
        if self.released {
            return Err(EngineError::Released);
        }

        let delay = self.control.script().offer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let offer = LoopbackOffer {
            offer: self.serial,
            audio: self.media.audio,
            video: self.media.video,
        };
        Ok(LocalDescription::new(json(&offer)))
    }

    async fn negotiate(&mut self, remote: &RemoteDescription) -> Result<(), EngineError> {
        if self.released {
            return Err(EngineError::Released);
        }

        let answer: LoopbackAnswer = serde_json::from_str(remote.as_str())
            .map_err(|e| EngineError::MalformedDescription(e.to_string()))?;
        if answer.kind != "answer" {
            return Err(EngineError::MalformedDescription(format!(
                "expected an answer, got '{}'",
                answer.kind
            )));
        }
        if answer.offer != self.serial {
            return Err(EngineError::MalformedDescription(format!(
                "answer is for offer {}, not {}",
                answer.offer, self.serial
            )));
        }

        let delay = self.control.script().negotiation_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = answer.fail {
            return Err(EngineError::Fatal(reason));
        }

        self.connected = true;
        info!("Loopback engine {} connected", self.serial);
        Ok(())
    }

    fn cancel_negotiation(&mut self) {
        debug!("Loopback engine {} negotiation cancelled", self.serial);
    }

    async fn send_control(&mut self, message: ControlMessage) -> Result<(), EngineError> {
        if self.released {
            return Err(EngineError::Released);
        }
        if !self.connected {
            return Err(EngineError::Fatal("not connected".into()));
        }
        self.stats.packets_sent += 1;
        self.control.script().sent.push(message);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.take()
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.connected = false;
        // Dropping our sender lets the event stream end once the script's
        // copy goes too.
        if let Some(tx) = self.events_tx.take() {
            self.control
                .script()
                .event_senders
                .retain(|other| !other.same_channel(&tx));
        }
        self.control.script().released += 1;
        debug!("Loopback engine {} released", self.serial);
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_must_match_offer() {
        let provider = LoopbackProvider::new();
        let config = SessionConfig::with_servers(["stun:example"]);
        let mut first = provider.create(&config).await.unwrap();
        let mut second = provider.create(&config).await.unwrap();

        let offer = first.create_offer().await.unwrap();
        let answer = answer_for(&offer).unwrap();

        assert!(matches!(
            second.negotiate(&answer).await,
            Err(EngineError::MalformedDescription(_))
        ));
        first.negotiate(&answer).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_counted_once() {
        let provider = LoopbackProvider::new();
        let control = provider.control();
        let mut engine = provider
            .create(&SessionConfig::with_servers(["stun:example"]))
            .await
            .unwrap();

        engine.release();
        engine.release();
        assert!(engine.is_released());
        assert_eq!(control.engines_released(), 1);
    }

    #[tokio::test]
    async fn events_end_after_release() {
        let provider = LoopbackProvider::new();
        let mut engine = provider
            .create(&SessionConfig::with_servers(["stun:example"]))
            .await
            .unwrap();
        let mut events = engine.take_events().unwrap();
        assert!(engine.take_events().is_none());

        provider.control().emit(EngineEvent::Disconnected);
        assert_eq!(events.recv().await, Some(EngineEvent::Disconnected));

        engine.release();
        assert_eq!(events.recv().await, None);
    }
}
