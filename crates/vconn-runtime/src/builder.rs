//! Messenger Builder API
//!
//! Builder-style construction for consumers (CLI, harness tests) that want to
//! register dispatchers before the reset worker starts.

use crate::dispatch::{Dispatcher, Position};
use crate::messenger::VirtualMessenger;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vconn_core::{MessengerConfig, OwnerKey, PhysicalTransport, VconnResult};

/// Builder for a `VirtualMessenger`
pub struct MessengerBuilder {
    transport: Arc<dyn PhysicalTransport>,
    config: MessengerConfig,
    dispatchers: Vec<(OwnerKey, Arc<dyn Dispatcher>, Position)>,
}

impl MessengerBuilder {
    pub fn new(transport: Arc<dyn PhysicalTransport>) -> Self {
        Self {
            transport,
            config: MessengerConfig::default(),
            dispatchers: Vec::new(),
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Answer bad credentials with a rejecting Accept
    pub fn reject_invalid_authorizers(mut self, enabled: bool) -> Self {
        self.config.reject_invalid_authorizers = enabled;
        self
    }

    pub fn slow_dispatch_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_dispatch_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Register a dispatcher at the tail of `owner`'s lists
    pub fn dispatcher(mut self, owner: OwnerKey, handler: Arc<dyn Dispatcher>) -> Self {
        self.dispatchers.push((owner, handler, Position::Tail));
        self
    }

    pub fn dispatcher_at(
        mut self,
        owner: OwnerKey,
        handler: Arc<dyn Dispatcher>,
        position: Position,
    ) -> Self {
        self.dispatchers.push((owner, handler, position));
        self
    }

    /// Build without starting the reset worker
    pub fn build(self) -> VconnResult<VirtualMessenger> {
        let messenger = VirtualMessenger::new(self.transport, self.config)?;
        for (owner, handler, position) in self.dispatchers {
            messenger.add_dispatcher(handler, owner, position);
        }
        Ok(messenger)
    }

    /// Build and start on the current tokio runtime
    pub fn build_and_start(self) -> VconnResult<VirtualMessenger> {
        let messenger = self.build()?;
        messenger.start()?;
        info!(name = %messenger.config().name, local = %messenger.my_instance(), "virtual messenger started");
        Ok(messenger)
    }
}
