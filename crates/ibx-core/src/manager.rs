//! The inbox manager: registration, coordinated start/stop, lifecycle
//! hooks.
//!
//! All configuration errors (invalid options, duplicate inboxes, handler /
//! delivery-mode mismatches) surface while the manager is being built.
//! After `build` the registry, options, and dispatch tables are immutable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleanup::{CleanupKind, CleanupOptions, CleanupTask};
use crate::error::{InboxError, Result};
use crate::handler::{HandleBatched, HandleFifoBatched, HandleSingle, HandlerKind};
use crate::health::HealthThresholds;
use crate::inbox::{Inbox, InboxShared};
use crate::options::{validate_inbox_name, DeliveryMode, InboxOptions};
use crate::processing::ProcessingLoop;
use crate::provider::StorageProvider;
use crate::registry::{InboxMessage, MessageTypeRegistry};
use crate::strategies::{self, DeliveryStrategy};

/// Start/stop observer invoked by the manager. `on_start` errors abort the
/// start and roll it back; `on_stop` errors are logged and swallowed.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> String;

    async fn on_start(self: Arc<Self>, stopping: CancellationToken) -> anyhow::Result<()>;

    async fn on_stop(self: Arc<Self>) -> anyhow::Result<()>;
}

/// Configuration of one inbox while the manager is being built.
pub struct InboxConfig {
    name: String,
    provider: Arc<dyn StorageProvider>,
    options: InboxOptions,
    handlers: HashMap<String, HandlerKind>,
    message_types: Vec<&'static str>,
    health_thresholds: HealthThresholds,
}

impl InboxConfig {
    fn register(&mut self, message_type: &'static str, kind: HandlerKind) -> Result<()> {
        if self.handlers.contains_key(message_type) {
            return Err(InboxError::Config(format!(
                "inbox '{}' already has a handler for message type '{message_type}'",
                self.name
            )));
        }
        self.message_types.push(message_type);
        self.handlers.insert(message_type.to_string(), kind);
        Ok(())
    }

    fn require_mode(&self, expected: DeliveryMode, shape: &str) -> Result<()> {
        if self.options.delivery_mode != expected {
            return Err(InboxError::Config(format!(
                "inbox '{}' delivers {:?}; {shape} handlers require {:?}",
                self.name, self.options.delivery_mode, expected
            )));
        }
        Ok(())
    }

    /// Register a payload type for writing without attaching a handler.
    pub fn message_type<T: InboxMessage>(&mut self) -> Result<&mut Self> {
        self.message_types.push(T::MESSAGE_TYPE);
        Ok(self)
    }

    pub fn handle_single<T, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        T: InboxMessage,
        H: HandleSingle<T> + 'static,
    {
        self.require_mode(DeliveryMode::Default, "single")?;
        self.register(T::MESSAGE_TYPE, HandlerKind::single::<T, _>(handler))?;
        Ok(self)
    }

    pub fn handle_batched<T, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        T: InboxMessage,
        H: HandleBatched<T> + 'static,
    {
        self.require_mode(DeliveryMode::Batched, "batched")?;
        self.register(T::MESSAGE_TYPE, HandlerKind::batched::<T, _>(handler))?;
        Ok(self)
    }

    pub fn handle_fifo<T, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        T: InboxMessage,
        H: HandleSingle<T> + 'static,
    {
        self.require_mode(DeliveryMode::Fifo, "fifo")?;
        self.register(T::MESSAGE_TYPE, HandlerKind::fifo_single::<T, _>(handler))?;
        Ok(self)
    }

    pub fn handle_fifo_batched<T, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        T: InboxMessage,
        H: HandleFifoBatched<T> + 'static,
    {
        self.require_mode(DeliveryMode::FifoBatched, "fifo-batched")?;
        self.register(T::MESSAGE_TYPE, HandlerKind::fifo_batched::<T, _>(handler))?;
        Ok(self)
    }

    pub fn health_thresholds(&mut self, thresholds: HealthThresholds) -> &mut Self {
        self.health_thresholds = thresholds;
        self
    }
}

pub struct InboxManagerBuilder {
    inboxes: Vec<InboxConfig>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    cleanup: CleanupOptions,
}

impl Default for InboxManagerBuilder {
    fn default() -> Self {
        Self {
            inboxes: Vec::new(),
            hooks: Vec::new(),
            cleanup: CleanupOptions::default(),
        }
    }
}

impl InboxManagerBuilder {
    /// Add an inbox backed by `provider`. Returns the inbox's configuration
    /// handle for registering handlers.
    pub fn add_inbox(
        &mut self,
        name: &str,
        provider: Arc<dyn StorageProvider>,
        options: InboxOptions,
    ) -> Result<&mut InboxConfig> {
        validate_inbox_name(name)?;
        options.validate()?;
        if self.inboxes.iter().any(|i| i.name == name) {
            return Err(InboxError::Config(format!("inbox '{name}' is already registered")));
        }
        self.inboxes.push(InboxConfig {
            name: name.to_string(),
            provider,
            options,
            handlers: HashMap::new(),
            message_types: Vec::new(),
            health_thresholds: HealthThresholds::default(),
        });
        Ok(self.inboxes.last_mut().expect("just pushed"))
    }

    pub fn add_hook(&mut self, hook: Arc<dyn LifecycleHook>) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    pub fn cleanup_options(&mut self, options: CleanupOptions) -> &mut Self {
        self.cleanup = options;
        self
    }

    pub fn build(self) -> Result<InboxManager> {
        let mut registry = MessageTypeRegistry::new();
        let mut inboxes = HashMap::new();
        let mut specs = Vec::new();
        let mut hooks = self.hooks;

        for config in self.inboxes {
            for message_type in &config.message_types {
                registry.register(*message_type, &config.name)?;
            }

            let options = Arc::new(config.options);
            let shared = Arc::new(InboxShared {
                name: config.name.clone(),
                options: Arc::clone(&options),
                provider: config.provider,
                handlers: config.handlers,
                health_thresholds: config.health_thresholds,
            });

            // Cleanup runs per enabled concern; a zero dead-letter lifetime
            // means keep forever.
            if options.enable_deduplication {
                hooks.push(CleanupTask::new(
                    config.name.clone(),
                    CleanupKind::ExpiredDeduplications,
                    Arc::clone(&shared.provider),
                    Arc::clone(&options),
                    self.cleanup.clone(),
                ));
            }
            if options.delivery_mode.is_fifo() {
                hooks.push(CleanupTask::new(
                    config.name.clone(),
                    CleanupKind::ExpiredGroupLocks,
                    Arc::clone(&shared.provider),
                    Arc::clone(&options),
                    self.cleanup.clone(),
                ));
            }
            if options.enable_dead_letter && !options.dead_letter_max_message_lifetime.is_zero() {
                hooks.push(CleanupTask::new(
                    config.name.clone(),
                    CleanupKind::ExpiredDeadLetters,
                    Arc::clone(&shared.provider),
                    Arc::clone(&options),
                    self.cleanup.clone(),
                ));
            }

            // Loops exist only for inboxes with at least one handler; pure
            // write-side inboxes still appear in the registry and health
            // enumeration.
            if !shared.handlers.is_empty() {
                let strategy = strategies::for_mode(options.delivery_mode);
                specs.push(LoopSpec {
                    shared: Arc::clone(&shared),
                    strategy,
                });
            }

            inboxes.insert(config.name.clone(), Inbox { shared });
        }

        Ok(InboxManager {
            inner: Arc::new(ManagerInner {
                inboxes,
                registry,
                specs,
                hooks,
                lifecycle: tokio::sync::Mutex::new(LifecycleState {
                    running: false,
                    active_loops: Vec::new(),
                    stopping: CancellationToken::new(),
                }),
            }),
        })
    }
}

struct LoopSpec {
    shared: Arc<InboxShared>,
    strategy: Arc<dyn DeliveryStrategy>,
}

struct LifecycleState {
    running: bool,
    active_loops: Vec<Arc<ProcessingLoop>>,
    /// Lifecycle-wide stopping token observed by hooks and cleanup tasks.
    stopping: CancellationToken,
}

struct ManagerInner {
    inboxes: HashMap<String, Inbox>,
    registry: MessageTypeRegistry,
    specs: Vec<LoopSpec>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    /// Serializes start against stop.
    lifecycle: tokio::sync::Mutex<LifecycleState>,
}

/// Owns all inboxes and their processing loops.
#[derive(Clone)]
pub struct InboxManager {
    inner: Arc<ManagerInner>,
}

impl InboxManager {
    pub fn builder() -> InboxManagerBuilder {
        InboxManagerBuilder::default()
    }

    pub fn inbox(&self, name: &str) -> Result<&Inbox> {
        self.inner
            .inboxes
            .get(name)
            .ok_or_else(|| InboxError::InboxNotFound(name.to_string()))
    }

    pub fn inboxes(&self) -> impl Iterator<Item = &Inbox> {
        self.inner.inboxes.values()
    }

    /// Write a message to its registered default inbox.
    pub async fn write<T: InboxMessage>(&self, value: &T) -> Result<()> {
        let name = self.default_inbox_for::<T>()?;
        self.inbox(&name)?.writer().write(value).await
    }

    pub async fn write_to<T: InboxMessage>(&self, inbox: &str, value: &T) -> Result<()> {
        self.inbox(inbox)?.writer().write(value).await
    }

    /// Write a batch to its registered default inbox. Empty batches are a
    /// silent no-op.
    pub async fn write_batch<T: InboxMessage>(&self, values: &[T]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let name = self.default_inbox_for::<T>()?;
        self.inbox(&name)?.writer().write_batch(values).await
    }

    pub async fn write_batch_to<T: InboxMessage>(&self, inbox: &str, values: &[T]) -> Result<()> {
        self.inbox(inbox)?.writer().write_batch(values).await
    }

    fn default_inbox_for<T: InboxMessage>(&self) -> Result<String> {
        Ok(self.inner.registry.default_inbox_for(T::MESSAGE_TYPE)?.to_string())
    }

    /// Run provider migrations for every inbox.
    pub async fn migrate(&self) -> Result<()> {
        for inbox in self.inner.inboxes.values() {
            inbox
                .provider()
                .migrate()
                .await
                .map_err(InboxError::Storage)?;
        }
        Ok(())
    }

    /// Idempotent. Starts every processing loop, then fires `on_start` on
    /// all hooks concurrently. A failing hook rolls the start back and the
    /// error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.lifecycle.lock().await;
        if state.running {
            return Ok(());
        }

        info!(inboxes = self.inner.inboxes.len(), loops = self.inner.specs.len(), "starting inbox manager");

        let stopping = CancellationToken::new();
        let loops: Vec<Arc<ProcessingLoop>> = self
            .inner
            .specs
            .iter()
            .map(|spec| {
                ProcessingLoop::new(
                    Arc::clone(&spec.shared),
                    Arc::clone(&spec.strategy),
                    stopping.child_token(),
                )
            })
            .collect();
        for processing_loop in &loops {
            processing_loop.start();
        }

        let hook_results = join_all(self.inner.hooks.iter().map(|hook| {
            let hook = Arc::clone(hook);
            let stopping = stopping.child_token();
            async move {
                let name = hook.name();
                (name, Arc::clone(&hook).on_start(stopping).await)
            }
        }))
        .await;

        let mut first_error = None;
        for (name, result) in hook_results {
            if let Err(err) = result {
                error!(hook = %name, error = %format!("{err:#}"), "lifecycle hook failed to start");
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            // Roll back: cancel, stop loops, stop hooks, stay not-running.
            stopping.cancel();
            join_all(loops.iter().map(|l| l.stop())).await;
            self.stop_hooks().await;
            return Err(InboxError::Storage(err.context("lifecycle hook failed to start")));
        }

        state.running = true;
        state.active_loops = loops;
        state.stopping = stopping;
        Ok(())
    }

    /// Idempotent. Cancels the lifecycle token, drains every loop (each
    /// bounded by its `shutdown_timeout`), then fires `on_stop` on hooks.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.lifecycle.lock().await;
        if !state.running {
            return Ok(());
        }

        info!("stopping inbox manager");

        state.stopping.cancel();
        let loops = std::mem::take(&mut state.active_loops);
        join_all(loops.iter().map(|l| l.stop())).await;

        self.stop_hooks().await;
        state.running = false;
        Ok(())
    }

    async fn stop_hooks(&self) {
        let results = join_all(self.inner.hooks.iter().map(|hook| {
            let hook = Arc::clone(hook);
            async move {
                let name = hook.name();
                (name, hook.on_stop().await)
            }
        }))
        .await;

        for (name, result) in results {
            if let Err(err) = result {
                warn!(hook = %name, error = %format!("{err:#}"), "lifecycle hook failed to stop");
            }
        }
    }
}
