use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::future::join_all;
use herald_core::{Message, Request};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConsumerState, MessagePump, PumpExit, Subscription};
use crate::error::DispatcherError;
use crate::processor::CommandProcessor;
use crate::traits::{Channel, ChannelFactory};

/// Lifecycle of a [`Dispatcher`].
///
/// State machine: Awaiting -> Running -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Subscriptions may be registered; nothing is consuming yet.
    Awaiting,
    /// `receive` has started the performers.
    Running,
    /// `end` has stopped every performer. Terminal.
    Stopped,
}

/// Snapshot of one performer for health and admin views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub subscription: String,
    pub state: ConsumerState,
}

// ---------------------------------------------------------------------------
// Performers
// ---------------------------------------------------------------------------

/// Starts a pump for one request type behind a type-erased handle.
trait PerformerLauncher: Send + Sync {
    fn launch(
        &self,
        processor: Arc<CommandProcessor>,
        channel: Arc<dyn Channel>,
        subscription: Arc<Subscription>,
        name: String,
    ) -> Performer;
}

struct TypedLauncher<R>(PhantomData<fn() -> R>);

impl<R: Request> PerformerLauncher for TypedLauncher<R> {
    fn launch(
        &self,
        processor: Arc<CommandProcessor>,
        channel: Arc<dyn Channel>,
        subscription: Arc<Subscription>,
        name: String,
    ) -> Performer {
        let pump = MessagePump::<R>::new(processor, channel, subscription, name.clone());
        let state = pump.state_handle();
        Performer {
            name,
            state,
            handle: Some(tokio::spawn(pump.run())),
        }
    }
}

struct Performer {
    name: String,
    state: Arc<ArcSwap<ConsumerState>>,
    handle: Option<JoinHandle<PumpExit>>,
}

impl Performer {
    fn is_running(&self) -> bool {
        **self.state.load() == ConsumerState::Running
    }
}

/// One subscription and the performers serving it.
struct Connection {
    subscription: Arc<Subscription>,
    launcher: Arc<dyn PerformerLauncher>,
    channel: Option<Arc<dyn Channel>>,
    performers: Vec<Performer>,
    target: usize,
    launched: usize,
}

impl Connection {
    fn running(&self) -> usize {
        self.performers.iter().filter(|p| p.is_running()).count()
    }

    fn prune_stopped(&mut self) {
        self.performers.retain(Performer::is_running);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns subscriptions and the performer loops consuming them.
///
/// Performers of one subscription compete on a single shared channel. Each is stopped by
/// putting a quit sentinel on that channel, so a performer finishes the message it is
/// handling before it exits.
pub struct Dispatcher {
    processor: Arc<CommandProcessor>,
    channels: Arc<dyn ChannelFactory>,
    connections: DashMap<String, Arc<Mutex<Connection>>>,
    state: Arc<ArcSwap<DispatcherState>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(processor: Arc<CommandProcessor>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self {
            processor,
            channels,
            connections: DashMap::new(),
            state: Arc::new(ArcSwap::from_pointee(DispatcherState::Awaiting)),
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        **self.state.load()
    }

    /// Registers a subscription whose messages map to `R`. Replaces an idle subscription
    /// with the same name; starts on the next [`receive`](Self::receive) or
    /// [`open`](Self::open).
    pub fn subscribe<R: Request>(&self, subscription: Subscription) {
        let name = subscription.name.clone();
        let target = subscription.no_of_performers;
        let connection = Connection {
            subscription: Arc::new(subscription),
            launcher: Arc::new(TypedLauncher::<R>(PhantomData)),
            channel: None,
            performers: Vec::new(),
            target,
            launched: 0,
        };
        debug!(subscription = %name, performers = target, "subscription registered");
        self.connections
            .insert(name, Arc::new(Mutex::new(connection)));
    }

    /// Starts every subscription's performers. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::Stopped`] after [`end`](Self::end), or a transport error
    /// if a channel cannot be created.
    pub fn receive(&self) -> Result<(), DispatcherError> {
        self.ensure_not_stopped()?;
        for name in self.subscription_names() {
            self.open(&name)?;
        }
        self.state.store(Arc::new(DispatcherState::Running));
        info!(subscriptions = self.connections.len(), "dispatcher running");
        Ok(())
    }

    /// Starts performers for one subscription until its target count is running.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::UnknownSubscription`], [`DispatcherError::Stopped`], or a
    /// transport error if the channel cannot be created.
    pub fn open(&self, name: &str) -> Result<(), DispatcherError> {
        self.ensure_not_stopped()?;
        let connection = self.connection(name)?;
        let mut conn = connection.lock();
        conn.prune_stopped();
        let missing = conn.target.saturating_sub(conn.running());
        self.launch(&mut conn, missing)?;
        Ok(())
    }

    /// Stops every performer of one subscription and waits for them to exit.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::UnknownSubscription`], or a transport error if a quit
    /// sentinel cannot be enqueued.
    pub async fn shut(&self, name: &str) -> Result<(), DispatcherError> {
        let connection = self.connection(name)?;
        let (channel, running, handles) = {
            let mut conn = connection.lock();
            let running = conn.running();
            let handles: Vec<_> = conn
                .performers
                .iter_mut()
                .filter_map(|p| p.handle.take())
                .collect();
            (conn.channel.clone(), running, handles)
        };

        if let Some(channel) = channel {
            for _ in 0..running {
                channel.enqueue(Message::quit()).await?;
            }
        }
        for exit in join_all(handles).await {
            match exit {
                Ok(exit) => debug!(subscription = name, ?exit, "performer joined"),
                Err(e) => warn!(subscription = name, error = %e, "performer task failed"),
            }
        }
        info!(subscription = name, stopped = running, "subscription shut");
        Ok(())
    }

    /// Changes how many performers serve a subscription. Extra performers are started at
    /// once; surplus ones are sent quit sentinels and awaited.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::UnknownSubscription`], [`DispatcherError::Stopped`], or a
    /// transport error.
    pub async fn set_active_performers(
        &self,
        name: &str,
        count: usize,
    ) -> Result<(), DispatcherError> {
        self.ensure_not_stopped()?;
        let connection = self.connection(name)?;
        let (channel, surplus) = {
            let mut conn = connection.lock();
            conn.target = count;
            conn.prune_stopped();
            let running = conn.running();
            if count > running {
                self.launch(&mut conn, count - running)?;
            }
            (conn.channel.clone(), running.saturating_sub(count))
        };

        if surplus > 0 {
            if let Some(channel) = channel {
                for _ in 0..surplus {
                    channel.enqueue(Message::quit()).await?;
                }
            }
            // Poll at 10ms intervals until the surplus performers have read their quits.
            while connection.lock().running() > count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            connection.lock().prune_stopped();
        }
        info!(subscription = name, performers = count, "performer count changed");
        Ok(())
    }

    /// Stops every subscription, closes the channels and moves to `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while shutting a subscription. Remaining subscriptions
    /// are still shut.
    pub async fn end(&self) -> Result<(), DispatcherError> {
        let mut first_error = None;
        for name in self.subscription_names() {
            if let Err(e) = self.shut(&name).await {
                warn!(subscription = %name, error = %e, "failed to shut subscription");
                first_error.get_or_insert(e);
            }
            if let Ok(connection) = self.connection(&name) {
                if let Some(channel) = connection.lock().channel.take() {
                    channel.close();
                }
            }
        }
        self.state.store(Arc::new(DispatcherState::Stopped));
        info!("dispatcher stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Every performer started since the last prune, sorted by name.
    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut consumers: Vec<ConsumerInfo> = connections
            .iter()
            .flat_map(|connection| {
                let conn = connection.lock();
                conn.performers
                    .iter()
                    .map(|p| ConsumerInfo {
                        name: p.name.clone(),
                        subscription: conn.subscription.name.clone(),
                        state: **p.state.load(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        consumers
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_not_stopped(&self) -> Result<(), DispatcherError> {
        if self.state() == DispatcherState::Stopped {
            return Err(DispatcherError::Stopped);
        }
        Ok(())
    }

    fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn connection(&self, name: &str) -> Result<Arc<Mutex<Connection>>, DispatcherError> {
        self.connections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DispatcherError::UnknownSubscription {
                name: name.to_string(),
            })
    }

    fn launch(&self, conn: &mut Connection, count: usize) -> Result<(), DispatcherError> {
        if count == 0 {
            return Ok(());
        }
        let channel = match &conn.channel {
            Some(channel) => Arc::clone(channel),
            None => {
                let channel = self.channels.create_channel(&conn.subscription)?;
                conn.channel = Some(Arc::clone(&channel));
                channel
            }
        };
        for _ in 0..count {
            let name = format!("{}-{}", conn.subscription.name, conn.launched);
            conn.launched += 1;
            let performer = conn.launcher.launch(
                Arc::clone(&self.processor),
                Arc::clone(&channel),
                Arc::clone(&conn.subscription),
                name,
            );
            conn.performers.push(performer);
        }
        debug!(
            subscription = %conn.subscription.name,
            started = count,
            "performers launched"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
