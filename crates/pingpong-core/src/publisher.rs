//! Publisher role: probe dispatch and pong listening on one shared session.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{LoopExit, Session, SessionTask};
use crate::dispatcher::ProbeDispatcher;
use crate::identity::Identity;
use crate::listener::{Correspondents, ListenerLoop};
use crate::shutdown::Shutdown;
use crate::targets::TargetSet;

pub struct Publisher<R> {
    dispatcher: ProbeDispatcher<R>,
    listener: ListenerLoop,
}

impl<R: Rng + Send> Publisher<R> {
    pub fn new(
        identity: Arc<Identity>,
        targets: TargetSet,
        interval: Duration,
        rng: R,
        correspondents: Correspondents,
    ) -> Self {
        Self {
            listener: ListenerLoop::new(identity.clone(), targets.clone(), correspondents),
            dispatcher: ProbeDispatcher::new(identity, targets, interval, rng),
        }
    }

    pub fn correspondents(&self) -> &Correspondents {
        self.listener.correspondents()
    }

    pub fn dispatcher(&self) -> &ProbeDispatcher<R> {
        &self.dispatcher
    }
}

#[async_trait]
impl<R: Rng + Send> SessionTask for Publisher<R> {
    /// Run both loops until either gives up the session.
    ///
    /// The loop that did not exit is dropped here, before the manager tears
    /// the session down.
    async fn run_session(&mut self, session: &Session, shutdown: &Shutdown) -> LoopExit {
        tokio::select! {
            exit = self.dispatcher.run(session, shutdown) => exit,
            exit = self.listener.run(session, shutdown) => exit,
        }
    }
}
