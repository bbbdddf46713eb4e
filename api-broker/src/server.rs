//! Broker lifecycle: start every lane, then tear them down in order.
//!
//! ```text
//! Created --start--> Running --shutdown / relay exit--> ShuttingDown --joined--> Stopped
//! ```
//!
//! The relay runs on its own thread inside a current-thread Tokio runtime. The
//! worker, callback, event, heartbeat and tx-wait lanes are plain threads.
//! Shutdown stops the handler and raises the shared flag. The relay thread then
//! closes its sockets, joins the lanes and shuts its runtime down last, so the
//! caller never drops a runtime itself.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::callback::{run_callback, run_tx_wait};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::events::run_event_lane;
use crate::handler::ApiHandler;
use crate::heartbeat::run_heartbeat;
use crate::relay::{Lanes, Relay};
use crate::shutdown::ShutdownSignal;
use crate::socket::{LaneEndpoint, lane_pair};
use crate::worker::run_worker;

/// Time the relay runtime gets to cancel open peer connections.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct ApiServer {
    config: BrokerConfig,
    handler: Arc<dyn ApiHandler>,
    signal: ShutdownSignal,
    lifecycle: Arc<Mutex<LifecycleState>>,
    local_addr: Mutex<Option<SocketAddr>>,
    relay: Mutex<Option<JoinHandle<()>>>,
    relay_exit: Arc<Notify>,
}

impl ApiServer {
    pub fn new(config: BrokerConfig, handler: Arc<dyn ApiHandler>) -> Self {
        Self {
            config,
            handler,
            signal: ShutdownSignal::new(),
            lifecycle: Arc::new(Mutex::new(LifecycleState::Created)),
            local_addr: Mutex::new(None),
            relay: Mutex::new(None),
            relay_exit: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.lock()
    }

    /// Address the front-end socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the front-end socket and starts the relay and every lane.
    pub fn start(&self) -> Result<SocketAddr, BrokerError> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != LifecycleState::Created {
            return Err(BrokerError::AlreadyStarted);
        }
        self.config.validate()?;

        let addr = self.config.bind_addr();
        let bind_error = |source| BrokerError::Bind { addr, source };
        let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (worker, worker_endpoint) = lane_pair("worker");
        let (callback, callback_endpoint) = lane_pair("callback");
        let (event, event_endpoint) = lane_pair("event");
        let (heartbeat, heartbeat_endpoint) = lane_pair("heartbeat");
        let lanes = Lanes {
            worker,
            callback,
            event,
            heartbeat,
        };

        let mut handles = Vec::with_capacity(self.config.workers + 4);
        let endpoints = [worker_endpoint, callback_endpoint, event_endpoint, heartbeat_endpoint];
        if let Err(err) = self.spawn_lanes(endpoints, &mut handles) {
            self.signal.trigger();
            drop(lanes);
            join_lanes(handles);
            return Err(err);
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let lifecycle_handle = Arc::clone(&self.lifecycle);
        let handler = Arc::clone(&self.handler);
        let signal = self.signal.clone();
        let relay_exit = Arc::clone(&self.relay_exit);
        let send_hwm = self.config.send_hwm;
        let max_frame_len = self.config.max_frame_len;
        let relay = thread::Builder::new()
            .name("api-relay".into())
            .spawn(move || {
                // The runtime lives and dies on this thread.
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(()));
                        runtime
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        signal.trigger();
                        drop(lanes);
                        join_lanes(handles);
                        return;
                    }
                };

                let result = runtime.block_on(async {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    let exit = async {
                        select! {
                            _ = signal.triggered() => {}
                            _ = relay_exit.notified() => {}
                        }
                    };
                    Relay::new(listener, lanes, Arc::clone(&handler), send_hwm, max_frame_len)
                        .run_until(exit)
                        .await
                });
                match result {
                    Ok(()) => debug!("relay returned"),
                    Err(err) => error!(error = %err, "relay terminated"),
                }
                begin_shutdown(&lifecycle_handle, handler.as_ref(), &signal);
                join_lanes(handles);
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
                debug!("relay runtime closed");
            });
        let relay = match relay {
            Ok(relay) => relay,
            Err(source) => {
                // The lanes went down with the closure; they exit on the flag.
                self.signal.trigger();
                return Err(BrokerError::Spawn {
                    lane: "api-relay".into(),
                    source,
                });
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = relay.join();
                return Err(BrokerError::Runtime(source));
            }
            Err(_) => {
                let _ = relay.join();
                return Err(BrokerError::Runtime(io::Error::other(
                    "relay thread exited during startup",
                )));
            }
        }

        *self.relay.lock() = Some(relay);
        *self.local_addr.lock() = Some(local_addr);
        *lifecycle = LifecycleState::Running;
        info!(addr = %local_addr, workers = self.config.workers, "api server started");
        Ok(local_addr)
    }

    /// Spawns N workers plus the callback, tx-wait, event and heartbeat lanes.
    fn spawn_lanes(
        &self,
        [worker, callback, event, heartbeat]: [LaneEndpoint; 4],
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), BrokerError> {
        for index in 0..self.config.workers {
            let handler = Arc::clone(&self.handler);
            let endpoint = worker.clone();
            let signal = self.signal.clone();
            handles.push(spawn_lane(format!("api-worker-{index}"), move || {
                run_worker(index, handler, endpoint, signal)
            })?);
        }

        let queue = self.handler.tx_status_queue().receiver();
        let reply = callback.reply;
        let signal = self.signal.clone();
        handles.push(spawn_lane("api-callback".into(), move || {
            run_callback(queue, reply, signal)
        })?);

        let handler = Arc::clone(&self.handler);
        let signal = self.signal.clone();
        handles.push(spawn_lane("api-tx-wait".into(), move || {
            run_tx_wait(handler, signal)
        })?);

        let handler = Arc::clone(&self.handler);
        let reply = event.reply;
        let interval = self.config.event_poll_interval();
        let signal = self.signal.clone();
        handles.push(spawn_lane("api-event".into(), move || {
            run_event_lane(handler, reply, interval, signal)
        })?);

        let signal = self.signal.clone();
        handles.push(spawn_lane("api-heartbeat".into(), move || {
            run_heartbeat(heartbeat, signal)
        })?);
        Ok(())
    }

    /// Stops the handler, raises the shutdown flag and waits for every thread.
    ///
    /// Safe to call more than once and from any thread.
    pub fn shutdown(&self) {
        begin_shutdown(&self.lifecycle, self.handler.as_ref(), &self.signal);
        self.finish();
    }

    /// Blocks until the relay exits (on shutdown or on a transport failure),
    /// then completes teardown.
    pub fn wait(&self) {
        self.finish();
    }

    /// Makes the relay return on its own, as a listener failure would.
    #[cfg(test)]
    pub(crate) fn stop_relay(&self) {
        self.relay_exit.notify_one();
    }

    fn finish(&self) {
        let mut relay = self.relay.lock();
        let Some(handle) = relay.take() else {
            return;
        };
        if handle.join().is_err() {
            error!("relay thread panicked");
            begin_shutdown(&self.lifecycle, self.handler.as_ref(), &self.signal);
        }

        *self.lifecycle.lock() = LifecycleState::Stopped;
        info!("api server stopped");
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Moves the server to ShuttingDown and wakes every lane. Only the first
/// caller does anything.
fn begin_shutdown(
    lifecycle: &Mutex<LifecycleState>,
    handler: &dyn ApiHandler,
    signal: &ShutdownSignal,
) -> bool {
    {
        let mut state = lifecycle.lock();
        match *state {
            LifecycleState::Running => *state = LifecycleState::ShuttingDown,
            LifecycleState::Created => *state = LifecycleState::Stopped,
            LifecycleState::ShuttingDown | LifecycleState::Stopped => return false,
        }
    }

    info!("api server shutting down");
    handler.shutdown();
    signal.trigger();
    true
}

fn spawn_lane<F>(name: String, run: F) -> Result<JoinHandle<()>, BrokerError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(run)
        .map_err(|source| BrokerError::Spawn { lane: name, source })
}

fn join_lanes(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("lane").to_string();
        if handle.join().is_err() {
            error!(thread = %name, "lane thread panicked");
        } else {
            debug!(thread = %name, "lane thread joined");
        }
    }
}
