use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use super::engine::{tunnel_start_payload, EngineCallbacks, EngineConfig, OlmEngine};
use super::{Config, State, OLM_PIPE_PATH};
use crate::winsvc::{
    self, ServiceControl, ServiceStatus, StatusReporter, ACCEPT_SHUTDOWN, ACCEPT_STOP,
};
use crate::{config as appconfig, fingerprint, version};

const FINGERPRINT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const CONFIG_PARSE_EXIT_CODE: u32 = 1;

pub type EngineFactory =
    Box<dyn FnOnce(EngineConfig, EngineCallbacks) -> Result<Arc<dyn OlmEngine>, String> + Send>;

type IdentityMaps = (
    HashMap<String, serde_json::Value>,
    HashMap<String, serde_json::Value>,
);
type IdentityGather = Box<dyn Fn() -> Pin<Box<dyn Future<Output = IdentityMaps> + Send>> + Send + Sync>;

/// Single-writer state cell for this worker's tunnel, with subscriptions for
/// in-process observers. The control pipe is the cross-process view.
pub struct StatePublisher {
    state: std::sync::Mutex<State>,
    tx: broadcast::Sender<State>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            state: std::sync::Mutex::new(State::Stopped),
            tx,
        }
    }

    pub fn set(&self, state: State) {
        *self.state.lock().unwrap() = state;
        let _ = self.tx.send(state);
        info!("tunnel state: {state}");
    }

    pub fn get(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<State> {
        self.tx.subscribe()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Service entry for `/tunnelservice <config>`: hand the body to the SCM
/// dispatcher. The worker service runs under its per-tunnel service name;
/// own-process services may register with an empty string.
pub fn run(config_json: String, engine_factory: EngineFactory) -> Result<(), String> {
    winsvc::run(
        "",
        Box::new(move |controls, status| {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("failed to build worker runtime: {err}");
                    return 1;
                }
            };
            let publisher = Arc::new(StatePublisher::new());
            runtime.block_on(execute(
                &config_json,
                controls,
                status.as_ref(),
                &publisher,
                engine_factory,
                Box::new(|| {
                    Box::pin(async {
                        let fp = fingerprint::gather_fingerprint_info().to_map();
                        let postures = fingerprint::gather_posture_checks().await.to_map();
                        (fp, postures)
                    })
                }),
            ))
        }),
    )
}

pub(crate) async fn execute(
    config_json: &str,
    mut controls: mpsc::UnboundedReceiver<ServiceControl>,
    status: &dyn StatusReporter,
    publisher: &Arc<StatePublisher>,
    engine_factory: EngineFactory,
    gather_identity: IdentityGather,
) -> u32 {
    status.set(ServiceStatus::start_pending());

    let config = match Config::from_json(config_json) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to parse tunnel config: {err}");
            return CONFIG_PARSE_EXIT_CODE;
        }
    };

    publisher.set(State::Registering);
    let accepts = ACCEPT_STOP | ACCEPT_SHUTDOWN;
    status.set(ServiceStatus::running(accepts));

    // Created before the engine exists: an OnTerminated fired during
    // initialization pre-cancels the watch and the loop sees it on its
    // first iteration.
    let (terminated_tx, mut terminated_rx) = watch::channel(false);
    let terminated_tx = Arc::new(terminated_tx);

    let engine_config = EngineConfig {
        log_level: appconfig::log_level(),
        enable_api: true,
        socket_path: OLM_PIPE_PATH.to_string(),
        version: version::NUMBER.to_string(),
        agent: "Pangolin Windows".to_string(),
    };
    let connected_publisher = publisher.clone();
    let registered_publisher = publisher.clone();
    let callbacks = EngineCallbacks {
        on_connected: Box::new(move || {
            info!("olm connected");
            connected_publisher.set(State::Running);
        }),
        on_registered: Box::new(move || {
            info!("olm registered");
            registered_publisher.set(State::Registered);
        }),
        on_terminated: Box::new({
            let terminated_tx = terminated_tx.clone();
            move || {
                info!("olm terminated");
                let _ = terminated_tx.send(true);
            }
        }),
    };

    let engine = match engine_factory(engine_config, callbacks) {
        Ok(engine) => engine,
        Err(err) => {
            error!("failed to initialize tunnel engine: {err}");
            publisher.set(State::Stopped);
            return 1;
        }
    };

    let (initial_fingerprint, initial_postures) = gather_identity().await;
    let payload = match tunnel_start_payload(&config, &initial_fingerprint, &initial_postures) {
        Ok(payload) => payload,
        Err(err) => {
            error!("failed to build tunnel start payload: {err}");
            publisher.set(State::Stopped);
            return 1;
        }
    };

    // The worker keeps running without its control surface; state is then
    // observable only through event notifications.
    if let Err(err) = engine.start_api() {
        warn!("control API failed to start, continuing without it: {err}");
    }

    let tunnel_engine = engine.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(err) = tunnel_engine.start_tunnel(&payload) {
            error!("tunnel engine exited with error: {err}");
        } else {
            info!("tunnel engine stopped");
        }
    });

    let refresh_engine = engine.clone();
    let (refresh_cancel_tx, mut refresh_cancel_rx) = watch::channel(false);
    let refresh_gather = gather_identity;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FINGERPRINT_REFRESH_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = refresh_cancel_rx.changed() => return,
                _ = ticker.tick() => {
                    let (fp, postures) = refresh_gather().await;
                    refresh_engine.set_fingerprint(&fp);
                    refresh_engine.set_postures(&postures);
                }
            }
        }
    });

    let exit_code = loop {
        tokio::select! {
            changed = terminated_rx.changed() => {
                if changed.is_err() || *terminated_rx.borrow() {
                    info!("engine terminated, stopping service");
                    publisher.set(State::Stopping);
                    status.set(ServiceStatus::stop_pending());
                    destroy(engine.as_ref());
                    publisher.set(State::Stopped);
                    break 0;
                }
            }
            control = controls.recv() => {
                match control {
                    None => {
                        info!("service control channel closed");
                        destroy(engine.as_ref());
                        break 0;
                    }
                    Some(ServiceControl::Interrogate) => {
                        status.set(ServiceStatus::running(accepts));
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        status.set(ServiceStatus::running(accepts));
                    }
                    Some(ServiceControl::Stop) | Some(ServiceControl::Shutdown) => {
                        info!("service stopping");
                        publisher.set(State::Stopping);
                        status.set(ServiceStatus::stop_pending());
                        destroy(engine.as_ref());
                        publisher.set(State::Stopped);
                        break 0;
                    }
                    Some(other) => {
                        info!("unexpected service control request: {other:?}");
                    }
                }
            }
        }
    };

    let _ = refresh_cancel_tx.send(true);
    exit_code
}

fn destroy(engine: &dyn OlmEngine) {
    engine.stop_api();
    engine.stop_tunnel();
}
