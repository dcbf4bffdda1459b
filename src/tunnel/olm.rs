use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::sync::{Mutex, OnceLock};

use libloading::{Library, Symbol};
use tracing::{debug, error};

use super::engine::{EngineCallbacks, EngineConfig, OlmEngine};

const LIBRARY_NAME: &str = "olm.dll";

/// Callback slot for the C trampolines. One tunnel engine per worker
/// process, so a single slot suffices.
static CALLBACKS: OnceLock<Mutex<Option<EngineCallbacks>>> = OnceLock::new();

fn callbacks() -> &'static Mutex<Option<EngineCallbacks>> {
    CALLBACKS.get_or_init(|| Mutex::new(None))
}

extern "C" fn on_connected_trampoline() {
    if let Some(callbacks) = &*callbacks().lock().unwrap() {
        (callbacks.on_connected)();
    }
}

extern "C" fn on_registered_trampoline() {
    if let Some(callbacks) = &*callbacks().lock().unwrap() {
        (callbacks.on_registered)();
    }
}

extern "C" fn on_terminated_trampoline() {
    if let Some(callbacks) = &*callbacks().lock().unwrap() {
        (callbacks.on_terminated)();
    }
}

/// Dynamic binding to the embedded OLM engine. The engine ships as a DLL
/// beside the executable and exposes a small C surface taking JSON payloads.
pub struct OlmLibrary {
    library: Library,
}

type InitFn = unsafe extern "C" fn(*const c_char) -> c_int;
type SetCallbacksFn = unsafe extern "C" fn(
    Option<extern "C" fn()>,
    Option<extern "C" fn()>,
    Option<extern "C" fn()>,
) -> c_int;
type StartApiFn = unsafe extern "C" fn() -> c_int;
type StartTunnelFn = unsafe extern "C" fn(*const c_char) -> c_int;
type StopFn = unsafe extern "C" fn();
type SetJsonFn = unsafe extern "C" fn(*const c_char) -> c_int;

impl OlmLibrary {
    /// Load the engine, hand it the bootstrap config, and wire the lifecycle
    /// callbacks.
    pub fn init(config: EngineConfig, hooks: EngineCallbacks) -> Result<Self, String> {
        let library = unsafe { Library::new(LIBRARY_NAME) }
            .map_err(|err| format!("failed to load {LIBRARY_NAME}: {err}"))?;

        *callbacks().lock().unwrap() = Some(hooks);

        let config_json =
            serde_json::to_string(&config).map_err(|err| err.to_string())?;
        let config_cstr = CString::new(config_json).map_err(|err| err.to_string())?;
        unsafe {
            let init: Symbol<InitFn> = library
                .get(b"OlmInit\0")
                .map_err(|err| format!("missing OlmInit: {err}"))?;
            let rc = init(config_cstr.as_ptr());
            if rc != 0 {
                return Err(format!("OlmInit failed with code {rc}"));
            }

            let set_callbacks: Symbol<SetCallbacksFn> = library
                .get(b"OlmSetCallbacks\0")
                .map_err(|err| format!("missing OlmSetCallbacks: {err}"))?;
            let rc = set_callbacks(
                Some(on_connected_trampoline),
                Some(on_registered_trampoline),
                Some(on_terminated_trampoline),
            );
            if rc != 0 {
                return Err(format!("OlmSetCallbacks failed with code {rc}"));
            }
        }

        debug!("olm engine initialized");
        Ok(Self { library })
    }

    fn call_json(&self, symbol: &[u8], payload: &str) -> Result<(), String> {
        let payload = CString::new(payload).map_err(|err| err.to_string())?;
        let name = String::from_utf8_lossy(&symbol[..symbol.len() - 1]).to_string();
        unsafe {
            let function: Symbol<SetJsonFn> = self
                .library
                .get(symbol)
                .map_err(|err| format!("missing {name}: {err}"))?;
            let rc = function(payload.as_ptr());
            if rc != 0 {
                return Err(format!("{name} failed with code {rc}"));
            }
        }
        Ok(())
    }
}

impl OlmEngine for OlmLibrary {
    fn start_api(&self) -> Result<(), String> {
        unsafe {
            let start: Symbol<StartApiFn> = self
                .library
                .get(b"OlmStartApi\0")
                .map_err(|err| format!("missing OlmStartApi: {err}"))?;
            let rc = start();
            if rc != 0 {
                return Err(format!("OlmStartApi failed with code {rc}"));
            }
        }
        Ok(())
    }

    fn start_tunnel(&self, payload: &str) -> Result<(), String> {
        let payload = CString::new(payload).map_err(|err| err.to_string())?;
        unsafe {
            let start: Symbol<StartTunnelFn> = self
                .library
                .get(b"OlmStartTunnel\0")
                .map_err(|err| format!("missing OlmStartTunnel: {err}"))?;
            let rc = start(payload.as_ptr());
            if rc != 0 {
                return Err(format!("OlmStartTunnel failed with code {rc}"));
            }
        }
        Ok(())
    }

    fn stop_api(&self) {
        unsafe {
            match self.library.get::<StopFn>(b"OlmStopApi\0") {
                Ok(stop) => stop(),
                Err(err) => error!("missing OlmStopApi: {err}"),
            }
        }
    }

    fn stop_tunnel(&self) {
        unsafe {
            match self.library.get::<StopFn>(b"OlmStopTunnel\0") {
                Ok(stop) => stop(),
                Err(err) => error!("missing OlmStopTunnel: {err}"),
            }
        }
    }

    fn set_fingerprint(&self, fingerprint: &HashMap<String, serde_json::Value>) {
        match serde_json::to_string(fingerprint) {
            Ok(payload) => {
                if let Err(err) = self.call_json(b"OlmSetFingerprint\0", &payload) {
                    error!("failed to push fingerprint: {err}");
                }
            }
            Err(err) => error!("failed to encode fingerprint: {err}"),
        }
    }

    fn set_postures(&self, postures: &HashMap<String, serde_json::Value>) {
        match serde_json::to_string(postures) {
            Ok(payload) => {
                if let Err(err) = self.call_json(b"OlmSetPostures\0", &payload) {
                    error!("failed to push postures: {err}");
                }
            }
            Err(err) => error!("failed to encode postures: {err}"),
        }
    }
}
