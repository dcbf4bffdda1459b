mod api;
mod auth;
mod config;
mod elevate;
mod fingerprint;
mod ipc;
mod logging;
mod manager;
mod secrets;
mod tunnel;
mod ui;
mod updater;
mod version;
mod winsvc;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::elevate::ElevateError;
use crate::manager::ManagerServiceStatus;
use crate::tunnel::{EngineCallbacks, EngineConfig, OlmEngine, OlmLibrary};

const UI_LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

fn fatal(message: String) -> ! {
    error!("{message}");
    eprintln!("{message}");
    std::process::exit(1);
}

fn main() {
    logging::init();
    info!("Pangolin version {} starting", version::NUMBER);

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("/managerservice") => {
            info!("starting as manager service");
            if let Err(err) = manager::run() {
                fatal(format!("Manager service failed: {err}"));
            }
        }
        Some("/tunnelservice") => {
            let Some(config_path) = args.get(2) else {
                fatal("Missing tunnel config path".to_string());
            };
            info!("starting as tunnel service with config {config_path}");
            let config_json = match std::fs::read_to_string(config_path) {
                Ok(config_json) => config_json,
                Err(err) => fatal(format!("Failed to read tunnel config: {err}")),
            };
            let factory: tunnel::EngineFactory = Box::new(olm_engine_factory);
            if let Err(err) = tunnel::service::run(config_json, factory) {
                fatal(format!("Tunnel service failed: {err}"));
            }
        }
        Some("/installmanagerservice") => {
            // Reached after elevation; install, then give the service a
            // moment to come up and raise the UI.
            match manager::install_manager() {
                Ok(()) => {
                    info!("manager service installed");
                    std::thread::sleep(Duration::from_secs(5));
                }
                Err(manager::InstallError::ManagerAlreadyRunning) => {
                    info!("manager service is already running");
                    std::thread::sleep(Duration::from_secs(5));
                }
                Err(err) => fatal(format!("Failed to install manager service: {err}")),
            }
        }
        Some("/ui") => {
            let handles: Vec<u64> = args[2..]
                .iter()
                .take(3)
                .filter_map(|value| value.parse().ok())
                .collect();
            if handles.len() != 3 {
                fatal("Invalid pipe handles from manager service".to_string());
            }
            if let Err(err) = ui::run(handles[0], handles[1], handles[2]) {
                fatal(format!("UI failed: {err}"));
            }
        }
        Some(other) => {
            fatal(format!("Unknown argument: {other}"));
        }
        None => bootstrap(),
    }
}

/// The double-click entry point: make sure the manager service exists and
/// runs (elevating as needed), then ask it for a UI in this session.
fn bootstrap() {
    let status = match manager::query_manager_status() {
        Ok(status) => status,
        Err(err) => {
            // Without SCM access we cannot even query; elevation both
            // installs and starts as needed.
            info!("cannot query service manager ({err}); requesting elevation");
            elevate_installer_and_exit();
        }
    };

    match status {
        ManagerServiceStatus::NotInstalled => {
            info!("manager service not found, installing");
            elevate_installer_and_exit();
        }
        ManagerServiceStatus::Stopped => {
            info!("manager service is stopped, starting");
            if let Err(err) = manager::start_manager_service() {
                info!("direct start failed ({err}); requesting elevation");
                match elevate::run_elevated_service_start(&manager::manager_service_name()) {
                    Ok(()) => {}
                    Err(ElevateError::Cancelled) => {
                        info!("user cancelled elevation, cannot start service");
                        return;
                    }
                    Err(err) => fatal(format!(
                        "Failed to start manager service: {err}\nPlease start the service manually or run as administrator."
                    )),
                }
                std::thread::sleep(Duration::from_secs(2));
                match manager::query_manager_status() {
                    Ok(ManagerServiceStatus::Stopped) | Err(_) => fatal(
                        "Service failed to start. Please start it manually or run as administrator."
                            .to_string(),
                    ),
                    _ => {}
                }
            } else {
                std::thread::sleep(Duration::from_secs(2));
            }
            info!("manager service started");
        }
        ManagerServiceStatus::Running => {
            info!("manager service is already running");
        }
        ManagerServiceStatus::Transitioning => {
            info!("manager service is starting");
            std::thread::sleep(Duration::from_secs(2));
        }
    }

    if !manager::request_ui_launch_with_retry(UI_LAUNCH_TIMEOUT) {
        fatal("Manager service did not accept the UI launch request.".to_string());
    }
}

fn elevate_installer_and_exit() -> ! {
    match elevate::run_elevated_manager_installer() {
        Ok(()) | Err(ElevateError::Cancelled) => std::process::exit(0),
        Err(err) => fatal(format!(
            "Failed to install manager service: {err}\nPlease run as administrator to install the service."
        )),
    }
}

fn olm_engine_factory(
    config: EngineConfig,
    callbacks: EngineCallbacks,
) -> Result<Arc<dyn OlmEngine>, String> {
    Ok(Arc::new(OlmLibrary::init(config, callbacks)?))
}
