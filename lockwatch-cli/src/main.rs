//! lockwatch: print session lock and unlock events as they happen.
//!
//! Events go to stdout as JSON lines, logs to stderr. Pressing Enter or
//! closing stdin ends the subscription. Configuration comes from the
//! `LOCKWATCH_*` environment variables, plus an optional YAML file named by
//! `LOCKWATCH_CONFIG`.

use lockwatch_core::{lock_channel, CancelToken, LockEvent, LockwatchResult, NotifierConfig};
use std::io::BufRead;
use std::path::Path;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};

const ENV_CONFIG: &str = "LOCKWATCH_CONFIG";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lockwatch=info,lockwatch_core=info,lockwatch_platform=info".into()
            }),
        )
        .try_init();
}

fn load_config(path: Option<&Path>) -> LockwatchResult<NotifierConfig> {
    let mut config = match path {
        Some(path) => NotifierConfig::load(path)?,
        None => NotifierConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

fn format_event(event: &LockEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

fn format_remote(remote: bool) -> String {
    serde_json::json!({ "remote": remote }).to_string()
}

/// Cancel `token` once stdin yields a line or closes.
fn watch_stdin(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("lockwatch-stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            info!("Stopping");
            token.cancel();
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to watch stdin; stop with Ctrl+C");
    }
}

fn main() -> ExitCode {
    init_logging();

    let config_path = std::env::var_os(ENV_CONFIG);
    let config = match load_config(config_path.as_deref().map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match lockwatch_platform::is_remote_session_with(&config) {
        Ok(remote) => println!("{}", format_remote(remote)),
        Err(e) => warn!(error = %e, "Could not tell whether the session is remote"),
    }

    let token = CancelToken::new();
    let (tx, rx) = lock_channel(&config);
    let subscription = match lockwatch_platform::subscribe_with(config, token.clone(), tx) {
        Ok(subscription) => subscription,
        Err(e) => {
            error!(error = %e, "Failed to subscribe to lock events");
            return ExitCode::FAILURE;
        }
    };
    watch_stdin(token);
    info!("Watching session lock events; press Enter to stop");

    // Ends once the relay drops its sender.
    for event in rx.iter() {
        println!("{}", format_event(&event));
    }

    subscription.join();
    info!("Subscription stopped");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_event() {
        let line = format_event(&LockEvent::now(true));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["locked"], true);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_format_remote() {
        assert_eq!(format_remote(true), r#"{"remote":true}"#);
        assert_eq!(format_remote(false), r#"{"remote":false}"#);
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(Some(Path::new("/nonexistent/lockwatch.yaml"))).unwrap_err();
        assert!(err.to_string().contains("lockwatch.yaml"));
    }
}
