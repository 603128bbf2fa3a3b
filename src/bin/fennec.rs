// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal CLI wrapper so the library can run as a stand-alone proxy.
//!
//!  Build it with `cargo build --release --bin fennec`
//!  The binary honours FENNEC_CONFIG_FILE or falls back to /etc/fennec/config.toml.
//!  On unix, SIGHUP re-reads the configuration without dropping connections.

use std::env;
use std::error::Error;

use fennec::{Fennec, error_fmt, info_fmt};

const FALLBACK_CONFIG: &str = "/etc/fennec/config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Starting Fennec");

    // Base loader always pulls env vars; the file decides the rest.
    let mut loader = Fennec::loader().with_env_vars();
    match env::var("FENNEC_CONFIG_FILE").ok() {
        Some(path) => {
            println!("Using configuration from {path}");
            loader = loader.with_config_file(&path);
        }
        None => {
            println!(
                "No FENNEC_CONFIG_FILE env var found. Attempting to use default configuration path: {FALLBACK_CONFIG}"
            );
            if !std::path::Path::new(FALLBACK_CONFIG).exists() {
                println!("Default configuration file {FALLBACK_CONFIG} does not exist.");
                return Err(Box::from("No configuration file found."));
            }
            loader = loader.with_config_file(FALLBACK_CONFIG);
        }
    }

    let proxy = match loader.build().await {
        Ok(p) => p,
        Err(e) => {
            println!("Failed to build proxy: {e}");
            return Err(e.into());
        }
    };

    #[cfg(unix)]
    spawn_reload_on_hangup(proxy.clone())?;

    match proxy.start().await {
        Ok(()) => {
            info_fmt!("Fennec", "Proxy server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error_fmt!("Fennec", "Proxy server failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(unix)]
fn spawn_reload_on_hangup(proxy: Fennec) -> Result<(), Box<dyn Error>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info_fmt!("Fennec", "Received SIGHUP; reloading configuration");
            if let Err(e) = proxy.reload() {
                error_fmt!("Fennec", "Reload failed, keeping current configuration: {}", e);
            }
        }
    });
    Ok(())
}
