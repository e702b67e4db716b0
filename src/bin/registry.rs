// Copyright (c) 2026 Meshsim
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! The rendezvous registry process (spec.md §4.3).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use meshsim::config::RegistryEndpoint;
use meshsim::monitoring::{http, Metrics};

/// Runs the mesh's rendezvous registry: accepts participant announcements,
/// distributes peer lists, and relays messages between peers that cannot
/// connect directly.
#[derive(Parser, Debug)]
#[command(name = "meshsim-registry", version, about)]
struct Args {
    /// Registry URI to listen on, e.g. `silkit://0.0.0.0:8500` or
    /// `local:///run/meshsim-registry.sock`.
    #[arg(long, default_value = "silkit://0.0.0.0:8500")]
    listen_uri: String,

    /// HTTP observability listen address for `/metrics` and `/healthz`
    /// (e.g. `0.0.0.0:9090`). Unset disables the surface.
    #[arg(long, default_value = "")]
    http_listen_addr: String,

    /// `tracing` log filter, e.g. `info` or `meshsim=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with_target(false)
        .init();

    let endpoint = match RegistryEndpoint::parse(&args.listen_uri) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "invalid --listen-uri");
            return ExitCode::from(2);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialise metrics");
            return ExitCode::from(3);
        }
    };

    let http_config = meshsim::config::HttpConfig { listen_addr: args.http_listen_addr.clone() };
    let http_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(&http_config, http_metrics).await {
            tracing::error!(error = %e, "HTTP observability surface exited");
        }
    });

    let result = match endpoint {
        RegistryEndpoint::Tcp(host_port) => match tokio::net::TcpListener::bind(&host_port).await {
            Ok(listener) => {
                tracing::info!(addr = %host_port, "registry listening");
                meshsim::networking::registry::run(listener).await.map_err(anyhow::Error::from)
            }
            Err(e) => Err(anyhow::anyhow!("binding {host_port}: {e}")),
        },
        #[cfg(unix)]
        RegistryEndpoint::Local(path) => {
            let _ = std::fs::remove_file(&path);
            match tokio::net::UnixListener::bind(&path) {
                Ok(listener) => {
                    tracing::info!(path = %path, "registry listening");
                    meshsim::networking::registry::run_unix(listener).await.map_err(anyhow::Error::from)
                }
                Err(e) => Err(anyhow::anyhow!("binding {path}: {e}")),
            }
        }
        #[cfg(not(unix))]
        RegistryEndpoint::Local(path) => Err(anyhow::anyhow!("local:// endpoints ({path}) require a unix target")),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "registry exited with an error");
        return ExitCode::from(3);
    }
    ExitCode::SUCCESS
}
