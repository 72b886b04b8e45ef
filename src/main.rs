// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFCOMM Explorer command-line host.

use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rfcomm_explorer::bluetooth::{
    BluezRadio, PlatformEvent, RadioStack, SessionEnd, SessionSink, UserInput,
};
use rfcomm_explorer::storage::{BlockStore, DiscoveryStore, FileStore};
use rfcomm_explorer::{Config, EventSink, EventSource, Explorer, ExplorerError};

/// Prints received stream data as it arrives.
struct StdoutSink;

impl SessionSink for StdoutSink {
    fn record(&mut self, data: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&text_record(data));
        let _ = out.flush();
    }
}

/// One read as a newline-terminated line.
fn text_record(data: &[u8]) -> Vec<u8> {
    let mut line = data.to_vec();
    if line.last() != Some(&b'\n') {
        line.push(b'\n');
    }
    line
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rfcomm_explorer=info".parse()?),
        )
        .init();

    info!("Starting RFCOMM Explorer v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let (sink, events) = EventSource::channel();
    spawn_input(sink.clone());

    let radio = BluezRadio::new(&config.bluetooth, sink.clone()).await?;
    info!("Local adapter address: {}", radio.address().await?);
    let store = DiscoveryStore::new(FileStore::new(&config.data_dir)?, config.store.name.clone());
    info!("Topology store in {}", config.data_dir.display());

    let mut explorer = Explorer::new(radio, events, store, &config);

    match run(&mut explorer).await {
        Ok(()) | Err(ExplorerError::Shutdown) => {
            info!("Shutting down...");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Feed stdin lines and Ctrl+C into the platform event queue.
fn spawn_input(sink: EventSink) {
    let lines_sink = sink.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "c" => lines_sink.cancel(),
                "q" => lines_sink.push(PlatformEvent::Input(UserInput::Exit)),
                other => lines_sink.command(other),
            }
        }
        lines_sink.shutdown();
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            sink.shutdown();
        }
    });
}

async fn run<R: RadioStack, S: BlockStore>(
    explorer: &mut Explorer<R, S>,
) -> rfcomm_explorer::Result<()> {
    match explorer.load() {
        Ok(count) => info!("{} devices known", count),
        Err(ExplorerError::Corruption(e)) => {
            warn!("Stored topology is corrupt: {}", e);
            println!("Stored topology is corrupt. [d]elete it or [i]gnore?");
            if explorer.next_command().await?.eq_ignore_ascii_case("d") {
                explorer.reset_store()?;
                println!("Store deleted");
            }
        }
        Err(e) => return Err(e),
    }

    loop {
        print_menu(explorer);
        let command = explorer.next_command().await?;
        let words: Vec<&str> = command.split_whitespace().collect();

        match words.as_slice() {
            ["s" | "scan"] => {
                println!("Scanning... enter 'c' to cancel");
                match explorer.scan().await {
                    Ok(report) => println!(
                        "Found {} devices, {} services in {:.1}s{}",
                        report.devices,
                        report.services,
                        report.elapsed.as_secs_f64(),
                        if report.cancelled { " (cancelled)" } else { "" }
                    ),
                    Err(ExplorerError::Shutdown) => return Err(ExplorerError::Shutdown),
                    Err(e) if e.is_retryable() => {
                        warn!("Scan failed: {}", e);
                        println!("Radio not ready, try again shortly");
                    }
                    Err(e) => error!("Scan failed: {}", e),
                }
            }
            ["l" | "list"] => print_topology(explorer),
            ["connect", device, service] => {
                let (Ok(device), Ok(service)) = (device.parse(), service.parse()) else {
                    println!("usage: connect <device> <service>");
                    continue;
                };
                println!("Connecting... enter 'c' to close");
                match explorer.open_session(device, service, &mut StdoutSink).await {
                    Ok(report) => match report.end {
                        SessionEnd::Failed { code } => {
                            println!("\nSession failed ({}) after {} bytes", code, report.bytes_received)
                        }
                        _ => println!("\nSession closed after {} bytes", report.bytes_received),
                    },
                    Err(ExplorerError::Shutdown) => return Err(ExplorerError::Shutdown),
                    Err(e) => error!("{}", e),
                }
            }
            ["reset"] => {
                explorer.reset_store()?;
                println!("Store deleted");
            }
            [] => {}
            _ => println!("Unknown command: {}", command),
        }
    }
}

fn print_menu<R: RadioStack, S: BlockStore>(explorer: &Explorer<R, S>) {
    let topology = explorer.topology();
    println!();
    println!(
        "{} devices, {} services known",
        topology.len(),
        topology.service_count()
    );
    println!("  scan | list | connect <device> <service> | reset | q");
}

fn print_topology<R: RadioStack, S: BlockStore>(explorer: &Explorer<R, S>) {
    let topology = explorer.topology();
    if topology.is_empty() {
        println!("No devices. Run a scan first.");
        return;
    }
    for (d, device) in topology.devices().iter().enumerate() {
        println!("d{}: {} {}", d, device.address, device.display_name());
        for (s, service) in device.services.iter().enumerate() {
            println!(
                "   s{}: channel {} {}",
                s,
                service.channel,
                service.display_name()
            );
        }
    }
}
