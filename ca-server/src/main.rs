// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod demo_adapter;
mod ring;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use ca_core::server::ServerCore;
use ca_protocol::DbrType;
use clap::Parser;
use demo_adapter::MemoryAdapter;
use log::{info, warn};
use std::sync::Mutex;

/// Serve the Channel Access stream protocol over a single TCP listener,
/// backed by an in-memory process variable table.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Address to bind the stream listener to.
    #[arg(long, env = "EPICS_CAS_SERVER_PORT", default_value = "0.0.0.0:5064")]
    bind: String,

    /// Maximum number of channels the server will admit across all
    /// clients before refusing further CLAIM_CHANNEL requests.
    #[arg(long, env = "EPICS_CAS_MAX_CHANNELS", default_value_t = 10_000)]
    max_channels: usize,

    /// Diagnostic verbosity passed through to the server/event-queue/
    /// async-table/resource-table `describe` calls.
    #[arg(long, env = "EPICS_CAS_DEBUG_LEVEL", default_value_t = 0)]
    debug_level: u32,

    /// Address to bind the UDP SEARCH/VERSION listener to. Simplified from
    /// the full `EPICS_CAS_INTF_ADDR_LIST` interface enumeration to a
    /// single configurable bind address; see DESIGN.md.
    #[arg(long, env = "EPICS_CAS_INTF_ADDR_LIST", default_value = "0.0.0.0:5064")]
    search_bind: String,

    /// UDP port beacons are sent to (the port clients listen for beacons
    /// on).
    #[arg(long, env = "EPICS_CAS_BEACON_PORT", default_value_t = 5065)]
    beacon_port: u16,

    /// Destination host beacons are sent to. Simplified from the full
    /// `EPICS_CAS_AUTO_BEACON_ADDR_LIST` interface enumeration to a single
    /// configurable destination; see DESIGN.md.
    #[arg(long, env = "EPICS_CAS_BEACON_ADDR_LIST", default_value = "255.255.255.255")]
    beacon_addr: String,

    /// Milliseconds between beacons. 15000 matches the upstream default
    /// beacon period.
    #[arg(long, env = "EPICS_CAS_BEACON_PERIOD", default_value_t = 15_000)]
    beacon_period_ms: u64,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut core = ServerCore::new().with_max_channels(cli.max_channels);
    core.set_debug_level(cli.debug_level);
    let server = Arc::new(Mutex::new(core));

    let adapter = Arc::new(MemoryAdapter::new());
    adapter.seed("demo:counter", DbrType::Long, 1, vec![0, 0, 0, 0], true);
    adapter.seed("demo:heartbeat", DbrType::Double, 1, vec![0u8; 8], false);

    // The datagram side (SEARCH/VERSION replies and the beacon) runs on its
    // own blocking sockets in background threads, the way the teacher runs
    // a second protocol service (the mount daemon's blocking TCP server)
    // alongside its primary one rather than folding it into the same event
    // loop -- see DESIGN.md.
    {
        let search_bind = cli.search_bind.clone();
        let server = Arc::clone(&server);
        let adapter: Arc<dyn ca_core::Adapter> = adapter.clone();
        std::thread::spawn(move || {
            if let Err(e) = udp::run_search_loop(&search_bind, server, adapter) {
                warn!("search loop exited with an error: {e}");
            }
        });
    }
    {
        let beacon_dest = format!("{}:{}", cli.beacon_addr, cli.beacon_port);
        let period = Duration::from_millis(cli.beacon_period_ms);
        let server = Arc::clone(&server);
        let adapter: Arc<dyn ca_core::Adapter> = adapter.clone();
        std::thread::spawn(move || {
            if let Err(e) = udp::run_beacon_loop("0.0.0.0:0", &beacon_dest, period, server, adapter) {
                warn!("beacon loop exited with an error: {e}");
            }
        });
    }

    info!("binding CA stream listener on {}", cli.bind);
    let mut server_loop = ring::CaRingServer::new(&cli.bind, server, adapter)
        .expect("failed to bind stream listener");

    server_loop.main_loop().expect("server loop exited with an error");
}
