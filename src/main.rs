//! Minimal wiring demo: argv -> `EngineConfig` -> `Reactor` + MD publisher
//! task. Not part of the library's tested surface — CLI entry points are
//! an external consumer of this crate; argv parsing lives in
//! `config::parse_args`, and this binary is just the thin construct-and-run
//! shell around it.

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use lighting_exchange_core::config::parse_args;
use lighting_exchange_core::engine::Engine;
use lighting_exchange_core::protocol::ApiKeyRegistry;
use lighting_exchange_core::reactor::{Reactor, SharedState};
use lighting_exchange_core::ring;
use lighting_exchange_core::telemetry::EventLog;

const DEMO_INSTRUMENT_ID: u32 = 1;
const DEMO_API_KEY: [u8; 16] = [0x01; 16];
const DEMO_HMAC_KEY: [u8; 32] = [0x02; 32];

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            eprintln!(
                "Usage: server [--tcp-port <u16>] [--md-port <u16>] [--ring-capacity <size>] [--max-depth <n>]"
            );
            std::process::exit(1);
        }
    };

    println!("Starting exchange core on TCP port {}...", config.tcp_port);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build current-thread runtime");

    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(run(config)));
}

async fn run(config: lighting_exchange_core::config::EngineConfig) {
    let engine = Engine::new(DEMO_INSTRUMENT_ID);
    let mut api_keys = ApiKeyRegistry::new();
    api_keys.register(DEMO_API_KEY, DEMO_HMAC_KEY);
    let events = EventLog::new(4096);
    let (producer, consumer) = ring::channel(config.ring_capacity);

    let tcp_port = config.tcp_port;
    let md_bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let md_port = config.md_port;
    let md_target: SocketAddr = (config.md_multicast_group, config.md_port).into();
    let md_group = config.md_multicast_group;
    let md_interface = config.md_interface;
    let md_ttl = config.md_ttl;
    let snapshot_interval = config.snapshot_interval;
    let max_depth = config.max_book_depth;
    let monitor_events = events.clone();

    let shared = Rc::new(RefCell::new(SharedState::new(engine, api_keys, producer, events, config)));

    let reactor = match Reactor::bind((Ipv4Addr::UNSPECIFIED, tcp_port).into(), shared.clone()).await {
        Ok(reactor) => reactor,
        Err(e) => {
            eprintln!("Fatal: {e}");
            std::process::exit(1);
        }
    };

    tokio::task::spawn_local(async move {
        let mut publisher = match lighting_exchange_core::md_publisher::MdPublisher::bind(
            md_bind,
            md_group,
            md_interface,
            md_target,
            md_ttl,
            DEMO_INSTRUMENT_ID,
            consumer,
            snapshot_interval,
            max_depth,
        )
        .await
        {
            Ok(publisher) => publisher,
            Err(e) => {
                eprintln!("Fatal: market-data publisher failed to bind: {e}");
                return;
            }
        };

        loop {
            if let Err(e) = publisher.run_once().await {
                tracing::warn!(target: "marketdata", error = %e, "send failed");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    tokio::task::spawn_local(async move {
        let socket = match tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, md_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(target: "marketdata", error = %e, "gap monitor failed to bind, disabled");
                return;
            }
        };
        if let Err(e) = socket.join_multicast_v4(md_group, md_interface) {
            tracing::warn!(target: "marketdata", error = %e, "gap monitor failed to join multicast group, disabled");
            return;
        }

        let mut monitor = lighting_exchange_core::md_observer::MdGapMonitor::new(monitor_events);
        let mut buf = [0u8; 2048];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, _addr)) => monitor.handle_datagram(&buf[..n]),
                Err(e) => {
                    tracing::warn!(target: "marketdata", error = %e, "gap monitor recv failed");
                }
            }
        }
    });

    reactor.run(Duration::from_secs(5)).await;
}
