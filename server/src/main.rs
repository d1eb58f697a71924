use clap::Parser;
use log::info;
use server::access::{OwnershipAuthorizer, WindowLimiter};
use server::combat::CombatEngine;
use server::events::EventBus;
use server::gateway::Gateway;
use server::map::{SectorMap, StaticMap};
use server::movement::MovementEngine;
use server::network::Server;
use server::trading::TradingEngine;
use shared::entities::{
    CharacterState, GarrisonState, Owner, PortInventory, ShipState,
};
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, seeds the demo universe, then runs the
/// network server until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Maximum concurrent sessions
        #[clap(short, long, default_value = "32")]
        max_sessions: usize,
        /// Combat round deadline in seconds
        #[clap(long, default_value = "30")]
        round_deadline_secs: u64,
        /// Hyperspace transit time per unit of warp cost, in milliseconds
        #[clap(long, default_value = "1000")]
        transit_ms: u64,
        /// Allowed operations per actor per minute
        #[clap(long, default_value = "60")]
        rate_limit: u32,
    }

    env_logger::init();
    let args = Args::parse();

    let gateway = Arc::new(Gateway::new());
    let map = seed_demo_universe(&gateway).await;
    let map: Arc<dyn SectorMap> = Arc::new(map);

    let (events, events_rx) = EventBus::new();
    let combat = Arc::new(CombatEngine::new(
        Arc::clone(&gateway),
        events.clone(),
        Arc::clone(&map),
        args.round_deadline_secs * 1000,
    ));
    let trading = Arc::new(TradingEngine::new(Arc::clone(&gateway), events.clone()));
    let movement = Arc::new(MovementEngine::new(
        Arc::clone(&gateway),
        events.clone(),
        Arc::clone(&map),
        Arc::clone(&combat),
        args.transit_ms,
    ));

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(
        &address,
        args.max_sessions,
        gateway,
        trading,
        combat,
        movement,
        Arc::new(OwnershipAuthorizer),
        Arc::new(WindowLimiter::new(args.rate_limit, 60_000)),
        events_rx,
    )
    .await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}

/// Seeds a small universe so the binary is playable out of the box: five
/// linked sectors, a port, a toll garrison and two characters with ships.
async fn seed_demo_universe(gateway: &Gateway) -> StaticMap {
    let mut map = StaticMap::new();
    map.link(1, 2);
    map.link(2, 3);
    map.link(3, 4);
    map.link(4, 5);
    map.link(5, 1);
    map.link(1, 3);

    gateway
        .ports
        .insert(
            1,
            PortInventory {
                port_id: 1,
                sector_id: 2,
                code: "SBB".to_string(),
                stock: [800, 400, 300],
                max_capacity: [1000, 1000, 1000],
            },
        )
        .await;

    gateway
        .garrisons
        .insert(
            1,
            GarrisonState {
                garrison_id: 1,
                sector_id: 4,
                owner: Owner::Character(2),
                fighters: 60,
                toll: 500,
                toll_balance: 0,
            },
        )
        .await;

    // Character 1 starts docked at the port so the smoke client can trade.
    for (character_id, ship_id, sector) in [(1u32, 1u32, 2u32), (2, 2, 3)] {
        gateway
            .ships
            .insert(
                ship_id,
                ShipState {
                    ship_id,
                    owner: Owner::Character(character_id),
                    sector_id: Some(sector),
                    credits: 5_000,
                    cargo: [0, 0, 0],
                    cargo_capacity: 60,
                    fighters: 100,
                    shields: 50,
                    is_escape_pod: false,
                    warp_power: 30,
                    warp_power_capacity: 30,
                    warp_cost: 3,
                    in_hyperspace: false,
                    hyperspace_destination: None,
                    hyperspace_eta: None,
                },
            )
            .await;
        gateway
            .characters
            .insert(
                character_id,
                CharacterState {
                    character_id,
                    corporation: None,
                    ship_id,
                },
            )
            .await;
    }

    info!("demo universe seeded: 5 sectors, 1 port, 1 garrison, 2 characters");
    map
}
