use bincode::{deserialize, serialize};
use shared::entities::{Commodity, TradeDirection};
use shared::{Packet, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

// Smoke-test client: connects as character 1, buys fuel ore at port 1 and
// prints everything the server sends back.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    println!("Connecting to {} as character 1...", server_addr);

    send(
        &socket,
        &server_addr,
        &Packet::Connect {
            character_id: 1,
            client_version: PROTOCOL_VERSION,
        },
    )
    .await?;

    match recv(&socket).await? {
        Packet::Connected { character_id } => {
            println!("Connected as character {}", character_id);
        }
        other => {
            println!("Connection refused: {:?}", other);
            return Ok(());
        }
    }

    send(
        &socket,
        &server_addr,
        &Packet::ExecuteTrade {
            character_id: 1,
            port_id: 1,
            commodity: Commodity::FuelOre,
            direction: TradeDirection::Buy,
            quantity: 5,
        },
    )
    .await?;

    // Collect the result plus any events that follow it.
    for _ in 0..4 {
        match recv(&socket).await {
            Ok(Packet::TradeResult { result }) => match result {
                Ok(receipt) => println!(
                    "Trade committed: {} x{:?} for {} credits ({} attempt(s))",
                    receipt.quantity, receipt.commodity, receipt.total, receipt.attempts
                ),
                Err(err) => println!("Trade rejected: {}", err),
            },
            Ok(Packet::Event { scope, event }) => {
                println!("Event for {:?}: {:?}", scope, event);
            }
            Ok(other) => println!("Unexpected packet: {:?}", other),
            Err(_) => break,
        }
    }

    send(&socket, &server_addr, &Packet::Disconnect).await?;
    println!("Disconnected");
    Ok(())
}

async fn send(
    socket: &UdpSocket,
    addr: &str,
    packet: &Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&serialize(packet)?, addr).await?;
    Ok(())
}

async fn recv(socket: &UdpSocket) -> Result<Packet, Box<dyn std::error::Error>> {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await??;
    Ok(deserialize(&buf[..len])?)
}
