use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use rendezvous_punch::{Builder, CancellationToken, PeerConfig, RedisStore};
use tokio::io::AsyncBufReadExt;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Identity the other peer registered under
    peer_identity: String,
    /// Rendezvous server (redis) address.
    /// example: 192.168.10.2:6379
    rendezvous_server: String,
    /// Our identity, defaults to the local address used to reach the server
    #[arg(short, long)]
    identity: Option<String>,
    /// Host to publish with our port, when the identity is not an address
    #[arg(short, long)]
    advertise_host: Option<IpAddr>,
    /// Registration lease in seconds
    #[arg(short, long)]
    ttl: Option<u64>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args {
        peer_identity,
        rendezvous_server,
        identity,
        advertise_host,
        ttl,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let identity = match identity {
        Some(identity) => identity,
        None => local_ip(&rendezvous_server)
            .context("--identity")?
            .to_string(),
    };
    let mut config = PeerConfig::default();
    if let Some(host) = advertise_host {
        config = config.set_advertise_host(host);
    }
    if let Some(ttl) = ttl {
        config = config.set_registration_ttl(Duration::from_secs(ttl));
    }

    let token = CancellationToken::new();
    let quit = token.clone();
    ctrlc2::set_async_handler(async move {
        quit.cancel();
    })
    .await;

    let mut peer = Builder::new()
        .identity(identity.as_str())
        .store(RedisStore::new(rendezvous_server))
        .config(config)
        .build()?;
    log::info!("{identity} connecting to {peer_identity}");
    if !peer
        .connect_with_cancel(&peer_identity, token.clone())
        .await?
    {
        println!("Failed to establish connection.");
        return Ok(());
    }
    println!("Connection established!");

    let (sender, receiver) = peer.split()?;
    let recv_task = tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        loop {
            match receiver.receive(&mut buf).await {
                Ok(len) => println!("recv: {}", String::from_utf8_lossy(&buf[..len])),
                Err(e) => {
                    log::warn!("receive {e:?}");
                    return;
                }
            }
        }
    });
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if let Err(e) = sender.send(line.as_bytes()).await {
            log::warn!("send {e:?}");
        }
    }
    recv_task.abort();
    peer.close().await;
    log::info!("exit!!!!");
    Ok(())
}

fn local_ip(server: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(server)?;
    Ok(socket.local_addr()?.ip())
}
