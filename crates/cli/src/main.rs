use std::net::IpAddr;
use std::sync::Arc;

use camstream::transport::{AddressSelector, SystemInterfaces};
use camstream::{AddressFamily, StreamingConfig};
use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Ipv4,
    Ipv6,
}

impl From<Family> for AddressFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Ipv4 => AddressFamily::Ipv4,
            Family::Ipv6 => AddressFamily::Ipv6,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "camstream-probe",
    about = "Dry-run a stream negotiation: bind return ports and pick the advertised address"
)]
struct Args {
    /// Interface the controller's connection arrives on
    #[arg(long, short)]
    interface: String,

    /// Local address of the controller's connection
    #[arg(long, short)]
    local_address: String,

    /// Address family requested by the controller
    #[arg(long, value_enum, default_value = "ipv4")]
    family: Family,

    /// Operator address override
    #[arg(long)]
    address_override: Option<IpAddr>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let family = AddressFamily::from(args.family);
    let config = StreamingConfig::default();
    let allocator = config.port_allocator();

    let mut sockets = Vec::with_capacity(2);
    for flow in ["video", "audio"] {
        match allocator.allocate(family).await {
            Ok((socket, port)) => {
                println!("{flow} return port: {port}");
                sockets.push(socket);
            }
            Err(e) => {
                eprintln!("Failed to bind {flow} return port: {e}");
                std::process::exit(1);
            }
        }
    }

    let selector = AddressSelector::new(Arc::new(SystemInterfaces));
    match selector.select(family, &args.local_address, &args.interface, args.address_override) {
        Some(address) => println!("advertised address: {address}"),
        None => println!("advertised address: declined"),
    }

    tracing::debug!(ports = sockets.len(), "releasing probe ports");

    drop(sockets);
}
