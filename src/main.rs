#[macro_use]
extern crate log;

use std::env;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::process;
use std::str::FromStr;

use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use wave_dht::{Config, Node, NodeId, NodeRole, ServiceInfo};

fn init_logger(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let logger_config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Off)
        .set_location_level(LevelFilter::Off)
        .build();
    if CombinedLogger::init(vec![TermLogger::new(
        level,
        logger_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .is_err()
    {
        eprintln!("Logger already initialized");
    }
}

fn load_config() -> Result<Config, wave_dht::DhtError> {
    match env::args().nth(1) {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
}

fn parse_addr(arg: Option<&&str>) -> Option<SocketAddr> {
    arg.and_then(|addr| addr.parse().ok())
}

fn parse_role(arg: Option<&&str>) -> Option<NodeRole> {
    arg.and_then(|role| role.parse().ok())
}

fn print_services(services: &[ServiceInfo]) {
    for info in services {
        println!(
            "{} {} {} shards={} version={}",
            info.role, info.node_id, info.address, info.num_shards, info.version
        );
    }
}

/// Runs one console command. Returns `false` when the console should exit.
fn run_command(node: &Node, line: &str) -> bool {
    let args: Vec<&str> = line.split_whitespace().collect();
    match args.first().copied() {
        Some("id") => println!("{}", node.node_id()),
        Some("size") => println!("{}", node.routing_table_size()),
        Some("peers") => {
            for contact in node.known_peers() {
                println!("{:?}", contact);
            }
        },
        Some("lookup") => match args.get(1).map(|id| id.parse::<NodeId>()) {
            Some(Ok(target)) => match node.lookup(&target) {
                Ok(()) => println!("routing table holds {} contacts", node.routing_table_size()),
                Err(err) => error!("Lookup failed: {}", err),
            },
            _ => println!("usage: lookup <hex id>"),
        },
        Some("ping") => match parse_addr(args.get(1)) {
            Some(addr) => match node.ping(addr) {
                Ok(info) => print_services(&[info]),
                Err(err) => error!("Ping failed: {}", err),
            },
            None => println!("usage: ping <ip:port>"),
        },
        Some("services") => match parse_role(args.get(1)) {
            Some(role) => print_services(&node.find_services_by_role(role)),
            None => println!("usage: services <capacitor|locker>"),
        },
        Some("remote-services") => match (parse_addr(args.get(1)), parse_role(args.get(2))) {
            (Some(addr), Some(role)) => match node.find_remote_services(addr, role) {
                Ok(services) => print_services(&services),
                Err(err) => error!("Find service failed: {}", err),
            },
            _ => println!("usage: remote-services <ip:port> <capacitor|locker>"),
        },
        Some("register") => match (args.get(1), parse_role(args.get(2)), args.get(3)) {
            (Some(service_id), Some(role), Some(address)) => {
                node.register_service(service_id, ServiceInfo::new(node.node_id(), role, address));
                println!("registered {}", service_id);
            },
            _ => println!("usage: register <service id> <capacitor|locker> <address>"),
        },
        Some("quit") | Some("exit") => return false,
        Some(other) => println!("unknown command `{}`", other),
        None => {},
    }
    true
}

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config: {}", err);
            process::exit(1);
        },
    };
    init_logger(&config.log_level);

    if let Err(err) = config.ensure_storage_dir() {
        error!("Failed to create storage directory: {}", err);
        process::exit(1);
    }

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(err) => {
            error!("DHT initialization failed: {}", err);
            process::exit(1);
        },
    };
    info!("DHT initialized with node id {}", node.node_id());

    if let Err(err) = node.start() {
        warn!("DHT bootstrap incomplete: {}", err);
    }

    let input = io::stdin();
    println!("Ready for input!");
    for line in input.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if !run_command(&node, &line) {
            break;
        }
    }

    node.stop();
}
