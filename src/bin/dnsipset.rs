//! dnsipset: inspect ipset rules and feed addresses into nftables sets.

use clap::{Parser, Subcommand};
use dnsipset::{normalize_host, parse_rules, Config, DomainIndex, SetId};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "dnsipset")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Map DNS hosts to nftables sets", long_about = None)]
struct Cli {
    /// Config file (YAML, or JSON with a .json extension)
    #[arg(short, long, global = true, default_value = "dnsipset.yaml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the rules and print each host with its sets
    Check,

    /// Print the sets a host would be added to
    Lookup {
        /// Host name to look up
        host: String,
    },

    /// Add addresses for a host to its sets in the kernel
    Add {
        /// Host the addresses were resolved for
        #[arg(long)]
        host: String,

        /// Resolved addresses
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match &cli.command {
        Commands::Check => check(&cli.config),
        Commands::Lookup { host } => lookup(&cli.config, host),
        Commands::Add { host, ips } => add(&cli.config, host, ips),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Build the host to identifier table without touching the kernel.
fn load_table(config_path: &Path) -> Result<DomainIndex<SetId>, Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let rules = parse_rules(&config.lines()?)?;

    let mut table = DomainIndex::new();
    for rule in &rules {
        for host in &rule.hosts {
            table.insert(host, rule.sets.iter().cloned());
        }
    }

    Ok(table)
}

fn check(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(config_path)?;

    let mut entries: Vec<_> = table.iter().collect();
    entries.sort_by_key(|(host, _)| *host);

    for (host, sets) in entries {
        let host = if host.is_empty() { "*" } else { host };
        let sets: Vec<String> = sets.iter().map(ToString::to_string).collect();
        println!("{} -> {}", host, sets.join(", "));
    }

    println!("{} hosts OK", table.len());
    Ok(())
}

fn lookup(config_path: &Path, host: &str) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(config_path)?;
    let sets = table.lookup(&normalize_host(host));

    if sets.is_empty() {
        println!("{}: no sets", host);
    }
    for set in sets {
        println!("{}", set);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn add(config_path: &Path, host: &str, ips: &[IpAddr]) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let Some(manager) = dnsipset::new_manager(&config)? else {
        return Err("no ipset rules configured".into());
    };

    let (ip4s, ip6s): (Vec<IpAddr>, Vec<IpAddr>) = ips.iter().partition(|ip| ip.is_ipv4());
    let added = manager.add(host, &ip4s, &ip6s);
    let closed = manager.close();

    println!("Added {} addresses for {}", added?, host);
    closed?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn add(_: &Path, _: &str, _: &[IpAddr]) -> Result<(), Box<dyn std::error::Error>> {
    Err("adding to nftables sets is only supported on Linux".into())
}
