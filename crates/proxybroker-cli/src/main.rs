//! CLI front end: three subcommands (`grab`, `find`, `serve`) over this
//! crate's `Broker`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::builder::PossibleValue;
use clap::{Args, Parser, Subcommand};
use proxybroker::{Broker, BrokerConfig, NoGeoIp, Protocol, RawBrokerConfig};

const HELP_TEXT: &str = "A public-proxy lifecycle engine: discover, verify, rank, and optionally forward through proxies.";

#[derive(Parser, Debug, Clone)]
#[command(after_help = HELP_TEXT)]
struct Cli {
	/// The maximum number of concurrent proxy checks (the check-queue bound)
	#[arg(long, default_value = "200")]
	max_conn: usize,

	/// Time in seconds before giving up on a single check
	#[arg(short, long, default_value = "8")]
	timeout: u64,

	/// Logging level
	#[arg(long = "log", default_value = "warn", value_parser([
		PossibleValue::new("debug"),
		PossibleValue::new("info"),
		PossibleValue::new("warn"),
		PossibleValue::new("error"),
	]))]
	log_level: String,

	/// Accepted for compatibility; this build has no version check to skip.
	#[arg(long, hide = true)]
	skip_version_check: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
	/// Discover, verify, and print proxies, then exit
	Grab(GrabArgs),
	/// Discover and verify proxies continuously, printing each as it's confirmed
	Find(FindArgs),
	/// Run a local forwarding proxy backed by continuously-verified proxies
	Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct GrabArgs {
	/// Protocol(s) that need to be confirmed on a proxy before it counts
	#[arg(long, num_args(1..), value_parser([
		PossibleValue::new("HTTP"),
		PossibleValue::new("HTTPS"),
		PossibleValue::new("SOCKS4"),
		PossibleValue::new("SOCKS5"),
		PossibleValue::new("CONNECT:80"),
		PossibleValue::new("CONNECT:25"),
	]))]
	types: Vec<String>,

	/// GeoIP country-code allow-list; unset means unfiltered
	#[arg(short = 'c', long = "countries", num_args(1..))]
	countries: Vec<String>,

	/// The maximum number of working proxies to collect
	#[arg(short, long, default_value = "10")]
	limit: usize,

	/// Judge URLs to verify candidates against
	#[arg(long, num_args(1..), required = true)]
	judges: Vec<String>,

	/// Proxy list files to use as providers instead of fetching from the web
	#[arg(long, num_args(1..))]
	files: Vec<std::path::PathBuf>,

	/// Submit the judge check as a POST instead of a GET
	#[arg(long)]
	post: bool,

	/// Request body to submit when `--post` is set
	#[arg(long)]
	data: Option<String>,

	/// Require High anonymity for a protocol check to count as passed
	#[arg(long)]
	strict: bool,

	/// DNSBL hostnames to check candidate IPs against
	#[arg(long, num_args(1..))]
	dnsbl: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct FindArgs {
	#[command(flatten)]
	grab: GrabArgs,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
	/// Address the local forwarding proxy listens on
	#[arg(long, default_value = "127.0.0.1:8080")]
	bind: SocketAddr,

	/// Protocol(s) that need to be confirmed on a proxy before it counts
	#[arg(long, num_args(1..), value_parser([
		PossibleValue::new("HTTP"),
		PossibleValue::new("HTTPS"),
		PossibleValue::new("SOCKS4"),
		PossibleValue::new("SOCKS5"),
		PossibleValue::new("CONNECT:80"),
		PossibleValue::new("CONNECT:25"),
	]))]
	types: Vec<String>,

	/// GeoIP country-code allow-list; unset means unfiltered
	#[arg(short = 'c', long = "countries", num_args(1..))]
	countries: Vec<String>,

	/// Judge URLs to verify candidates against
	#[arg(long, num_args(1..), required = true)]
	judges: Vec<String>,

	/// Proxy list files to use as providers instead of fetching from the web
	#[arg(long, num_args(1..))]
	files: Vec<std::path::PathBuf>,

	/// How many verified proxies the backing pool buffers at once
	#[arg(short, long, default_value = "100")]
	limit: usize,

	/// Prefer CONNECT tunneling over a relayed request when both work
	#[arg(long)]
	prefer_connect: bool,

	/// HTTP status codes a relayed response is allowed to carry; unset means no filtering
	#[arg(long, num_args(1..))]
	http_allowed_codes: Vec<u16>,
}

fn parse_countries(countries: &[String]) -> HashSet<String> {
	countries.iter().map(|c| c.to_uppercase()).collect()
}

fn parse_types(types: &[String]) -> HashSet<Protocol> {
	types
		.iter()
		.filter_map(|t| match t.as_str() {
			"HTTP" => Some(Protocol::Http),
			"HTTPS" => Some(Protocol::Https),
			"SOCKS4" => Some(Protocol::Socks4),
			"SOCKS5" => Some(Protocol::Socks5),
			"CONNECT:80" => Some(Protocol::Connect80),
			"CONNECT:25" => Some(Protocol::Connect25),
			_ => None,
		})
		.collect()
}

fn parse_judges(urls: &[String]) -> anyhow::Result<Vec<url::Url>> {
	urls.iter().map(|u| url::Url::parse(u).map_err(Into::into)).collect()
}

async fn load_providers(files: &[std::path::PathBuf]) -> anyhow::Result<Vec<Arc<dyn proxybroker::discovery::Provider>>> {
	use proxybroker::discovery::{Provider, RawCandidate, StaticListProvider};
	let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
	for file in files {
		let contents = tokio::fs::read_to_string(file).await?;
		let candidates: Vec<RawCandidate> = contents
			.lines()
			.filter_map(|line| {
				let (host, port) = line.trim().rsplit_once(':')?;
				Some(RawCandidate {
					host: host.to_string(),
					port: port.parse().ok()?,
					expected_types: HashSet::new(),
				})
			})
			.collect();
		providers.push(Arc::new(StaticListProvider::new(file.display().to_string(), candidates)));
	}
	Ok(providers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	broker_core::logging::init(&cli.log_level);

	match cli.command {
		Commands::Grab(args) => {
			let config = RawBrokerConfig {
				max_conn: Some(cli.max_conn),
				check_timeout: Some(std::time::Duration::from_secs(cli.timeout)),
				post: Some(args.post),
				data: args.data.clone(),
				strict: Some(args.strict),
				dnsbl: if args.dnsbl.is_empty() { None } else { Some(args.dnsbl.clone()) },
				..Default::default()
			}
			.resolve()?;
			let judges = parse_judges(&args.judges)?;
			let providers = load_providers(&args.files).await?;
			let broker = Broker::new(config, providers, judges, Arc::new(NoGeoIp));
			let types = parse_types(&args.types);
			let countries = parse_countries(&args.countries);
			let found = broker.grab(types, countries, args.limit).await?;
			for proxy in found {
				println!("{}", proxy.as_text());
			}
		}
		Commands::Find(args) => {
			let args = args.grab;
			let config = RawBrokerConfig {
				max_conn: Some(cli.max_conn),
				check_timeout: Some(std::time::Duration::from_secs(cli.timeout)),
				post: Some(args.post),
				data: args.data.clone(),
				strict: Some(args.strict),
				dnsbl: if args.dnsbl.is_empty() { None } else { Some(args.dnsbl.clone()) },
				..Default::default()
			}
			.resolve()?;
			let judges = parse_judges(&args.judges)?;
			let providers = load_providers(&args.files).await?;
			let broker = Broker::new(config, providers, judges, Arc::new(NoGeoIp));
			let types = parse_types(&args.types);
			let countries = parse_countries(&args.countries);
			let pool = broker.find(types, countries).await?;
			loop {
				tokio::time::sleep(std::time::Duration::from_secs(5)).await;
				tracing::info!(queued = pool.len(), "pool status");
			}
		}
		Commands::Serve(args) => {
			let config = RawBrokerConfig {
				max_conn: Some(cli.max_conn),
				check_timeout: Some(std::time::Duration::from_secs(cli.timeout)),
				prefer_connect: Some(args.prefer_connect),
				http_allowed_codes: if args.http_allowed_codes.is_empty() { None } else { Some(args.http_allowed_codes.clone()) },
				..Default::default()
			}
			.resolve()?;
			let judges = parse_judges(&args.judges)?;
			let providers = load_providers(&args.files).await?;
			let broker = Broker::new(config, providers, judges, Arc::new(NoGeoIp));
			let types = parse_types(&args.types);
			let countries = parse_countries(&args.countries);
			broker.serve(args.bind, types, countries, args.limit).await?;
		}
	}
	Ok(())
}
