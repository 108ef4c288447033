//! Broker model, config-string parsing, and latency-based ranking.
use std::{
	cmp::Ordering,
	fmt,
	net::{IpAddr, Ipv4Addr, Ipv6Addr},
	str::FromStr,
	sync::OnceLock,
	time::Duration,
};

use thiserror::Error;
use url::Url;

/// The wire protocol a [`Broker`] speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
	/// Direct TLS, `ssl://host:port`.
	Ssl,
	/// TLS-over-WebSocket, `wss://host:port`.
	Wss,
}

impl Protocol {
	pub fn scheme(self) -> &'static str {
		match self {
			Protocol::Ssl => "ssl",
			Protocol::Wss => "wss",
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.scheme())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedBroker {
	#[error("broker config string is empty")]
	Empty,
	#[error("broker config string is missing a required field")]
	MissingField,
	#[error("broker config string has too many fields")]
	TooManyFields,
	#[error("broker port {0:?} is out of range (must be 1-65535)")]
	InvalidPort(String),
	#[error("broker hostname {0:?} is not a valid hostname or IP address")]
	InvalidHostName(String),
	#[error("broker IP address {0:?} is not a valid IPv4 or IPv6 address")]
	InvalidIpAddress(String),
}

/// A single broker endpoint.
///
/// Two `Broker`s are equal iff `(unique_id, host_name, ip_address, port)` match;
/// `response_time` and `response_from_ip_address` are measurement state, not
/// identity.
#[derive(Clone, Debug)]
pub struct Broker {
	pub unique_id: String,
	pub host_name: String,
	pub ip_address: Option<IpAddr>,
	pub port: u16,
	pub protocol: Protocol,
	pub response_time: Option<Duration>,
	pub response_from_ip_address: bool,
}

impl PartialEq for Broker {
	fn eq(&self, other: &Self) -> bool {
		self.unique_id == other.unique_id
			&& self.host_name == other.host_name
			&& self.ip_address == other.ip_address
			&& self.port == other.port
	}
}
impl Eq for Broker {}

impl Broker {
	/// Parses a broker config string of the form `UniqueId;Port;HostName[;IpAddress]`.
	///
	/// IPv6 literals may be wrapped in `[]`; the brackets are stripped on parse
	/// and re-added when composing a URI.
	pub fn parse(input: &str, protocol: Protocol) -> Result<Self, MalformedBroker> {
		if input.trim().is_empty() {
			return Err(MalformedBroker::Empty);
		}

		let fields: Vec<&str> = input.split(';').collect();
		if fields.len() < 3 {
			return Err(MalformedBroker::MissingField);
		}
		if fields.len() > 4 {
			return Err(MalformedBroker::TooManyFields);
		}

		let unique_id = fields[0].trim();
		if unique_id.is_empty() {
			return Err(MalformedBroker::MissingField);
		}

		let port = parse_port(fields[1])?;

		let host_name = strip_ipv6_brackets(fields[2].trim());
		if host_name.is_empty() {
			return Err(MalformedBroker::MissingField);
		}
		if !is_valid_host(host_name) {
			return Err(MalformedBroker::InvalidHostName(host_name.to_string()));
		}

		let ip_address = match fields.get(3) {
			Some(raw) => {
				let raw = strip_ipv6_brackets(raw.trim());
				if raw.is_empty() {
					None
				} else {
					Some(
						IpAddr::from_str(raw)
							.map_err(|_| MalformedBroker::InvalidIpAddress(raw.to_string()))?,
					)
				}
			}
			None => None,
		};

		Ok(Self {
			unique_id: unique_id.to_string(),
			host_name: host_name.to_string(),
			ip_address,
			port,
			protocol,
			response_time: None,
			response_from_ip_address: false,
		})
	}

	/// Round-trips back to the `UniqueId;Port;HostName[;IpAddress]` form.
	pub fn to_config_string(&self) -> String {
		let host = bracket_if_ipv6(&self.host_name);
		match self.ip_address {
			Some(ip) => format!(
				"{};{};{};{}",
				self.unique_id,
				self.port,
				host,
				bracket_if_ipv6(&ip.to_string())
			),
			None => format!("{};{};{}", self.unique_id, self.port, host),
		}
	}

	/// The `scheme://host:port` URI built from `host_name`.
	pub fn host_uri(&self) -> Url {
		self.uri_for(&bracket_if_ipv6(&self.host_name))
	}

	/// The `scheme://host:port` URI built from `ip_address`, if known.
	pub fn ip_uri(&self) -> Option<Url> {
		self.ip_address
			.map(|ip| self.uri_for(&bracket_if_ipv6(&ip.to_string())))
	}

	fn uri_for(&self, host: &str) -> Url {
		Url::parse(&format!("{}://{}:{}", self.protocol.scheme(), host, self.port))
			.expect("scheme/host/port always form a valid URL")
	}

	/// The URIs a connect attempt should try for this broker, hostname first.
	///
	/// Both are always emitted (not just whichever probed successfully) so a
	/// later connect attempt — which may run long after ranking — can still
	/// fall back to the other address.
	pub fn uris(&self) -> Vec<Url> {
		let mut uris = vec![self.host_uri()];
		if let Some(ip_uri) = self.ip_uri() {
			uris.push(ip_uri);
		}
		uris
	}
}

/// Default bound on concurrent TCP probes during [`rank`].
pub const DEFAULT_PROBE_CONCURRENCY: usize = 20;
/// Default per-attempt probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Ranks `brokers` by TCP-connect latency to `host_name` (falling back to
/// `ip_address` on failure), using up to [`DEFAULT_PROBE_CONCURRENCY`]
/// concurrent probes of [`DEFAULT_PROBE_TIMEOUT`] each.
///
/// Brokers that fail both probes keep `response_time == None` and sort after
/// every successfully-probed broker. This never holds any client-wide lock —
/// it only operates on the `Vec<Broker>` it owns.
pub async fn rank(brokers: Vec<Broker>) -> Vec<Broker> {
	rank_with(brokers, DEFAULT_PROBE_CONCURRENCY, DEFAULT_PROBE_TIMEOUT).await
}

/// [`rank`] with an explicit concurrency bound and per-attempt timeout, for tests.
pub async fn rank_with(brokers: Vec<Broker>, concurrency: usize, timeout: Duration) -> Vec<Broker> {
	use tokio::sync::Semaphore;
	use tokio::task::JoinSet;

	let semaphore = std::sync::Arc::new(Semaphore::new(concurrency.max(1)));
	let mut set = JoinSet::new();
	for broker in brokers {
		let semaphore = std::sync::Arc::clone(&semaphore);
		set.spawn(async move {
			let _permit = semaphore
				.acquire_owned()
				.await
				.expect("probe semaphore is never closed");
			probe_one(broker, timeout).await
		});
	}

	let mut probed = Vec::new();
	while let Some(result) = set.join_next().await {
		if let Ok(broker) = result {
			probed.push(broker);
		}
	}

	probed.sort();
	probed
}

async fn probe_one(mut broker: Broker, timeout: Duration) -> Broker {
	use std::time::Instant;
	use tokio::net::TcpStream;

	let start = Instant::now();
	let connected = tokio::time::timeout(timeout, TcpStream::connect((broker.host_name.as_str(), broker.port)))
		.await
		.map(|result| result.is_ok())
		.unwrap_or(false);
	if connected {
		broker.response_time = Some(start.elapsed());
		broker.response_from_ip_address = false;
		return broker;
	}

	if let Some(ip) = broker.ip_address {
		let start = Instant::now();
		let connected = tokio::time::timeout(timeout, TcpStream::connect((ip, broker.port)))
			.await
			.map(|result| result.is_ok())
			.unwrap_or(false);
		if connected {
			broker.response_time = Some(start.elapsed());
			broker.response_from_ip_address = true;
			return broker;
		}
	}

	broker.response_time = None;
	broker
}

impl PartialOrd for Broker {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Broker {
	/// Ascending by `response_time`; brokers with no measured latency sort last.
	fn cmp(&self, other: &Self) -> Ordering {
		match (self.response_time, other.response_time) {
			(Some(a), Some(b)) => a.cmp(&b),
			(Some(_), None) => Ordering::Less,
			(None, Some(_)) => Ordering::Greater,
			(None, None) => Ordering::Equal,
		}
	}
}

fn parse_port(raw: &str) -> Result<u16, MalformedBroker> {
	let raw = raw.trim();
	let value: u32 = raw
		.parse()
		.map_err(|_| MalformedBroker::InvalidPort(raw.to_string()))?;
	if value == 0 || value > u16::MAX as u32 {
		return Err(MalformedBroker::InvalidPort(raw.to_string()));
	}
	Ok(value as u16)
}

fn strip_ipv6_brackets(s: &str) -> &str {
	s.strip_prefix('[')
		.and_then(|s| s.strip_suffix(']'))
		.unwrap_or(s)
}

fn bracket_if_ipv6(host: &str) -> String {
	if host.parse::<Ipv6Addr>().is_ok() {
		format!("[{host}]")
	} else {
		host.to_string()
	}
}

fn dns_label_regex() -> &'static regex::Regex {
	static RE: OnceLock<regex::Regex> = OnceLock::new();
	RE.get_or_init(|| {
		regex::Regex::new(r"^(?:[A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]{0,61}[A-Za-z0-9])$")
			.expect("static regex is valid")
	})
}

fn netbios_regex() -> &'static regex::Regex {
	static RE: OnceLock<regex::Regex> = OnceLock::new();
	RE.get_or_init(|| {
		regex::Regex::new(r"^[A-Za-z0-9!@#$%^&()\-_'{}.~]{1,15}$").expect("static regex is valid")
	})
}

/// Validates `host` as one of: an IPv4 dotted quad, a full IPv6 literal
/// (with embedded v4 support via [`Ipv4Addr`]/[`Ipv6Addr`] parsing), a
/// dot-separated run of DNS labels, or a bare NetBIOS name.
fn is_valid_host(host: &str) -> bool {
	if host.parse::<Ipv4Addr>().is_ok() || host.parse::<Ipv6Addr>().is_ok() {
		return true;
	}

	if host.contains('.') {
		return host.split('.').all(|label| dns_label_regex().is_match(label));
	}

	dns_label_regex().is_match(host) || netbios_regex().is_match(host)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_broker() {
		let broker = Broker::parse("broker-1;8883;mqtt.example.com", Protocol::Ssl).unwrap();
		assert_eq!(broker.unique_id, "broker-1");
		assert_eq!(broker.port, 8883);
		assert_eq!(broker.host_name, "mqtt.example.com");
		assert_eq!(broker.ip_address, None);
	}

	#[test]
	fn parses_broker_with_ip() {
		let broker = Broker::parse("broker-1;8883;mqtt.example.com;10.0.0.1", Protocol::Ssl).unwrap();
		assert_eq!(broker.ip_address, Some(IpAddr::from([10, 0, 0, 1])));
	}

	#[test]
	fn parses_bracketed_ipv6() {
		let broker = Broker::parse("broker-1;8883;[::1]", Protocol::Ssl).unwrap();
		assert_eq!(broker.host_name, "::1");
		assert_eq!(broker.to_config_string(), "broker-1;8883;[::1]");
	}

	#[test]
	fn rejects_blank_input() {
		assert_eq!(Broker::parse("", Protocol::Ssl), Err(MalformedBroker::Empty));
		assert_eq!(
			Broker::parse("   ", Protocol::Ssl),
			Err(MalformedBroker::Empty)
		);
	}

	#[test]
	fn rejects_missing_fields() {
		assert_eq!(
			Broker::parse("broker-1;8883", Protocol::Ssl),
			Err(MalformedBroker::MissingField)
		);
	}

	#[test]
	fn port_boundaries() {
		assert_eq!(
			Broker::parse("b;0;host", Protocol::Ssl),
			Err(MalformedBroker::InvalidPort("0".into()))
		);
		assert!(Broker::parse("b;65535;host", Protocol::Ssl).is_ok());
		assert_eq!(
			Broker::parse("b;65536;host", Protocol::Ssl),
			Err(MalformedBroker::InvalidPort("65536".into()))
		);
		assert_eq!(
			Broker::parse("b;notaport;host", Protocol::Ssl),
			Err(MalformedBroker::InvalidPort("notaport".into()))
		);
	}

	#[test]
	fn round_trips_config_string() {
		for input in [
			"broker-1;8883;mqtt.example.com",
			"broker-2;1883;mqtt.example.com;10.0.0.1",
			"broker-3;8883;[::1]",
		] {
			let broker = Broker::parse(input, Protocol::Ssl).unwrap();
			let reparsed = Broker::parse(&broker.to_config_string(), Protocol::Ssl).unwrap();
			assert_eq!(broker, reparsed);
		}
	}

	#[test]
	fn orders_by_response_time_with_none_last() {
		let mut a = Broker::parse("a;1883;host-a", Protocol::Ssl).unwrap();
		let mut b = Broker::parse("b;1883;host-b", Protocol::Ssl).unwrap();
		let c = Broker::parse("c;1883;host-c", Protocol::Ssl).unwrap();

		a.response_time = Some(Duration::from_millis(50));
		b.response_time = Some(Duration::from_millis(10));
		// `c` has no response time.

		let mut brokers = vec![a.clone(), b.clone(), c.clone()];
		brokers.sort();
		assert_eq!(brokers, vec![b, a, c]);
	}

	#[tokio::test]
	async fn ranks_reachable_broker_ahead_of_unreachable_one() {
		let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		tokio::spawn(async move {
			loop {
				let _ = listener.accept().await;
			}
		});

		let reachable = Broker::parse(&format!("up;{port};127.0.0.1"), Protocol::Ssl).unwrap();
		let unreachable = Broker::parse("down;1;192.0.2.1", Protocol::Ssl).unwrap();

		let ranked = rank_with(
			vec![unreachable.clone(), reachable.clone()],
			4,
			Duration::from_millis(100),
		)
		.await;

		assert_eq!(ranked[0].unique_id, "up");
		assert!(ranked[0].response_time.is_some());
		assert_eq!(ranked[1].unique_id, "down");
		assert_eq!(ranked[1].response_time, None);
	}
}
