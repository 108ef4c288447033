//! Parses the INI-style client configuration file: CA/cert/key paths, the
//! broker lists (plain and WebSocket), and an optional outbound HTTP proxy.
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::broker::{Broker, Protocol};
use crate::error::{Error, Result};
use crate::transport::ProxyConfig;

/// Certificate/key material paths, resolved relative to the config file.
#[derive(Clone, Debug)]
pub struct CertPaths {
	pub broker_cert_chain: PathBuf,
	pub cert_file: PathBuf,
	pub private_key: PathBuf,
}

/// Parsed client configuration: cert paths, ranked broker candidates, and
/// optional proxy.
#[derive(Clone, Debug)]
pub struct FabricClientConfig {
	pub certs: CertPaths,
	pub brokers: Vec<Broker>,
	pub brokers_web_sockets: Vec<Broker>,
	pub proxy: Option<ProxyConfig>,
	pub use_web_sockets: bool,
}

impl FabricClientConfig {
	/// Loads and parses the config file at `path`.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let ini = Ini::load_from_file(path)
			.map_err(|error| Error::Config(format!("failed to read {}: {error}", path.display())))?;
		let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
		Self::from_ini(&ini, base_dir)
	}

	fn from_ini(ini: &Ini, base_dir: &Path) -> Result<Self> {
		let certs_section = ini
			.section(Some("Certs"))
			.ok_or_else(|| Error::Config("missing [Certs] section".into()))?;
		let certs = CertPaths {
			broker_cert_chain: resolve_path(base_dir, required(certs_section, "BrokerCertChain")?),
			cert_file: resolve_path(base_dir, required(certs_section, "CertFile")?),
			private_key: resolve_path(base_dir, required(certs_section, "PrivateKey")?),
		};

		let brokers = parse_broker_section(ini, "Brokers", Protocol::Ssl)?;
		let brokers_web_sockets = parse_broker_section(ini, "BrokersWebSockets", Protocol::Wss)?;

		let proxy = ini.section(Some("Proxy")).map(|section| {
			Ok::<_, Error>(ProxyConfig {
				host: required(section, "Address")?.to_string(),
				port: required(section, "Port")?
					.parse()
					.map_err(|_| Error::Config("Proxy.Port is not a valid port number".into()))?,
				username: section.get("User").map(str::to_string),
				password: section.get("Password").map(str::to_string),
			})
		});
		let proxy = proxy.transpose()?;

		let use_web_sockets = ini
			.general_section()
			.get("UseWebSockets")
			.map(|value| value.eq_ignore_ascii_case("true"))
			.unwrap_or(false);

		Ok(Self {
			certs,
			brokers,
			brokers_web_sockets,
			proxy,
			use_web_sockets,
		})
	}
}

fn parse_broker_section(ini: &Ini, section_name: &str, protocol: Protocol) -> Result<Vec<Broker>> {
	let Some(section) = ini.section(Some(section_name)) else {
		return Ok(Vec::new());
	};
	section
		.iter()
		.map(|(_, value)| Broker::parse(value, protocol).map_err(Error::from))
		.collect()
}

fn required<'a>(section: &'a ini::Properties, key: &str) -> Result<&'a str> {
	section
		.get(key)
		.ok_or_else(|| Error::Config(format!("missing required key {key:?}")))
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
	let candidate = Path::new(value);
	if candidate.is_absolute() {
		candidate.to_path_buf()
	} else {
		base_dir.join(candidate)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("client.conf");
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(contents.as_bytes()).unwrap();
		(dir, path)
	}

	#[test]
	fn parses_full_config() {
		let contents = "\
[Certs]
BrokerCertChain=ca.crt
CertFile=client.crt
PrivateKey=client.key

[Brokers]
broker1=unique-1;8883;broker1.example.com

[BrokersWebSockets]
broker2=unique-2;443;broker2.example.com

[Proxy]
Address=proxy.example.com
Port=3128
User=alice
Password=secret

UseWebSockets=true
";
		let (dir, path) = write_config(contents);
		let config = FabricClientConfig::load(&path).unwrap();

		assert_eq!(config.certs.broker_cert_chain, dir.path().join("ca.crt"));
		assert_eq!(config.brokers.len(), 1);
		assert_eq!(config.brokers[0].unique_id, "unique-1");
		assert_eq!(config.brokers_web_sockets.len(), 1);
		assert_eq!(config.brokers_web_sockets[0].protocol, Protocol::Wss);
		let proxy = config.proxy.unwrap();
		assert_eq!(proxy.host, "proxy.example.com");
		assert_eq!(proxy.port, 3128);
		assert!(config.use_web_sockets);
	}

	#[test]
	fn missing_certs_section_is_an_error() {
		let (_dir, path) = write_config("[Brokers]\nb=id;1;host\n");
		assert!(FabricClientConfig::load(&path).is_err());
	}

	#[test]
	fn defaults_use_web_sockets_to_false_and_omits_optional_sections() {
		let contents = "\
[Certs]
BrokerCertChain=ca.crt
CertFile=client.crt
PrivateKey=client.key

[Brokers]
b=id;1;host
";
		let (_dir, path) = write_config(contents);
		let config = FabricClientConfig::load(&path).unwrap();
		assert!(!config.use_web_sockets);
		assert!(config.proxy.is_none());
		assert!(config.brokers_web_sockets.is_empty());
	}
}
