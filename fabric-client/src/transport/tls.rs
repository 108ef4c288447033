//! Builds a `rustls` client config from PEM trust/key material, walking the
//! CA set by `Issuer == Subject` to assemble the client certificate chain.
use std::sync::Arc;

use tokio_rustls::rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore};

use crate::error::{Error, Result};

/// Parsed CA bundle plus an optional client certificate/key pair, ready to
/// hand to [`super::client_config`].
pub struct TrustBundle {
	ca_certs: Vec<Certificate>,
	client_chain: Option<(Vec<Certificate>, PrivateKey)>,
}

/// PEM-encoded inputs for [`TrustBundle::from_pem`].
pub struct TlsMaterial<'a> {
	pub ca_bundle_pem: &'a [u8],
	pub client_cert_pem: Option<&'a [u8]>,
	pub client_key_pem: Option<&'a [u8]>,
}

impl TrustBundle {
	pub fn from_pem(material: TlsMaterial<'_>) -> Result<Self> {
		let ca_certs = parse_certs(material.ca_bundle_pem)?;
		if ca_certs.is_empty() {
			return Err(Error::Transport("CA bundle contained no certificates".into()));
		}

		let client_chain = match (material.client_cert_pem, material.client_key_pem) {
			(Some(cert_pem), Some(key_pem)) => {
				let leaf = parse_certs(cert_pem)?;
				let leaf = leaf
					.into_iter()
					.next()
					.ok_or_else(|| Error::Transport("client cert PEM contained no certificate".into()))?;
				let chain = build_chain(leaf, &ca_certs);
				let key = parse_private_key(key_pem)?;
				Some((chain, key))
			}
			(None, None) => None,
			_ => {
				return Err(Error::Transport(
					"client cert and client key must be supplied together".into(),
				))
			}
		};

		Ok(Self {
			ca_certs,
			client_chain,
		})
	}

	/// The `CN` of the client certificate's leaf, if a client cert was
	/// supplied. DXL-style deployments mint the cert CN as the client's
	/// uniqueId, so this is the natural default client identity.
	pub fn client_common_name(&self) -> Option<String> {
		let (chain, _) = self.client_chain.as_ref()?;
		let leaf = chain.first()?;
		let (subject, _) = x509_names(leaf)?;
		extract_common_name(&subject)
	}
}

fn extract_common_name(subject: &str) -> Option<String> {
	subject.split(',').find_map(|part| {
		let part = part.trim();
		part.strip_prefix("CN=").map(str::to_string)
	})
}

fn parse_certs(pem: &[u8]) -> Result<Vec<Certificate>> {
	let mut reader = std::io::Cursor::new(pem);
	let der = rustls_pemfile::certs(&mut reader)
		.map_err(|error| Error::Transport(format!("failed to parse PEM certificates: {error}")))?;
	Ok(der.into_iter().map(Certificate).collect())
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKey> {
	let mut reader = std::io::Cursor::new(pem);
	let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
		.map_err(|error| Error::Transport(format!("failed to parse PKCS#8 private key: {error}")))?;
	let key = keys
		.pop()
		.ok_or_else(|| Error::Transport("no PKCS#8 private key found in PEM".into()))?;
	Ok(PrivateKey(key))
}

/// Walks `Issuer == Subject` against `ca_certs` to build `[leaf, issuer, ..., root]`.
fn build_chain(leaf: Certificate, ca_certs: &[Certificate]) -> Vec<Certificate> {
	let mut chain = vec![leaf];
	loop {
		let current = chain.last().expect("chain always has at least the leaf");
		let Some((subject, issuer)) = x509_names(current) else {
			break;
		};
		if subject == issuer {
			// Self-signed; already the root, stop walking.
			break;
		}
		let Some(next) = ca_certs.iter().find(|candidate| {
			x509_names(candidate)
				.map(|(candidate_subject, _)| candidate_subject == issuer)
				.unwrap_or(false)
		}) else {
			break;
		};
		if chain.iter().any(|seen| seen.0 == next.0) {
			break;
		}
		chain.push(next.clone());
	}
	chain
}

fn x509_names(cert: &Certificate) -> Option<(String, String)> {
	let (_, parsed) = x509_parser::parse_x509_certificate(&cert.0).ok()?;
	Some((
		parsed.subject().to_string(),
		parsed.issuer().to_string(),
	))
}

/// Builds a TLS 1.2 client config that trusts `bundle`'s CA set and, if
/// present, presents `bundle`'s client certificate chain.
pub fn client_config(bundle: &TrustBundle) -> Result<Arc<ClientConfig>> {
	let mut root_store = RootCertStore::empty();
	for cert in &bundle.ca_certs {
		let anchor = trust_anchor_from_der(cert)?;
		root_store.add_trust_anchors(std::iter::once(anchor));
	}

	let builder = ClientConfig::builder()
		.with_safe_defaults()
		.with_root_certificates(root_store);

	let config = match &bundle.client_chain {
		Some((chain, key)) => builder
			.with_client_auth_cert(chain.clone(), key.clone())
			.map_err(|error| Error::Transport(format!("invalid client certificate/key: {error}")))?,
		None => builder.with_no_client_auth(),
	};

	Ok(Arc::new(config))
}

fn trust_anchor_from_der(cert: &Certificate) -> Result<OwnedTrustAnchor> {
	let (_, parsed) = x509_parser::parse_x509_certificate(&cert.0)
		.map_err(|error| Error::Transport(format!("invalid CA certificate: {error}")))?;
	let spki = parsed.tbs_certificate.subject_pki.raw;
	let subject = parsed.tbs_certificate.subject.as_raw();
	Ok(OwnedTrustAnchor::from_subject_spki_name_constraints(
		subject.to_vec(),
		spki.to_vec(),
		None,
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_client_key_without_cert_is_accepted_as_no_client_auth() {
		// A CA-only bundle with neither cert nor key configures no client
		// auth, rather than erroring -- only a cert/key mismatch is invalid.
		let material = TlsMaterial {
			ca_bundle_pem: TEST_CA_PEM,
			client_cert_pem: None,
			client_key_pem: None,
		};
		let bundle = TrustBundle::from_pem(material).unwrap();
		assert!(bundle.client_chain.is_none());
	}

	#[test]
	fn mismatched_cert_and_key_presence_is_rejected() {
		let material = TlsMaterial {
			ca_bundle_pem: TEST_CA_PEM,
			client_cert_pem: Some(TEST_CA_PEM),
			client_key_pem: None,
		};
		assert!(TrustBundle::from_pem(material).is_err());
	}

	// A minimal self-signed CA generated for test fixtures only; not used to
	// authenticate anything outside this module.
	const TEST_CA_PEM: &[u8] = include_bytes!("../../tests/fixtures/test-ca.pem");
}
