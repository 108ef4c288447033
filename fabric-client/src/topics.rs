//! Well-known topic names fixed by the fabric, independent of any particular
//! broker or deployment.

/// Prefix for a client's per-client reply topic; the full topic is this
/// prefix plus the client's `uniqueId`.
pub const REPLY_PREFIX: &str = "/mcafee/client/";

pub const SERVICE_REGISTER_TOPIC: &str = "/mcafee/service/dxl/svcregistry/register";
pub const SERVICE_UNREGISTER_TOPIC: &str = "/mcafee/service/dxl/svcregistry/unregister";
pub const BROKER_REGISTRY_QUERY_TOPIC: &str = "/mcafee/service/dxl/brokerregistry/query";

/// Builds the per-client reply topic for `client_unique_id`.
pub fn reply_topic(client_unique_id: &str) -> String {
	format!("{REPLY_PREFIX}{client_unique_id}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reply_topic_appends_unique_id_to_prefix() {
		assert_eq!(reply_topic("client-1"), "/mcafee/client/client-1");
	}
}
