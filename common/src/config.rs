use std::env;

/// The well-known name the filtering service registers under.
pub const SERVICE_NAME: &str = "gatelink.filter";

const SERVICE_NAME_ENV: &str = "GATELINK_SERVICE_NAME";

/// Default per-flow byte budget requested when enabling the statistics
/// stream.
pub const DEFAULT_FLOW_BUFFER_BYTES: u32 = 0x40_0000;

/// Resolves the service name, honoring the `GATELINK_SERVICE_NAME`
/// environment override.
pub fn service_name() -> String {
    env::var(SERVICE_NAME_ENV).unwrap_or_else(|_| SERVICE_NAME.to_string())
}
