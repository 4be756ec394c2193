//! Discovery of a running container's network address

use crate::descriptor::HostDescriptor;
use crate::runner::{CommandError, CommandRunner};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Network endpoint requests are forwarded to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackendAddress {
    pub ip: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("inspection failed: {0}")]
    Inspect(#[from] CommandError),
    #[error("container has no IP address")]
    EmptyIp,
    #[error("container exposes no TCP port")]
    NoUsablePort,
}

/// Pick the canonical address from `ip:port/proto:port/proto...`.
///
/// The smallest port whose protocol is not `udp` wins. Entries that do not
/// parse are ignored.
pub fn parse_inspection(output: &str) -> Result<BackendAddress, LocateError> {
    let mut entries = output.trim().split(':');

    let ip = entries.next().unwrap_or_default().trim();
    if ip.is_empty() {
        return Err(LocateError::EmptyIp);
    }

    let port = entries
        .filter_map(|entry| {
            let (port, proto) = entry.split_once('/').unwrap_or((entry, "tcp"));
            if proto.eq_ignore_ascii_case("udp") {
                return None;
            }
            match port.trim().parse::<u16>() {
                Ok(port) if port > 0 => Some(port),
                _ => {
                    trace!(entry, "Skipping malformed port entry");
                    None
                }
            }
        })
        .min()
        .ok_or(LocateError::NoUsablePort)?;

    Ok(BackendAddress::new(ip, port))
}

/// Resolves descriptors to live backend addresses via container inspection
pub struct Locator {
    runner: Arc<dyn CommandRunner>,
}

impl Locator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn locate(&self, descriptor: &HostDescriptor) -> Result<BackendAddress, LocateError> {
        let name = descriptor.container_name();
        let output = self.runner.inspect(&name).await?;
        let address = parse_inspection(&output)?;
        debug!(container = %name, address = %address, "Located backend");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HostParser;
    use crate::testing::ScriptedRunner;

    #[test]
    fn test_smallest_non_udp_port_wins() {
        let addr = parse_inspection("10.0.0.5:8080/tcp:9090/udp:7000/tcp").unwrap();
        assert_eq!(addr, BackendAddress::new("10.0.0.5", 7000));
        assert_eq!(addr.to_string(), "10.0.0.5:7000");
    }

    #[test]
    fn test_single_port() {
        let addr = parse_inspection("172.17.0.2:4000/tcp\n").unwrap();
        assert_eq!(addr.to_string(), "172.17.0.2:4000");
    }

    #[test]
    fn test_udp_only_is_unusable() {
        assert!(matches!(
            parse_inspection("172.17.0.2:53/udp"),
            Err(LocateError::NoUsablePort)
        ));
        assert!(matches!(
            parse_inspection("172.17.0.2"),
            Err(LocateError::NoUsablePort)
        ));
    }

    #[test]
    fn test_empty_ip() {
        assert!(matches!(parse_inspection(""), Err(LocateError::EmptyIp)));
        assert!(matches!(
            parse_inspection(":80/tcp"),
            Err(LocateError::EmptyIp)
        ));
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let addr = parse_inspection("10.0.0.9:abc/tcp:/tcp:99999/tcp:3000/tcp").unwrap();
        assert_eq!(addr.port, 3000);
    }

    #[tokio::test]
    async fn test_locate_uses_container_name() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_inspection("master.hello-world.acme.github.com", "172.17.0.3:4000/tcp");
        let locator = Locator::new(runner.clone());

        let descriptor = HostParser::default()
            .parse("master.hello-world.acme.github.com.moorage:3000")
            .unwrap();
        let addr = locator.locate(&descriptor).await.unwrap();

        assert_eq!(addr.to_string(), "172.17.0.3:4000");
        assert_eq!(runner.inspects(), 1);
    }

    #[tokio::test]
    async fn test_locate_reports_inspect_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        let locator = Locator::new(runner);
        let descriptor = HostParser::default()
            .parse("master.app.acme.github.com.moorage:3000")
            .unwrap();

        assert!(matches!(
            locator.locate(&descriptor).await,
            Err(LocateError::Inspect(_))
        ));
    }
}
