//! Hostname grammar and the repository descriptor parsed from it
//!
//! A request hostname names the repository and ref to serve:
//!
//! ```text
//! [<commit>.]<refspec>.<name>.<owner>.<service>[.<server_name>]:<port>
//! ```
//!
//! e.g. `master.hello-world.acme.github.com.moorage:3000`. The identity of the
//! provisioned backend is derived from `(refspec, name, owner, service)` only.

use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

/// Default proxy domain label expected between the service and the port
pub const DEFAULT_SERVER_NAME: &str = "moorage";

/// Reasons a hostname does not yield a descriptor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The hostname does not fit the grammar
    #[error("hostname does not match the repository grammar")]
    NoMatch,
    /// A field matched but is not safe to use as a command argument or path
    #[error("hostname field '{field}' contains unsupported characters")]
    UnsafeField { field: &'static str },
}

/// The identity of a provisioned backend.
///
/// Two hostnames with the same key always map to the same checkout, image and
/// container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub refspec: String,
    pub repository_name: String,
    pub repository_owner: String,
    pub repository_service: String,
}

impl IdentityKey {
    /// Container name: `refspec.name.owner.service`
    pub fn container_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.refspec, self.repository_name, self.repository_owner, self.repository_service
        )
    }

    /// Image tag: `service/owner/name:refspec`
    pub fn image_tag(&self) -> String {
        format!(
            "{}/{}/{}:{}",
            self.repository_service, self.repository_owner, self.repository_name, self.refspec
        )
    }

    /// Local checkout directory below `source_dir`
    pub fn checkout_path(&self, source_dir: &Path) -> PathBuf {
        source_dir
            .join(&self.repository_service)
            .join(&self.repository_owner)
            .join(&self.repository_name)
    }

    /// Remote repository URL, e.g. `https://github.com/acme/hello-world.git`
    pub fn clone_url(&self, scheme: &str) -> String {
        format!(
            "{}://{}/{}/{}.git",
            scheme, self.repository_service, self.repository_owner, self.repository_name
        )
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.container_name())
    }
}

/// Structured form of a request hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDescriptor {
    /// Short commit hash for pinned builds (7 lowercase hex chars)
    pub commit: Option<String>,
    pub refspec: String,
    pub repository_name: String,
    pub repository_owner: String,
    pub repository_service: String,
    /// Port the client addressed; does not select the backend port
    pub server_port: u16,
}

impl HostDescriptor {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            refspec: self.refspec.clone(),
            repository_name: self.repository_name.clone(),
            repository_owner: self.repository_owner.clone(),
            repository_service: self.repository_service.clone(),
        }
    }

    pub fn container_name(&self) -> String {
        self.identity().container_name()
    }

    pub fn image_tag(&self) -> String {
        self.identity().image_tag()
    }

    /// Serialize back into the canonical hostname form
    pub fn to_hostname(&self, server_name: &str) -> String {
        let mut host = String::new();
        if let Some(commit) = &self.commit {
            host.push_str(commit);
            host.push('.');
        }
        host.push_str(&self.container_name());
        if !server_name.is_empty() {
            host.push('.');
            host.push_str(server_name);
        }
        host.push(':');
        host.push_str(&self.server_port.to_string());
        host
    }
}

/// Compiled hostname grammar for one proxy domain
#[derive(Debug, Clone)]
pub struct HostParser {
    pattern: Regex,
    server_name: String,
}

impl HostParser {
    /// Build a parser for hostnames ending in `.<server_name>:<port>`.
    ///
    /// An empty `server_name` accepts `...<service>:<port>` with no suffix.
    pub fn new(server_name: &str) -> Self {
        let server_name = server_name.to_lowercase();
        let suffix = if server_name.is_empty() {
            String::new()
        } else {
            format!(r"\.{}", regex::escape(&server_name))
        };
        let pattern = format!(
            r"^((?P<commit>[0-9a-f]{{7}})\.)?(?P<refspec>[^.]+)\.(?P<repository_name>[^.]+)\.(?P<repository_owner>[^.]+)\.(?P<repository_service>.+){}:(?P<server_port>[0-9]+)$",
            suffix
        );

        Self {
            pattern: Regex::new(&pattern).expect("hostname grammar is a valid regex"),
            server_name,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Parse a hostname (with port) into a descriptor
    pub fn parse(&self, hostname: &str) -> Result<HostDescriptor, ParseError> {
        let hostname = hostname.trim().to_lowercase();
        let caps = self.pattern.captures(&hostname).ok_or(ParseError::NoMatch)?;

        let field = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

        let server_port = field("server_port")
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or(ParseError::NoMatch)?;

        let descriptor = HostDescriptor {
            commit: field("commit"),
            refspec: field("refspec").ok_or(ParseError::NoMatch)?,
            repository_name: field("repository_name").ok_or(ParseError::NoMatch)?,
            repository_owner: field("repository_owner").ok_or(ParseError::NoMatch)?,
            repository_service: field("repository_service").ok_or(ParseError::NoMatch)?,
            server_port,
        };

        check_segment("refspec", &descriptor.refspec)?;
        check_segment("repository_name", &descriptor.repository_name)?;
        check_segment("repository_owner", &descriptor.repository_owner)?;
        for label in descriptor.repository_service.split('.') {
            check_segment("repository_service", label)?;
        }

        Ok(descriptor)
    }
}

impl Default for HostParser {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_NAME)
    }
}

/// Fields end up as git/docker arguments and path components, so they must
/// start alphanumeric and stay within `[a-z0-9._-]`.
fn check_segment(field: &'static str, value: &str) -> Result<(), ParseError> {
    let starts_ok = value
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let chars_ok = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));

    if starts_ok && chars_ok {
        Ok(())
    } else {
        Err(ParseError::UnsafeField { field })
    }
}
