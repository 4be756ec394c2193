//! Moorage - A reverse proxy that builds its backends from the request hostname
//!
//! A hostname such as `master.hello-world.acme.github.com.moorage:3000` names a
//! repository and ref. On the first request the proxy:
//! - Clones (or fetches) the ref into a local checkout
//! - Builds a container image from it and runs the container
//! - Inspects the container for its address and forwards the request there
//!
//! Concurrent requests for the same repository share one provisioning run, and
//! the number of live and background resolutions is bounded.

pub mod admin;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod flight;
pub mod guard;
pub mod locale;
pub mod locator;
pub mod pool;
pub mod provisioner;
pub mod proxy;
pub mod resolver;
pub mod runner;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
