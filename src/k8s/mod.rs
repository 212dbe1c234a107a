pub mod client;
pub mod watch;

/// Default user agent for `kwatch` - automatically uses the package version
///
/// All API traffic goes through `client::new(Some(USER_AGENT))`; the page
/// source and the stream connector share that one client.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
