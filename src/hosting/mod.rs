//! External match hosting: provider API and server connection probes

pub mod api;
pub mod http;
pub mod mock;
pub mod probe;

pub use api::{
    CreateMatchRequest, CreatedMatch, CreatedTeams, HostedMatchStatus, HostedRoster, HostingApi,
    HostingError, HostingServer,
};
pub use http::HttpHostingApi;
pub use mock::{FakeHostingBehaviour, InMemoryHostingApi};
pub use probe::{A2sServerProbe, ServerInfo, ServerProbe, StaticServerProbe};

#[cfg(test)]
pub use api::MockHostingApi;
