pub mod backend;
pub mod errors;
pub mod quota;
pub mod route;
#[cfg(any(test, feature = "test-server"))]
pub mod test_server;

pub use backend::{Backend, RoutingBackend};
pub use errors::{BackendError, ErrorKind, RoutingError};
pub use route::{Route, RouteRequest};
