pub mod marshal;
pub mod object_route;
pub mod routes;
pub mod sql_builder;

pub use routes::{build_router, ServerContext};
