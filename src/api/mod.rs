//! API module which contains all the routes, the bearer authentication and the request limiting of the server.

pub mod auth;
pub mod ratelimit;
pub mod route;
pub mod schema;
